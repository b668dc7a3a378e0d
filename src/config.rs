use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use error_stack::{Report, ResultExt};
use lazy_static::lazy_static;
use maplit::hashmap;
use serde::{Deserialize, Serialize};

use crate::crs::SpatialReference;
use crate::error::{BasinError, Result};
use crate::geometry::VectorLayer;
use crate::karst::DEFAULT_SIMPLIFY_TOLERANCE;
use crate::raster::{GridSource, RasterDataset};
use crate::twi::DEFAULT_NBINS;

/// The named single-band layers of the raster database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RasterLayer {
    ScalingParameter,
    KSat,
    ConMult,
    SoilThickness,
    FieldCap,
    Porosity,
    Awc,
    Imp,
    Twi,
    Stream,
}

impl RasterLayer {
    pub const ALL: [RasterLayer; 10] = [
        RasterLayer::ScalingParameter,
        RasterLayer::KSat,
        RasterLayer::ConMult,
        RasterLayer::SoilThickness,
        RasterLayer::FieldCap,
        RasterLayer::Porosity,
        RasterLayer::Awc,
        RasterLayer::Imp,
        RasterLayer::Twi,
        RasterLayer::Stream,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            RasterLayer::ScalingParameter => "scaling_parameter",
            RasterLayer::KSat => "k_sat",
            RasterLayer::ConMult => "con_mult",
            RasterLayer::SoilThickness => "soil_thickness",
            RasterLayer::FieldCap => "field_cap",
            RasterLayer::Porosity => "porosity",
            RasterLayer::Awc => "awc",
            RasterLayer::Imp => "imp",
            RasterLayer::Twi => "twi",
            RasterLayer::Stream => "stream",
        }
    }
}

lazy_static! {
    pub static ref DEFAULT_LAYERS: HashMap<String, String> = {
        hashmap! {
            String::from("awc") => String::from("HA00_AWC.tif"),
            String::from("con_mult") => String::from("HA00_cnmlt.tif"),
            String::from("field_cap") => String::from("HA00_FC.tif"),
            String::from("k_sat") => String::from("HA00_Ksat.tif"),
            String::from("scaling_parameter") => String::from("HA00_m_1.tif"),
            String::from("soil_thickness") => String::from("HA00_TH.tif"),
            String::from("porosity") => String::from("HA00_POR.tif"),
            String::from("imp") => String::from("IMP.tif"),
            String::from("twi") => String::from("TWI.tif"),
            String::from("stream") => String::from("snet_10m.tif"),
        }
    };
}

/// Lambert conformal conic grid of the Daymet archive.
pub const DAYMET_PROJECTION: &str =
    "+proj=lcc +lat_1=25 +lat_2=60 +lat_0=42.5 +lon_0=-100 +x_0=0 +y_0=0 +ellps=WGS84 +units=m +no_defs";

/// Source of the named raster layers.
///
/// Implementations are shared across rayon workers; each call returns a
/// fresh handle owned by the caller.
pub trait LayerProvider: Sync {
    fn open_layer(&self, layer: RasterLayer) -> Result<Box<dyn GridSource>>;
}

/// Layout of the raster/vector/climate database. Relative file names are
/// resolved against `root`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub root: PathBuf,
    pub layers: HashMap<String, String>,
    pub karst_raster: String,
    pub karst_vector: String,
    pub climate_dir: String,
    pub daymet_projection: String,
    pub nbins: usize,
    pub simplify_tolerance: f64,
    pub climate_start: NaiveDate,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            root: PathBuf::from("database"),
            layers: DEFAULT_LAYERS.clone(),
            karst_raster: String::from("Sinks_masked.tif"),
            karst_vector: String::from("karst_shp.shp"),
            climate_dir: String::from("climate"),
            daymet_projection: String::from(DAYMET_PROJECTION),
            nbins: DEFAULT_NBINS,
            simplify_tolerance: DEFAULT_SIMPLIFY_TOLERANCE,
            climate_start: NaiveDate::from_ymd_opt(1980, 1, 1).unwrap_or_default(),
        }
    }
}

impl DatabaseConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .change_context(BasinError::ResourceOpen)
            .attach_printable_lazy(|| format!("config {}", path.display()))?;
        serde_json::from_str(&text)
            .change_context(BasinError::ResourceOpen)
            .attach_printable_lazy(|| format!("config {} is not valid JSON", path.display()))
    }

    pub fn raster_path(&self, layer: &str) -> Result<PathBuf> {
        self.layers
            .get(layer)
            .map(|file| self.root.join(file))
            .ok_or_else(|| {
                Report::new(BasinError::ResourceOpen).attach_printable(format!("no raster configured for layer `{}`", layer))
            })
    }

    pub fn karst_raster_path(&self) -> PathBuf {
        self.root.join(&self.karst_raster)
    }

    pub fn karst_vector_path(&self) -> PathBuf {
        self.root.join(&self.karst_vector)
    }

    pub fn climate_path(&self) -> PathBuf {
        self.root.join(&self.climate_dir)
    }

    pub fn daymet_crs(&self) -> Result<SpatialReference> {
        SpatialReference::new(&self.daymet_projection)
    }

    pub fn open_karst_raster(&self) -> Result<RasterDataset> {
        RasterDataset::open(self.karst_raster_path())
    }

    pub fn open_karst_sinks(&self) -> Result<VectorLayer> {
        VectorLayer::open(self.karst_vector_path())
    }
}

impl LayerProvider for DatabaseConfig {
    fn open_layer(&self, layer: RasterLayer) -> Result<Box<dyn GridSource>> {
        let path = self.raster_path(layer.key())?;
        Ok(Box::new(RasterDataset::open(path)?))
    }
}
