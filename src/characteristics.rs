use std::collections::HashMap;
use std::path::Path;

use error_stack::Report;
use lazy_static::lazy_static;
use log::{info, warn};
use maplit::hashmap;
use rayon::prelude::*;

use crate::climate::{build_climate_table, ClimateTable, DateRange};
use crate::config::{DatabaseConfig, LayerProvider, RasterLayer};
use crate::crs::SpatialReference;
use crate::error::{BasinError, Result};
use crate::geometry::PolygonFeature;
use crate::karst::{KarstOutcome, KarstPipeline, KarstRegion};
use crate::output::{ensure_dir, write_characteristics, write_timeseries, write_twi};
use crate::twi::{twi_bins, TwiBinTable};
use crate::zonal::{zonal_area, zonal_stats, ZonalStats};

/// Geographic system used to report basin latitude.
pub const LATITUDE_CRS: &str = "EPSG:4269";

// basin and stream areas are reported as area / AREA_DIVISOR
const AREA_DIVISOR: f64 = 10e6;

/// Keys of the characteristics table, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    ScalingParameter,
    SaturatedHydraulicConductivity,
    SaturatedHydraulicConductivityMultiplier,
    SoilDepthTotal,
    FieldCapacityFraction,
    PorosityFraction,
    WiltingPointFraction,
    Latitude,
    BasinAreaTotal,
    ImperviousAreaFraction,
    ChannelLengthMax,
    ChannelVelocityAvg,
    FlowInitial,
    StreamArea,
    EffImp,
    ImpDelay,
    TwiAdj,
    EtExpDorm,
    EtExpGrow,
    GrowTrigger,
    RipArea,
    LakeDelay,
}

impl Characteristic {
    pub const ALL: [Characteristic; 22] = [
        Characteristic::ScalingParameter,
        Characteristic::SaturatedHydraulicConductivity,
        Characteristic::SaturatedHydraulicConductivityMultiplier,
        Characteristic::SoilDepthTotal,
        Characteristic::FieldCapacityFraction,
        Characteristic::PorosityFraction,
        Characteristic::WiltingPointFraction,
        Characteristic::Latitude,
        Characteristic::BasinAreaTotal,
        Characteristic::ImperviousAreaFraction,
        Characteristic::ChannelLengthMax,
        Characteristic::ChannelVelocityAvg,
        Characteristic::FlowInitial,
        Characteristic::StreamArea,
        Characteristic::EffImp,
        Characteristic::ImpDelay,
        Characteristic::TwiAdj,
        Characteristic::EtExpDorm,
        Characteristic::EtExpGrow,
        Characteristic::GrowTrigger,
        Characteristic::RipArea,
        Characteristic::LakeDelay,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Characteristic::ScalingParameter => "scaling_parameter",
            Characteristic::SaturatedHydraulicConductivity => "saturated_hydraulic_conductivity",
            Characteristic::SaturatedHydraulicConductivityMultiplier => "saturated_hydraulic_conductivity_multiplier",
            Characteristic::SoilDepthTotal => "soil_depth_total",
            Characteristic::FieldCapacityFraction => "field_capacity_fraction",
            Characteristic::PorosityFraction => "porosity_fraction",
            Characteristic::WiltingPointFraction => "wilting_point_fraction",
            Characteristic::Latitude => "latitude",
            Characteristic::BasinAreaTotal => "basin_area_total",
            Characteristic::ImperviousAreaFraction => "impervious_area_fraction",
            Characteristic::ChannelLengthMax => "channel_length_max",
            Characteristic::ChannelVelocityAvg => "channel_velocity_avg",
            Characteristic::FlowInitial => "flow_initial",
            Characteristic::StreamArea => "stream_area",
            Characteristic::EffImp => "eff_imp",
            Characteristic::ImpDelay => "imp_delay",
            Characteristic::TwiAdj => "twi_adj",
            Characteristic::EtExpDorm => "et_exp_dorm",
            Characteristic::EtExpGrow => "et_exp_grow",
            Characteristic::GrowTrigger => "grow_trigger",
            Characteristic::RipArea => "rip_area",
            Characteristic::LakeDelay => "lake_delay",
        }
    }
}

lazy_static! {
    /// Model parameters that are not derived from the database.
    pub static ref LITERAL_DEFAULTS: HashMap<Characteristic, f64> = hashmap! {
        Characteristic::ChannelLengthMax => 10.0,
        Characteristic::ChannelVelocityAvg => 0.1,
        Characteristic::FlowInitial => 0.1,
        Characteristic::EffImp => 0.7,
        Characteristic::ImpDelay => 0.1,
        Characteristic::TwiAdj => 1.0,
        Characteristic::EtExpDorm => 0.0,
        Characteristic::EtExpGrow => 0.0,
        Characteristic::GrowTrigger => 15.0,
        Characteristic::LakeDelay => 0.0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Query {
    Mean,
    Area,
}

const QUERIES: [(RasterLayer, Query); 9] = [
    (RasterLayer::ScalingParameter, Query::Mean),
    (RasterLayer::KSat, Query::Mean),
    (RasterLayer::ConMult, Query::Mean),
    (RasterLayer::SoilThickness, Query::Mean),
    (RasterLayer::FieldCap, Query::Mean),
    (RasterLayer::Porosity, Query::Mean),
    (RasterLayer::Awc, Query::Mean),
    (RasterLayer::Imp, Query::Area),
    (RasterLayer::Stream, Query::Area),
];

enum LayerValue {
    Stats(ZonalStats),
    Area(f64),
}

/// Ordered (key, value) table for one polygon, plus the per-layer zonal
/// records the means were taken from.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicsTable {
    values: Vec<(Characteristic, f64)>,
    pub diagnostics: Vec<ZonalStats>,
}

impl CharacteristicsTable {
    pub fn get(&self, key: Characteristic) -> Option<f64> {
        self.values.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Characteristic, f64)> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Computes every characteristic of `basin`. Raster layers are evaluated on
/// the global rayon pool, each task opening its own handle.
pub fn characteristics<P: LayerProvider + ?Sized>(provider: &P, basin: &PolygonFeature) -> Result<CharacteristicsTable> {
    let results = QUERIES
        .par_iter()
        .map(|&(layer, query)| -> Result<(RasterLayer, LayerValue)> {
            let raster = provider.open_layer(layer)?;
            let value = match query {
                Query::Mean => LayerValue::Stats(zonal_stats(raster.as_ref(), basin)?),
                Query::Area => LayerValue::Area(zonal_area(raster.as_ref(), basin)?),
            };
            Ok((layer, value))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut means = HashMap::new();
    let mut areas = HashMap::new();
    let mut diagnostics = Vec::new();
    for (layer, value) in results {
        match value {
            LayerValue::Stats(stats) => {
                means.insert(layer, stats.mean);
                diagnostics.push(stats);
            }
            LayerValue::Area(area) => {
                areas.insert(layer, area);
            }
        }
    }
    let mean = |layer: RasterLayer| means.get(&layer).copied().unwrap_or(f64::NAN);
    let area_of = |layer: RasterLayer| areas.get(&layer).copied().unwrap_or(f64::NAN);

    let latitude = basin.projected_centroid(&SpatialReference::new(LATITUDE_CRS)?)?.1;
    let area = basin.area();
    if area <= 0.0 {
        return Err(Report::new(BasinError::GeometryOperation).attach_printable("basin has zero area"));
    }
    let stream_area = area_of(RasterLayer::Stream) / AREA_DIVISOR;

    let values = Characteristic::ALL
        .iter()
        .map(|&key| {
            let value = match key {
                Characteristic::ScalingParameter => mean(RasterLayer::ScalingParameter) / 100.0,
                Characteristic::SaturatedHydraulicConductivity => mean(RasterLayer::KSat) / 100.0 * 86.4,
                Characteristic::SaturatedHydraulicConductivityMultiplier => mean(RasterLayer::ConMult) / 100.0,
                Characteristic::SoilDepthTotal => mean(RasterLayer::SoilThickness) / 10.0,
                Characteristic::FieldCapacityFraction => mean(RasterLayer::FieldCap) / 10000.0,
                Characteristic::PorosityFraction => mean(RasterLayer::Porosity) / 10000.0,
                Characteristic::WiltingPointFraction => {
                    mean(RasterLayer::FieldCap) / 10000.0 - mean(RasterLayer::Awc) / 100.0
                }
                Characteristic::Latitude => latitude,
                Characteristic::BasinAreaTotal => area / AREA_DIVISOR,
                Characteristic::ImperviousAreaFraction => area_of(RasterLayer::Imp) / area * 100.0,
                Characteristic::StreamArea => stream_area,
                // lake area is not modelled
                Characteristic::RipArea => stream_area,
                other => LITERAL_DEFAULTS.get(&other).copied().unwrap_or(f64::NAN),
            };
            (key, value)
        })
        .collect();

    Ok(CharacteristicsTable { values, diagnostics })
}

/// Characteristics and TWI distribution of the karst sub-region.
#[derive(Debug, Clone)]
pub struct KarstReport {
    pub region: KarstRegion,
    pub characteristics: CharacteristicsTable,
    pub twi: TwiBinTable,
}

#[derive(Debug)]
pub struct BasinReport {
    pub characteristics: CharacteristicsTable,
    pub twi: TwiBinTable,
    /// `None` when the basin has no karst; `Some(Err)` when the karst
    /// sub-pipeline failed after the primary results were computed.
    pub karst: Option<Result<KarstReport>>,
    pub climate: Option<ClimateTable>,
}

impl BasinReport {
    pub fn write_all<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        write_characteristics(&dir.join("basin_characteristics.csv"), &self.characteristics)?;
        write_twi(&dir.join("twi.csv"), &self.twi)?;

        match &self.karst {
            Some(Ok(karst)) => {
                write_characteristics(&dir.join("basin_characteristics_karst.csv"), &karst.characteristics)?;
                write_twi(&dir.join("twi_karst.csv"), &karst.twi)?;
            }
            Some(Err(report)) => warn!("karst outputs skipped: {:?}", report),
            None => {}
        }

        if let Some(climate) = &self.climate {
            write_timeseries(&dir.join("timeseries.csv"), climate)?;
        }
        Ok(())
    }
}

fn karst_report(config: &DatabaseConfig, basin: &PolygonFeature, output_dir: &Path) -> Result<Option<KarstReport>> {
    let raster = config.open_karst_raster()?;
    let sinks = config.open_karst_sinks()?;
    let mut pipeline = KarstPipeline::new(&raster, &sinks, output_dir);
    pipeline.tolerance = config.simplify_tolerance;

    let region = match pipeline.run(basin)? {
        KarstOutcome::Absent => return Ok(None),
        KarstOutcome::Present(region) => region,
    };

    let characteristics = characteristics(config, &region.region)?;
    let twi_raster = config.open_layer(RasterLayer::Twi)?;
    let twi = twi_bins(twi_raster.as_ref(), &region.region, config.nbins)?;
    Ok(Some(KarstReport { region, characteristics, twi }))
}

/// Runs the full characteristics computation for one basin boundary.
///
/// Derived karst vector sources are written to `output_dir`, which is created
/// if missing; tables are only written by [`BasinReport::write_all`].
pub fn run_basin<P: AsRef<Path>, Q: AsRef<Path>>(
    config: &DatabaseConfig,
    basin_path: P,
    output_dir: Q,
    timeseries: bool,
) -> Result<BasinReport> {
    ensure_dir(output_dir.as_ref())?;
    let basin = PolygonFeature::open(basin_path)?;
    info!("basin {} ({} square units)", basin.stem(), basin.area());

    let characteristics = characteristics(config, &basin)?;
    let twi_raster = config.open_layer(RasterLayer::Twi)?;
    let twi = twi_bins(twi_raster.as_ref(), &basin, config.nbins)?;

    let karst = match karst_report(config, &basin, output_dir.as_ref()) {
        Ok(Some(report)) => Some(Ok(report)),
        Ok(None) => None,
        Err(report) => {
            warn!("karst sub-pipeline failed: {:?}", report);
            Some(Err(report))
        }
    };

    let climate = if timeseries {
        let (x, y) = basin.projected_centroid(&config.daymet_crs()?)?;
        let range = DateRange::since(config.climate_start);
        Some(build_climate_table(config.climate_path(), x, y, &range)?)
    } else {
        None
    };

    Ok(BasinReport { characteristics, twi, karst, climate })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{GeoTransform, GridSource, Raster};
    use geo::{polygon, MultiPolygon};

    const UTM16: &str = "+proj=utm +zone=16 +datum=NAD83 +units=m +no_defs";

    // 10x10 grid of 10 m cells with a constant value per layer
    struct ConstantLayers {
        values: HashMap<RasterLayer, f64>,
    }

    impl LayerProvider for ConstantLayers {
        fn open_layer(&self, layer: RasterLayer) -> Result<Box<dyn GridSource>> {
            let value = self.values.get(&layer).copied().ok_or_else(|| {
                Report::new(BasinError::ResourceOpen).attach_printable(format!("no layer {}", layer.key()))
            })?;
            let gt = GeoTransform::new(600000.0, 10.0, 4100100.0, -10.0)?;
            let crs = SpatialReference::new(UTM16)?;
            Ok(Box::new(Raster::new(layer.key(), vec![value; 100], 10, 10, gt, crs, Some(-9999.0))?))
        }
    }

    fn provider() -> ConstantLayers {
        ConstantLayers {
            values: hashmap! {
                RasterLayer::ScalingParameter => 250.0,
                RasterLayer::KSat => 50.0,
                RasterLayer::ConMult => 300.0,
                RasterLayer::SoilThickness => 1200.0,
                RasterLayer::FieldCap => 3000.0,
                RasterLayer::Porosity => 4500.0,
                RasterLayer::Awc => 15.0,
                RasterLayer::Imp => 1.0,
                RasterLayer::Stream => 1.0,
            },
        }
    }

    fn basin() -> PolygonFeature {
        // 50 m x 40 m inside the grid: 20 cells
        let geometry = MultiPolygon::new(vec![polygon![
            (x: 600020.0, y: 4100020.0),
            (x: 600070.0, y: 4100020.0),
            (x: 600070.0, y: 4100060.0),
            (x: 600020.0, y: 4100060.0),
            (x: 600020.0, y: 4100020.0),
        ]]);
        PolygonFeature::new(geometry, SpatialReference::new(UTM16).unwrap()).unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_table_has_every_key_in_order() {
        let table = characteristics(&provider(), &basin()).unwrap();
        let names: Vec<&str> = table.iter().map(|(k, _)| k.name()).collect();
        let expected: Vec<&str> = Characteristic::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names, expected);
        assert_eq!(table.len(), 22);
        assert_eq!(table.diagnostics.len(), 7);
    }

    #[test]
    fn test_unit_conversions() {
        let table = characteristics(&provider(), &basin()).unwrap();
        let get = |k| table.get(k).unwrap();

        assert!(close(get(Characteristic::ScalingParameter), 2.5));
        assert!(close(get(Characteristic::SaturatedHydraulicConductivity), 0.5 * 86.4));
        assert!(close(get(Characteristic::SaturatedHydraulicConductivityMultiplier), 3.0));
        assert!(close(get(Characteristic::SoilDepthTotal), 120.0));
        assert!(close(get(Characteristic::FieldCapacityFraction), 0.3));
        assert!(close(get(Characteristic::PorosityFraction), 0.45));
        assert!(close(get(Characteristic::WiltingPointFraction), 0.3 - 0.15));
        assert!(close(get(Characteristic::BasinAreaTotal), 2000.0 / 10e6));
        // 20 cells * 100 over 2000 square metres
        assert!(close(get(Characteristic::ImperviousAreaFraction), 100.0));
        assert!(close(get(Characteristic::StreamArea), 2000.0 / 10e6));
        assert_eq!(get(Characteristic::RipArea), get(Characteristic::StreamArea));
    }

    #[test]
    fn test_literal_defaults() {
        let table = characteristics(&provider(), &basin()).unwrap();
        assert_eq!(table.get(Characteristic::ChannelLengthMax), Some(10.0));
        assert_eq!(table.get(Characteristic::GrowTrigger), Some(15.0));
        assert_eq!(table.get(Characteristic::TwiAdj), Some(1.0));
        assert_eq!(table.get(Characteristic::LakeDelay), Some(0.0));
    }

    #[test]
    fn test_latitude_is_geographic() {
        let table = characteristics(&provider(), &basin()).unwrap();
        let latitude = table.get(Characteristic::Latitude).unwrap();
        assert!(latitude > 36.0 && latitude < 38.0, "latitude {}", latitude);
    }

    #[test]
    fn test_missing_layer_aborts() {
        let mut layers = provider();
        layers.values.remove(&RasterLayer::Porosity);
        let err = characteristics(&layers, &basin()).unwrap_err();
        assert_eq!(*err.current_context(), BasinError::ResourceOpen);
    }

    #[test]
    fn test_write_all_skips_failed_karst() {
        let dir = std::env::temp_dir().join("waterbasin_report");
        std::fs::create_dir_all(&dir).unwrap();
        let _ = std::fs::remove_file(dir.join("twi_karst.csv"));

        let report = BasinReport {
            characteristics: characteristics(&provider(), &basin()).unwrap(),
            twi: TwiBinTable { bins: vec![] },
            karst: Some(Err(Report::new(BasinError::GeometryOperation))),
            climate: None,
        };
        report.write_all(&dir).unwrap();

        let written = std::fs::read_to_string(dir.join("basin_characteristics.csv")).unwrap();
        assert!(written.starts_with("name,value\nscaling_parameter,2.5\n"));
        assert_eq!(written.lines().count(), 23);
        assert!(!dir.join("twi_karst.csv").exists());
    }
}
