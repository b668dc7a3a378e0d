use std::ptr;

use error_stack::{Report, ResultExt};
use gdal::raster::rasterize as gdal_rasterize;
use gdal::vector::{LayerAccess, LayerOptions, ToGdal};
use gdal::{Dataset, DriverManager};
use gdal_sys::{CPLErr, OGRwkbGeometryType};
use geo::{MultiPolygon, Polygon};
use log::debug;

use crate::crs::reconcile;
use crate::error::{BasinError, Result};
use crate::geometry::{Envelope, PolygonFeature};
use crate::raster::{GeoTransform, GridSource};

/// Sub-window of a raster grid, in pixels. Offsets may be negative when the
/// envelope starts outside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub x_offset: isize,
    pub y_offset: isize,
    pub width: usize,
    pub height: usize,
}

/// Snaps an envelope to the raster grid.
///
/// The window spans one pixel past the floor of the far edge on each axis, so
/// boundary pixels are never clipped; downstream numbers depend on this exact
/// sizing.
pub fn bbox_to_pixel_offsets(gt: &GeoTransform, envelope: &Envelope) -> PixelWindow {
    let x1 = ((envelope.xmin - gt.origin_x) / gt.pixel_width).floor() as isize;
    let x2 = ((envelope.xmax - gt.origin_x) / gt.pixel_width).floor() as isize + 1;

    // pixel_height is negative: ymax maps to the top row
    let y1 = ((envelope.ymax - gt.origin_y) / gt.pixel_height).floor() as isize;
    let y2 = ((envelope.ymin - gt.origin_y) / gt.pixel_height).floor() as isize + 1;

    PixelWindow {
        x_offset: x1,
        y_offset: y1,
        width: (x2 - x1).max(1) as usize,
        height: (y2 - y1).max(1) as usize,
    }
}

/// Binary raster marking cells interior to a burned polygon.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub width: usize,
    pub height: usize,
    pub cells: Vec<bool>,
}

impl Mask {
    pub fn get(&self, col: usize, row: usize) -> bool {
        self.cells[row * self.width + col]
    }

    pub fn count(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }
}

/// Single-band byte grid held by gdal's in-memory driver; burned cells hold 1.
pub struct BurnGrid {
    dataset: Dataset,
    width: usize,
    height: usize,
}

impl BurnGrid {
    pub fn new(gt: &GeoTransform, width: usize, height: usize) -> Result<Self> {
        let driver = DriverManager::get_driver_by_name("MEM").change_context(BasinError::GeometryOperation)?;
        let mut dataset = driver
            .create_with_band_type::<u8, _>("", width as isize, height as isize, 1)
            .change_context(BasinError::GeometryOperation)
            .attach_printable_lazy(|| format!("could not allocate a {}x{} burn grid", width, height))?;
        dataset
            .set_geo_transform(&gt.to_gdal())
            .change_context(BasinError::GeometryOperation)?;
        Ok(BurnGrid { dataset, width, height })
    }

    /// Burns every polygon of `geometry` with gdal's default rule: a cell is
    /// set when its centre falls inside the polygon, holes excluded. Parts are
    /// burned one by one, so overlapping parts are OR-ed.
    pub fn burn(&mut self, geometry: &MultiPolygon<f64>) -> Result<()> {
        let shapes = geometry
            .0
            .iter()
            .map(|polygon| polygon.to_gdal())
            .collect::<std::result::Result<Vec<_>, _>>()
            .change_context(BasinError::GeometryOperation)?;
        if shapes.is_empty() {
            return Ok(());
        }
        let burn_values = vec![1.0; shapes.len()];
        gdal_rasterize(&mut self.dataset, &[1], &shapes, &burn_values, None)
            .change_context(BasinError::GeometryOperation)
            .attach_printable_lazy(|| format!("burning {} polygon(s)", shapes.len()))
    }

    pub fn mask(&self) -> Result<Mask> {
        let band = self.dataset.rasterband(1).change_context(BasinError::GeometryOperation)?;
        let buffer = band
            .read_as::<u8>((0, 0), (self.width, self.height), (self.width, self.height), None)
            .change_context(BasinError::GeometryOperation)?;
        Ok(Mask {
            width: self.width,
            height: self.height,
            cells: buffer.data.into_iter().map(|v| v != 0).collect(),
        })
    }

    /// Traces the burned cells into georeferenced polygons, one per
    /// 4-connected region.
    pub fn polygonize(&self) -> Result<Vec<Polygon<f64>>> {
        let driver = DriverManager::get_driver_by_name("Memory").change_context(BasinError::GeometryOperation)?;
        let mut vectors = driver
            .create_vector_only("")
            .change_context(BasinError::GeometryOperation)?;
        let mut layer = vectors
            .create_layer(LayerOptions {
                name: "burned",
                ty: OGRwkbGeometryType::wkbPolygon,
                ..Default::default()
            })
            .change_context(BasinError::GeometryOperation)?;
        let band = self.dataset.rasterband(1).change_context(BasinError::GeometryOperation)?;

        // the band doubles as its own mask, so unburned cells yield nothing
        let status = unsafe {
            gdal_sys::GDALPolygonize(
                band.c_rasterband(),
                band.c_rasterband(),
                layer.c_layer(),
                -1,
                ptr::null_mut(),
                None,
                ptr::null_mut(),
            )
        };
        if status != CPLErr::CE_None {
            return Err(Report::new(BasinError::GeometryOperation)
                .attach_printable(format!("polygonizing a {}x{} grid failed", self.width, self.height)));
        }

        let mut polygons = Vec::new();
        for feature in layer.features() {
            let Some(geometry) = feature.geometry() else {
                continue;
            };
            match geometry.to_geo().change_context(BasinError::GeometryOperation)? {
                geo::Geometry::Polygon(polygon) => polygons.push(polygon),
                geo::Geometry::MultiPolygon(multi) => polygons.extend(multi.0),
                _ => {}
            }
        }
        debug!("polygonized {} region(s)", polygons.len());
        Ok(polygons)
    }
}

/// Burns `geometry` into a `width` x `height` grid described by `gt`.
pub fn rasterize(geometry: &MultiPolygon<f64>, gt: &GeoTransform, width: usize, height: usize) -> Result<Mask> {
    let mut grid = BurnGrid::new(gt, width, height)?;
    grid.burn(geometry)?;
    grid.mask()
}

/// A raster sub-window paired with the polygon mask burned onto the same grid.
///
/// Built once per (raster, polygon) pair: the polygon is reconciled to the
/// raster's CRS, the covering window is read, and the mask is rasterized
/// with the window's shifted geotransform so the two align pixel for pixel.
#[derive(Debug, Clone)]
pub struct AlignedWindow {
    pub source: String,
    pub window: PixelWindow,
    pub geo_transform: GeoTransform,
    pub values: Vec<f64>,
    pub mask: Mask,
    pub no_data: Option<f64>,
}

impl AlignedWindow {
    pub fn new(raster: &dyn GridSource, feature: &PolygonFeature) -> Result<Self> {
        // a reprojected copy lives only for the duration of this call
        let aligned = reconcile(feature, raster.crs())?;

        let gt = raster.geo_transform();
        let window = bbox_to_pixel_offsets(&gt, &aligned.envelope);
        let values = raster.read_window(&window)?;
        let geo_transform = gt.shifted(window.x_offset, window.y_offset);
        let mask = rasterize(&aligned.geometry, &geo_transform, window.width, window.height)?;

        debug!(
            "aligned {} window {:?}: {} interior cell(s)",
            raster.name(),
            window,
            mask.count()
        );

        Ok(AlignedWindow {
            source: raster.name().to_string(),
            window,
            geo_transform,
            values,
            mask,
            no_data: raster.no_data(),
        })
    }

    /// True for NaN, off-grid, or sentinel-valued samples.
    pub fn is_no_data(&self, value: f64) -> bool {
        value.is_nan() || self.no_data.map_or(false, |nd| value == nd)
    }

    /// Interior samples that are not no-data.
    pub fn valid_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values
            .iter()
            .zip(self.mask.cells.iter())
            .filter(move |(&v, &inside)| inside && !self.is_no_data(v))
            .map(|(&v, _)| v)
    }
}

/// A computation over an aligned (window, mask) pair.
pub trait WindowReducer {
    type Output;

    fn reduce(&self, window: &AlignedWindow) -> Result<Self::Output>;

    /// Aligns `feature` to `raster` and reduces the result.
    fn apply(&self, raster: &dyn GridSource, feature: &PolygonFeature) -> Result<Self::Output> {
        let window = AlignedWindow::new(raster, feature)?;
        self.reduce(&window)
    }
}
