use error_stack::Report;
use log::debug;

use crate::error::{BasinError, Result};
use crate::geometry::PolygonFeature;
use crate::raster::GridSource;
use crate::rasterize::{AlignedWindow, WindowReducer};

/// Fixed per-cell area convention used by `zonal_area`. This is a cell count
/// scaling, not the true pixel area.
pub const CELL_AREA_FACTOR: f64 = 100.0;

/// Summary of the valid cells of one raster under one polygon.
#[derive(Debug, Clone, PartialEq)]
pub struct ZonalStats {
    pub source: String,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    pub std: f64,
    pub count: usize,
}

/// Min/mean/max/population std over interior, non-nodata cells.
pub struct Statistics;

impl WindowReducer for Statistics {
    type Output = ZonalStats;

    fn reduce(&self, window: &AlignedWindow) -> Result<ZonalStats> {
        let mut count = 0usize;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        // Welford
        let mut mean = 0.0;
        let mut m2 = 0.0;

        for value in window.valid_values() {
            count += 1;
            min = min.min(value);
            max = max.max(value);
            let delta = value - mean;
            mean += delta / count as f64;
            m2 += delta * (value - mean);
        }

        if count == 0 {
            return Err(Report::new(BasinError::EmptyZone)
                .attach_printable(format!("no valid cells of {} under polygon", window.source)));
        }

        let stats = ZonalStats {
            source: window.source.clone(),
            min,
            mean: mean.clamp(min, max),
            max,
            std: (m2 / count as f64).max(0.0).sqrt(),
            count,
        };
        debug!("{:?}", stats);
        Ok(stats)
    }
}

/// Valid cell count scaled by `CELL_AREA_FACTOR`.
pub struct CellArea;

impl WindowReducer for CellArea {
    type Output = f64;

    fn reduce(&self, window: &AlignedWindow) -> Result<f64> {
        let count = window.valid_values().count();
        debug!("{}: {} valid cell(s) for area", window.source, count);
        Ok(count as f64 * CELL_AREA_FACTOR)
    }
}

pub fn zonal_stats(raster: &dyn GridSource, feature: &PolygonFeature) -> Result<ZonalStats> {
    Statistics.apply(raster, feature)
}

/// Zonal mean, the canonical summary value used by the aggregator.
pub fn zonal_mean(raster: &dyn GridSource, feature: &PolygonFeature) -> Result<f64> {
    zonal_stats(raster, feature).map(|stats| stats.mean)
}

pub fn zonal_area(raster: &dyn GridSource, feature: &PolygonFeature) -> Result<f64> {
    CellArea.apply(raster, feature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::SpatialReference;
    use crate::raster::{GeoTransform, Raster};
    use geo::{polygon, MultiPolygon};

    const UTM16: &str = "+proj=utm +zone=16 +datum=NAD83 +units=m +no_defs";

    fn crs() -> SpatialReference {
        SpatialReference::new(UTM16).unwrap()
    }

    fn raster(data: Vec<f64>, width: usize, height: usize, no_data: Option<f64>) -> Raster {
        let gt = GeoTransform::new(1000.0, 10.0, 2000.0, -10.0).unwrap();
        Raster::new("test.tif", data, width, height, gt, crs(), no_data).unwrap()
    }

    fn square(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> PolygonFeature {
        let geometry = MultiPolygon::new(vec![polygon![
            (x: xmin, y: ymin),
            (x: xmax, y: ymin),
            (x: xmax, y: ymax),
            (x: xmin, y: ymax),
            (x: xmin, y: ymin),
        ]]);
        PolygonFeature::new(geometry, crs()).unwrap()
    }

    #[test]
    fn test_single_cell_polygon() {
        let grid = raster(vec![1.0, 2.0, 3.0, 4.0, 7.5, 6.0, 7.0, 8.0, 9.0], 3, 3, None);
        // exactly covers cell (1, 1)
        let stats = zonal_stats(&grid, &square(1010.0, 1980.0, 1020.0, 1990.0)).unwrap();
        assert_eq!(stats.mean, 7.5);
        assert_eq!(stats.min, 7.5);
        assert_eq!(stats.max, 7.5);
        assert_eq!(stats.std, 0.0);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.source, "test.tif");
    }

    #[test]
    fn test_statistics_exclude_negative_nodata() {
        let grid = raster(vec![-9999.0, 2.0, 4.0, -9999.0], 2, 2, Some(-9999.0));
        let stats = zonal_stats(&grid, &square(1000.0, 1980.0, 1020.0, 2000.0)).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 4.0);
        assert!((stats.mean - 3.0).abs() < 1e-12);
        assert!((stats.std - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_statistics_are_ordered() {
        let data: Vec<f64> = (0..25).map(|v| ((v * 37) % 11) as f64 - 3.3).collect();
        let grid = raster(data, 5, 5, None);
        let stats = zonal_stats(&grid, &square(1005.0, 1955.0, 1042.0, 1996.0)).unwrap();
        assert!(stats.min <= stats.mean && stats.mean <= stats.max);
        assert!(stats.std >= 0.0);
    }

    #[test]
    fn test_polygon_outside_raster_is_empty_zone() {
        let grid = raster(vec![1.0; 4], 2, 2, None);
        let err = zonal_stats(&grid, &square(5000.0, 5000.0, 5100.0, 5100.0)).unwrap_err();
        assert_eq!(*err.current_context(), BasinError::EmptyZone);
    }

    #[test]
    fn test_all_nodata_is_empty_zone() {
        let grid = raster(vec![0.0; 4], 2, 2, Some(0.0));
        let err = zonal_mean(&grid, &square(1000.0, 1980.0, 1020.0, 2000.0)).unwrap_err();
        assert_eq!(*err.current_context(), BasinError::EmptyZone);
    }

    #[test]
    fn test_area_counts_valid_cells() {
        let grid = raster(vec![1.0, -1.0, 1.0, 1.0], 2, 2, Some(-1.0));
        let area = zonal_area(&grid, &square(1000.0, 1980.0, 1020.0, 2000.0)).unwrap();
        assert_eq!(area, 3.0 * CELL_AREA_FACTOR);
    }

    #[test]
    fn test_area_of_disjoint_polygon_is_zero() {
        let grid = raster(vec![1.0; 4], 2, 2, None);
        assert_eq!(zonal_area(&grid, &square(5000.0, 5000.0, 5100.0, 5100.0)).unwrap(), 0.0);
    }
}
