use error_stack::Report;
use log::debug;

use crate::error::{BasinError, Result};
use crate::geometry::PolygonFeature;
use crate::raster::GridSource;
use crate::rasterize::{AlignedWindow, WindowReducer};

pub const DEFAULT_NBINS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwiBin {
    /// 1-based, ascending TWI order.
    pub bin: usize,
    pub twi: f64,
    pub proportion: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TwiBinTable {
    pub bins: Vec<TwiBin>,
}

impl TwiBinTable {
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn total_proportion(&self) -> f64 {
        self.bins.iter().map(|b| b.proportion).sum()
    }
}

/// Histogram binning of wetness index values under a polygon.
pub struct TwiBinner {
    pub nbins: usize,
}

impl Default for TwiBinner {
    fn default() -> Self {
        TwiBinner { nbins: DEFAULT_NBINS }
    }
}

impl TwiBinner {
    /// Bins already-masked values. Negative and NaN samples are ignored.
    pub fn bin_values(&self, values: &[f64]) -> Result<TwiBinTable> {
        let nbins = self.nbins;
        if nbins == 0 {
            return Err(Report::new(BasinError::DegenerateDistribution).attach_printable("nbins must be positive"));
        }

        let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan() && *v >= 0.0).collect();
        if valid.is_empty() {
            return Err(Report::new(BasinError::EmptyZone).attach_printable("no valid TWI cells"));
        }

        let min = valid.iter().copied().fold(f64::INFINITY, f64::min);
        let max = valid.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if min == max {
            return Err(Report::new(BasinError::DegenerateDistribution)
                .attach_printable(format!("all {} TWI cells equal {}", valid.len(), min)));
        }

        // nbins + 1 intervals, only the first nbins are binned
        let intvl = (max - min) / (nbins as f64 + 1.0);
        let edges: Vec<f64> = (0..=nbins).map(|k| min + k as f64 * intvl).collect();
        debug!("TWI range [{}, {}], interval {}, edges {:?}", min, max, intvl, edges);

        let mut counts = vec![0usize; nbins];
        for v in valid {
            if v > edges[nbins] {
                continue;
            }
            // half-open [e_k, e_k+1) bins, the last one closed
            let idx = edges.partition_point(|e| *e <= v).saturating_sub(1).min(nbins - 1);
            counts[idx] += 1;
        }

        let total: usize = counts.iter().sum();
        let bins = (0..nbins)
            .map(|i| {
                let twi = if i == 0 { edges[0] / 2.0 } else { (edges[i] + edges[i - 1]) / 2.0 };
                let proportion = if total == 0 { 0.0 } else { counts[i] as f64 / total as f64 };
                TwiBin { bin: i + 1, twi, proportion }
            })
            .collect();

        Ok(TwiBinTable { bins })
    }
}

impl WindowReducer for TwiBinner {
    type Output = TwiBinTable;

    fn reduce(&self, window: &AlignedWindow) -> Result<TwiBinTable> {
        let interior: Vec<f64> = window.valid_values().collect();
        self.bin_values(&interior)
    }
}

pub fn twi_bins(raster: &dyn GridSource, feature: &PolygonFeature, nbins: usize) -> Result<TwiBinTable> {
    TwiBinner { nbins }.apply(raster, feature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::SpatialReference;
    use crate::raster::{GeoTransform, Raster};
    use geo::{polygon, MultiPolygon};

    #[test]
    fn test_bin_count_and_proportions() {
        let values: Vec<f64> = (0..500).map(|v| (v as f64 * 0.731).sin().abs() * 12.0 + 1.0).collect();
        let table = TwiBinner::default().bin_values(&values).unwrap();
        assert_eq!(table.len(), DEFAULT_NBINS);
        assert!((table.total_proportion() - 1.0).abs() < 1e-9);
        assert_eq!(table.bins.first().unwrap().bin, 1);
        assert_eq!(table.bins.last().unwrap().bin, DEFAULT_NBINS);
        assert!(table.bins.windows(2).all(|w| w[0].twi < w[1].twi));
    }

    #[test]
    fn test_representative_values() {
        // min 0, max 4, nbins 3 -> interval 1, edges [0, 1, 2, 3]
        let values = vec![0.0, 0.5, 1.5, 2.5, 3.0, 4.0];
        let table = TwiBinner { nbins: 3 }.bin_values(&values).unwrap();
        let twi: Vec<f64> = table.bins.iter().map(|b| b.twi).collect();
        assert_eq!(twi, vec![0.0, 0.5, 1.5]);

        // 4.0 lies beyond the last edge and is dropped
        let proportions: Vec<f64> = table.bins.iter().map(|b| b.proportion).collect();
        assert_eq!(proportions, vec![0.4, 0.2, 0.4]);
    }

    #[test]
    fn test_value_on_inner_edge_opens_next_bin() {
        let (min, max, nbins) = (1.0, 8.3, 3);
        let edge = min + 2.0 * ((max - min) / (nbins as f64 + 1.0));
        let table = TwiBinner { nbins }.bin_values(&[min, edge, max]).unwrap();
        let proportions: Vec<f64> = table.bins.iter().map(|b| b.proportion).collect();
        assert_eq!(proportions, vec![0.5, 0.0, 0.5]);
    }

    #[test]
    fn test_first_bin_is_half_lower_edge() {
        let values = vec![2.0, 3.0, 6.0];
        let table = TwiBinner { nbins: 1 }.bin_values(&values).unwrap();
        assert_eq!(table.bins[0].twi, 1.0);
        assert_eq!(table.bins[0].proportion, 1.0);
    }

    #[test]
    fn test_negative_values_are_excluded() {
        let values = vec![-5.0, -1.0, 1.0, 3.0];
        let table = TwiBinner { nbins: 2 }.bin_values(&values).unwrap();
        // min 1 -> first representative is 0.5
        assert_eq!(table.bins[0].twi, 0.5);
    }

    #[test]
    fn test_uniform_values_are_degenerate() {
        let err = TwiBinner::default().bin_values(&[5.0; 10]).unwrap_err();
        assert_eq!(*err.current_context(), BasinError::DegenerateDistribution);
    }

    #[test]
    fn test_no_valid_values_is_empty_zone() {
        let err = TwiBinner::default().bin_values(&[-1.0, f64::NAN]).unwrap_err();
        assert_eq!(*err.current_context(), BasinError::EmptyZone);
    }

    #[test]
    fn test_twi_bins_over_raster() {
        let crs = SpatialReference::new("+proj=utm +zone=16 +datum=NAD83 +units=m +no_defs").unwrap();
        let gt = GeoTransform::new(0.0, 10.0, 40.0, -10.0).unwrap();
        let data: Vec<f64> = (0..16).map(|v| v as f64).collect();
        let raster = Raster::new("twi.tif", data, 4, 4, gt, crs.clone(), Some(-9999.0)).unwrap();
        let geometry = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 40.0, y: 0.0),
            (x: 40.0, y: 40.0),
            (x: 0.0, y: 40.0),
            (x: 0.0, y: 0.0),
        ]]);
        let feature = PolygonFeature::new(geometry, crs).unwrap();

        let table = twi_bins(&raster, &feature, 5).unwrap();
        assert_eq!(table.len(), 5);
        assert!((table.total_proportion() - 1.0).abs() < 1e-9);
    }
}
