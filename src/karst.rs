use std::path::{Path, PathBuf};

use error_stack::{Report, ResultExt};
use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{BooleanOps, Intersects, Line, LineString, MultiPolygon, Polygon, Simplify};
use log::{debug, info, warn};

use crate::crs::reconcile;
use crate::error::{BasinError, Result};
use crate::geometry::{Envelope, PolygonFeature, VectorLayer};
use crate::raster::GridSource;
use crate::rasterize::{bbox_to_pixel_offsets, AlignedWindow, BurnGrid, WindowReducer};

/// Boundary simplification tolerance in source CRS units.
pub const DEFAULT_SIMPLIFY_TOLERANCE: f64 = 100.0;

/// Flags a polygon that overlaps any non-zero, valid karst-sink cell.
pub struct KarstDetector;

impl WindowReducer for KarstDetector {
    type Output = bool;

    fn reduce(&self, window: &AlignedWindow) -> Result<bool> {
        Ok(window.valid_values().any(|v| v != 0.0))
    }
}

pub fn detect(raster: &dyn GridSource, basin: &PolygonFeature) -> Result<bool> {
    let flag = KarstDetector.apply(raster, basin)?;
    info!("karst detection against {}: {}", raster.name(), flag);
    Ok(flag)
}

fn simplify_ring(ring: &LineString<f64>, tolerance: f64) -> Option<LineString<f64>> {
    let simple = ring.simplify(&tolerance);
    // a closed ring needs three distinct vertices
    if simple.0.len() < 4 {
        return None;
    }
    Some(simple)
}

/// True when two edges of the closed `ring` meet anywhere other than the
/// vertex shared by neighbouring edges.
pub fn ring_self_intersects(ring: &LineString<f64>) -> bool {
    let lines: Vec<Line<f64>> = ring.lines().collect();
    let n = lines.len();
    for i in 0..n {
        for j in i + 1..n {
            let neighbours = j == i + 1 || (i == 0 && j == n - 1);
            match line_intersection(lines[i], lines[j]) {
                None => {}
                Some(LineIntersection::SinglePoint { .. }) if neighbours => {}
                Some(_) => return true,
            }
        }
    }
    false
}

fn is_simple_polygon(polygon: &Polygon<f64>) -> bool {
    let rings: Vec<&LineString<f64>> = std::iter::once(polygon.exterior()).chain(polygon.interiors()).collect();
    if rings.iter().any(|ring| ring_self_intersects(ring)) {
        return false;
    }
    for (i, a) in rings.iter().enumerate() {
        if rings[i + 1..].iter().any(|b| a.intersects(*b)) {
            return false;
        }
    }
    true
}

fn simplify_polygon(polygon: &Polygon<f64>, tolerance: f64) -> Option<Polygon<f64>> {
    let exterior = simplify_ring(polygon.exterior(), tolerance)?;
    let interiors = polygon
        .interiors()
        .iter()
        .filter_map(|ring| simplify_ring(ring, tolerance))
        .collect();
    let simple = Polygon::new(exterior, interiors);
    if is_simple_polygon(&simple) {
        return Some(simple);
    }
    warn!(
        "simplifying with tolerance {} made a polygon cross itself, keeping its {} original vertices",
        tolerance,
        polygon.exterior().0.len()
    );
    Some(polygon.clone())
}

/// Douglas-Peucker simplification of every ring. Rings that collapse are
/// dropped; a polygon whose exterior collapses is dropped entirely. A polygon
/// whose simplified rings would cross is kept unsimplified.
pub fn simplify(feature: &PolygonFeature, tolerance: f64) -> Result<PolygonFeature> {
    let polygons: Vec<Polygon<f64>> = feature
        .geometry
        .iter()
        .filter_map(|polygon| simplify_polygon(polygon, tolerance))
        .collect();

    if polygons.is_empty() {
        return Err(Report::new(BasinError::GeometryOperation)
            .attach_printable(format!("simplify with tolerance {} collapsed the polygon", tolerance)));
    }

    let before: usize = feature.geometry.iter().map(|p| p.exterior().0.len()).sum();
    let after: usize = polygons.iter().map(|p| p.exterior().0.len()).sum();
    debug!("simplified exterior vertices {} -> {}", before, after);

    PolygonFeature::new(MultiPolygon::new(polygons), feature.crs.clone())
}

/// Unions parts pairwise, halving the list each round.
fn union_all(mut parts: Vec<MultiPolygon<f64>>) -> MultiPolygon<f64> {
    while parts.len() > 1 {
        let mut merged = Vec::with_capacity((parts.len() + 1) / 2);
        let mut iter = parts.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => merged.push(a.union(&b)),
                None => merged.push(a),
            }
        }
        parts = merged;
    }
    parts.pop().unwrap_or_else(|| MultiPolygon::new(vec![]))
}

/// Intersects the sink layer with `basin`, returning the karst sub-region in
/// the basin's CRS.
pub fn clip(sinks: &VectorLayer, basin: &PolygonFeature) -> Result<PolygonFeature> {
    let sinks = sinks.reprojected(&basin.crs)?;

    let candidates: Vec<MultiPolygon<f64>> = sinks
        .geometries
        .into_iter()
        .filter(|g| Envelope::of(g).map_or(false, |e| e.intersects(&basin.envelope)))
        .collect();
    debug!("{} sink feature(s) overlap the basin envelope", candidates.len());

    let clipped = union_all(candidates).intersection(&basin.geometry);
    PolygonFeature::new(clipped, basin.crs.clone()).attach_printable("karst sinks do not intersect the basin")
}

/// Removes `region` from `feature`; the result stays in `feature`'s CRS.
pub fn erase(feature: &PolygonFeature, region: &PolygonFeature) -> Result<PolygonFeature> {
    let region = reconcile(region, &feature.crs)?;
    let remainder = feature.geometry.difference(&region.geometry);
    PolygonFeature::new(remainder, feature.crs.clone()).attach_printable("erase left nothing of the polygon")
}

/// Burns every feature of `layer` onto `template`'s grid, polygonizes the
/// burned cells and unions them into a single multipolygon feature in the
/// template's CRS.
pub fn dissolve(template: &dyn GridSource, layer: &VectorLayer) -> Result<PolygonFeature> {
    let layer = layer.reprojected(template.crs())?;
    let envelope = layer
        .envelope()
        .ok_or_else(|| Report::new(BasinError::GeometryOperation).attach_printable("layer to dissolve is empty"))?;

    let gt = template.geo_transform();
    let window = bbox_to_pixel_offsets(&gt, &envelope);
    let window_gt = gt.shifted(window.x_offset, window.y_offset);

    let mut grid = BurnGrid::new(&window_gt, window.width, window.height)?;
    for geometry in &layer.geometries {
        grid.burn(geometry)?;
    }
    let regions = grid.polygonize()?;
    debug!("dissolving {} burned region(s) in window {:?}", regions.len(), window);

    let parts = regions.into_iter().map(|polygon| MultiPolygon::new(vec![polygon])).collect();
    let dissolved = union_all(parts);
    PolygonFeature::new(dissolved, template.crs().clone()).attach_printable("no cells were burned while dissolving")
}

/// Derived polygons of a basin that overlaps karst terrain. Every feature is
/// file-backed.
#[derive(Debug, Clone)]
pub struct KarstRegion {
    pub simplified: PolygonFeature,
    /// Karst sub-region, in the basin's CRS.
    pub region: PolygonFeature,
    /// Basin minus the karst sub-region; `None` when the whole basin is karst.
    pub remainder: Option<PolygonFeature>,
}

#[derive(Debug, Clone)]
pub enum KarstOutcome {
    Absent,
    Present(KarstRegion),
}

/// Detect, simplify, clip, erase.
pub struct KarstPipeline<'a> {
    pub raster: &'a dyn GridSource,
    pub sinks: &'a VectorLayer,
    pub tolerance: f64,
    pub output_dir: PathBuf,
}

impl<'a> KarstPipeline<'a> {
    pub fn new<P: AsRef<Path>>(raster: &'a dyn GridSource, sinks: &'a VectorLayer, output_dir: P) -> Self {
        KarstPipeline {
            raster,
            sinks,
            tolerance: DEFAULT_SIMPLIFY_TOLERANCE,
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    fn derived_path(&self, stem: &str, suffix: &str) -> PathBuf {
        self.output_dir.join(format!("{}_{}.geojson", stem, suffix))
    }

    pub fn run(&self, basin: &PolygonFeature) -> Result<KarstOutcome> {
        if !detect(self.raster, basin)? {
            return Ok(KarstOutcome::Absent);
        }

        let stem = basin.stem();
        let simplified = simplify(basin, self.tolerance)?.persist(self.derived_path(&stem, "simple"))?;
        let region = clip(self.sinks, &simplified)?.persist(self.derived_path(&stem, "simple_karst"))?;

        let remainder = match erase(basin, &region) {
            Ok(rest) => Some(rest.persist(self.derived_path(&stem, "notkarst"))?),
            Err(report) if *report.current_context() == BasinError::GeometryOperation => {
                warn!("basin {} lies entirely within karst terrain", stem);
                None
            }
            Err(report) => return Err(report),
        };

        info!("karst region of {} covers {:.1} square units", stem, region.area());
        Ok(KarstOutcome::Present(KarstRegion { simplified, region, remainder }))
    }

    /// Dissolves the sink layer onto the karst raster grid and persists it
    /// next to the other derived sources.
    pub fn flatten(&self, stem: &str) -> Result<PolygonFeature> {
        dissolve(self.raster, self.sinks)?.persist(self.derived_path(stem, "karst_flat"))
    }
}
