use std::fs;
use std::path::{Path, PathBuf};

use error_stack::{Report, ResultExt};
use gdal::vector::LayerAccess;
use gdal::Dataset;
use geo::{Area, BoundingRect, Centroid, MultiPolygon};
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, JsonObject, Value};
use log::{debug, info};
use serde_json::json;

use crate::crs::{transform_point, CoordinateTransform, SpatialReference};
use crate::error::{BasinError, Result};

/// Axis-aligned bounding envelope (xmin, xmax, ymin, ymax).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

impl Envelope {
    pub fn of(geometry: &MultiPolygon<f64>) -> Option<Envelope> {
        geometry.bounding_rect().map(|rect| Envelope {
            xmin: rect.min().x,
            xmax: rect.max().x,
            ymin: rect.min().y,
            ymax: rect.max().y,
        })
    }

    pub fn intersects(&self, other: &Envelope) -> bool {
        self.xmin <= other.xmax && other.xmin <= self.xmax && self.ymin <= other.ymax && other.ymin <= self.ymax
    }
}

/// A single polygonal feature together with its reference system.
///
/// Geometry operations never mutate a feature; they build a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonFeature {
    pub geometry: MultiPolygon<f64>,
    pub crs: SpatialReference,
    pub centroid: (f64, f64),
    pub envelope: Envelope,
    /// Backing file when the feature was loaded from or persisted to disk.
    pub path: Option<PathBuf>,
}

impl PolygonFeature {
    pub fn new(geometry: MultiPolygon<f64>, crs: SpatialReference) -> Result<Self> {
        let envelope = Envelope::of(&geometry)
            .ok_or_else(|| Report::new(BasinError::GeometryOperation).attach_printable("geometry is empty"))?;
        let centroid = geometry
            .centroid()
            .map(|p| (p.x(), p.y()))
            .ok_or_else(|| Report::new(BasinError::GeometryOperation).attach_printable("geometry has no centroid"))?;

        Ok(PolygonFeature {
            geometry,
            crs,
            centroid,
            envelope,
            path: None,
        })
    }

    /// Loads feature 0 of the first layer of any OGR-readable vector source.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let layer = VectorLayer::open(path)?;
        let geometry = layer.geometries.into_iter().next().ok_or_else(|| {
            Report::new(BasinError::ResourceOpen)
                .attach_printable(format!("vector source {} has no features", path.display()))
        })?;

        let mut feature = PolygonFeature::new(geometry, layer.crs)?;
        feature.path = Some(path.to_path_buf());
        Ok(feature)
    }

    /// Planar area in the feature's CRS units.
    pub fn area(&self) -> f64 {
        self.geometry.unsigned_area()
    }

    /// Centroid expressed in another reference system, e.g. the Daymet grid.
    pub fn projected_centroid(&self, target: &SpatialReference) -> Result<(f64, f64)> {
        transform_point(self.centroid.0, self.centroid.1, &self.crs, target)
    }

    /// File stem used to name derived vector sources.
    pub fn stem(&self) -> String {
        self.path
            .as_ref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("basin"))
    }

    /// Persists the feature as a single-feature GeoJSON source, replacing any
    /// existing file at `path`, and returns the file-backed feature.
    pub fn persist<P: AsRef<Path>>(&self, path: P) -> Result<PolygonFeature> {
        let path = path.as_ref();
        write_geojson(path, &self.geometry, &self.crs)?;
        info!("wrote {}", path.display());

        let mut persisted = self.clone();
        persisted.path = Some(path.to_path_buf());
        Ok(persisted)
    }
}

/// Every polygonal feature of a vector source, e.g. the karst-sink layer.
#[derive(Debug, Clone)]
pub struct VectorLayer {
    pub geometries: Vec<MultiPolygon<f64>>,
    pub crs: SpatialReference,
}

impl VectorLayer {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let dataset = Dataset::open(path)
            .change_context(BasinError::ResourceOpen)
            .attach_printable_lazy(|| format!("vector source {}", path.display()))?;
        let mut layer = dataset
            .layer(0)
            .change_context(BasinError::ResourceOpen)
            .attach_printable_lazy(|| format!("vector source {} has no layer", path.display()))?;

        let srs = layer.spatial_ref().ok_or_else(|| {
            Report::new(BasinError::InvalidReferenceSystem)
                .attach_printable(format!("vector source {} has no spatial reference", path.display()))
        })?;
        let crs = SpatialReference::from_gdal(&srs)?;

        let mut geometries = Vec::new();
        for feature in layer.features() {
            let Some(geometry) = feature.geometry() else {
                continue;
            };
            let json = geometry
                .json()
                .change_context(BasinError::ResourceOpen)
                .attach_printable_lazy(|| format!("unreadable geometry in {}", path.display()))?;
            geometries.push(parse_polygonal(&json)?);
        }
        debug!("read {} feature(s) from {}", geometries.len(), path.display());

        Ok(VectorLayer { geometries, crs })
    }

    /// Returns a copy of the layer in `target`'s reference system.
    pub fn reprojected(&self, target: &SpatialReference) -> Result<VectorLayer> {
        if &self.crs == target {
            return Ok(self.clone());
        }
        let transform = CoordinateTransform::new(&self.crs, target)?;
        let geometries = self
            .geometries
            .iter()
            .map(|g| transform.multi_polygon(g))
            .collect::<Result<Vec<_>>>()?;
        Ok(VectorLayer {
            geometries,
            crs: target.clone(),
        })
    }

    pub fn envelope(&self) -> Option<Envelope> {
        self.geometries
            .iter()
            .filter_map(Envelope::of)
            .reduce(|a, b| Envelope {
                xmin: a.xmin.min(b.xmin),
                xmax: a.xmax.max(b.xmax),
                ymin: a.ymin.min(b.ymin),
                ymax: a.ymax.max(b.ymax),
            })
    }
}

fn parse_polygonal(json: &str) -> Result<MultiPolygon<f64>> {
    let geojson: GeoJson = json
        .parse()
        .change_context(BasinError::ResourceOpen)
        .attach_printable("geometry is not valid GeoJSON")?;

    let geometry = match geojson {
        GeoJson::Geometry(geometry) => geometry,
        _ => {
            return Err(Report::new(BasinError::ResourceOpen).attach_printable("expected a bare geometry"));
        }
    };

    match geo::Geometry::<f64>::try_from(geometry).change_context(BasinError::ResourceOpen)? {
        geo::Geometry::Polygon(polygon) => Ok(MultiPolygon::new(vec![polygon])),
        geo::Geometry::MultiPolygon(multi) => Ok(multi),
        other => Err(Report::new(BasinError::GeometryOperation)
            .attach_printable(format!("unsupported geometry type: {}", geometry_kind(&other)))),
    }
}

fn geometry_kind(geometry: &geo::Geometry<f64>) -> &'static str {
    match geometry {
        geo::Geometry::Point(_) => "Point",
        geo::Geometry::Line(_) => "Line",
        geo::Geometry::LineString(_) => "LineString",
        geo::Geometry::MultiPoint(_) => "MultiPoint",
        geo::Geometry::MultiLineString(_) => "MultiLineString",
        geo::Geometry::GeometryCollection(_) => "GeometryCollection",
        geo::Geometry::Rect(_) => "Rect",
        geo::Geometry::Triangle(_) => "Triangle",
        geo::Geometry::Polygon(_) => "Polygon",
        geo::Geometry::MultiPolygon(_) => "MultiPolygon",
    }
}

/// Writes a one-feature FeatureCollection carrying a legacy `crs` member so
/// that OGR can read the reference system back.
pub fn write_geojson(path: &Path, geometry: &MultiPolygon<f64>, crs: &SpatialReference) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .change_context(BasinError::Output)
            .attach_printable_lazy(|| format!("could not replace {}", path.display()))?;
    }

    let feature = Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::from(geometry))),
        id: None,
        properties: None,
        foreign_members: None,
    };

    let mut foreign_members = JsonObject::new();
    foreign_members.insert(
        String::from("crs"),
        json!({
            "type": "name",
            "properties": {
                "name": crs.as_str()
            }
        }),
    );

    let collection = FeatureCollection {
        bbox: None,
        features: vec![feature],
        foreign_members: Some(foreign_members),
    };

    let serialized = serde_json::to_string_pretty(&collection).change_context(BasinError::Output)?;
    fs::write(path, serialized)
        .change_context(BasinError::Output)
        .attach_printable_lazy(|| format!("could not write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdal::spatial_ref::SpatialRef;
    use gdal::vector::{LayerOptions, ToGdal};
    use gdal::DriverManager;
    use gdal_sys::OGRwkbGeometryType;
    use geo::polygon;

    const UTM16: &str = "+proj=utm +zone=16 +datum=NAD83 +units=m +no_defs";

    fn rectangle(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: xmin, y: ymin),
            (x: xmax, y: ymin),
            (x: xmax, y: ymax),
            (x: xmin, y: ymax),
            (x: xmin, y: ymin),
        ]])
    }

    #[test]
    fn test_new_computes_envelope_centroid_area() {
        let crs = SpatialReference::new(UTM16).unwrap();
        let feature = PolygonFeature::new(rectangle(0.0, 0.0, 20.0, 10.0), crs).unwrap();

        assert_eq!(feature.envelope, Envelope { xmin: 0.0, xmax: 20.0, ymin: 0.0, ymax: 10.0 });
        assert!((feature.centroid.0 - 10.0).abs() < 1e-9);
        assert!((feature.centroid.1 - 5.0).abs() < 1e-9);
        assert!((feature.area() - 200.0).abs() < 1e-9);
        assert_eq!(feature.stem(), "basin");
    }

    #[test]
    fn test_empty_geometry_is_rejected() {
        let crs = SpatialReference::new(UTM16).unwrap();
        let err = PolygonFeature::new(MultiPolygon::new(vec![]), crs).unwrap_err();
        assert_eq!(*err.current_context(), BasinError::GeometryOperation);
    }

    #[test]
    fn test_envelope_intersects() {
        let a = Envelope { xmin: 0.0, xmax: 10.0, ymin: 0.0, ymax: 10.0 };
        let b = Envelope { xmin: 10.0, xmax: 20.0, ymin: 5.0, ymax: 6.0 };
        let c = Envelope { xmin: 10.5, xmax: 20.0, ymin: 5.0, ymax: 6.0 };
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_parse_polygonal_accepts_polygon_and_rejects_lines() {
        let poly = r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1],[0,0]]]}"#;
        let parsed = parse_polygonal(poly).unwrap();
        assert_eq!(parsed.0.len(), 1);

        let line = r#"{"type":"LineString","coordinates":[[0,0],[1,1]]}"#;
        let err = parse_polygonal(line).unwrap_err();
        assert_eq!(*err.current_context(), BasinError::GeometryOperation);
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_shapefile(path: &Path, proj4: Option<&str>, parts: &[MultiPolygon<f64>]) {
        let driver = DriverManager::get_driver_by_name("ESRI Shapefile").unwrap();
        let mut dataset = driver.create_vector_only(path).unwrap();
        let srs = proj4.map(|p| SpatialRef::from_proj4(p).unwrap());
        let mut layer = dataset
            .create_layer(LayerOptions {
                name: "basin",
                srs: srs.as_ref(),
                ty: OGRwkbGeometryType::wkbPolygon,
                ..Default::default()
            })
            .unwrap();
        for part in parts {
            layer.create_feature(part.0[0].to_gdal().unwrap()).unwrap();
        }
    }

    fn same_place(a: &SpatialReference, b: &SpatialReference) -> bool {
        let (x, y) = transform_point(600000.0, 4100000.0, a, b).unwrap();
        (x - 600000.0).abs() < 1e-6 && (y - 4100000.0).abs() < 1e-6
    }

    #[test]
    fn test_open_takes_first_feature() {
        let dir = scratch_dir("waterbasin_geometry_shapefile");
        let path = dir.join("basin.shp");
        write_shapefile(&path, Some(UTM16), &[rectangle(0.0, 0.0, 20.0, 10.0), rectangle(100.0, 100.0, 110.0, 110.0)]);

        let layer = VectorLayer::open(&path).unwrap();
        assert_eq!(layer.geometries.len(), 2);

        let feature = PolygonFeature::open(&path).unwrap();
        assert!((feature.area() - 200.0).abs() < 1e-9);
        assert_eq!(feature.stem(), "basin");
        assert!(same_place(&feature.crs, &SpatialReference::new(UTM16).unwrap()));
    }

    #[test]
    fn test_open_without_reference_system_is_rejected() {
        let dir = scratch_dir("waterbasin_geometry_no_srs");
        let path = dir.join("basin.shp");
        write_shapefile(&path, None, &[rectangle(0.0, 0.0, 20.0, 10.0)]);

        let err = PolygonFeature::open(&path).unwrap_err();
        assert_eq!(*err.current_context(), BasinError::InvalidReferenceSystem);
    }

    #[test]
    fn test_persisted_feature_reopens_with_its_crs() {
        let dir = scratch_dir("waterbasin_geometry_roundtrip");
        let crs = SpatialReference::new(UTM16).unwrap();
        let feature = PolygonFeature::new(rectangle(600000.0, 4100000.0, 600050.0, 4100040.0), crs.clone()).unwrap();
        let persisted = feature.persist(dir.join("rockcastle_simple.geojson")).unwrap();

        let reopened = PolygonFeature::open(persisted.path.as_ref().unwrap()).unwrap();
        assert!((reopened.area() - 2000.0).abs() < 1e-6);
        assert_eq!(reopened.envelope, feature.envelope);
        assert!(same_place(&reopened.crs, &crs));
    }

    #[test]
    fn test_open_missing_source_is_resource_error() {
        let err = PolygonFeature::open("/nonexistent/waterbasin/basin.shp").unwrap_err();
        assert_eq!(*err.current_context(), BasinError::ResourceOpen);
    }

    #[test]
    fn test_persist_replaces_existing_file() {
        let dir = std::env::temp_dir().join("waterbasin_geometry_persist");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("derived.geojson");
        fs::write(&path, "stale").unwrap();

        let crs = SpatialReference::new(UTM16).unwrap();
        let feature = PolygonFeature::new(rectangle(0.0, 0.0, 1.0, 1.0), crs).unwrap();
        let persisted = feature.persist(&path).unwrap();

        assert_eq!(persisted.path.as_deref(), Some(path.as_path()));
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("FeatureCollection"));
        assert!(written.contains("+proj=utm"));
        assert_eq!(persisted.stem(), "derived");
    }
}
