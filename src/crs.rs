use std::borrow::Cow;
use std::fmt;

use error_stack::{Report, ResultExt};
use gdal::spatial_ref::SpatialRef;
use geo::{Coord, MapCoords, MultiPolygon};
use log::debug;
use proj::Proj;

use crate::error::{BasinError, Result};
use crate::geometry::PolygonFeature;

/// A coordinate reference system in its PROJ string form.
///
/// Definitions are whitespace-normalized on construction so that two
/// references compare equal exactly when their normalized strings match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpatialReference {
    definition: String,
}

impl SpatialReference {
    /// Parses and validates a PROJ/EPSG/WKT definition.
    pub fn new(definition: &str) -> Result<Self> {
        let normalized = definition.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            return Err(Report::new(BasinError::InvalidReferenceSystem)
                .attach_printable("empty CRS definition"));
        }

        Proj::new(&normalized)
            .change_context(BasinError::InvalidReferenceSystem)
            .attach_printable_lazy(|| format!("unparseable CRS: {}", normalized))?;

        Ok(SpatialReference { definition: normalized })
    }

    /// Exports a gdal spatial reference to PROJ4 and wraps it.
    pub fn from_gdal(srs: &SpatialRef) -> Result<Self> {
        let proj4 = srs
            .to_proj4()
            .change_context(BasinError::InvalidReferenceSystem)
            .attach_printable("could not export spatial reference to PROJ4")?;
        SpatialReference::new(&proj4)
    }

    pub fn from_wkt(wkt: &str) -> Result<Self> {
        if wkt.trim().is_empty() {
            return Err(Report::new(BasinError::InvalidReferenceSystem)
                .attach_printable("data source has no projection"));
        }
        let srs = SpatialRef::from_wkt(wkt)
            .change_context(BasinError::InvalidReferenceSystem)
            .attach_printable_lazy(|| format!("unparseable WKT: {}", wkt))?;
        SpatialReference::from_gdal(&srs)
    }

    pub fn as_str(&self) -> &str {
        &self.definition
    }
}

impl fmt::Display for SpatialReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.definition)
    }
}

/// Point and geometry transformation between two reference systems.
///
/// Axis order is always (x/easting/longitude, y/northing/latitude).
pub struct CoordinateTransform {
    proj: Proj,
}

impl CoordinateTransform {
    pub fn new(from: &SpatialReference, to: &SpatialReference) -> Result<Self> {
        let proj = Proj::new_known_crs(from.as_str(), to.as_str(), None)
            .change_context(BasinError::InvalidReferenceSystem)
            .attach_printable_lazy(|| format!("no transformation from `{}` to `{}`", from, to))?;
        Ok(CoordinateTransform { proj })
    }

    pub fn point(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        self.proj
            .convert((x, y))
            .change_context(BasinError::InvalidReferenceSystem)
            .attach_printable_lazy(|| format!("failed to transform ({}, {})", x, y))
    }

    pub fn multi_polygon(&self, geometry: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>> {
        let proj = &self.proj;
        geometry
            .try_map_coords(|c: Coord<f64>| proj.convert((c.x, c.y)).map(|(x, y)| Coord { x, y }))
            .change_context(BasinError::InvalidReferenceSystem)
            .attach_printable("failed to transform geometry")
    }
}

/// Transforms a single point between two reference systems.
pub fn transform_point(x: f64, y: f64, from: &SpatialReference, to: &SpatialReference) -> Result<(f64, f64)> {
    if from == to {
        return Ok((x, y));
    }
    CoordinateTransform::new(from, to)?.point(x, y)
}

/// Brings a polygon feature into `target`'s reference system.
///
/// Returns the feature untouched when both systems already agree. Otherwise
/// the returned feature is an owned, in-memory reprojection that is released
/// as soon as the caller drops it.
pub fn reconcile<'a>(feature: &'a PolygonFeature, target: &SpatialReference) -> Result<Cow<'a, PolygonFeature>> {
    if &feature.crs == target {
        debug!("CRS already aligned: {}", target);
        return Ok(Cow::Borrowed(feature));
    }

    debug!("reprojecting feature from `{}` to `{}`", feature.crs, target);
    let transform = CoordinateTransform::new(&feature.crs, target)?;
    let geometry = transform.multi_polygon(&feature.geometry)?;
    let reprojected = PolygonFeature::new(geometry, target.clone())
        .attach_printable("reprojected feature is empty")?;
    Ok(Cow::Owned(reprojected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    const UTM16: &str = "+proj=utm +zone=16 +datum=NAD83 +units=m +no_defs";
    const LONLAT: &str = "+proj=longlat +datum=NAD83 +no_defs";

    fn square(crs: &str) -> PolygonFeature {
        let poly = polygon![
            (x: 600000.0, y: 4100000.0),
            (x: 601000.0, y: 4100000.0),
            (x: 601000.0, y: 4101000.0),
            (x: 600000.0, y: 4101000.0),
            (x: 600000.0, y: 4100000.0),
        ];
        PolygonFeature::new(MultiPolygon::new(vec![poly]), SpatialReference::new(crs).unwrap()).unwrap()
    }

    #[test]
    fn test_definition_is_whitespace_normalized() {
        let a = SpatialReference::new("  +proj=utm   +zone=16 +datum=NAD83 +units=m +no_defs ").unwrap();
        let b = SpatialReference::new(UTM16).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_definition_is_invalid() {
        let err = SpatialReference::new("   ").unwrap_err();
        assert_eq!(*err.current_context(), BasinError::InvalidReferenceSystem);
    }

    #[test]
    fn test_garbage_definition_is_invalid() {
        let err = SpatialReference::new("+proj=not_a_projection +foo").unwrap_err();
        assert_eq!(*err.current_context(), BasinError::InvalidReferenceSystem);
    }

    #[test]
    fn test_reconcile_aligned_is_noop() {
        let feature = square(UTM16);
        let target = SpatialReference::new(UTM16).unwrap();

        let once = reconcile(&feature, &target).unwrap();
        assert!(matches!(once, Cow::Borrowed(_)));
        let twice = reconcile(&once, &target).unwrap();
        assert!(matches!(twice, Cow::Borrowed(_)));
        assert_eq!(twice.geometry, feature.geometry);
    }

    #[test]
    fn test_reconcile_reprojects_and_round_trips() {
        let feature = square(UTM16);
        let lonlat = SpatialReference::new(LONLAT).unwrap();

        let geographic = reconcile(&feature, &lonlat).unwrap();
        assert!(matches!(geographic, Cow::Owned(_)));
        assert_eq!(geographic.crs, lonlat);
        // zone 16 spans -90..-84 degrees
        assert!(geographic.centroid.0 < -84.0 && geographic.centroid.0 > -90.0);
        assert!(geographic.centroid.1 > 30.0 && geographic.centroid.1 < 45.0);

        let utm = SpatialReference::new(UTM16).unwrap();
        let back = reconcile(&geographic, &utm).unwrap();
        assert!((back.envelope.xmin - 600000.0).abs() < 1e-3);
        assert!((back.envelope.ymax - 4101000.0).abs() < 1e-3);
    }

    #[test]
    fn test_transform_point_same_crs_is_identity() {
        let crs = SpatialReference::new(UTM16).unwrap();
        assert_eq!(transform_point(1.5, 2.5, &crs, &crs).unwrap(), (1.5, 2.5));
    }
}
