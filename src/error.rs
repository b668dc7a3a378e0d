use std::fmt;

/// Failure kinds surfaced by the basin characteristics engine.
///
/// Used as the `error_stack` context for every fallible operation in the
/// crate; the underlying gdal/proj/netcdf/io error is kept as the report's
/// source and the offending path or CRS is attached as printable context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasinError {
    /// A CRS is missing or could not be parsed.
    InvalidReferenceSystem,
    /// The zonal mask has no valid cells.
    EmptyZone,
    /// The binned value range has zero width.
    DegenerateDistribution,
    /// Simplify, clip, dissolve or erase produced no geometry.
    GeometryOperation,
    /// The requested date range is outside the archive coverage.
    ArchiveLookup,
    /// A raster, vector or archive file could not be opened or read.
    ResourceOpen,
    /// A derived vector source or a table could not be written.
    Output,
}

impl fmt::Display for BasinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            BasinError::InvalidReferenceSystem => "invalid or missing spatial reference system",
            BasinError::EmptyZone => "zonal mask contains no valid cells",
            BasinError::DegenerateDistribution => "value range has zero width, cannot bin",
            BasinError::GeometryOperation => "geometry operation produced no geometry",
            BasinError::ArchiveLookup => "requested dates are outside the climate archive",
            BasinError::ResourceOpen => "failed to open or read a data source",
            BasinError::Output => "failed to write output",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for BasinError {}

pub type Result<T> = error_stack::Result<T, BasinError>;
