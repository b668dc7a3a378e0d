use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use error_stack::{Report, ResultExt};
use log::{debug, info, warn};
use netcdf::AttributeValue;
use walkdir::WalkDir;

use crate::error::{BasinError, Result};
use crate::utils::nearest_index;

/// The two gridded daily variables held in the climate archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClimateVariable {
    Precipitation,
    MaxTemperature,
}

impl ClimateVariable {
    /// Variable name inside an archive file.
    pub fn variable_name(&self) -> &'static str {
        match self {
            ClimateVariable::Precipitation => "prcp",
            ClimateVariable::MaxTemperature => "tmax",
        }
    }

    /// Filename suffix that marks an archive file as holding this variable.
    pub fn file_suffix(&self) -> &'static str {
        match self {
            ClimateVariable::Precipitation => "p.nc",
            ClimateVariable::MaxTemperature => "x.nc",
        }
    }

    /// Column header used in the merged time series table.
    pub fn column(&self) -> &'static str {
        match self {
            ClimateVariable::Precipitation => "precipitation (mm/day)",
            ClimateVariable::MaxTemperature => "temperature (celsius)",
        }
    }

    pub fn from_path(path: &Path) -> Option<ClimateVariable> {
        let name = path.file_name()?.to_str()?;
        [ClimateVariable::Precipitation, ClimateVariable::MaxTemperature]
            .into_iter()
            .find(|v| name.ends_with(v.file_suffix()))
    }
}

/// A single-variable daily grid: 1-D x, y and time axes over a
/// (time, y, x) value cube.
pub trait GridArchive {
    fn name(&self) -> &str;
    fn x(&self) -> &[f64];
    fn y(&self) -> &[f64];
    fn times(&self) -> &[NaiveDateTime];
    /// Values at cell (`iy`, `ix`) for time indices `t_start..=t_end`.
    fn cell_series(&self, t_start: usize, t_end: usize, iy: usize, ix: usize) -> Result<Vec<f64>>;
}

// about three million years either side of the reference time
const MAX_OFFSET_MILLIS: f64 = 1e17;

/// Decodes a CF `"<unit> since <timestamp>"` axis on the standard calendar.
///
/// Non-finite offsets (an unmasked fill value, say) and offsets that would
/// leave the representable date range are rejected.
pub fn decode_time_axis(units: &str, offsets: &[f64]) -> Result<Vec<NaiveDateTime>> {
    let invalid = || Report::new(BasinError::ResourceOpen).attach_printable(format!("unsupported time units `{}`", units));

    let (unit, reference) = units.split_once(" since ").ok_or_else(invalid)?;
    let seconds_per_unit = match unit.trim().to_lowercase().as_str() {
        "days" | "day" | "d" => 86_400.0,
        "hours" | "hour" | "h" => 3_600.0,
        "minutes" | "minute" | "min" => 60.0,
        "seconds" | "second" | "s" => 1.0,
        _ => return Err(invalid()),
    };
    let origin = parse_reference_time(reference).ok_or_else(invalid)?;

    offsets
        .iter()
        .map(|&offset| {
            let out_of_range = || {
                Report::new(BasinError::ResourceOpen)
                    .attach_printable(format!("time offset {} {} is out of range", offset, units))
            };
            let millis = (offset * seconds_per_unit * 1000.0).round();
            if !millis.is_finite() || millis.abs() > MAX_OFFSET_MILLIS {
                return Err(out_of_range());
            }
            origin
                .checked_add_signed(Duration::milliseconds(millis as i64))
                .ok_or_else(out_of_range)
        })
        .collect()
}

fn parse_reference_time(reference: &str) -> Option<NaiveDateTime> {
    let trimmed = reference.trim().trim_end_matches("UTC").trim_end_matches('Z').trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// One archive file opened through the netcdf library.
pub struct NetcdfArchive {
    name: String,
    variable: ClimateVariable,
    file: netcdf::File,
    x: Vec<f64>,
    y: Vec<f64>,
    times: Vec<NaiveDateTime>,
    fill_value: Option<f64>,
}

fn read_axis(file: &netcdf::File, name: &str, path: &Path) -> Result<Vec<f64>> {
    file.variable(name)
        .ok_or_else(|| {
            Report::new(BasinError::ResourceOpen)
                .attach_printable(format!("{} has no `{}` variable", path.display(), name))
        })?
        .get_values::<f64, _>(..)
        .change_context(BasinError::ResourceOpen)
        .attach_printable_lazy(|| format!("reading `{}` from {}", name, path.display()))
}

fn f64_attr(var: &netcdf::Variable, name: &str) -> Option<f64> {
    if !var.attributes().any(|attr| attr.name() == name) {
        return None;
    }
    let value = var.attribute_value(name)?.ok()?;
    f64::try_from(value).ok()
}

fn str_attr(var: &netcdf::Variable, name: &str) -> Option<String> {
    if !var.attributes().any(|attr| attr.name() == name) {
        return None;
    }
    match var.attribute_value(name)?.ok()? {
        AttributeValue::Str(s) => Some(s),
        _ => None,
    }
}

impl NetcdfArchive {
    pub fn open<P: AsRef<Path>>(path: P, variable: ClimateVariable) -> Result<Self> {
        let path = path.as_ref();
        let file = netcdf::open(path)
            .change_context(BasinError::ResourceOpen)
            .attach_printable_lazy(|| format!("climate archive {}", path.display()))?;

        let x = read_axis(&file, "x", path)?;
        let y = read_axis(&file, "y", path)?;
        let offsets = read_axis(&file, "time", path)?;

        let (units, fill_value) = {
            let time_var = file.variable("time").ok_or_else(|| {
                Report::new(BasinError::ResourceOpen).attach_printable(format!("{} has no time axis", path.display()))
            })?;
            let units = str_attr(&time_var, "units").ok_or_else(|| {
                Report::new(BasinError::ResourceOpen)
                    .attach_printable(format!("{} time axis has no units", path.display()))
            })?;

            let data_var = file.variable(variable.variable_name()).ok_or_else(|| {
                Report::new(BasinError::ResourceOpen).attach_printable(format!(
                    "{} has no `{}` variable",
                    path.display(),
                    variable.variable_name()
                ))
            })?;
            let fill_value = f64_attr(&data_var, "_FillValue").or_else(|| f64_attr(&data_var, "missing_value"));
            (units, fill_value)
        };
        let times = decode_time_axis(&units, &offsets).attach_printable_lazy(|| path.display().to_string())?;

        debug!(
            "opened {} ({} x, {} y, {} day(s), fill {:?})",
            path.display(),
            x.len(),
            y.len(),
            times.len(),
            fill_value
        );

        Ok(NetcdfArchive {
            name: path.display().to_string(),
            variable,
            file,
            x,
            y,
            times,
            fill_value,
        })
    }
}

impl GridArchive for NetcdfArchive {
    fn name(&self) -> &str {
        &self.name
    }

    fn x(&self) -> &[f64] {
        &self.x
    }

    fn y(&self) -> &[f64] {
        &self.y
    }

    fn times(&self) -> &[NaiveDateTime] {
        &self.times
    }

    fn cell_series(&self, t_start: usize, t_end: usize, iy: usize, ix: usize) -> Result<Vec<f64>> {
        let var = self.file.variable(self.variable.variable_name()).ok_or_else(|| {
            Report::new(BasinError::ResourceOpen).attach_printable(format!("{} lost its data variable", self.name))
        })?;
        let values = var
            .get_values::<f64, _>((t_start..t_end + 1, iy, ix))
            .change_context(BasinError::ResourceOpen)
            .attach_printable_lazy(|| format!("reading cell ({}, {}) from {}", iy, ix, self.name))?;

        Ok(values
            .into_iter()
            .map(|v| match self.fill_value {
                Some(fill) if v == fill => f64::NAN,
                _ => v,
            })
            .collect())
    }
}

/// Inclusive extraction window; `end` defaults to the current time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DateRange {
    pub fn since(start: NaiveDate) -> Self {
        DateRange {
            start: start.and_hms_opt(0, 0, 0).unwrap_or_default(),
            end: Utc::now().naive_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClimateSeries {
    pub variable: ClimateVariable,
    pub records: Vec<(NaiveDateTime, f64)>,
}

fn nearest_time(times: &[NaiveDateTime], target: NaiveDateTime) -> Option<usize> {
    let seconds: Vec<f64> = times.iter().map(|t| (*t - target).num_seconds() as f64).collect();
    nearest_index(&seconds, 0.0)
}

/// Extracts the series at the grid cell nearest to (`x`, `y`), a point already
/// expressed in the archive's grid CRS. Each axis is matched independently.
pub fn extract_series(
    archive: &dyn GridArchive,
    variable: ClimateVariable,
    x: f64,
    y: f64,
    range: &DateRange,
) -> Result<ClimateSeries> {
    let times = archive.times();
    let (first, last) = match (times.first(), times.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => {
            return Err(Report::new(BasinError::ArchiveLookup)
                .attach_printable(format!("{} has an empty time axis", archive.name())));
        }
    };
    if range.end < first || range.start > last {
        return Err(Report::new(BasinError::ArchiveLookup).attach_printable(format!(
            "{} covers {} to {}, requested {} to {}",
            archive.name(),
            first,
            last,
            range.start,
            range.end
        )));
    }

    let lookup = |axis: &str| {
        Report::new(BasinError::ArchiveLookup).attach_printable(format!("{} has an empty {} axis", archive.name(), axis))
    };
    let ix = nearest_index(archive.x(), x).ok_or_else(|| lookup("x"))?;
    let iy = nearest_index(archive.y(), y).ok_or_else(|| lookup("y"))?;
    let t_start = nearest_time(times, range.start).ok_or_else(|| lookup("time"))?;
    let t_end = nearest_time(times, range.end).ok_or_else(|| lookup("time"))?;
    if t_end < t_start {
        return Err(Report::new(BasinError::ArchiveLookup)
            .attach_printable(format!("{} time axis is not ascending", archive.name())));
    }

    debug!("{}: cell (y {}, x {}), time {}..={}", archive.name(), iy, ix, t_start, t_end);
    let values = archive.cell_series(t_start, t_end, iy, ix)?;

    Ok(ClimateSeries {
        variable,
        records: times[t_start..=t_end].iter().copied().zip(values).collect(),
    })
}

/// Concatenates per-file series of one variable in the order they arrive.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesAccumulator {
    series: ClimateSeries,
    files: usize,
}

impl SeriesAccumulator {
    pub fn empty(variable: ClimateVariable) -> Self {
        SeriesAccumulator {
            series: ClimateSeries { variable, records: Vec::new() },
            files: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files == 0
    }

    pub fn append(&mut self, series: ClimateSeries) -> Result<()> {
        if series.variable != self.series.variable {
            return Err(Report::new(BasinError::ArchiveLookup).attach_printable(format!(
                "cannot append {:?} to a {:?} series",
                series.variable, self.series.variable
            )));
        }
        info!("appending {} {:?} record(s)", series.records.len(), series.variable);
        self.series.records.extend(series.records);
        self.files += 1;
        Ok(())
    }

    pub fn into_series(self) -> ClimateSeries {
        self.series
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateRow {
    pub date: NaiveDateTime,
    pub precipitation: f64,
    pub temperature: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClimateTable {
    pub rows: Vec<ClimateRow>,
}

/// Inner join on exact date equality, in precipitation order. Dates present
/// in only one series are dropped; repeated dates pair up with every match.
pub fn merge_series(precipitation: &ClimateSeries, temperature: &ClimateSeries) -> ClimateTable {
    let mut by_date: HashMap<NaiveDateTime, Vec<f64>> = HashMap::with_capacity(temperature.records.len());
    for &(date, t) in &temperature.records {
        by_date.entry(date).or_default().push(t);
    }

    let rows = precipitation
        .records
        .iter()
        .flat_map(|&(date, p)| {
            by_date
                .get(&date)
                .into_iter()
                .flatten()
                .map(move |&t| ClimateRow { date, precipitation: p, temperature: t })
        })
        .collect();
    ClimateTable { rows }
}

/// Archive files grouped by variable, each list in lexicographic path order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveFiles {
    pub precipitation: Vec<PathBuf>,
    pub temperature: Vec<PathBuf>,
}

/// Walks `dir` depth-first with each directory's entries sorted by name,
/// which yields files in lexicographic path order.
pub fn discover_archives<P: AsRef<Path>>(dir: P) -> Result<ArchiveFiles> {
    let dir = dir.as_ref();
    let mut files = ArchiveFiles::default();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry
            .change_context(BasinError::ResourceOpen)
            .attach_printable_lazy(|| format!("climate directory {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        match ClimateVariable::from_path(&path) {
            Some(ClimateVariable::Precipitation) => files.precipitation.push(path),
            Some(ClimateVariable::MaxTemperature) => files.temperature.push(path),
            None => debug!("skipping {}", path.display()),
        }
    }
    Ok(files)
}

fn accumulate(
    variable: ClimateVariable,
    paths: &[PathBuf],
    x: f64,
    y: f64,
    range: &DateRange,
) -> Result<ClimateSeries> {
    let mut accumulator = SeriesAccumulator::empty(variable);
    for path in paths {
        let archive = NetcdfArchive::open(path, variable)?;
        accumulator.append(extract_series(&archive, variable, x, y, range)?)?;
    }
    if accumulator.is_empty() {
        warn!("no {:?} archive files found", variable);
    }
    Ok(accumulator.into_series())
}

/// Builds the merged daily table for a point in the archive's grid CRS.
pub fn build_climate_table<P: AsRef<Path>>(dir: P, x: f64, y: f64, range: &DateRange) -> Result<ClimateTable> {
    let files = discover_archives(dir)?;
    let precipitation = accumulate(ClimateVariable::Precipitation, &files.precipitation, x, y, range)?;
    let temperature = accumulate(ClimateVariable::MaxTemperature, &files.temperature, x, y, range)?;
    let table = merge_series(&precipitation, &temperature);
    info!("climate table has {} row(s)", table.rows.len());
    Ok(table)
}
