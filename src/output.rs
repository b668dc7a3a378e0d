use std::fs::{self, File};
use std::path::Path;

use error_stack::ResultExt;
use log::info;

use crate::characteristics::CharacteristicsTable;
use crate::climate::{ClimateTable, ClimateVariable};
use crate::error::{BasinError, Result};
use crate::twi::TwiBinTable;

/// Creates `dir` and its parents if missing.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .change_context(BasinError::Output)
        .attach_printable_lazy(|| format!("could not create output directory {}", dir.display()))
}

fn writer(path: &Path) -> Result<csv::Writer<File>> {
    let file = File::create(path)
        .change_context(BasinError::Output)
        .attach_printable_lazy(|| format!("could not create {}", path.display()))?;
    Ok(csv::Writer::from_writer(file))
}

fn write_rows(path: &Path, headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<()> {
    let mut writer = writer(path)?;
    writer
        .write_record(&headers)
        .change_context(BasinError::Output)
        .attach_printable_lazy(|| path.display().to_string())?;

    for row in &rows {
        writer
            .write_record(row)
            .change_context(BasinError::Output)
            .attach_printable_lazy(|| path.display().to_string())?;
    }

    writer
        .flush()
        .change_context(BasinError::Output)
        .attach_printable_lazy(|| path.display().to_string())?;
    info!("wrote {} row(s) to {}", rows.len(), path.display());
    Ok(())
}

pub fn write_characteristics(path: &Path, table: &CharacteristicsTable) -> Result<()> {
    let headers: Vec<String> = vec![String::from("name"), String::from("value")];
    let rows = table
        .iter()
        .map(|(key, value)| vec![key.name().to_string(), value.to_string()])
        .collect();
    write_rows(path, headers, rows)
}

pub fn write_twi(path: &Path, table: &TwiBinTable) -> Result<()> {
    let headers: Vec<String> = vec![String::from("bin"), String::from("twi"), String::from("proportion")];
    let rows = table
        .bins
        .iter()
        .map(|b| vec![b.bin.to_string(), b.twi.to_string(), b.proportion.to_string()])
        .collect();
    write_rows(path, headers, rows)
}

pub fn write_timeseries(path: &Path, table: &ClimateTable) -> Result<()> {
    let headers: Vec<String> = vec![
        String::from("date"),
        String::from(ClimateVariable::Precipitation.column()),
        String::from(ClimateVariable::MaxTemperature.column()),
    ];
    let rows = table
        .rows
        .iter()
        .map(|r| {
            vec![
                r.date.format("%Y-%m-%d").to_string(),
                r.precipitation.to_string(),
                r.temperature.to_string(),
            ]
        })
        .collect();
    write_rows(path, headers, rows)
}
