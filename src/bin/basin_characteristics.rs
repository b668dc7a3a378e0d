extern crate clap;

use std::process::ExitCode;

use clap::Parser;
use log::error;
use rayon::ThreadPoolBuilder;

use waterbasin::characteristics::run_basin;
use waterbasin::config::DatabaseConfig;

#[derive(Parser)]
#[clap(version, about = "Derive watershed characteristics for a basin boundary")]
struct Opts {
    /// Path to the basin boundary (any OGR vector source)
    basin: String,

    /// Database configuration (JSON); defaults apply when omitted
    #[clap(long)]
    config: Option<String>,

    /// Directory for the CSV tables and derived vector sources
    #[clap(short, long, default_value = "input")]
    output_dir: String,

    /// Also build the daily climate time series
    #[clap(short, long)]
    timeseries: bool,

    /// Number of CPU threads
    #[clap(short, long, default_value = "1")]
    ncpu: usize,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts: Opts = Opts::parse();

    if let Err(e) = ThreadPoolBuilder::new().num_threads(opts.ncpu).build_global() {
        error!("could not build thread pool: {}", e);
        return ExitCode::FAILURE;
    }

    let config = match &opts.config {
        Some(path) => DatabaseConfig::from_file(path),
        None => Ok(DatabaseConfig::default()),
    };

    let result = config.and_then(|config| {
        let report = run_basin(&config, &opts.basin, &opts.output_dir, opts.timeseries)?;
        report.write_all(&opts.output_dir)
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            error!("{:?}", report);
            ExitCode::FAILURE
        }
    }
}
