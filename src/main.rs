use clap::Parser;
use hdr_lighting::app::Estimator;
use hdr_lighting::io::config::Config;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

/// Estimates HDR lighting (exposures, point lights, sun) from an RGB-D capture folder.
#[derive(Parser, Debug)]
#[command(name = "hdr_lighting", version, about)]
struct Cli {
    /// Capture folder holding the frames directory and the mesh reconstruction
    #[arg(value_name = "CAPTURE")]
    capture: PathBuf,

    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Ignore and do not write stage caches
    #[arg(long)]
    no_cache: bool,

    /// Also write the HDR mesh and panorama debug images
    #[arg(long)]
    debug: bool,

    /// Output folder (defaults to the capture folder)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    // 1. Load Config
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading config from '{}'", path.display());
            match Config::load(path) {
                Ok(config) => config,
                Err(e) => {
                    error!("{e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        None => Config::default(),
    };

    // 2. Command line overrides
    if cli.no_cache {
        config.output.cache = false;
    }
    if cli.debug {
        config.output.debug = true;
    }
    if let Some(output) = &cli.output {
        config.output.dir = Some(output.to_string_lossy().into_owned());
    }

    // 3. Run
    match Estimator::new(config).run(&cli.capture) {
        Ok(report) => {
            info!(
                "{} lights written to '{}'",
                report.lights.len(),
                report.output_dir.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
