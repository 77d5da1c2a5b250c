use anyhow::{Context, Result};
use clap::Parser;
use harmonic_trend::config::PipelineConfig;
use harmonic_trend::core::HarmonicTrendModel;
use harmonic_trend::io::{credentials_from_config, DriveClient, EarthEngineClient};
use harmonic_trend::pipeline::PipelineDriver;
use std::path::PathBuf;

/// Export Sentinel-2 NDVI harmonic trend coefficients and download the raster
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Exported file name, e.g. s2_harmonic_trends_2023.tif
    #[arg(long)]
    filename: Option<String>,

    /// Remote folder to export into and download from
    #[arg(long)]
    folder: Option<String>,

    /// Local directory the folder is created under
    #[arg(long)]
    download_root: Option<PathBuf>,

    /// Print the export expression and exit without submitting
    #[arg(long)]
    dry_run: bool,
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(filename) = &cli.filename {
        config.raster_name = filename.clone();
    }
    if let Some(folder) = &cli.folder {
        config.drive_folder = folder.clone();
    }
    if let Some(root) = &cli.download_root {
        config.download_root = root.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Export expression only; needs no credentials
fn dry_run(config: &PipelineConfig) -> Result<String> {
    Ok(HarmonicTrendModel::new(config)?.expression_json()?)
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    if cli.dry_run {
        println!("{}", dry_run(&config)?);
        return Ok(());
    }

    let credentials = credentials_from_config(&config.auth)?;
    let earth_engine = EarthEngineClient::new(&config.endpoints, &config.project, credentials.clone())?;
    let drive = DriveClient::new(&config.endpoints, credentials)?;
    let driver = PipelineDriver::new(config, earth_engine, drive)?;

    let report = driver.run()?;
    for (stage, duration) in &report.timings {
        println!("{} time: {:.2} seconds", stage, duration.as_secs_f64());
    }
    if let Some(max_pixels) = report.attempts.last().map(|a| a.max_pixels) {
        println!(
            "Exported with max_pixels {} after {} attempt(s)",
            max_pixels,
            report.attempts.len()
        );
    }
    println!("Saved to {}", report.output_path.display());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        log::error!("Pipeline failed: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
