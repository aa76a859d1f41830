//! Firebird CLI
//!
//! Change detection and classification for one tile at a time.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use firebird::{
    build_runtime, init_rayon, run_change_detection, run_classification, Config, GridPartitioner,
};

#[derive(Parser)]
#[command(name = "firebird")]
#[command(about = "Change detection and classification over tiled satellite chips", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override concurrent partitions
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run change detection for the tile containing (x, y)
    Changedetection {
        #[arg(short, allow_negative_numbers = true)]
        x: i64,

        #[arg(short, allow_negative_numbers = true)]
        y: i64,

        /// ISO8601 date range, e.g. 1982-01-01/2017-12-31 (default: all time until now)
        #[arg(short, long)]
        acquired: Option<String>,

        /// Number of chips of the tile to process
        #[arg(short, long, default_value_t = 2500)]
        number: usize,
    },

    /// Train a classifier around the tile containing (x, y) and classify it
    Classification {
        #[arg(short, allow_negative_numbers = true)]
        x: i64,

        #[arg(short, allow_negative_numbers = true)]
        y: i64,

        /// Start of the training period (ordinal day or ISO date)
        #[arg(short = 's', long)]
        msday: String,

        /// End of the training period (ordinal day or ISO date)
        #[arg(short = 'e', long)]
        meday: String,

        /// ISO8601 date range of the change segments to classify
        #[arg(short, long)]
        acquired: Option<String>,
    },

    /// List chips intersecting a bounding box
    Chips {
        #[arg(long, allow_negative_numbers = true)]
        ulx: i64,

        #[arg(long, allow_negative_numbers = true)]
        uly: i64,

        #[arg(long, allow_negative_numbers = true)]
        lrx: i64,

        #[arg(long, allow_negative_numbers = true)]
        lry: i64,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Changedetection {
            x,
            y,
            acquired,
            number,
        } => {
            let Some(config) = job_config(&cli.config, cli.concurrency) else {
                return Ok(());
            };
            let Some(runtime) = job_runtime(&config) else {
                return Ok(());
            };
            if let Some(md) = runtime.block_on(run_change_detection(config, x, y, acquired.as_deref(), number)) {
                tracing::info!("Tile ({}, {}) recorded {} results", md.tile_x, md.tile_y, md.segcount);
            }
        }

        Commands::Classification {
            x,
            y,
            msday,
            meday,
            acquired,
        } => {
            let Some(config) = job_config(&cli.config, cli.concurrency) else {
                return Ok(());
            };
            let Some(runtime) = job_runtime(&config) else {
                return Ok(());
            };
            if let Some(outcome) = runtime.block_on(run_classification(
                config,
                x,
                y,
                &msday,
                &meday,
                acquired.as_deref(),
            )) {
                tracing::info!("Classification outcome: {:?}", outcome);
            }
        }

        Commands::Chips { ulx, uly, lrx, lry } => {
            chips_command(cli.config, ulx, uly, lrx, lry)?;
        }

        Commands::Validate => {
            validate_command(cli.config)?;
        }

        Commands::GenerateConfig { output } => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(path: &PathBuf, concurrency: Option<usize>) -> Result<Config> {
    let mut config = Config::from_file(path)?;
    config.apply_env()?;
    if let Some(c) = concurrency {
        config.processing.concurrency = c;
    }
    Ok(config)
}

/// Configuration for a job command. Failures are logged, not returned.
fn job_config(path: &PathBuf, concurrency: Option<usize>) -> Option<Config> {
    match load_config(path, concurrency) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::error!("Failed to load configuration from {}: {:?}", path.display(), e);
            None
        }
    }
}

fn try_job_runtime(config: &Config) -> Result<tokio::runtime::Runtime> {
    init_rayon(config.processing.rayon_threads)?;
    build_runtime(config.processing.worker_threads)
}

/// Runtime for a job command. Failures are logged, not returned.
fn job_runtime(config: &Config) -> Option<tokio::runtime::Runtime> {
    match try_job_runtime(config) {
        Ok(runtime) => Some(runtime),
        Err(e) => {
            tracing::error!("Failed to start job runtime: {:?}", e);
            None
        }
    }
}

fn chips_command(config_path: PathBuf, ulx: i64, uly: i64, lrx: i64, lry: i64) -> Result<()> {
    let config = load_config(&config_path, None)?;
    let grid = GridPartitioner::new(&config.grid);
    for chip in grid.chips_in_bounds(ulx, uly, lrx, lry)? {
        println!("{} {}", chip.x, chip.y);
    }
    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path, None)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    let yaml = r#"# Firebird Configuration
# Environment overrides: ARD_CHIPMUNK, AUX_CHIPMUNK, FIREBIRD_KEYSPACE,
# FIREBIRD_STORE_PATH, INPUT_PARTITIONS, PRODUCT_PARTITIONS, CCD_QA_BITPACKED

# === CATALOG: Chip and spec services ===
catalog:
  # Analysis-ready spectral data
  ard_url: "http://localhost:5656"

  # Ancillary layers (dem, trends, nlcd, ...)
  aux_url: "http://localhost:5656"

  specs_path: "/v1/landsat/chip-specs"
  chips_path: "/v1/landsat/chips"

  # Per-request timeout in seconds
  timeout_secs: 120

# === STORE: Where result rows and tile metadata live ===
# Choose ONE of: local_path (local disk) OR bucket+prefix (S3)
store:
  # Option 1: Local filesystem
  local_path: "/tmp/firebird"

  # Option 2: S3 (comment out local_path and uncomment these)
  # bucket: "results-bucket"
  # prefix: "firebird"

  # Namespace for every row written by this deployment
  keyspace: "lcmap_changes_local"

# === GRID: Tile and chip layout ===
grid:
  # Affine grid specs; rx/ry give axis direction, sx/sy cell size, tx/ty origin
  tile: { rx: 1, ry: -1, sx: 150000, sy: 150000, tx: 2565585, ty: 3314805 }
  chip: { rx: 1, ry: -1, sx: 3000, sy: 3000, tx: 2565585, ty: 3314805 }

  # Pixel size in projection units
  pixel_size: 30

  # Tiles around the classified tile used for training (1 = 3x3)
  training_radius: 1

# === PROCESSING: Partitioning and concurrency ===
processing:
  # Minimum partitions per chip for detection
  input_partitions: 16

  # Minimum partitions for classification results
  product_partitions: 16

  # Upper bound on one partition's payload in bytes
  max_task_payload_bytes: 102400

  # Partitions executing concurrently
  concurrency: 16

  # Concurrent chip fetches when assembling ancillary data
  fetch_concurrency: 4

  # Concurrent row writes inside one partition
  write_concurrency: 32

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 16

  # Rayon thread pool size for CPU work (null = num CPUs)
  # rayon_threads: 16

  enable_metrics: true
  metrics_interval_secs: 10
  # metrics_output_path: "/tmp/firebird-metrics.json"

# === DETECTION: External change detection command ===
detection:
  # Reads a rod as JSON on stdin, prints change models as JSON
  command: ["ccd-json"]
  qa_bitpacked: true

# === CLASSIFICATION: External classifier command ===
classification:
  # Invoked with `train` or `predict` appended
  command: ["rf-json"]
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["firebird"]).is_err());
    }

    #[test]
    fn test_cli_parse_changedetection() {
        let cli = Cli::try_parse_from([
            "firebird", "changedetection", "-x", "-2115585", "-y", "1964805", "-n", "10",
        ])
        .unwrap();
        match cli.command {
            Commands::Changedetection { x, y, acquired, number } => {
                assert_eq!((x, y), (-2_115_585, 1_964_805));
                assert!(acquired.is_none());
                assert_eq!(number, 10);
            }
            _ => panic!("expected changedetection"),
        }
    }

    #[test]
    fn test_cli_parse_classification() {
        let cli = Cli::try_parse_from([
            "firebird", "-c", "other.yaml", "classification", "-x", "0", "-y", "0", "-s", "730000",
            "-e", "736000", "-a", "1982-01-01/2017-12-31",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
        assert!(matches!(cli.command, Commands::Classification { ref msday, .. } if msday == "730000"));
    }

    #[test]
    fn test_cli_classification_requires_window() {
        assert!(Cli::try_parse_from(["firebird", "classification", "-x", "0", "-y", "0"]).is_err());
    }

    #[test]
    fn test_job_runtime_failure_is_logged() {
        let config = Config::from_yaml(
            "store:\n  local_path: /tmp/firebird\nprocessing:\n  rayon_threads: 1\n",
        )
        .unwrap();
        // The global rayon pool can only be built once
        let _ = job_runtime(&config);
        assert!(job_runtime(&config).is_none());
    }

    #[test]
    fn test_generated_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.detection.command, vec!["ccd-json".to_string()]);
        assert_eq!(config.grid.training_radius, 1);
    }
}
