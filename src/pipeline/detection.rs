//! Per-pixel change detection.
//!
//! Every submitted pixel yields exactly one `DetectionResult`, whether the
//! detector succeeded, returned an error, or panicked. Partitions write
//! their own rows straight to the result store.

use crate::config::DetectionConfig;
use crate::grid::Tile;
use crate::io::{checksum, produced_now, DetectionOutput, DetectionResult, ResultStore};
use crate::pipeline::Metrics;
use crate::timeseries::Rod;
use crate::validation::AcquiredRange;
use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

/// Quality-band interpretation passed to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DetectionParams {
    pub qa_bitpacked: bool,
    pub qa_fill: u16,
    pub qa_clear: u16,
    pub qa_water: u16,
    pub qa_shadow: u16,
    pub qa_snow: u16,
    pub qa_cloud: u16,
}

impl DetectionParams {
    /// Class-valued (not bit-packed) quality encoding.
    pub const UNPACKED: Self = Self {
        qa_bitpacked: false,
        qa_fill: 255,
        qa_clear: 0,
        qa_water: 1,
        qa_shadow: 2,
        qa_snow: 3,
        qa_cloud: 4,
    };

    /// Parameters for a detection job.
    ///
    /// Deployed jobs always run with the class-valued encoding whatever
    /// `qa_bitpacked` says; stored results depend on that.
    pub fn from_config(config: &DetectionConfig) -> Self {
        if config.qa_bitpacked {
            tracing::debug!("qa_bitpacked requested; detection uses class-valued quality");
        }
        Self::UNPACKED
    }
}

/// Change detection capability.
pub trait Detector: Send + Sync {
    /// Algorithm identifier stored with every row.
    fn algorithm(&self) -> String;

    /// Detect change segments for one pixel.
    fn detect(&self, rod: &Rod, params: &DetectionParams) -> Result<DetectionOutput>;
}

/// Request body sent to an external detector.
#[derive(Serialize)]
struct DetectRequest<'a> {
    #[serde(flatten)]
    rod: &'a Rod,
    params: &'a DetectionParams,
}

/// Detector backed by an external command speaking JSON on stdin/stdout.
///
/// The command receives `{"dates": [...], "reds": [...], ..., "params": {...}}`
/// and must print a detection payload with `change_models`.
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
    algorithm: String,
}

impl CommandDetector {
    pub fn new(command: &[String], algorithm: impl Into<String>) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("Detection command is empty")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            algorithm: algorithm.into(),
        })
    }

    /// Build from configuration, asking the command for its algorithm id.
    pub fn from_config(config: &DetectionConfig) -> Result<Self> {
        let mut detector = Self::new(&config.command, String::new())?;
        let output = Command::new(&detector.program)
            .args(&detector.args)
            .arg("--version")
            .output()
            .with_context(|| format!("Failed to run {}", detector.program))?;
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        detector.algorithm = if version.is_empty() {
            detector.program.clone()
        } else {
            version
        };
        Ok(detector)
    }
}

impl Detector for CommandDetector {
    fn algorithm(&self) -> String {
        self.algorithm.clone()
    }

    fn detect(&self, rod: &Rod, params: &DetectionParams) -> Result<DetectionOutput> {
        let body = serde_json::to_vec(&DetectRequest { rod, params })?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program))?;

        child
            .stdin
            .take()
            .context("Detector stdin unavailable")?
            .write_all(&body)?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        serde_json::from_slice(&output.stdout).context("Detector returned invalid JSON")
    }
}

/// Outcome for one pixel.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelOutcome {
    Detected(DetectionOutput),
    Failed(String),
}

impl PixelOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Detected(_))
    }
}

/// Aggregate of one or more partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionSummary {
    pub pixels: u64,
    pub detected: u64,
    pub failed: u64,
    pub rows_written: u64,
    pub bytes_written: u64,
}

impl PartitionSummary {
    pub fn merge(mut self, other: Self) -> Self {
        self.pixels += other.pixels;
        self.detected += other.detected;
        self.failed += other.failed;
        self.rows_written += other.rows_written;
        self.bytes_written += other.bytes_written;
        self
    }
}

impl std::fmt::Display for PartitionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pixels: {}, Detected: {}, Failed: {}, Rows: {}",
            self.pixels, self.detected, self.failed, self.rows_written
        )
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "detector panicked".to_string()
    }
}

/// Runs detection over partitions of rods for one tile.
pub struct DetectionExecutor {
    detector: Arc<dyn Detector>,
    params: DetectionParams,
    store: ResultStore,
    metrics: Arc<Metrics>,
    tile: Tile,
    acquired: AcquiredRange,
    write_concurrency: usize,
}

impl DetectionExecutor {
    pub fn new(
        detector: Arc<dyn Detector>,
        params: DetectionParams,
        store: ResultStore,
        metrics: Arc<Metrics>,
        tile: Tile,
        acquired: AcquiredRange,
        write_concurrency: usize,
    ) -> Self {
        Self {
            detector,
            params,
            store,
            metrics,
            tile,
            acquired,
            write_concurrency: write_concurrency.max(1),
        }
    }

    pub fn algorithm(&self) -> String {
        self.detector.algorithm()
    }

    /// Detect one pixel, never failing.
    pub fn detect_pixel(&self, rod: &Rod) -> PixelOutcome {
        if rod.is_empty() {
            return PixelOutcome::Failed("insufficient data".to_string());
        }
        match catch_unwind(AssertUnwindSafe(|| self.detector.detect(rod, &self.params))) {
            Ok(Ok(output)) => PixelOutcome::Detected(output),
            Ok(Err(e)) => PixelOutcome::Failed(format!("{:#}", e)),
            Err(panic) => PixelOutcome::Failed(panic_message(panic)),
        }
    }

    /// Row for a pixel outcome.
    pub fn to_row(&self, rod: &Rod, outcome: &PixelOutcome) -> Result<DetectionResult> {
        let (result, result_ok) = match outcome {
            PixelOutcome::Detected(output) => (serde_json::to_string(output)?, true),
            PixelOutcome::Failed(_) => (String::new(), false),
        };
        Ok(DetectionResult {
            tile_x: self.tile.x,
            tile_y: self.tile.y,
            chip_x: rod.chip().x,
            chip_y: rod.chip().y,
            x: rod.pixel().x,
            y: rod.pixel().y,
            algorithm: self.detector.algorithm(),
            acquired: self.acquired.as_str().to_string(),
            result_md5: checksum(result.as_bytes()),
            result,
            result_ok,
            result_produced: produced_now(),
            inputs_md5: checksum(&rod.to_json()?),
        })
    }

    fn detect_all(&self, rods: &[Rod]) -> Result<(Vec<DetectionResult>, PartitionSummary)> {
        let start = Instant::now();
        let mut summary = PartitionSummary::default();
        let mut rows = Vec::with_capacity(rods.len());

        for rod in rods {
            let outcome = self.detect_pixel(rod);
            summary.pixels += 1;
            match &outcome {
                PixelOutcome::Detected(_) => {
                    summary.detected += 1;
                    self.metrics.add_pixel_detected();
                }
                PixelOutcome::Failed(reason) => {
                    summary.failed += 1;
                    self.metrics.add_pixel_failed();
                    tracing::debug!("Detection failed at {}: {}", rod.pixel(), reason);
                }
            }
            rows.push(self.to_row(rod, &outcome)?);
        }

        self.metrics.add_detect_time(start.elapsed());
        Ok((rows, summary))
    }

    /// Detect and persist one partition of rods.
    pub async fn run_partition(self: Arc<Self>, rods: Vec<Rod>) -> Result<PartitionSummary> {
        let this = self.clone();
        let (rows, mut summary) = tokio::task::spawn_blocking(move || this.detect_all(&rods))
            .await
            .map_err(|e| anyhow::anyhow!("Detection task panicked: {}", e))??;

        let start = Instant::now();
        let written: Vec<usize> = stream::iter(rows)
            .map(|row| {
                let store = &self.store;
                let acquired = &self.acquired;
                async move { store.put_detection(&row, acquired).await }
            })
            .buffer_unordered(self.write_concurrency)
            .try_collect()
            .await?;
        self.metrics.add_write_time(start.elapsed());

        summary.rows_written = written.len() as u64;
        summary.bytes_written = written.iter().sum::<usize>() as u64;
        self.metrics.add_rows_written(summary.rows_written);
        self.metrics.add_bytes_written(summary.bytes_written);
        self.metrics.add_partition_run();

        if summary.failed > 0 {
            tracing::debug!("Partition done with failures: {}", summary);
        }
        Ok(summary)
    }
}
