//! Chip-by-chip scheduling of change detection for one tile.
//!
//! Catalog lookups and partitioning happen sequentially per chip; each chip's
//! rods are then fanned out across the execution context.

use crate::config::ProcessingConfig;
use crate::grid::ChipCoord;
use crate::io::{CatalogClient, ResolvedBands};
use crate::pipeline::{DetectionExecutor, ExecutionContext, Metrics, MetricsReporter, PartitionSummary};
use crate::timeseries::{SpectralBand, TimeSeriesAssembler};
use crate::validation::AcquiredRange;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum partitions per chip
    pub input_partitions: usize,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    pub metrics_output_path: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            input_partitions: 1,
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        }
    }
}

impl From<&ProcessingConfig> for SchedulerConfig {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            input_partitions: config.input_partitions,
            enable_metrics: config.enable_metrics,
            metrics_interval_secs: config.metrics_interval_secs,
            metrics_output_path: config.metrics_output_path.clone(),
        }
    }
}

/// Runs detection over the chips of a tile.
pub struct Scheduler {
    ctx: Arc<ExecutionContext>,
    catalog: CatalogClient,
    assembler: TimeSeriesAssembler,
    executor: Arc<DetectionExecutor>,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        ctx: Arc<ExecutionContext>,
        catalog: CatalogClient,
        assembler: TimeSeriesAssembler,
        executor: Arc<DetectionExecutor>,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ctx,
            catalog,
            assembler,
            executor,
            metrics,
            config,
        }
    }

    /// Detect every pixel of one chip.
    async fn run_chip(
        &self,
        chip: ChipCoord,
        acquired: &AcquiredRange,
        bands: &ResolvedBands<SpectralBand>,
    ) -> Result<PartitionSummary> {
        let rasters = self.catalog.fetch(chip, acquired, bands).await?;
        tracing::debug!("Fetched {} rasters for chip {}", rasters.raster_count(), chip);

        let start = Instant::now();
        let assembler = self.assembler.clone();
        let rods = tokio::task::spawn_blocking(move || assembler.assemble(rasters))
            .await
            .map_err(|e| anyhow::anyhow!("Assembly task panicked: {}", e))??;
        self.metrics.add_assemble_time(start.elapsed());
        self.metrics.add_chip_assembled();

        let partitions = self
            .ctx
            .parallelize(rods, self.config.input_partitions, |rod| rod.payload_bytes())?;
        tracing::debug!("Chip {}: {} partitions", chip, partitions.len());

        let executor = self.executor.clone();
        let summaries = self
            .ctx
            .map_partitions(partitions, move |_, rods| executor.clone().run_partition(rods))
            .await?;

        Ok(summaries
            .into_iter()
            .fold(PartitionSummary::default(), PartitionSummary::merge))
    }

    /// Run detection over `chips` in order. A chip failure aborts the run.
    pub async fn run(&self, chips: &[ChipCoord], acquired: &AcquiredRange) -> Result<SchedulerStats> {
        let total_chips = chips.len();
        tracing::info!(
            "Scheduling {} chips for detection with {}",
            total_chips,
            self.executor.algorithm()
        );

        let bands = self.catalog.resolve::<SpectralBand>().await?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                total_chips as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let mut stats = SchedulerStats {
            total_chips,
            ..Default::default()
        };
        let mut outcome: Result<()> = Ok(());
        for &chip in chips {
            match self
                .run_chip(chip, acquired, &bands)
                .await
                .with_context(|| format!("Detection failed for chip {}", chip))
            {
                Ok(summary) => {
                    stats.chips_processed += 1;
                    stats.summary = stats.summary.merge(summary);
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if self.config.enable_metrics {
            if let Some(ref path) = self.config.metrics_output_path {
                let snapshot = self.metrics.snapshot();
                if let Err(e) = snapshot.save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        outcome?;
        Ok(stats)
    }
}

/// Statistics from a scheduler run.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Chips scheduled
    pub total_chips: usize,

    /// Chips fully detected and written
    pub chips_processed: usize,

    /// Pixel outcomes across all chips
    pub summary: PartitionSummary,
}

impl std::fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chips: {}/{}, {}",
            self.chips_processed, self.total_chips, self.summary
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_from_processing() {
        let processing = ProcessingConfig {
            input_partitions: 8,
            enable_metrics: false,
            metrics_output_path: Some("m.json".to_string()),
            ..Default::default()
        };
        let config = SchedulerConfig::from(&processing);
        assert_eq!(config.input_partitions, 8);
        assert!(!config.enable_metrics);
        assert_eq!(config.metrics_output_path.as_deref(), Some("m.json"));

        let default = SchedulerConfig::default();
        assert!(default.enable_metrics);
        assert!(default.metrics_output_path.is_none());
    }

    #[test]
    fn test_scheduler_stats_display() {
        let stats = SchedulerStats {
            total_chips: 4,
            chips_processed: 3,
            summary: PartitionSummary {
                pixels: 30,
                detected: 25,
                failed: 5,
                rows_written: 30,
                bytes_written: 900,
            },
        };

        let display = format!("{}", stats);
        assert!(display.contains("Chips: 3/4"));
        assert!(display.contains("Failed: 5"));
    }
}
