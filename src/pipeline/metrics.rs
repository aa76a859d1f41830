//! Progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for a job.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Encoded chip bytes received from the catalog
    pub bytes_fetched: AtomicU64,

    /// Serialized bytes written to the result store
    pub bytes_written: AtomicU64,

    /// Chips assembled into rods
    pub chips_assembled: AtomicU64,

    /// Pixels whose detection succeeded
    pub pixels_detected: AtomicU64,

    /// Pixels whose detection failed (still persisted)
    pub pixels_failed: AtomicU64,

    /// Rows written to the result store
    pub rows_written: AtomicU64,

    /// Partitions executed
    pub partitions_run: AtomicU64,

    /// Segments classified
    pub segments_classified: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-phase timing (in microseconds for precision)
    /// Time spent fetching chips (microseconds)
    pub fetch_us: AtomicU64,

    /// Time spent aligning rasters into rods (microseconds)
    pub assemble_us: AtomicU64,

    /// Time spent in the detector (microseconds)
    pub detect_us: AtomicU64,

    /// Time spent writing rows (microseconds)
    pub write_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_bytes_fetched(&self, bytes: u64) {
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_chip_assembled(&self) {
        self.chips_assembled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_pixel_detected(&self) {
        self.pixels_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_pixel_failed(&self) {
        self.pixels_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rows_written(&self, count: u64) {
        self.rows_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_partition_run(&self) {
        self.partitions_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_segments_classified(&self, count: u64) {
        self.segments_classified.fetch_add(count, Ordering::Relaxed);
    }

    /// Record time spent fetching chips.
    pub fn add_fetch_time(&self, duration: Duration) {
        self.fetch_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent assembling rods.
    pub fn add_assemble_time(&self, duration: Duration) {
        self.assemble_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent in the detector.
    pub fn add_detect_time(&self, duration: Duration) {
        self.detect_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent writing rows.
    pub fn add_write_time(&self, duration: Duration) {
        self.write_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Pixels per second through detection, failures included.
    pub fn pixels_per_second(&self) -> f64 {
        let pixels = self.pixels_detected.load(Ordering::Relaxed)
            + self.pixels_failed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            pixels as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |us: &AtomicU64| us.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            chips_assembled: self.chips_assembled.load(Ordering::Relaxed),
            pixels_detected: self.pixels_detected.load(Ordering::Relaxed),
            pixels_failed: self.pixels_failed.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            partitions_run: self.partitions_run.load(Ordering::Relaxed),
            segments_classified: self.segments_classified.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            pixels_per_second: self.pixels_per_second(),
            fetch_secs: secs(&self.fetch_us),
            assemble_secs: secs(&self.assemble_us),
            detect_secs: secs(&self.detect_us),
            write_secs: secs(&self.write_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_fetched: u64,
    pub bytes_written: u64,
    pub chips_assembled: u64,
    pub pixels_detected: u64,
    pub pixels_failed: u64,
    pub rows_written: u64,
    pub partitions_run: u64,
    pub segments_classified: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub pixels_per_second: f64,
    /// Total time fetching chips (seconds, summed across tasks)
    pub fetch_secs: f64,
    /// Total time assembling rods (seconds, summed across tasks)
    pub assemble_secs: f64,
    /// Total time in the detector (seconds, summed across tasks)
    pub detect_secs: f64,
    /// Total time writing rows (seconds, summed across tasks)
    pub write_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.fetch_secs + self.assemble_secs + self.detect_secs + self.write_secs;
        let pct = |v: f64| if total > 0.0 { v / total * 100.0 } else { 0.0 };

        write!(
            f,
            "Chips: {} | Pixels: {} ok, {} failed | Rows: {} | Partitions: {} | \
             Fetched: {:.1} MB | Written: {:.1} MB | Rate: {:.1} px/s | Elapsed: {:.1}s | \
             Time: fetch {:.0}% | assemble {:.0}% | detect {:.0}% | write {:.0}%",
            self.chips_assembled,
            self.pixels_detected,
            self.pixels_failed,
            self.rows_written,
            self.partitions_run,
            self.bytes_fetched as f64 / (1024.0 * 1024.0),
            self.bytes_written as f64 / (1024.0 * 1024.0),
            self.pixels_per_second,
            self.elapsed.as_secs_f64(),
            pct(self.fetch_secs),
            pct(self.assemble_secs),
            pct(self.detect_secs),
            pct(self.write_secs),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_chips: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_chips: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_chips,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_chips > 0 {
                        snapshot.chips_assembled as f64 / self.total_chips as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }
}
