//! Firebird
//!
//! Change detection and land-cover classification over a tiled grid of
//! satellite image chips.
//!
//! # Architecture
//!
//! - **Grid**: tile and chip enumeration
//! - **Timeseries**: per-band chip rasters aligned into per-pixel rods
//! - **I/O**: chip catalog client, keyed result rows, per-tile metadata
//! - **Pipeline**: partitioned execution of detection and classification
//!
//! # Usage
//!
//! ```no_run
//! use firebird::{run_change_detection, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_change_detection(config, 1_631_415, 2_114_805, None, 2500).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod grid;
pub mod io;
pub mod pipeline;
pub mod timeseries;
pub mod validation;

pub use config::Config;
pub use grid::{GridPartitioner, Tile};
pub use io::{CatalogClient, JobMetadata, MetadataRecorder, ResultStore};
pub use pipeline::{
    ClassificationOrchestrator, ClassificationRequest, Classifier, Detector, ExecutionContext,
    Metrics, Outcome,
};
pub use validation::{AcquiredRange, ValidationError};

use anyhow::Result;
use io::{ChipSource, HttpCatalog};
use object_store::ObjectStore;
use pipeline::{
    CommandClassifier, CommandDetector, DetectionExecutor, DetectionParams, Scheduler,
    SchedulerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use timeseries::TimeSeriesAssembler;

/// Components shared by every stage of a job.
pub struct Services {
    pub config: Arc<Config>,
    pub grid: GridPartitioner,
    pub ard: CatalogClient,
    pub aux: CatalogClient,
    pub results: ResultStore,
    pub metadata: MetadataRecorder,
    pub metrics: Arc<Metrics>,
}

impl Services {
    /// Wire services over explicit catalog sources and result store.
    pub fn new(
        config: Arc<Config>,
        ard: Arc<dyn ChipSource>,
        aux: Arc<dyn ChipSource>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        let metrics = Metrics::new();
        let keyspace = config.store.keyspace.clone();
        Self {
            grid: GridPartitioner::new(&config.grid),
            ard: CatalogClient::new(ard, config.catalog.ard_url.clone()).with_metrics(metrics.clone()),
            aux: CatalogClient::new(aux, config.catalog.aux_url.clone()).with_metrics(metrics.clone()),
            results: ResultStore::new(store.clone(), keyspace.clone()),
            metadata: MetadataRecorder::new(store, keyspace),
            metrics,
            config,
        }
    }

    /// Services backed by the HTTP catalogs and the configured result store.
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let timeout = Duration::from_secs(config.catalog.timeout_secs);
        let ard = HttpCatalog::new(config.ard_specs_url(), config.ard_chips_url(), timeout)?;
        let aux = HttpCatalog::new(config.aux_specs_url(), config.aux_chips_url(), timeout)?;
        let store = io::create_result_store(&config)?;
        tracing::info!(
            "Results in keyspace '{}' at {}",
            config.store.keyspace,
            config.store.path_display()
        );
        Ok(Self::new(config, Arc::new(ard), Arc::new(aux), store))
    }
}

/// One change-detection run.
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    /// Any point inside the tile
    pub x: i64,
    pub y: i64,
    pub acquired: AcquiredRange,
    /// Detect only the first `number` chips of the tile
    pub number: usize,
}

/// Detect change for every pixel of a tile, then record the tile's metadata.
pub async fn change_detection(
    services: &Services,
    detector: Arc<dyn Detector>,
    req: &DetectionRequest,
) -> Result<JobMetadata> {
    let config = &services.config;
    let ctx = ExecutionContext::start("change-detection", &config.processing);
    let _guard = ctx.guard();

    let tile = services.grid.tile(req.x, req.y);
    let chips: Vec<_> = services.grid.chips(&tile).take(req.number).collect();
    tracing::info!(
        "Tile {} for ({}, {}), {} chips, acquired {}",
        tile,
        req.x,
        req.y,
        chips.len(),
        req.acquired
    );

    let algorithm = detector.algorithm();
    let executor = Arc::new(DetectionExecutor::new(
        detector,
        DetectionParams::from_config(&config.detection),
        services.results.clone(),
        services.metrics.clone(),
        tile,
        req.acquired.clone(),
        config.processing.write_concurrency,
    ));

    let scheduler = Scheduler::new(
        ctx.clone(),
        services.ard.clone(),
        TimeSeriesAssembler::new(services.grid.chip_geometry()),
        executor,
        services.metrics.clone(),
        SchedulerConfig::from(&config.processing),
    );
    let stats = scheduler.run(&chips, &req.acquired).await?;
    tracing::info!("Detection finished: {}", stats);

    let segcount = services
        .results
        .count_detections(&chips, &algorithm, &req.acquired)
        .await?;
    let md = JobMetadata::detection(
        &tile,
        req.acquired.as_str(),
        &algorithm,
        services.ard.url(),
        segcount,
    );
    services.metadata.write_detection(&md).await?;
    Ok(md)
}

/// Train on the tile neighbourhood and classify the tile's segments.
pub async fn classification(
    services: &Services,
    classifier: Arc<dyn Classifier>,
    req: &ClassificationRequest,
) -> Result<Outcome> {
    let processing = &services.config.processing;
    let ctx = ExecutionContext::start("classification", processing);
    let _guard = ctx.guard();

    let orchestrator = ClassificationOrchestrator::new(
        ctx.clone(),
        services.grid.clone(),
        services.aux.clone(),
        services.results.clone(),
        services.metadata.clone(),
        classifier,
        services.metrics.clone(),
    )
    .with_limits(
        processing.fetch_concurrency,
        processing.product_partitions,
        processing.write_concurrency,
    );

    let outcome = orchestrator.run(req).await?;
    tracing::info!("Classification finished: {}", services.metrics.snapshot());
    Ok(outcome)
}

fn acquired_or_default(acquired: Option<&str>) -> Result<AcquiredRange, ValidationError> {
    match acquired {
        Some(value) => AcquiredRange::parse(value),
        None => Ok(AcquiredRange::until_now()),
    }
}

async fn try_change_detection(
    config: Config,
    x: i64,
    y: i64,
    acquired: Option<&str>,
    number: usize,
) -> Result<JobMetadata> {
    let acquired = acquired_or_default(acquired)?;
    config.validate()?;

    let config = Arc::new(config);
    let services = Services::from_config(config.clone())?;
    let detector = Arc::new(CommandDetector::from_config(&config.detection)?);

    change_detection(
        &services,
        detector,
        &DetectionRequest {
            x,
            y,
            acquired,
            number,
        },
    )
    .await
}

async fn try_classification(
    config: Config,
    x: i64,
    y: i64,
    msday: &str,
    meday: &str,
    acquired: Option<&str>,
) -> Result<Outcome> {
    let acquired = acquired_or_default(acquired)?;
    let msday = validation::product_date(msday)?;
    let meday = validation::product_date(meday)?;
    validation::training_window(msday, meday)?;
    config.validate()?;

    let config = Arc::new(config);
    let services = Services::from_config(config.clone())?;
    let classifier = Arc::new(CommandClassifier::new(&config.classification.command)?);
    let tile = services.grid.tile(x, y);

    classification(
        &services,
        classifier,
        &ClassificationRequest {
            tile,
            msday,
            meday,
            acquired,
        },
    )
    .await
}

/// Run change detection for the tile containing `(x, y)`.
///
/// Errors are logged with their full chain and swallowed.
pub async fn run_change_detection(
    config: Config,
    x: i64,
    y: i64,
    acquired: Option<&str>,
    number: usize,
) -> Option<JobMetadata> {
    match try_change_detection(config, x, y, acquired, number).await {
        Ok(md) => Some(md),
        Err(e) => {
            tracing::error!("change-detection failed: {:?}", e);
            None
        }
    }
}

/// Run classification for the tile containing `(x, y)`.
///
/// Errors are logged with their full chain and swallowed.
pub async fn run_classification(
    config: Config,
    x: i64,
    y: i64,
    msday: &str,
    meday: &str,
    acquired: Option<&str>,
) -> Option<Outcome> {
    match try_classification(config, x, y, msday, meday, acquired).await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            tracing::error!("classification failed: {:?}", e);
            None
        }
    }
}

/// Build a Tokio runtime with the given worker thread count.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
