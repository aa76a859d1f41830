//! Train a classifier over a tile neighbourhood and classify the tile's
//! change segments.

use crate::grid::{ChipCoord, GridPartitioner, Tile};
use crate::io::{
    checksum, produced_now, CatalogClient, ClassificationRecord, ClassificationSummary,
    JobMetadata, MetadataRecorder, ResolvedBands, ResultStore,
};
use crate::pipeline::features::{self, FeatureRow};
use crate::pipeline::{ExecutionContext, Metrics};
use crate::timeseries::{AuxBand, AuxRod, TimeSeriesAssembler};
use crate::validation::AcquiredRange;
use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

/// Prediction vector in the classifier's native encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum DenseVector {
    Dense(Array1<f64>),
    Sparse {
        size: usize,
        indices: Vec<usize>,
        values: Vec<f64>,
    },
}

impl DenseVector {
    /// Plain probability vector.
    pub fn dedensify(&self) -> Vec<f64> {
        match self {
            Self::Dense(values) => values.to_vec(),
            Self::Sparse {
                size,
                indices,
                values,
            } => {
                let mut dense = vec![0.0; *size];
                for (&i, &v) in indices.iter().zip(values) {
                    if let Some(slot) = dense.get_mut(i) {
                        *slot = v;
                    }
                }
                dense
            }
        }
    }
}

/// Wire form of a prediction: a bare array or a sparse object.
#[derive(Deserialize)]
#[serde(untagged)]
enum WirePrediction {
    Dense(Vec<f64>),
    Sparse {
        size: usize,
        indices: Vec<usize>,
        values: Vec<f64>,
    },
}

impl From<WirePrediction> for DenseVector {
    fn from(wire: WirePrediction) -> Self {
        match wire {
            WirePrediction::Dense(values) => Self::Dense(Array1::from(values)),
            WirePrediction::Sparse {
                size,
                indices,
                values,
            } => Self::Sparse {
                size,
                indices,
                values,
            },
        }
    }
}

/// Classification capability. Models are opaque JSON documents.
pub trait Classifier: Send + Sync {
    /// Classifier identifier recorded in tile metadata.
    fn algorithm(&self) -> String;

    fn train(&self, rows: &[FeatureRow]) -> Result<serde_json::Value>;

    /// One prediction per row, in row order.
    fn predict(&self, model: &serde_json::Value, rows: &[FeatureRow]) -> Result<Vec<DenseVector>>;
}

#[derive(Serialize)]
struct TrainRequest<'a> {
    columns: Vec<&'static str>,
    rows: &'a [FeatureRow],
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    columns: Vec<&'static str>,
    model: &'a serde_json::Value,
    rows: &'a [FeatureRow],
}

/// Classifier backed by an external command with `train` and `predict`
/// subcommands speaking JSON on stdin/stdout.
pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
}

impl CommandClassifier {
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("Classification command is empty")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    fn call<T: Serialize>(&self, subcommand: &str, body: &T) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(body)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(subcommand)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {} {}", self.program, subcommand))?;

        child
            .stdin
            .take()
            .context("Classifier stdin unavailable")?
            .write_all(&body)?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.program,
                subcommand,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

impl Classifier for CommandClassifier {
    fn algorithm(&self) -> String {
        self.program.clone()
    }

    fn train(&self, rows: &[FeatureRow]) -> Result<serde_json::Value> {
        let out = self.call(
            "train",
            &TrainRequest {
                columns: features::feature_names(),
                rows,
            },
        )?;
        serde_json::from_slice(&out).context("Classifier returned an invalid model")
    }

    fn predict(&self, model: &serde_json::Value, rows: &[FeatureRow]) -> Result<Vec<DenseVector>> {
        let out = self.call(
            "predict",
            &PredictRequest {
                columns: features::feature_names(),
                model,
                rows,
            },
        )?;
        let wire: Vec<WirePrediction> =
            serde_json::from_slice(&out).context("Classifier returned invalid predictions")?;
        Ok(wire.into_iter().map(DenseVector::from).collect())
    }
}

/// Pipeline stage, logged on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchTrainingGrid,
    AssembleAuxTimeseries,
    FilterValidTrends,
    JoinPriorSegments,
    BuildFeatures,
    TrainModel,
    FetchClassificationGrid,
    Predict,
    NormalizePredictionEncoding,
    PersistResults,
    ReadPriorTileMetadata,
    MergeAndWriteMetadata,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FetchTrainingGrid => "FETCH_TRAINING_GRID",
            Self::AssembleAuxTimeseries => "ASSEMBLE_AUX_TIMESERIES",
            Self::FilterValidTrends => "FILTER_VALID_TRENDS",
            Self::JoinPriorSegments => "JOIN_PRIOR_SEGMENTS",
            Self::BuildFeatures => "BUILD_FEATURES",
            Self::TrainModel => "TRAIN_MODEL",
            Self::FetchClassificationGrid => "FETCH_CLASSIFICATION_GRID",
            Self::Predict => "PREDICT",
            Self::NormalizePredictionEncoding => "NORMALIZE_PREDICTION_ENCODING",
            Self::PersistResults => "PERSIST_RESULTS",
            Self::ReadPriorTileMetadata => "READ_PRIOR_TILE_METADATA",
            Self::MergeAndWriteMetadata => "MERGE_AND_WRITE_METADATA",
        };
        f.write_str(name)
    }
}

/// Terminal state of a classification run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// No training features; nothing was persisted.
    Aborted,
    Success(JobMetadata),
}

/// Parameters of one classification run.
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub tile: Tile,
    pub msday: i64,
    pub meday: i64,
    pub acquired: AcquiredRange,
}

/// Runs training and classification for one tile.
pub struct ClassificationOrchestrator {
    ctx: Arc<ExecutionContext>,
    grid: GridPartitioner,
    aux: CatalogClient,
    assembler: TimeSeriesAssembler,
    results: ResultStore,
    metadata: MetadataRecorder,
    classifier: Arc<dyn Classifier>,
    metrics: Arc<Metrics>,
    fetch_concurrency: usize,
    product_partitions: usize,
    write_concurrency: usize,
}

impl ClassificationOrchestrator {
    pub fn new(
        ctx: Arc<ExecutionContext>,
        grid: GridPartitioner,
        aux: CatalogClient,
        results: ResultStore,
        metadata: MetadataRecorder,
        classifier: Arc<dyn Classifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let assembler = TimeSeriesAssembler::new(grid.chip_geometry());
        Self {
            ctx,
            grid,
            aux,
            assembler,
            results,
            metadata,
            classifier,
            metrics,
            fetch_concurrency: 4,
            product_partitions: 1,
            write_concurrency: 16,
        }
    }

    /// Concurrency of chip fetches, minimum result partitions, and
    /// concurrent writes per partition.
    pub fn with_limits(mut self, fetch: usize, partitions: usize, writes: usize) -> Self {
        self.fetch_concurrency = fetch.max(1);
        self.product_partitions = partitions.max(1);
        self.write_concurrency = writes.max(1);
        self
    }

    fn enter(&self, stage: Stage, tile: &Tile) {
        tracing::info!("[{}] {} for tile {}", self.ctx.name(), stage, tile);
    }

    /// Fetch and assemble aux rods for a set of chips.
    async fn assemble_aux(
        &self,
        chips: &[ChipCoord],
        acquired: &AcquiredRange,
        bands: &ResolvedBands<AuxBand>,
    ) -> Result<Vec<AuxRod>> {
        let per_chip: Vec<Vec<AuxRod>> = stream::iter(chips.iter().copied())
            .map(|chip| async move {
                let rasters = self.aux.fetch(chip, acquired, bands).await?;
                let assembler = self.assembler.clone();
                let start = Instant::now();
                let rods = tokio::task::spawn_blocking(move || assembler.assemble(rasters))
                    .await
                    .map_err(|e| anyhow::anyhow!("Assembly task panicked: {}", e))?
                    .with_context(|| format!("Failed to assemble aux for chip {}", chip))?;
                self.metrics.add_assemble_time(start.elapsed());
                self.metrics.add_chip_assembled();
                Ok::<_, anyhow::Error>(rods)
            })
            .buffer_unordered(self.fetch_concurrency)
            .try_collect()
            .await?;
        Ok(per_chip.into_iter().flatten().collect())
    }

    /// Fit a model on the tile neighbourhood. `None` when there is nothing to train on.
    async fn train(
        &self,
        req: &ClassificationRequest,
        bands: &ResolvedBands<AuxBand>,
    ) -> Result<Option<serde_json::Value>> {
        let tile = &req.tile;

        self.enter(Stage::FetchTrainingGrid, tile);
        let chips = self.grid.training_chips(tile);
        tracing::info!("Training grid has {} chips", chips.len());

        self.enter(Stage::AssembleAuxTimeseries, tile);
        let aux = self.assemble_aux(&chips, &req.acquired, bands).await?;

        self.enter(Stage::FilterValidTrends, tile);
        let aux = self.ctx.retain("training aux", features::valid_trends(aux));
        tracing::info!("{} aux rows with valid trends", aux.len());

        self.enter(Stage::JoinPriorSegments, tile);
        let segments = self.results.read_segments(&chips).await?;
        let segments = features::in_window(segments, req.msday, req.meday);

        self.enter(Stage::BuildFeatures, tile);
        let rows = self.ctx.retain(
            "training features",
            Arc::new(features::build(&aux, &segments, true)),
        );

        if rows.is_empty() {
            tracing::warn!("No training features for tile {}; model could not be trained", tile);
            aux.release();
            rows.release();
            return Ok(None);
        }

        self.enter(Stage::TrainModel, tile);
        tracing::info!("Training {} on {} rows", self.classifier.algorithm(), rows.len());
        let classifier = self.classifier.clone();
        let training = Arc::clone(&rows);
        let model = tokio::task::spawn_blocking(move || classifier.train(&training))
            .await
            .map_err(|e| anyhow::anyhow!("Training task panicked: {}", e))??;

        aux.release();
        rows.release();
        Ok(Some(model))
    }

    /// Classify the tile's segments and build the rows to persist.
    async fn classify(
        &self,
        req: &ClassificationRequest,
        bands: &ResolvedBands<AuxBand>,
        model: serde_json::Value,
    ) -> Result<Vec<ClassificationRecord>> {
        let tile = &req.tile;

        self.enter(Stage::FetchClassificationGrid, tile);
        let chips = self.grid.classification_chips(tile);
        tracing::info!("Classification grid has {} chips", chips.len());

        self.enter(Stage::AssembleAuxTimeseries, tile);
        let aux = self.assemble_aux(&chips, &req.acquired, bands).await?;

        self.enter(Stage::JoinPriorSegments, tile);
        let segments = self.ctx.retain(
            "classification segments",
            self.results.read_segments(&chips).await?,
        );
        tracing::info!("Found {} change segments", segments.len());

        self.enter(Stage::BuildFeatures, tile);
        let rows = self.ctx.retain(
            "classification features",
            Arc::new(features::build(&aux, &segments, false)),
        );
        drop(aux);
        segments.release();

        self.enter(Stage::Predict, tile);
        let classifier = self.classifier.clone();
        let inputs = Arc::clone(&rows);
        let predictions =
            tokio::task::spawn_blocking(move || classifier.predict(&model, &inputs))
                .await
                .map_err(|e| anyhow::anyhow!("Prediction task panicked: {}", e))??;
        if predictions.len() != rows.len() {
            bail!(
                "Classifier returned {} predictions for {} rows",
                predictions.len(),
                rows.len()
            );
        }

        self.enter(Stage::NormalizePredictionEncoding, tile);
        let mut records = Vec::with_capacity(rows.len());
        for (row, prediction) in rows.iter().zip(&predictions) {
            let rfrawp = prediction.dedensify();
            records.push(ClassificationRecord {
                tile_x: tile.x,
                tile_y: tile.y,
                chip_x: row.chip.x,
                chip_y: row.chip.y,
                x: row.pixel.x,
                y: row.pixel.y,
                sday: row.sday,
                eday: row.eday,
                result_md5: checksum(&serde_json::to_vec(&rfrawp)?),
                rfrawp,
                produced: produced_now(),
            });
        }

        rows.release();
        Ok(records)
    }

    /// Write classification rows across the execution context.
    async fn persist(&self, records: Vec<ClassificationRecord>) -> Result<u64> {
        let partitions = self.ctx.parallelize(records, self.product_partitions, |r| {
            64 + 8 * r.rfrawp.len()
        })?;
        let store = self.results.clone();
        let writes = self.write_concurrency;
        let metrics = self.metrics.clone();

        let counts = self
            .ctx
            .map_partitions(partitions, move |_, rows| {
                let store = store.clone();
                let metrics = metrics.clone();
                async move {
                    let start = Instant::now();
                    let written: Vec<usize> = stream::iter(rows)
                        .map(|row| {
                            let store = &store;
                            async move { store.put_classification(&row).await }
                        })
                        .buffer_unordered(writes)
                        .try_collect()
                        .await?;
                    metrics.add_write_time(start.elapsed());
                    metrics.add_bytes_written(written.iter().sum::<usize>() as u64);
                    metrics.add_partition_run();
                    Ok::<u64, anyhow::Error>(written.len() as u64)
                }
            })
            .await?;

        let total = counts.into_iter().sum();
        self.metrics.add_rows_written(total);
        self.metrics.add_segments_classified(total);
        Ok(total)
    }

    /// Run the whole pipeline for one tile.
    ///
    /// A failing stage stops the execution context before the error is returned.
    pub async fn run(&self, req: &ClassificationRequest) -> Result<Outcome> {
        let outcome = self.run_stages(req).await;
        if outcome.is_err() {
            self.ctx.stop();
        }
        outcome
    }

    async fn run_stages(&self, req: &ClassificationRequest) -> Result<Outcome> {
        tracing::info!(
            "Classifying tile {} acquired {} with training window [{}, {}]",
            req.tile,
            req.acquired,
            req.msday,
            req.meday
        );
        let bands = self.aux.resolve::<AuxBand>().await?;

        let Some(model) = self.train(req, &bands).await? else {
            return Ok(Outcome::Aborted);
        };

        let records = self.classify(req, &bands, model).await?;

        self.enter(Stage::PersistResults, &req.tile);
        let classified = self.persist(records).await?;
        tracing::info!("Saved {} classification results", classified);

        self.enter(Stage::ReadPriorTileMetadata, &req.tile);
        let prior = self.metadata.read_detection(&req.tile).await?;

        self.enter(Stage::MergeAndWriteMetadata, &req.tile);
        let summary = ClassificationSummary {
            msday: req.msday,
            meday: req.meday,
            classifier: self.classifier.algorithm(),
            auxurl: self.aux.url().to_string(),
            classified,
        };
        let md = self.metadata.merge_classification(prior, &summary).await?;
        Ok(Outcome::Success(md))
    }
}
