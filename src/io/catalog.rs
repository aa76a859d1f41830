//! Chip and chip-spec catalog access.
//!
//! A band role resolves to band identifiers (ubids) through a tag query
//! against the chip-specs endpoint. Rasters are then fetched per chip from the
//! chips endpoint as base64 little-endian arrays.

use crate::grid::ChipCoord;
use crate::pipeline::Metrics;
use crate::timeseries::{BandRasters, BandRole, Raster};
use crate::validation::{self, AcquiredRange};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Element type of a chip's raster data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Uint8,
    Int16,
    Uint16,
    Int32,
    Float32,
}

impl DataType {
    fn width(self) -> usize {
        match self {
            Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Float32 => 4,
        }
    }
}

/// Description of one band as served by the chip-specs endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandSpec {
    pub ubid: String,
    pub data_shape: Vec<usize>,
    pub data_type: DataType,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One chip as served by the chips endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipRecord {
    pub x: i64,
    pub y: i64,
    pub ubid: String,
    pub acquired: String,
    pub data: String,
}

/// Decode base64 little-endian raster data.
pub fn decode(data: &str, data_type: DataType, shape: &[usize]) -> Result<Vec<f64>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .context("Chip data is not valid base64")?;
    let expected: usize = shape.iter().product();
    if bytes.len() != expected * data_type.width() {
        bail!(
            "Chip data has {} bytes, expected {} values of {:?} ({} bytes)",
            bytes.len(),
            expected,
            data_type,
            expected * data_type.width()
        );
    }

    let values = match data_type {
        DataType::Uint8 => bytes.iter().map(|&b| b as f64).collect(),
        DataType::Int16 => bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f64)
            .collect(),
        DataType::Uint16 => bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) as f64)
            .collect(),
        DataType::Int32 => bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
        DataType::Float32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
    };
    Ok(values)
}

/// Source of band specs and chips.
#[async_trait]
pub trait ChipSource: Send + Sync {
    /// Band specs matching a tag query.
    async fn specs(&self, query: &str) -> Result<Vec<BandSpec>>;

    /// Chips at `chip` for the given ubids within the acquired range.
    async fn chips(
        &self,
        chip: ChipCoord,
        acquired: &AcquiredRange,
        ubids: &[String],
    ) -> Result<Vec<ChipRecord>>;
}

/// HTTP catalog service.
pub struct HttpCatalog {
    client: reqwest::Client,
    specs_url: String,
    chips_url: String,
}

impl HttpCatalog {
    pub fn new(specs_url: String, chips_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            specs_url,
            chips_url,
        })
    }
}

#[async_trait]
impl ChipSource for HttpCatalog {
    async fn specs(&self, query: &str) -> Result<Vec<BandSpec>> {
        let specs = self
            .client
            .get(&self.specs_url)
            .query(&[("q", query)])
            .send()
            .await
            .with_context(|| format!("Spec request to {} failed", self.specs_url))?
            .error_for_status()?
            .json::<Vec<BandSpec>>()
            .await
            .with_context(|| format!("Invalid spec response for '{}'", query))?;
        Ok(specs)
    }

    async fn chips(
        &self,
        chip: ChipCoord,
        acquired: &AcquiredRange,
        ubids: &[String],
    ) -> Result<Vec<ChipRecord>> {
        let mut params: Vec<(&str, String)> = vec![
            ("x", chip.x.to_string()),
            ("y", chip.y.to_string()),
            ("acquired", acquired.as_str().to_string()),
        ];
        params.extend(ubids.iter().map(|u| ("ubid", u.clone())));

        let chips = self
            .client
            .get(&self.chips_url)
            .query(&params)
            .send()
            .await
            .with_context(|| format!("Chip request for {} failed", chip))?
            .error_for_status()?
            .json::<Vec<ChipRecord>>()
            .await
            .with_context(|| format!("Invalid chip response for {}", chip))?;
        Ok(chips)
    }
}

/// Band specs resolved for every role of `B`.
#[derive(Debug, Clone)]
pub struct ResolvedBands<B: BandRole> {
    roles: Vec<(B, Vec<BandSpec>)>,
}

impl<B: BandRole> ResolvedBands<B> {
    pub fn ubids(&self, role: B) -> Vec<String> {
        self.roles
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, specs)| specs.iter().map(|s| s.ubid.clone()).collect())
            .unwrap_or_default()
    }
}

/// Resolves band roles and fetches chip rasters.
#[derive(Clone)]
pub struct CatalogClient {
    source: Arc<dyn ChipSource>,
    url: String,
    metrics: Option<Arc<Metrics>>,
}

impl CatalogClient {
    pub fn new(source: Arc<dyn ChipSource>, url: impl Into<String>) -> Self {
        Self {
            source,
            url: url.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Base URL of the catalog, recorded in job metadata.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Resolve every role of `B` to its band specs.
    ///
    /// Duplicate ubids are dropped. A role that resolves to nothing is an error.
    pub async fn resolve<B: BandRole>(&self) -> Result<ResolvedBands<B>> {
        let mut roles = Vec::with_capacity(B::ALL.len());
        for role in B::ALL {
            let mut specs = self
                .source
                .specs(role.query())
                .await
                .with_context(|| format!("Failed to resolve band {}", role.name()))?;
            let mut seen = std::collections::HashSet::new();
            specs.retain(|s| seen.insert(s.ubid.clone()));
            if specs.is_empty() {
                bail!("No bands match '{}' for {}", role.query(), role.name());
            }
            tracing::debug!("{} -> {:?}", role.name(), specs.iter().map(|s| &s.ubid).collect::<Vec<_>>());
            roles.push((*role, specs));
        }
        Ok(ResolvedBands { roles })
    }

    /// Fetch and decode every role's rasters for one chip.
    pub async fn fetch<B: BandRole>(
        &self,
        chip: ChipCoord,
        acquired: &AcquiredRange,
        bands: &ResolvedBands<B>,
    ) -> Result<BandRasters<B>> {
        let start = Instant::now();
        let mut rasters = BandRasters::new(chip);
        let mut fetched_bytes = 0u64;

        for (role, specs) in &bands.roles {
            let by_ubid: HashMap<&str, &BandSpec> =
                specs.iter().map(|s| (s.ubid.as_str(), s)).collect();
            let ubids: Vec<String> = specs.iter().map(|s| s.ubid.clone()).collect();

            let records = self
                .source
                .chips(chip, acquired, &ubids)
                .await
                .with_context(|| format!("Failed to fetch {} for chip {}", role.name(), chip))?;

            let mut decoded = Vec::with_capacity(records.len());
            for record in records {
                let spec = by_ubid
                    .get(record.ubid.as_str())
                    .with_context(|| format!("Unexpected ubid {} for {}", record.ubid, role.name()))?;
                let acquired_day = validation::parse_iso_date(&record.acquired)
                    .map(validation::to_ordinal)
                    .with_context(|| format!("Bad acquired date '{}'", record.acquired))?;
                fetched_bytes += record.data.len() as u64;
                let values = decode(&record.data, spec.data_type, &spec.data_shape)
                    .with_context(|| format!("Failed to decode {} at {}", record.ubid, record.acquired))?;
                decoded.push(Raster {
                    ubid: record.ubid,
                    acquired: acquired_day,
                    values,
                });
            }
            rasters.insert(*role, decoded);
        }

        if let Some(metrics) = &self.metrics {
            metrics.add_bytes_fetched(fetched_bytes);
            metrics.add_fetch_time(start.elapsed());
        }
        Ok(rasters)
    }
}
