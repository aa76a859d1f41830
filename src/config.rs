//! Configuration for the firebird pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration, built once at process start and shared as `Arc<Config>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Chip and spec catalog endpoints
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Result and metadata storage
    pub store: StoreConfig,

    /// Tile and chip grid definitions
    #[serde(default)]
    pub grid: GridConfig,

    /// Partitioning and concurrency
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Change detection capability
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Classification capability
    #[serde(default)]
    pub classification: ClassificationConfig,
}

/// Catalog service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Base URL of the catalog serving surface reflectance (ARD) chips
    #[serde(default = "default_catalog_url")]
    pub ard_url: String,

    /// Base URL of the catalog serving ancillary (AUX) chips
    #[serde(default = "default_catalog_url")]
    pub aux_url: String,

    /// Path of the chip-spec endpoint, appended to the base URL
    #[serde(default = "default_specs_path")]
    pub specs_path: String,

    /// Path of the chips endpoint, appended to the base URL
    #[serde(default = "default_chips_path")]
    pub chips_path: String,

    /// Request timeout in seconds
    #[serde(default = "default_catalog_timeout")]
    pub timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            ard_url: default_catalog_url(),
            aux_url: default_catalog_url(),
            specs_path: default_specs_path(),
            chips_path: default_chips_path(),
            timeout_secs: default_catalog_timeout(),
        }
    }
}

/// Result store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Local filesystem root for the store.
    /// Mutually exclusive with bucket/prefix.
    #[serde(default)]
    pub local_path: Option<String>,

    /// S3 bucket (required if local_path is not set)
    #[serde(default)]
    pub bucket: Option<String>,

    /// S3 key prefix (required if local_path is not set)
    #[serde(default)]
    pub prefix: Option<String>,

    /// Keyspace that namespaces every row written by this deployment
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
}

impl StoreConfig {
    /// Check if the store lives on the local filesystem.
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// Store location as a display string (local path or s3:// URI).
    pub fn path_display(&self) -> String {
        if let Some(path) = &self.local_path {
            path.clone()
        } else {
            format!("s3://{}/{}",
                self.bucket.as_deref().unwrap_or(""),
                self.prefix.as_deref().unwrap_or(""))
        }
    }
}

/// Affine definition of one grid level.
///
/// `rx`/`ry` are the axis reflections, `sx`/`sy` the cell size in projection
/// units and `tx`/`ty` the grid origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub rx: i64,
    pub ry: i64,
    pub sx: i64,
    pub sy: i64,
    pub tx: i64,
    pub ty: i64,
}

/// Tile/chip/pixel grid configuration (CONUS ARD by default).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default = "default_tile_grid")]
    pub tile: GridSpec,

    #[serde(default = "default_chip_grid")]
    pub chip: GridSpec,

    /// Pixel edge length in projection units
    #[serde(default = "default_pixel_size")]
    pub pixel_size: i64,

    /// Tiles around the target tile that contribute training chips
    #[serde(default = "default_training_radius")]
    pub training_radius: i64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            tile: default_tile_grid(),
            chip: default_chip_grid(),
            pixel_size: default_pixel_size(),
            training_radius: default_training_radius(),
        }
    }
}

/// Partitioning and concurrency configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Minimum partitions for per-pixel detection input
    #[serde(default = "default_input_partitions")]
    pub input_partitions: usize,

    /// Minimum partitions for classification products
    #[serde(default = "default_product_partitions")]
    pub product_partitions: usize,

    /// Upper bound on one partition's serialized payload in bytes
    #[serde(default = "default_max_task_payload")]
    pub max_task_payload_bytes: usize,

    /// Partitions executing concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Concurrent catalog requests when assembling several chips
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Concurrent store writes inside one partition
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for CPU-bound work
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            input_partitions: default_input_partitions(),
            product_partitions: default_product_partitions(),
            max_task_payload_bytes: default_max_task_payload(),
            concurrency: default_concurrency(),
            fetch_concurrency: default_fetch_concurrency(),
            write_concurrency: default_write_concurrency(),
            worker_threads: None,
            rayon_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Change detection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// External detector command and arguments
    #[serde(default)]
    pub command: Vec<String>,

    /// Requested quality band encoding. Recorded but not honoured, see
    /// [`crate::pipeline::DetectionParams::from_config`].
    #[serde(default = "default_true")]
    pub qa_bitpacked: bool,
}

/// Classification configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// External classifier command and arguments
    #[serde(default)]
    pub command: Vec<String>,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("ARD_CHIPMUNK") {
            self.catalog.ard_url = url;
        }
        if let Some(url) = lookup("AUX_CHIPMUNK") {
            self.catalog.aux_url = url;
        }
        if let Some(keyspace) = lookup("FIREBIRD_KEYSPACE") {
            self.store.keyspace = keyspace;
        }
        if let Some(path) = lookup("FIREBIRD_STORE_PATH") {
            if path.starts_with("s3://") {
                let (bucket, prefix) = crate::io::parse_s3_uri(&path)?;
                self.store.bucket = Some(bucket.to_string());
                self.store.prefix = Some(prefix.to_string());
                self.store.local_path = None;
            } else {
                self.store.local_path = Some(path);
                self.store.bucket = None;
                self.store.prefix = None;
            }
        }
        if let Some(n) = lookup("INPUT_PARTITIONS") {
            self.processing.input_partitions = n
                .parse()
                .map_err(|e| anyhow::anyhow!("INPUT_PARTITIONS '{}': {}", n, e))?;
        }
        if let Some(n) = lookup("PRODUCT_PARTITIONS") {
            self.processing.product_partitions = n
                .parse()
                .map_err(|e| anyhow::anyhow!("PRODUCT_PARTITIONS '{}': {}", n, e))?;
        }
        if let Some(flag) = lookup("CCD_QA_BITPACKED") {
            self.detection.qa_bitpacked = flag.eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    /// Full URL of the ARD chip-spec endpoint.
    pub fn ard_specs_url(&self) -> String {
        format!("{}{}", self.catalog.ard_url, self.catalog.specs_path)
    }

    /// Full URL of the ARD chips endpoint.
    pub fn ard_chips_url(&self) -> String {
        format!("{}{}", self.catalog.ard_url, self.catalog.chips_path)
    }

    /// Full URL of the AUX chip-spec endpoint.
    pub fn aux_specs_url(&self) -> String {
        format!("{}{}", self.catalog.aux_url, self.catalog.specs_path)
    }

    /// Full URL of the AUX chips endpoint.
    pub fn aux_chips_url(&self) -> String {
        format!("{}{}", self.catalog.aux_url, self.catalog.chips_path)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        match (&self.store.local_path, &self.store.bucket, &self.store.prefix) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                anyhow::bail!("Cannot specify both local_path and bucket/prefix");
            }
            (None, None, _) | (None, _, None) => {
                anyhow::bail!("Must specify either local_path or both bucket and prefix");
            }
            _ => {}
        }

        if self.store.keyspace.is_empty() || self.store.keyspace.contains('/') {
            anyhow::bail!("Keyspace must be a non-empty single path segment");
        }

        let grid = &self.grid;
        if grid.pixel_size <= 0 || grid.chip.sx <= 0 || grid.chip.sy <= 0 {
            anyhow::bail!("Pixel and chip sizes must be > 0");
        }
        if grid.tile.sx % grid.chip.sx != 0 || grid.tile.sy % grid.chip.sy != 0 {
            anyhow::bail!("Tile size must be a multiple of chip size");
        }
        if grid.chip.sx % grid.pixel_size != 0 || grid.chip.sy % grid.pixel_size != 0 {
            anyhow::bail!("Chip size must be a multiple of pixel size");
        }
        if grid.training_radius < 0 {
            anyhow::bail!("Training radius must be >= 0");
        }

        if self.processing.concurrency == 0 {
            anyhow::bail!("Concurrency must be > 0");
        }
        if self.processing.fetch_concurrency == 0 || self.processing.write_concurrency == 0 {
            anyhow::bail!("Fetch and write concurrency must be > 0");
        }
        if self.processing.input_partitions == 0 || self.processing.product_partitions == 0 {
            anyhow::bail!("Partition counts must be > 0");
        }
        if self.processing.max_task_payload_bytes == 0 {
            anyhow::bail!("Task payload bound must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_catalog_url() -> String { "http://localhost:5656".to_string() }
fn default_specs_path() -> String { "/v1/landsat/chip-specs".to_string() }
fn default_chips_path() -> String { "/v1/landsat/chips".to_string() }
fn default_catalog_timeout() -> u64 { 120 }
fn default_keyspace() -> String { "lcmap_changes_local".to_string() }
fn default_pixel_size() -> i64 { 30 }
fn default_training_radius() -> i64 { 1 }
fn default_input_partitions() -> usize { 16 }
fn default_product_partitions() -> usize { 16 }
fn default_max_task_payload() -> usize { 100 * 1024 }
fn default_concurrency() -> usize { 16 }
fn default_fetch_concurrency() -> usize { 4 }
fn default_write_concurrency() -> usize { 32 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }

fn default_tile_grid() -> GridSpec {
    GridSpec { rx: 1, ry: -1, sx: 150_000, sy: 150_000, tx: 2_565_585, ty: 3_314_805 }
}

fn default_chip_grid() -> GridSpec {
    GridSpec { rx: 1, ry: -1, sx: 3_000, sy: 3_000, tx: 2_565_585, ty: 3_314_805 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn local_config() -> Config {
        Config::from_yaml("store:\n  local_path: /tmp/firebird\n").unwrap()
    }

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let config = local_config();
        assert_eq!(config.store.keyspace, "lcmap_changes_local");
        assert_eq!(config.grid.tile.sx, 150_000);
        assert_eq!(config.grid.chip.sx, 3_000);
        assert_eq!(config.processing.max_task_payload_bytes, 100 * 1024);
        assert!(config.detection.qa_bitpacked);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_s3() {
        let config = Config::from_yaml(
            "store:\n  bucket: results\n  prefix: firebird\n",
        ).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.path_display(), "s3://results/firebird");
    }

    #[test]
    fn test_config_validation_invalid() {
        // Both local_path and bucket set - should fail
        let config = Config::from_yaml(
            "store:\n  local_path: /tmp/x\n  bucket: results\n",
        ).unwrap();
        assert!(config.validate().is_err());

        let mut config = local_config();
        config.grid.chip.sx = 3_001;
        assert!(config.validate().is_err());

        let mut config = local_config();
        config.store.keyspace = "a/b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ARD_CHIPMUNK", "http://ard:5656"),
            ("FIREBIRD_KEYSPACE", "lcmap_changes_test"),
            ("INPUT_PARTITIONS", "64"),
            ("CCD_QA_BITPACKED", "False"),
        ]
        .into_iter()
        .collect();

        let mut config = local_config();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.ard_specs_url(), "http://ard:5656/v1/landsat/chip-specs");
        assert_eq!(config.store.keyspace, "lcmap_changes_test");
        assert_eq!(config.processing.input_partitions, 64);
        assert!(!config.detection.qa_bitpacked);
        assert_eq!(config.aux_chips_url(), "http://localhost:5656/v1/landsat/chips");
    }

    #[test]
    fn test_store_path_override() {
        let mut config = local_config();
        config
            .apply_overrides(|k| (k == "FIREBIRD_STORE_PATH").then(|| "s3://results/lcmap".to_string()))
            .unwrap();
        assert_eq!(config.store.bucket.as_deref(), Some("results"));
        assert_eq!(config.store.prefix.as_deref(), Some("lcmap"));
        assert!(config.store.local_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override_bad_number() {
        let mut config = local_config();
        let result = config.apply_overrides(|k| {
            (k == "PRODUCT_PARTITIONS").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_yaml_roundtrip_through_file() {
        let config = local_config();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, config.to_yaml().unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.store.local_path.as_deref(), Some("/tmp/firebird"));
        assert_eq!(loaded.grid.tile, config.grid.tile);
    }
}
