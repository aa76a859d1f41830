//! Object store construction for S3 and local filesystem result storage.

use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::prefix::PrefixStore;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    without_scheme
        .split_once('/')
        .with_context(|| format!("Invalid S3 URI: expected 's3://bucket/key' format in '{}'", uri))
}

/// Client options for many small row writes.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(30))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(64)
}

/// Retry configuration for transient failures.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        // Initial backoff (doubles each retry)
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an authenticated S3 client.
///
/// Credentials and region are loaded from the environment, AWS config
/// files, or the instance profile.
fn create_authenticated_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating authenticated S3 client for bucket: {}", bucket);

    let builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config())
        .with_virtual_hosted_style_request(true);

    Ok(Arc::new(builder.build()?))
}

/// Create the store holding result rows and job metadata.
///
/// Uses LocalFileSystem if local_path is set, otherwise S3 under the
/// configured prefix.
pub fn create_result_store(config: &crate::config::Config) -> Result<Arc<dyn ObjectStore>> {
    let store = &config.store;
    match (&store.local_path, &store.bucket, &store.prefix) {
        (Some(local_path), _, _) => {
            let path = std::path::Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)?;
            }
            tracing::info!("Creating LocalFileSystem store at: {}", path.display());
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        (None, Some(bucket), Some(prefix)) => {
            let s3 = create_authenticated_store(bucket)?;
            Ok(Arc::new(PrefixStore::new(s3, prefix.as_str())))
        }
        _ => anyhow::bail!("Invalid config: no result store destination"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use object_store::path::Path;
    use object_store::ObjectStoreExt;

    #[test]
    fn test_create_authenticated_store() {
        let result = create_authenticated_store("test-bucket");
        assert!(result.is_ok());
    }

    #[test]
    fn test_parse_s3_uri() {
        let (bucket, key) = parse_s3_uri("s3://lcmap-results/changes/v1").unwrap();
        assert_eq!(bucket, "lcmap-results");
        assert_eq!(key, "changes/v1");

        let (bucket, key) = parse_s3_uri("s3://bucket/prefix").unwrap();
        assert_eq!(bucket, "bucket");
        assert_eq!(key, "prefix");
    }

    #[test]
    fn test_parse_s3_uri_invalid() {
        assert!(parse_s3_uri("bucket/key").is_err());
        assert!(parse_s3_uri("http://bucket/key").is_err());
        assert!(parse_s3_uri("s3://bucket").is_err());
    }

    #[tokio::test]
    async fn test_local_store_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested");
        let yaml = format!("store:\n  local_path: {}\n", root.display());
        let config = Config::from_yaml(&yaml).unwrap();

        let store = create_result_store(&config).unwrap();
        assert!(root.exists());

        store.put(&Path::from("ks/row.json"), "{}".into()).await.unwrap();
        assert!(root.join("ks").join("row.json").exists());
    }
}
