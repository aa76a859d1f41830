//! Per-tile completion records.

use crate::grid::Tile;
use crate::io::records::{produced_now, ClassificationSummary, JobMetadata};
use anyhow::{Context, Result};
use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use std::sync::Arc;

/// Reads and writes one `JobMetadata` per tile.
///
/// A record is only ever written after all row writes of its stage have
/// completed, so its presence marks the stage as done for the tile.
#[derive(Clone)]
pub struct MetadataRecorder {
    store: Arc<dyn ObjectStore>,
    keyspace: String,
}

impl MetadataRecorder {
    pub fn new(store: Arc<dyn ObjectStore>, keyspace: impl Into<String>) -> Self {
        Self {
            store,
            keyspace: keyspace.into(),
        }
    }

    fn path(&self, tile_x: i64, tile_y: i64) -> Path {
        Path::from_iter([
            self.keyspace.clone(),
            "jobconf".to_string(),
            format!("{}_{}.json", tile_x, tile_y),
        ])
    }

    /// Current record for a tile, if any.
    pub async fn read(&self, tile: &Tile) -> Result<Option<JobMetadata>> {
        let path = self.path(tile.x, tile.y);
        match self.store.get(&path).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                let md = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Corrupt metadata at {}", path))?;
                Ok(Some(md))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path)),
        }
    }

    /// Write a record, replacing any previous one for the same tile.
    pub async fn write(&self, md: &JobMetadata) -> Result<()> {
        let path = self.path(md.tile_x, md.tile_y);
        let body = serde_json::to_vec_pretty(md)?;
        self.store
            .put(&path, PutPayload::from(Bytes::from(body)))
            .await
            .with_context(|| format!("Failed to write {}", path))?;
        Ok(())
    }

    /// Record a completed detection run.
    pub async fn write_detection(&self, md: &JobMetadata) -> Result<()> {
        tracing::info!(
            "Detection complete for tile ({}, {}): {} results",
            md.tile_x,
            md.tile_y,
            md.segcount
        );
        self.write(md).await
    }

    /// Detection record for a tile, which must exist.
    pub async fn read_detection(&self, tile: &Tile) -> Result<JobMetadata> {
        self.read(tile).await?.with_context(|| {
            format!("No detection metadata for tile ({}, {})", tile.x, tile.y)
        })
    }

    /// Merge classification fields into a detection record and write it
    /// back under the same key.
    pub async fn merge_classification(
        &self,
        mut md: JobMetadata,
        summary: &ClassificationSummary,
    ) -> Result<JobMetadata> {
        md.msday = Some(summary.msday);
        md.meday = Some(summary.meday);
        md.classifier = Some(summary.classifier.clone());
        md.auxurl = Some(summary.auxurl.clone());
        md.classified = Some(summary.classified);
        md.produced = produced_now();

        self.write(&md).await?;
        Ok(md)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn tile() -> Tile {
        Tile { h: 5, v: 2, x: 1_631_415, y: 2_114_805 }
    }

    fn summary() -> ClassificationSummary {
        ClassificationSummary {
            msday: 730_120,
            meday: 735_000,
            classifier: "rf".to_string(),
            auxurl: "http://aux".to_string(),
            classified: 12,
        }
    }

    #[tokio::test]
    async fn test_write_then_merge() {
        let recorder = MetadataRecorder::new(Arc::new(InMemory::new()), "ks");
        let detection = JobMetadata::detection(&tile(), "a/b", "ccd", "http://ard", 40);
        recorder.write_detection(&detection).await.unwrap();

        let prior = recorder.read_detection(&tile()).await.unwrap();
        let merged = recorder.merge_classification(prior, &summary()).await.unwrap();
        assert_eq!(merged.segcount, 40);
        assert_eq!(merged.detector, "ccd");
        assert_eq!(merged.msday, Some(730_120));
        assert_eq!(merged.classified, Some(12));

        let stored = recorder.read(&tile()).await.unwrap().unwrap();
        assert_eq!(stored, merged);
    }

    #[tokio::test]
    async fn test_missing_detection_is_an_error() {
        let recorder = MetadataRecorder::new(Arc::new(InMemory::new()), "ks");
        assert!(recorder.read_detection(&tile()).await.is_err());
        assert!(recorder.read(&tile()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rewrite_replaces_record() {
        let recorder = MetadataRecorder::new(Arc::new(InMemory::new()), "ks");
        let mut md = JobMetadata::detection(&tile(), "a/b", "ccd", "http://ard", 1);
        recorder.write(&md).await.unwrap();
        md.segcount = 2;
        recorder.write(&md).await.unwrap();
        assert_eq!(recorder.read(&tile()).await.unwrap().unwrap().segcount, 2);
    }
}
