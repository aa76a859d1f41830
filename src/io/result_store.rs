//! Keyed, idempotent persistence of detection and classification rows.
//!
//! Every row is one JSON object whose path is derived from its key, so
//! writing the same key twice replaces the row. There are no cross-row
//! transactions: an interrupted tile is recovered by re-running it.

use crate::grid::ChipCoord;
use crate::io::records::{ClassificationRecord, DetectionResult, SegmentRow};
use crate::validation::AcquiredRange;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::path::{Path, PathPart};
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use std::sync::Arc;

const DETECTIONS: &str = "results";
const CLASSIFICATIONS: &str = "classifications";

/// Row store over an injected object store, namespaced by keyspace.
#[derive(Clone)]
pub struct ResultStore {
    store: Arc<dyn ObjectStore>,
    keyspace: String,
    read_concurrency: usize,
}

impl ResultStore {
    pub fn new(store: Arc<dyn ObjectStore>, keyspace: impl Into<String>) -> Self {
        Self {
            store,
            keyspace: keyspace.into(),
            read_concurrency: 32,
        }
    }

    /// Bound on concurrent object reads when scanning chips.
    pub fn with_read_concurrency(mut self, n: usize) -> Self {
        self.read_concurrency = n.max(1);
        self
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    fn chip_prefix(&self, table: &str, chip: ChipCoord) -> Path {
        Path::from_iter([
            self.keyspace.clone(),
            table.to_string(),
            format!("{}_{}", chip.x, chip.y),
        ])
    }

    fn detection_path(&self, row: &DetectionResult, acquired_key: &str) -> Path {
        Path::from_iter([
            self.keyspace.clone(),
            DETECTIONS.to_string(),
            format!("{}_{}", row.chip_x, row.chip_y),
            format!("{}_{}", row.x, row.y),
            row.algorithm.clone(),
            format!("{}.json", acquired_key),
        ])
    }

    fn classification_path(&self, row: &ClassificationRecord) -> Path {
        Path::from_iter([
            self.keyspace.clone(),
            CLASSIFICATIONS.to_string(),
            format!("{}_{}", row.chip_x, row.chip_y),
            format!("{}_{}", row.x, row.y),
            format!("{}_{}.json", row.sday, row.eday),
        ])
    }

    async fn put_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<usize> {
        let body = serde_json::to_vec(value)?;
        let len = body.len();
        self.store
            .put(path, PutPayload::from(Bytes::from(body)))
            .await
            .with_context(|| format!("Failed to write {}", path))?;
        Ok(len)
    }

    /// Upsert one detection row. Returns the bytes written.
    pub async fn put_detection(&self, row: &DetectionResult, acquired: &AcquiredRange) -> Result<usize> {
        let path = self.detection_path(row, &acquired.key());
        self.put_json(&path, row).await
    }

    /// Upsert one classification row. Returns the bytes written.
    pub async fn put_classification(&self, row: &ClassificationRecord) -> Result<usize> {
        let path = self.classification_path(row);
        self.put_json(&path, row).await
    }

    /// Fetch one detection row by key.
    pub async fn get_detection(
        &self,
        chip: ChipCoord,
        x: i64,
        y: i64,
        algorithm: &str,
        acquired: &AcquiredRange,
    ) -> Result<Option<DetectionResult>> {
        let path = Path::from_iter([
            self.keyspace.clone(),
            DETECTIONS.to_string(),
            format!("{}_{}", chip.x, chip.y),
            format!("{}_{}", x, y),
            algorithm.to_string(),
            format!("{}.json", acquired.key()),
        ]);
        match self.store.get(&path).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path)),
        }
    }

    async fn read_all<T: serde::de::DeserializeOwned>(&self, prefix: &Path) -> Result<Vec<T>> {
        let metas: Vec<_> = self
            .store
            .list(Some(prefix))
            .try_collect()
            .await
            .with_context(|| format!("Failed to list {}", prefix))?;

        let store = &self.store;
        stream::iter(metas)
            .map(|meta| async move {
                let bytes = store.get(&meta.location).await?.bytes().await?;
                let row = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Corrupt row at {}", meta.location))?;
                Ok::<T, anyhow::Error>(row)
            })
            .buffer_unordered(self.read_concurrency)
            .try_collect()
            .await
    }

    /// Every detection row stored for a chip, optionally restricted to one
    /// algorithm and acquired range.
    pub async fn detections_for_chip(
        &self,
        chip: ChipCoord,
        algorithm: Option<&str>,
        acquired: Option<&AcquiredRange>,
    ) -> Result<Vec<DetectionResult>> {
        let rows: Vec<DetectionResult> = self.read_all(&self.chip_prefix(DETECTIONS, chip)).await?;
        Ok(rows
            .into_iter()
            .filter(|r| algorithm.map_or(true, |a| r.algorithm == a))
            .filter(|r| acquired.map_or(true, |a| same_range(&r.acquired, a)))
            .collect())
    }

    /// Segments with valid bounds for a set of chips, whatever range or
    /// algorithm produced them.
    pub async fn read_segments(&self, chips: &[ChipCoord]) -> Result<Vec<SegmentRow>> {
        let per_chip: Vec<Vec<DetectionResult>> = stream::iter(chips.iter().copied())
            .map(|chip| self.detections_for_chip(chip, None, None))
            .buffered(self.read_concurrency)
            .try_collect()
            .await?;

        let mut segments = Vec::new();
        for row in per_chip.into_iter().flatten() {
            let parsed = row
                .segments()
                .with_context(|| format!("Unreadable payload for pixel {}", row.pixel()))?;
            segments.extend(parsed.into_iter().filter(SegmentRow::is_valid));
        }
        Ok(segments)
    }

    /// Number of detection rows for the chips of a tile.
    ///
    /// Counts keys from the listing without reading the rows.
    pub async fn count_detections(
        &self,
        chips: &[ChipCoord],
        algorithm: &str,
        acquired: &AcquiredRange,
    ) -> Result<u64> {
        let algorithm_part = PathPart::from(algorithm);
        let file = format!("{}.json", acquired.key());
        let file_part = PathPart::from(file.as_str());
        let counts: Vec<usize> = stream::iter(chips.iter().copied())
            .map(|chip| {
                let prefix = self.chip_prefix(DETECTIONS, chip);
                let (algorithm_part, file_part) = (&algorithm_part, &file_part);
                async move {
                    let metas: Vec<_> = self
                        .store
                        .list(Some(&prefix))
                        .try_collect()
                        .await
                        .with_context(|| format!("Failed to list {}", prefix))?;
                    Ok::<usize, anyhow::Error>(
                        metas
                            .iter()
                            .filter(|meta| {
                                let parts: Vec<_> = meta.location.parts().collect();
                                parts.len() >= 2
                                    && &parts[parts.len() - 2] == algorithm_part
                                    && &parts[parts.len() - 1] == file_part
                            })
                            .count(),
                    )
                }
            })
            .buffer_unordered(self.read_concurrency)
            .try_collect()
            .await?;
        Ok(counts.into_iter().sum::<usize>() as u64)
    }

    /// Every classification row stored for a chip.
    pub async fn classifications(&self, chip: ChipCoord) -> Result<Vec<ClassificationRecord>> {
        self.read_all(&self.chip_prefix(CLASSIFICATIONS, chip)).await
    }
}

/// Whether a stored `acquired` value names the same days as `range`.
fn same_range(stored: &str, range: &AcquiredRange) -> bool {
    AcquiredRange::parse(stored).map_or(false, |r| r.key() == range.key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::records::{checksum, produced_now};
    use object_store::memory::InMemory;

    fn store() -> ResultStore {
        ResultStore::new(Arc::new(InMemory::new()), "lcmap_test")
    }

    fn acquired() -> AcquiredRange {
        AcquiredRange::parse("1982-01-01/2017-12-31").unwrap()
    }

    fn detection(chip: ChipCoord, x: i64, payload: &str, ok: bool) -> DetectionResult {
        DetectionResult {
            tile_x: 0,
            tile_y: 0,
            chip_x: chip.x,
            chip_y: chip.y,
            x,
            y: chip.y,
            algorithm: "ccd".to_string(),
            acquired: acquired().as_str().to_string(),
            result: payload.to_string(),
            result_ok: ok,
            result_produced: produced_now(),
            inputs_md5: checksum(b"inputs"),
            result_md5: checksum(payload.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let store = store();
        let chip = ChipCoord::new(0, 0);
        let first = detection(chip, 0, r#"{"change_models":[]}"#, true);
        store.put_detection(&first, &acquired()).await.unwrap();

        let second = detection(chip, 0, r#"{"change_models":[{"start_day":1,"end_day":2}]}"#, true);
        store.put_detection(&second, &acquired()).await.unwrap();

        let rows = store.detections_for_chip(chip, None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].result_md5, second.result_md5);
        assert_ne!(first.result_md5, second.result_md5);

        let fetched = store
            .get_detection(chip, 0, chip.y, "ccd", &acquired())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, second);
        assert!(store
            .get_detection(chip, 30, chip.y, "ccd", &acquired())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_read_segments_filters_invalid_bounds() {
        let store = store();
        let chip = ChipCoord::new(3000, -3000);
        let rows = [
            detection(chip, 3000, r#"{"change_models":[{"start_day":5,"end_day":9}]}"#, true),
            detection(chip, 3030, r#"{"change_models":[]}"#, true),
            detection(chip, 3060, "", false),
        ];
        for row in &rows {
            store.put_detection(row, &acquired()).await.unwrap();
        }

        let segments = store.read_segments(&[chip, ChipCoord::new(0, 0)]).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!((segments[0].x, segments[0].sday, segments[0].eday), (3000, 5, 9));

        let count = store.count_detections(&[chip], "ccd", &acquired()).await.unwrap();
        assert_eq!(count, 3);
        let count = store.count_detections(&[chip], "other", &acquired()).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_acquired_filter_matches_equivalent_spellings() {
        let store = store();
        let chip = ChipCoord::new(0, 0);
        store.put_detection(&detection(chip, 0, "", false), &acquired()).await.unwrap();

        let spelled = AcquiredRange::parse("1982-01-01T00:00:00/2017-12-31T23:59:59.5").unwrap();
        let rows = store.detections_for_chip(chip, None, Some(&spelled)).await.unwrap();
        assert_eq!(rows.len(), 1);

        let other = AcquiredRange::parse("1982-01-01/2016-12-31").unwrap();
        assert!(store.detections_for_chip(chip, None, Some(&other)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keyspaces_are_isolated() {
        let backing: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let a = ResultStore::new(backing.clone(), "a");
        let b = ResultStore::new(backing, "b");
        let chip = ChipCoord::new(0, 0);
        a.put_detection(&detection(chip, 0, "", false), &acquired()).await.unwrap();

        assert_eq!(a.detections_for_chip(chip, None, None).await.unwrap().len(), 1);
        assert!(b.detections_for_chip(chip, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_classification_roundtrip() {
        let store = store();
        let record = ClassificationRecord {
            tile_x: 0,
            tile_y: 0,
            chip_x: 0,
            chip_y: 0,
            x: 30,
            y: -30,
            sday: 10,
            eday: 20,
            rfrawp: vec![0.25, 0.75],
            result_md5: checksum(b"[0.25,0.75]"),
            produced: produced_now(),
        };
        store.put_classification(&record).await.unwrap();
        store.put_classification(&record).await.unwrap();

        let rows = store.classifications(ChipCoord::new(0, 0)).await.unwrap();
        assert_eq!(rows, vec![record]);
    }
}
