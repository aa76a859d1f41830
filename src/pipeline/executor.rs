//! In-process execution context: partitioned parallel map with whole-job teardown.
//!
//! Submissions block until every partition completes or fails. There is no
//! per-task cancellation; `stop()` tears the context down and every later
//! submission fails.

use crate::config::ProcessingConfig;
use anyhow::{bail, Result};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared execution context for one job.
#[derive(Debug)]
pub struct ExecutionContext {
    name: String,
    concurrency: usize,
    max_payload_bytes: usize,
    stopped: AtomicBool,
    retained: Arc<AtomicUsize>,
}

impl ExecutionContext {
    /// Start a context named after the job.
    pub fn start(name: &str, config: &ProcessingConfig) -> Arc<Self> {
        tracing::info!(
            "Starting execution context '{}' ({} concurrent partitions)",
            name,
            config.concurrency
        );
        Arc::new(Self {
            name: name.to_string(),
            concurrency: config.concurrency.max(1),
            max_payload_bytes: config.max_task_payload_bytes.max(1),
            stopped: AtomicBool::new(false),
            retained: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tear down the context. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let retained = self.retained_count();
            if retained > 0 {
                tracing::warn!("Stopping '{}' with {} retained collections", self.name, retained);
            } else {
                tracing::info!("Stopped execution context '{}'", self.name);
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Guard that stops the context when dropped.
    pub fn guard(self: &Arc<Self>) -> ContextGuard {
        ContextGuard { ctx: self.clone() }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            bail!("Execution context '{}' is stopped", self.name);
        }
        Ok(())
    }

    /// Number of partitions for `items` elements totalling `total_bytes`.
    ///
    /// At least `min_partitions`, enough to keep each partition under the
    /// payload bound, and never more than one partition per item.
    pub fn partition_count(&self, items: usize, total_bytes: usize, min_partitions: usize) -> usize {
        if items == 0 {
            return 0;
        }
        let by_payload = total_bytes.div_ceil(self.max_payload_bytes);
        min_partitions.max(by_payload).max(1).min(items)
    }

    /// Split items into contiguous partitions sized by their payload.
    pub fn parallelize<T, F>(&self, items: Vec<T>, min_partitions: usize, payload: F) -> Result<Vec<Vec<T>>>
    where
        F: Fn(&T) -> usize,
    {
        self.ensure_running()?;
        let total: usize = items.iter().map(&payload).sum();
        let n = self.partition_count(items.len(), total, min_partitions);
        if n == 0 {
            return Ok(Vec::new());
        }

        let base = items.len() / n;
        let extra = items.len() % n;
        let mut partitions = Vec::with_capacity(n);
        let mut iter = items.into_iter();
        for i in 0..n {
            let size = base + usize::from(i < extra);
            partitions.push(iter.by_ref().take(size).collect());
        }
        tracing::debug!(
            "Parallelized {} bytes into {} partitions",
            total,
            partitions.len()
        );
        Ok(partitions)
    }

    /// Run `f` over every partition with bounded concurrency.
    ///
    /// Blocks until all partitions finish. Results come back in completion
    /// order. If any partition fails or panics, the first error is returned
    /// after the rest have completed.
    pub async fn map_partitions<T, R, F, Fut>(&self, partitions: Vec<Vec<T>>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(usize, Vec<T>) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.ensure_running()?;

        let handles: Vec<_> = partitions
            .into_iter()
            .enumerate()
            .map(|(i, part)| (i, f(i, part)))
            .collect();

        let outcomes: Vec<(usize, Result<R>)> = stream::iter(handles)
            .map(|(i, fut)| async move {
                let result = match tokio::spawn(fut).await {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("Partition {} panicked: {}", i, e)),
                };
                (i, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        for (i, outcome) in outcomes {
            match outcome {
                Ok(r) => results.push(r),
                Err(e) => {
                    tracing::warn!("Partition {} failed: {:#}", i, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Mark a collection as retained until released.
    pub fn retain<T>(&self, label: &'static str, value: T) -> Retained<T> {
        let count = self.retained.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Retained {} ({} held)", label, count);
        Retained {
            value,
            label,
            counter: self.retained.clone(),
            released: false,
        }
    }

    /// Collections currently retained.
    pub fn retained_count(&self) -> usize {
        self.retained.load(Ordering::SeqCst)
    }
}

/// A retained intermediate collection.
///
/// Released explicitly with [`Retained::release`], or on drop if the
/// owning stage exits early.
#[derive(Debug)]
pub struct Retained<T> {
    value: T,
    label: &'static str,
    counter: Arc<AtomicUsize>,
    released: bool,
}

impl<T> Retained<T> {
    fn mark_released(&mut self) {
        if !self.released {
            self.released = true;
            let left = self.counter.fetch_sub(1, Ordering::SeqCst) - 1;
            tracing::debug!("Released {} ({} held)", self.label, left);
        }
    }

    /// Release the collection and drop it.
    pub fn release(mut self) {
        self.mark_released();
    }
}

impl<T> Deref for Retained<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for Retained<T> {
    fn drop(&mut self) {
        self.mark_released();
    }
}

/// Stops the execution context when dropped.
pub struct ContextGuard {
    ctx: Arc<ExecutionContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.ctx.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(max_payload: usize) -> Arc<ExecutionContext> {
        let config = ProcessingConfig {
            max_task_payload_bytes: max_payload,
            concurrency: 4,
            ..Default::default()
        };
        ExecutionContext::start("test", &config)
    }

    #[test]
    fn test_partition_count() {
        let ctx = context(100);
        assert_eq!(ctx.partition_count(0, 0, 16), 0);
        // Configured minimum wins when payload is small
        assert_eq!(ctx.partition_count(1000, 500, 16), 16);
        // Payload bound wins when larger
        assert_eq!(ctx.partition_count(1000, 10_001, 16), 101);
        // Never more partitions than items
        assert_eq!(ctx.partition_count(3, 10_000, 16), 3);
    }

    #[test]
    fn test_parallelize_balances_and_keeps_everything() {
        let ctx = context(1_000_000);
        let partitions = ctx.parallelize((0..10).collect(), 3, |_| 8).unwrap();
        let sizes: Vec<_> = partitions.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        let flat: Vec<i32> = partitions.into_iter().flatten().collect();
        assert_eq!(flat, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_parallelize_respects_payload_bound() {
        let ctx = context(100 * 1024);
        // 10,000 items of ~2.6 KB each
        let partitions = ctx.parallelize(vec![0u8; 10_000], 1, |_| 2_600).unwrap();
        for part in &partitions {
            assert!(part.len() * 2_600 <= 100 * 1024);
        }
    }

    #[tokio::test]
    async fn test_map_partitions_runs_all() {
        let ctx = context(100);
        let partitions = vec![vec![1, 2], vec![3], vec![4, 5, 6]];
        let mut sums = ctx
            .map_partitions(partitions, |_, part| async move { Ok::<_, anyhow::Error>(part.iter().sum::<i32>()) })
            .await
            .unwrap();
        sums.sort();
        assert_eq!(sums, vec![3, 3, 15]);
    }

    #[tokio::test]
    async fn test_map_partitions_waits_then_fails() {
        let ctx = context(100);
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let result = ctx
            .map_partitions(vec![vec![0], vec![1], vec![2]], move |i, _| {
                let counter = counter.clone();
                async move {
                    if i == 1 {
                        bail!("boom");
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_partition_is_an_error() {
        let ctx = context(100);
        let result: Result<Vec<()>> = ctx
            .map_partitions(vec![vec![()]], |_, part| async move {
                assert!(part.is_empty(), "detector crashed");
                Ok::<(), anyhow::Error>(())
            })
            .await;
        assert!(result.unwrap_err().to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn test_stopped_context_rejects_submissions() {
        let ctx = context(100);
        {
            let _guard = ctx.guard();
        }
        assert!(ctx.is_stopped());
        assert!(ctx.parallelize(vec![1], 1, |_| 1).is_err());
        let result = ctx
            .map_partitions(vec![vec![1]], |_, _| async move { Ok::<(), anyhow::Error>(()) })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_retained_release_and_drop() {
        let ctx = context(100);
        let a = ctx.retain("aux", vec![1, 2, 3]);
        let b = ctx.retain("features", vec![4]);
        assert_eq!(ctx.retained_count(), 2);
        assert_eq!(a.len(), 3);

        a.release();
        assert_eq!(ctx.retained_count(), 1);

        drop(b);
        assert_eq!(ctx.retained_count(), 0);
    }
}
