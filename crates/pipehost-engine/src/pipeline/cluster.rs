//! Cluster capability trait
//!
//! Implement [`Cluster`] for any unit of work the host should run. The
//! supervisor calls `extract` once per run and fans the extracted items out to
//! as many `transform` / `load` workers as the queues demand.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::channel::BackpressureChannel;
use super::types::Item;
use crate::error::ChannelError;

/// User-defined Extract/Transform/Load unit of work
///
/// Returning `Err` from any method is treated like a panic: the run is marked
/// crashed and the worker stops calling into the cluster. The one exception is
/// `extract` passing on [`ChannelError::Suspended`] from a suspended run.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Push zero or more items into `sink`, then return
    ///
    /// Stream clusters should keep extracting until [`ExtractSink::suspended`]
    /// resolves.
    async fn extract(&self, sink: ExtractSink) -> Result<()>;

    /// Transform one item; `None` drops it
    async fn transform(&self, item: Item) -> Result<Option<Item>>;

    async fn load(&self, item: Item) -> Result<()>;

    /// Decide whether an extracted item reaches `transform`
    async fn verify_extracted(&self, _item: &Item) -> bool {
        true
    }

    /// Decide whether a transformed item reaches `load`
    async fn verify_transformed(&self, _item: &Item) -> bool {
        true
    }
}

/// Output handle given to [`Cluster::extract`]
#[derive(Clone)]
pub struct ExtractSink {
    queue: Arc<BackpressureChannel>,
    suspend: CancellationToken,
    extracted: Arc<AtomicU64>,
}

impl ExtractSink {
    pub(crate) fn new(
        queue: Arc<BackpressureChannel>,
        suspend: CancellationToken,
        extracted: Arc<AtomicU64>,
    ) -> Self {
        Self {
            queue,
            suspend,
            extracted,
        }
    }

    /// Enqueue an item for the transform stage, waiting while the queue is full
    pub async fn push(&self, item: Item) -> Result<(), ChannelError> {
        if self.suspend.is_cancelled() {
            return Err(ChannelError::Suspended(self.queue.name().to_string()));
        }
        self.queue.push(item).await?;
        self.extracted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend.is_cancelled()
    }

    /// Resolves once the run is suspended
    pub async fn suspended(&self) {
        self.suspend.cancelled().await
    }
}
