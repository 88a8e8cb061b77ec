//! Backpressure channel between two pipeline stages
//!
//! Wraps a bounded queue and tracks how deep it is and when it was last fed,
//! so the owning supervisor can decide whether the consuming stage needs more
//! workers. The queue closes exactly once: when the last registered producer
//! calls [`BackpressureChannel::producer_done`].
//!
//! Callers must register every producer before any producer finishes.
//! Otherwise the count can touch zero while another producer is still about to
//! register, and the queue closes underneath it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;

use super::types::{ChannelConfig, Item};
use crate::error::ChannelError;

/// An empty queue that has not been fed for this long is idle.
pub const IDLE_AFTER: Duration = Duration::from_secs(3);

/// Health of a channel as seen by the scaling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Idle,
    Empty,
    Healthy,
    Congested,
}

#[derive(Debug)]
struct Producers {
    count: usize,
    sender: Option<mpsc::Sender<Item>>,
}

#[derive(Debug)]
pub struct BackpressureChannel {
    name: String,
    config: ChannelConfig,
    depth: AtomicUsize,
    epoch: Instant,
    /// Milliseconds between `epoch` and the most recent push
    last_push_ms: AtomicU64,
    producers: Mutex<Producers>,
    receiver: AsyncMutex<mpsc::Receiver<Item>>,
}

impl BackpressureChannel {
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        Self {
            name: name.into(),
            config,
            depth: AtomicUsize::new(0),
            epoch: Instant::now(),
            last_push_ms: AtomicU64::new(0),
            producers: Mutex::new(Producers {
                count: 0,
                sender: Some(sender),
            }),
            receiver: AsyncMutex::new(receiver),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn threshold(&self) -> usize {
        self.config.threshold
    }

    pub fn growth_factor(&self) -> u32 {
        self.config.growth_factor
    }

    pub fn producers(&self) -> usize {
        self.lock_producers().count
    }

    pub fn is_closed(&self) -> bool {
        self.lock_producers().sender.is_none()
    }

    /// Enqueue `item`, waiting while the queue is full
    pub async fn push(&self, item: Item) -> Result<(), ChannelError> {
        let sender = self
            .lock_producers()
            .sender
            .clone()
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))?;

        self.depth.fetch_add(1, Ordering::AcqRel);
        self.touch();

        if sender.send(item).await.is_err() {
            self.pull();
            return Err(ChannelError::Closed(self.name.clone()));
        }
        Ok(())
    }

    /// Receive the next item; `None` once closed and drained
    pub async fn recv(&self) -> Option<Item> {
        self.receiver.lock().await.recv().await
    }

    /// Record that one received item left the queue
    pub fn pull(&self) {
        // Never below zero, even if a caller pulls without a matching push.
        let _ = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1));
    }

    pub fn add_producer(&self) -> Result<(), ChannelError> {
        let mut producers = self.lock_producers();
        if producers.sender.is_none() {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        producers.count += 1;
        Ok(())
    }

    /// Deregister one producer; the last one closes the queue
    pub fn producer_done(&self) {
        let mut producers = self.lock_producers();
        if producers.count == 0 {
            tracing::warn!(
                channel = %self.name,
                "producer_done called with no registered producer"
            );
            return;
        }

        producers.count -= 1;
        if producers.count == 0 && producers.sender.take().is_some() {
            tracing::debug!(channel = %self.name, depth = self.depth(), "Channel closed");
        }
    }

    pub fn state(&self) -> ChannelState {
        let depth = self.depth();
        if depth == 0 {
            if self.since_last_push() > IDLE_AFTER {
                ChannelState::Idle
            } else {
                ChannelState::Empty
            }
        } else if depth > self.config.threshold {
            ChannelState::Congested
        } else {
            ChannelState::Healthy
        }
    }

    fn since_last_push(&self) -> Duration {
        let last = self.epoch + Duration::from_millis(self.last_push_ms.load(Ordering::Acquire));
        Instant::now().saturating_duration_since(last)
    }

    fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.epoch);
        self.last_push_ms.store(
            elapsed.as_millis().try_into().unwrap_or(u64::MAX),
            Ordering::Release,
        );
    }

    fn lock_producers(&self) -> std::sync::MutexGuard<'_, Producers> {
        self.producers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn channel(threshold: usize) -> BackpressureChannel {
        BackpressureChannel::new(
            "test",
            ChannelConfig {
                threshold,
                growth_factor: 2,
                capacity: 64,
            },
        )
    }

    #[tokio::test]
    async fn test_depth_tracks_push_and_pull() {
        let chan = channel(2);
        chan.add_producer().unwrap();
        for i in 0..3 {
            chan.push(json!(i)).await.unwrap();
        }
        assert_eq!(chan.depth(), 3);
        assert_eq!(chan.state(), ChannelState::Congested);

        assert_eq!(chan.recv().await, Some(json!(0)));
        chan.pull();
        assert_eq!(chan.depth(), 2);
        assert_eq!(chan.state(), ChannelState::Healthy);
    }

    #[test]
    fn test_pull_never_goes_negative() {
        let chan = channel(2);
        chan.pull();
        chan.pull();
        assert_eq!(chan.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_turns_idle_after_quiet_period() {
        let chan = channel(2);
        chan.add_producer().unwrap();
        chan.push(json!("x")).await.unwrap();
        chan.recv().await.unwrap();
        chan.pull();

        assert_eq!(chan.state(), ChannelState::Empty);
        tokio::time::advance(IDLE_AFTER + Duration::from_millis(10)).await;
        assert_eq!(chan.state(), ChannelState::Idle);
    }

    #[tokio::test]
    async fn test_last_producer_closes_channel() {
        let chan = channel(8);
        chan.add_producer().unwrap();
        chan.add_producer().unwrap();
        chan.push(json!(1)).await.unwrap();

        chan.producer_done();
        assert!(!chan.is_closed());

        chan.producer_done();
        assert!(chan.is_closed());

        // buffered item still delivered, then end of stream
        assert_eq!(chan.recv().await, Some(json!(1)));
        assert_eq!(chan.recv().await, None);
        assert!(matches!(chan.push(json!(2)).await, Err(ChannelError::Closed(_))));
        assert!(chan.add_producer().is_err());
    }

    #[test]
    fn test_extra_producer_done_is_ignored() {
        let chan = channel(8);
        chan.producer_done();
        assert!(!chan.is_closed());
        assert_eq!(chan.producers(), 0);
    }

    proptest! {
        #[test]
        fn prop_congested_iff_depth_exceeds_threshold(
            threshold in 1usize..16,
            ops in prop::collection::vec(any::<bool>(), 0..64),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            rt.block_on(async {
                let chan = channel(threshold);
                chan.add_producer().unwrap();
                let mut expected = 0usize;
                for push in ops {
                    if push {
                        chan.push(json!(null)).await.unwrap();
                        expected += 1;
                    } else if expected > 0 {
                        chan.recv().await.unwrap();
                        chan.pull();
                        expected -= 1;
                    } else {
                        chan.pull();
                    }
                    prop_assert_eq!(chan.depth(), expected);
                    prop_assert_eq!(
                        chan.state() == ChannelState::Congested,
                        expected > threshold
                    );
                }
                Ok::<(), TestCaseError>(())
            })?;
        }

        #[test]
        fn prop_closes_only_after_last_producer(producers in 1usize..12) {
            let chan = channel(4);
            for _ in 0..producers {
                chan.add_producer().unwrap();
            }
            for done in 1..=producers {
                chan.producer_done();
                prop_assert_eq!(chan.is_closed(), done == producers);
            }
        }
    }
}
