//! Request/response correlation over subsystem inboxes
//!
//! A caller sends an [`Envelope`] tagged with a fresh [`Nonce`] into a
//! subsystem's inbox and waits for the subsystem to answer through
//! [`Correlator::respond`]. Every pending entry is removed exactly once: on
//! response, on timeout, on send failure, or when the waiting caller is
//! dropped.

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::CorrelatorError;

/// Random per-request tag
pub type Nonce = u32;

/// A request on its way to a subsystem
#[derive(Debug)]
pub struct Envelope<Req> {
    pub nonce: Nonce,
    pub body: Req,
}

type Pending<Resp> = Arc<RwLock<HashMap<Nonce, oneshot::Sender<Resp>>>>;

pub struct Correlator<Resp> {
    subsystem: String,
    max_wait: Duration,
    pending: Pending<Resp>,
}

impl<Resp> Clone for Correlator<Resp> {
    fn clone(&self) -> Self {
        Self {
            subsystem: self.subsystem.clone(),
            max_wait: self.max_wait,
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<Resp> std::fmt::Debug for Correlator<Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("subsystem", &self.subsystem)
            .field("max_wait", &self.max_wait)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Removes the caller's entry however the call ends
struct PendingGuard<'a, Resp> {
    pending: &'a Pending<Resp>,
    nonce: Nonce,
}

impl<Resp> Drop for PendingGuard<'_, Resp> {
    fn drop(&mut self) {
        self.pending
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.nonce);
    }
}

impl<Resp> Correlator<Resp> {
    pub fn new(subsystem: impl Into<String>, max_wait: Duration) -> Self {
        Self {
            subsystem: subsystem.into(),
            max_wait,
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Number of calls still waiting for a response
    pub fn pending(&self) -> usize {
        self.pending.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_pending(&self, nonce: Nonce) -> bool {
        self.pending
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&nonce)
    }

    /// Send `body` to `inbox` and wait for the matching response
    pub async fn call<Req>(
        &self,
        inbox: &mpsc::Sender<Envelope<Req>>,
        body: Req,
    ) -> Result<Resp, CorrelatorError> {
        let (tx, rx) = oneshot::channel();
        let nonce = self.insert(tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            nonce,
        };

        let exchange = async {
            inbox
                .send(Envelope { nonce, body })
                .await
                .map_err(|_| CorrelatorError::Unavailable(self.subsystem.clone()))?;
            rx.await
                .map_err(|_| CorrelatorError::Unavailable(self.subsystem.clone()))
        };

        match tokio::time::timeout(self.max_wait, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    subsystem = %self.subsystem,
                    nonce,
                    waited_ms = self.max_wait.as_millis() as u64,
                    "Correlated call timed out"
                );
                Err(CorrelatorError::Timeout {
                    nonce,
                    waited: self.max_wait,
                })
            }
        }
    }

    /// Deliver the response for `nonce`; `false` if nobody is waiting anymore
    pub fn respond(&self, nonce: Nonce, response: Resp) -> bool {
        let waiter = self
            .pending
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&nonce);

        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                tracing::debug!(subsystem = %self.subsystem, nonce, "Dropping late response");
                false
            }
        }
    }

    fn insert(&self, tx: oneshot::Sender<Resp>) -> Nonce {
        let mut pending = self.pending.write().unwrap_or_else(|p| p.into_inner());
        let mut rng = rand::thread_rng();
        let nonce = loop {
            let candidate: Nonce = rng.gen();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(nonce, tx);
        nonce
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn echo_service(
        correlator: Correlator<String>,
        capacity: usize,
    ) -> mpsc::Sender<Envelope<String>> {
        let (tx, mut rx) = mpsc::channel::<Envelope<String>>(capacity);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                correlator.respond(envelope.nonce, envelope.body.to_uppercase());
            }
        });
        tx
    }

    #[tokio::test]
    async fn test_call_gets_matching_response() {
        let correlator = Correlator::new("echo", Duration::from_secs(1));
        let inbox = echo_service(correlator.clone(), 8);

        let (a, b) = tokio::join!(
            correlator.call(&inbox, "left".to_string()),
            correlator.call(&inbox, "right".to_string())
        );
        assert_eq!(a.unwrap(), "LEFT");
        assert_eq!(b.unwrap(), "RIGHT");
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let correlator: Correlator<String> = Correlator::new("silent", Duration::from_millis(50));
        let (inbox, mut rx) = mpsc::channel::<Envelope<String>>(8);

        let err = correlator.call(&inbox, "hello".to_string()).await.unwrap_err();
        let nonce = match err {
            CorrelatorError::Timeout { nonce, waited } => {
                assert_eq!(waited, Duration::from_millis(50));
                nonce
            }
            other => panic!("expected timeout, got {other:?}"),
        };
        assert_eq!(correlator.pending(), 0);

        // the request did arrive; answering it now goes nowhere
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.nonce, nonce);
        assert!(!correlator.respond(nonce, "late".to_string()));
    }

    #[tokio::test]
    async fn test_closed_inbox_is_unavailable() {
        let correlator: Correlator<String> = Correlator::new("gone", Duration::from_secs(1));
        let (inbox, rx) = mpsc::channel::<Envelope<String>>(1);
        drop(rx);

        let err = correlator.call(&inbox, "x".to_string()).await.unwrap_err();
        assert_eq!(err, CorrelatorError::Unavailable("gone".to_string()));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_dropped_caller_releases_entry() {
        let correlator: Correlator<String> = Correlator::new("slow", Duration::from_secs(30));
        let (inbox, mut rx) = mpsc::channel::<Envelope<String>>(1);

        let call = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.call(&inbox, "x".to_string()).await })
        };
        let envelope = rx.recv().await.unwrap();
        assert!(correlator.is_pending(envelope.nonce));

        call.abort();
        let _ = call.await;
        assert!(!correlator.is_pending(envelope.nonce));
    }
}
