//! Shared fixtures for engine integration tests
//!
//! Provides a provisioner wired to an in-memory database and a recording
//! messenger, plus a handful of test clusters.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use pipehost_engine::{
    Cluster, CompletionReport, DatabaseHandle, ExtractSink, InMemoryDatabase, Item,
    MemoryMessenger, Provisioner, RunConfig,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};

pub const MODULE: &str = "test-module";

pub struct Harness {
    pub provisioner: Arc<Provisioner>,
    pub messenger: Arc<MemoryMessenger>,
}

impl Harness {
    pub fn new() -> Self {
        let (db, _task) =
            DatabaseHandle::spawn_with(InMemoryDatabase::new(16), 64, Duration::from_secs(2));
        let messenger = Arc::new(MemoryMessenger::default());
        let provisioner = Provisioner::new(db, messenger.clone());
        Self {
            provisioner,
            messenger,
        }
    }

    /// Register `cluster` under a fresh module and store its default config
    pub async fn install(
        &self,
        module: &str,
        name: &str,
        cluster: Arc<dyn Cluster>,
        config: RunConfig,
    ) {
        self.provisioner
            .register_module(module, vec![(name.to_string(), cluster)])
            .unwrap();
        self.provisioner.put_config(module, config).await.unwrap();
    }

    /// Mount both the module and the cluster
    pub async fn mount(&self, module: &str, name: &str) -> Option<u32> {
        self.provisioner.mount_module(module).await.unwrap();
        self.provisioner.mount_cluster(module, name).await.unwrap()
    }

    pub fn live(&self, module: &str, name: &str) -> usize {
        self.provisioner.status(module, name).unwrap().len()
    }
}

pub async fn next_report(rx: &mut broadcast::Receiver<CompletionReport>) -> CompletionReport {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("run did not complete in time")
        .expect("completion channel closed")
}

/// Poll `check` until it holds or `limit` elapses
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Emits `0..count`; optional gate on transform and panic on one value
pub struct Numbers {
    pub count: u64,
    pub gate: Option<Arc<Semaphore>>,
    pub panic_on: Option<u64>,
    pub loaded: AtomicU64,
}

impl Numbers {
    pub fn new(count: u64) -> Self {
        Self {
            count,
            gate: None,
            panic_on: None,
            loaded: AtomicU64::new(0),
        }
    }

    pub fn gated(count: u64, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(count)
        }
    }

    pub fn loaded(&self) -> u64 {
        self.loaded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Cluster for Numbers {
    async fn extract(&self, sink: ExtractSink) -> anyhow::Result<()> {
        for i in 0..self.count {
            sink.push(json!(i)).await?;
        }
        Ok(())
    }

    async fn transform(&self, item: Item) -> anyhow::Result<Option<Item>> {
        let n = item.as_u64().unwrap_or_default();
        if self.panic_on == Some(n) {
            panic!("transform cannot handle {n}");
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        Ok(Some(json!(n + 1)))
    }

    async fn load(&self, _item: Item) -> anyhow::Result<()> {
        self.loaded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Extracts forever until the run is suspended
pub struct Ticker;

#[async_trait]
impl Cluster for Ticker {
    async fn extract(&self, sink: ExtractSink) -> anyhow::Result<()> {
        let mut n = 0u64;
        loop {
            tokio::select! {
                _ = sink.suspended() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_millis(5)) => {
                    if sink.push(json!(n)).await.is_err() {
                        return Ok(());
                    }
                    n += 1;
                }
            }
        }
    }

    async fn transform(&self, item: Item) -> anyhow::Result<Option<Item>> {
        Ok(Some(item))
    }

    async fn load(&self, _item: Item) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Stream extract written with `?`: ends by propagating the sink's refusal
pub struct Feed;

#[async_trait]
impl Cluster for Feed {
    async fn extract(&self, sink: ExtractSink) -> anyhow::Result<()> {
        let mut n = 0u64;
        loop {
            sink.push(json!(n)).await?;
            n += 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn transform(&self, item: Item) -> anyhow::Result<Option<Item>> {
        Ok(Some(item))
    }

    async fn load(&self, _item: Item) -> anyhow::Result<()> {
        Ok(())
    }
}
