//! Supervisor for one run of a cluster
//!
//! Drives the Extract, Transform and Load stages over two backpressure
//! channels:
//!
//! ```text
//! extract --[et]--> transform xN --[tl]--> load xM
//! ```
//!
//! A scaling loop checks both channels once per interval and multiplies the
//! consuming stage by the channel's growth factor whenever it is congested.
//! [`Supervisor::start`] returns once every worker has finished, with a
//! [`CompletionReport`]. Panics and errors raised by the cluster are contained
//! inside the worker that hit them and surface only as `crashed` in the report.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{BackpressureChannel, ChannelState};
use super::cluster::{Cluster, ExtractSink};
use super::state::{Lifecycle, LifecycleEvent, LifecycleState};
use super::types::{CompletionReport, Item, RunConfig, Stage, Statistics};
use crate::error::{ChannelError, EngineResult};
use crate::subsystems::messenger::{Messenger, Severity};

/// Worker counts and breach counters, guarded together so a growth step
/// reads and updates them as one snapshot
#[derive(Debug, Default)]
struct WorkerBook {
    extract: u64,
    transform: u64,
    load: u64,
    et_breaches: u64,
    tl_breaches: u64,
}

impl WorkerBook {
    fn workers_mut(&mut self, stage: Stage) -> &mut u64 {
        match stage {
            Stage::Extract => &mut self.extract,
            Stage::Transform => &mut self.transform,
            Stage::Load => &mut self.load,
        }
    }
}

/// Item counters bumped by workers
#[derive(Debug, Default)]
struct ItemCounters {
    extracted: Arc<AtomicU64>,
    filtered: AtomicU64,
    dropped: AtomicU64,
    load_received: AtomicU64,
    loaded: AtomicU64,
}

/// Observable state of one queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    pub depth: usize,
    pub threshold: usize,
    pub producers: usize,
    pub state: ChannelState,
}

impl QueueStatus {
    fn of(channel: &BackpressureChannel) -> Self {
        Self {
            name: channel.name().to_string(),
            depth: channel.depth(),
            threshold: channel.threshold(),
            producers: channel.producers(),
            state: channel.state(),
        }
    }
}

/// Point-in-time view of a supervisor for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub id: Option<u32>,
    pub module: String,
    pub cluster: String,
    pub state: LifecycleState,
    pub suspended: bool,
    pub crashed: bool,
    pub statistics: Statistics,
    pub et: QueueStatus,
    pub tl: QueueStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime: Option<Duration>,
}

pub struct Supervisor {
    id: OnceLock<u32>,
    module: String,
    cluster_name: String,
    cluster: Arc<dyn Cluster>,
    config: RunConfig,
    metadata: Item,
    messenger: Arc<dyn Messenger>,
    lifecycle: Lifecycle,
    et: Arc<BackpressureChannel>,
    tl: Arc<BackpressureChannel>,
    book: Mutex<WorkerBook>,
    counters: ItemCounters,
    crashed: AtomicBool,
    outstanding: AtomicUsize,
    drained: Notify,
    suspend: CancellationToken,
    started: OnceLock<(Instant, DateTime<Utc>)>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("id", &self.id.get())
            .field("module", &self.module)
            .field("cluster", &self.cluster_name)
            .field("state", &self.lifecycle.current())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(
        module: impl Into<String>,
        cluster_name: impl Into<String>,
        cluster: Arc<dyn Cluster>,
        config: RunConfig,
        metadata: Item,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        let cluster_name = cluster_name.into();
        let et = BackpressureChannel::new(format!("{cluster_name}.et"), config.et_channel);
        let tl = BackpressureChannel::new(format!("{cluster_name}.tl"), config.tl_channel);

        Self {
            id: OnceLock::new(),
            module: module.into(),
            cluster_name,
            cluster,
            config,
            metadata,
            messenger,
            lifecycle: Lifecycle::default(),
            et: Arc::new(et),
            tl: Arc::new(tl),
            book: Mutex::new(WorkerBook::default()),
            counters: ItemCounters::default(),
            crashed: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
            suspend: CancellationToken::new(),
            started: OnceLock::new(),
        }
    }

    /// Set by the registry; later calls are ignored
    pub(crate) fn assign_id(&self, id: u32) {
        let _ = self.id.set(id);
    }

    pub fn id(&self) -> Option<u32> {
        self.id.get().copied()
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend.is_cancelled()
    }

    /// Stop accepting extracted items; in-flight transform and load work drains
    pub fn suspend(&self) {
        if !self.suspend.is_cancelled() {
            info!(cluster = %self.cluster_name, supervisor_id = ?self.id(), "Suspending run");
            self.suspend.cancel();
        }
    }

    pub fn statistics(&self) -> Statistics {
        let book = self.lock_book();
        Statistics {
            extract_workers: book.extract,
            transform_workers: book.transform,
            load_workers: book.load,
            et_breaches: book.et_breaches,
            tl_breaches: book.tl_breaches,
            items_extracted: self.counters.extracted.load(Ordering::Relaxed),
            items_filtered: self.counters.filtered.load(Ordering::Relaxed),
            items_dropped: self.counters.dropped.load(Ordering::Relaxed),
            load_received: self.counters.load_received.load(Ordering::Relaxed),
            items_loaded: self.counters.loaded.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        let started = self.started.get();
        SupervisorStatus {
            id: self.id(),
            module: self.module.clone(),
            cluster: self.cluster_name.clone(),
            state: self.state(),
            suspended: self.is_suspended(),
            crashed: self.is_crashed(),
            statistics: self.statistics(),
            et: QueueStatus::of(&self.et),
            tl: QueueStatus::of(&self.tl),
            started_at: started.map(|(_, at)| *at),
            uptime: started.map(|(clock, _)| clock.elapsed()),
        }
    }

    /// Run the pipeline to completion
    ///
    /// Fails if the config is invalid or the supervisor was already started.
    pub async fn start(self: &Arc<Self>) -> EngineResult<CompletionReport> {
        self.config.validate()?;
        self.lifecycle.fire(LifecycleEvent::Startup)?;
        let (clock, started_at) = *self.started.get_or_init(|| (Instant::now(), Utc::now()));

        info!(
            cluster = %self.cluster_name,
            supervisor_id = ?self.id(),
            transform = self.config.start_with_transform,
            load = self.config.start_with_load,
            "Run started"
        );
        self.messenger
            .send(&self.cluster_name, Severity::Info, "run started");

        self.provision(Stage::Extract, 1);
        self.provision(Stage::Transform, self.config.start_with_transform.into());
        self.provision(Stage::Load, self.config.start_with_load.into());

        let stop = CancellationToken::new();
        let scaler = tokio::spawn(Arc::clone(self).scale_loop(stop.clone()));

        self.wait_drained().await;
        stop.cancel();
        if let Err(e) = scaler.await {
            warn!(cluster = %self.cluster_name, error = %e, "Scaling loop ended abnormally");
        }
        // A worker reserved by the final scaling pass still has to finish.
        self.wait_drained().await;

        if let Err(e) = self.lifecycle.fire(LifecycleEvent::TearedDown) {
            debug!(cluster = %self.cluster_name, error = %e, "Run not torn down cleanly");
        }

        let crashed = self.is_crashed();
        let report = CompletionReport {
            supervisor_id: self.id().unwrap_or_default(),
            module: self.module.clone(),
            cluster: self.cluster_name.clone(),
            metadata: self.metadata.clone(),
            config: self.config.clone(),
            statistics: self.statistics(),
            state: self.state(),
            started_at,
            finished_at: Utc::now(),
            elapsed: clock.elapsed(),
            crashed,
        };

        info!(
            cluster = %self.cluster_name,
            supervisor_id = report.supervisor_id,
            crashed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            loaded = report.statistics.items_loaded,
            "Run finished"
        );

        Ok(report)
    }

    /// Attach up to `count` workers to `stage`, returning how many were spawned
    pub fn provision(self: &Arc<Self>, stage: Stage, count: u64) -> u64 {
        self.provision_with(stage, |_| count)
    }

    /// Reserve and spawn workers in one bracketed step
    ///
    /// `requested` runs under the book lock, so the count it derives from the
    /// book and the count written back cannot interleave with another step.
    fn provision_with(
        self: &Arc<Self>,
        stage: Stage,
        requested: impl FnOnce(&mut WorkerBook) -> u64,
    ) -> u64 {
        // Provisioning proceeds after a fault too: downstream stages must
        // still attach so the queues close and the run drains.
        let bracketed = self.lifecycle.fire(LifecycleEvent::StartProvision).is_ok();

        let granted = {
            let mut book = self.lock_book();
            let want = requested(&mut book);
            self.reserve(&mut book, stage, want)
        };
        for _ in 0..granted {
            self.spawn_worker(stage);
        }

        if bracketed {
            if let Err(e) = self.lifecycle.fire(LifecycleEvent::EndProvision) {
                debug!(
                    cluster = %self.cluster_name,
                    error = %e,
                    "Provisioning ended after a fault"
                );
            }
        }

        if granted > 0 {
            debug!(
                cluster = %self.cluster_name,
                stage = stage.as_str(),
                spawned = granted,
                "Provisioned workers"
            );
        }
        granted
    }

    /// Register producers, count the workers and mark them outstanding
    fn reserve(&self, book: &mut WorkerBook, stage: Stage, want: u64) -> u64 {
        let current = *book.workers_mut(stage);
        let cap = match stage {
            Stage::Extract => None,
            Stage::Transform => self.config.max_transform_workers,
            Stage::Load => self.config.max_load_workers,
        };
        let allowed = cap.map_or(want, |c| want.min(u64::from(c).saturating_sub(current)));

        let mut granted = 0;
        while granted < allowed {
            let registered = match stage {
                Stage::Extract => self.et.add_producer(),
                Stage::Transform => self.tl.add_producer(),
                Stage::Load => Ok(()),
            };
            if let Err(e) = registered {
                debug!(cluster = %self.cluster_name, error = %e, "Stage no longer accepts workers");
                break;
            }
            granted += 1;
        }

        *book.workers_mut(stage) += granted;
        self.outstanding
            .fetch_add(granted as usize, Ordering::AcqRel);
        granted
    }

    fn spawn_worker(self: &Arc<Self>, stage: Stage) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match stage {
                Stage::Extract => {
                    this.run_extract().await;
                    this.et.producer_done();
                }
                Stage::Transform => {
                    this.run_transform().await;
                    this.tl.producer_done();
                }
                Stage::Load => this.run_load().await,
            }
            this.worker_finished();
        });
    }

    async fn run_extract(&self) {
        let sink = ExtractSink::new(
            Arc::clone(&self.et),
            self.suspend.clone(),
            Arc::clone(&self.counters.extracted),
        );
        match contain(self.cluster.extract(sink)).await {
            Ok(()) => {}
            Err(e) if self.is_suspended() && is_suspension(&e) => {
                debug!(cluster = %self.cluster_name, "Extract stopped by suspension");
            }
            Err(fault) => self.record_fault(Stage::Extract, &fault),
        }
    }

    async fn run_transform(&self) {
        let mut faulted = false;
        while let Some(item) = self.et.recv().await {
            self.et.pull();
            if faulted {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            match contain(self.transform_one(item)).await {
                Ok(Some(out)) => {
                    if let Err(e) = self.tl.push(out).await {
                        warn!(cluster = %self.cluster_name, error = %e, "Transformed item lost");
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(None) => {
                    self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                }
                Err(fault) => {
                    self.record_fault(Stage::Transform, &fault);
                    faulted = true;
                }
            }
        }
    }

    async fn transform_one(&self, item: Item) -> anyhow::Result<Option<Item>> {
        if !self.cluster.verify_extracted(&item).await {
            return Ok(None);
        }
        self.cluster.transform(item).await
    }

    async fn run_load(&self) {
        let mut faulted = false;
        while let Some(item) = self.tl.recv().await {
            self.tl.pull();
            self.counters.load_received.fetch_add(1, Ordering::Relaxed);
            if faulted {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            match contain(self.load_one(item)).await {
                Ok(true) => {
                    self.counters.loaded.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {
                    self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                }
                Err(fault) => {
                    self.record_fault(Stage::Load, &fault);
                    faulted = true;
                }
            }
        }
    }

    async fn load_one(&self, item: Item) -> anyhow::Result<bool> {
        if !self.cluster.verify_transformed(&item).await {
            return Ok(false);
        }
        self.cluster.load(item).await?;
        Ok(true)
    }

    fn record_fault(&self, stage: Stage, fault: &anyhow::Error) {
        self.crashed.store(true, Ordering::Release);
        if let Err(e) = self.lifecycle.fire(LifecycleEvent::Error) {
            debug!(cluster = %self.cluster_name, error = %e, "Run already failed");
        }

        error!(
            cluster = %self.cluster_name,
            supervisor_id = ?self.id(),
            stage = stage.as_str(),
            fault = %format_args!("{fault:#}"),
            "Cluster code faulted; worker now discards its input"
        );
        self.messenger.send(
            &self.cluster_name,
            Severity::Fatal,
            &format!("{} worker faulted: {fault:#}", stage.as_str()),
        );
    }

    async fn scale_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.scale_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; start measuring after one period.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => self.scale_pass(),
            }
        }
    }

    /// One congestion check over both queues
    pub(crate) fn scale_pass(self: &Arc<Self>) {
        for (stage, channel) in [(Stage::Transform, &self.et), (Stage::Load, &self.tl)] {
            if channel.state() != ChannelState::Congested {
                continue;
            }

            let factor = u64::from(channel.growth_factor());
            let mut before = 0;
            let spawned = self.provision_with(stage, |book| {
                match stage {
                    Stage::Load => book.tl_breaches += 1,
                    _ => book.et_breaches += 1,
                }
                before = *book.workers_mut(stage);
                before.saturating_mul(factor.saturating_sub(1))
            });

            warn!(
                cluster = %self.cluster_name,
                queue = channel.name(),
                depth = channel.depth(),
                threshold = channel.threshold(),
                stage = stage.as_str(),
                before,
                after = before + spawned,
                "Queue congested"
            );
            self.messenger.send(
                &self.cluster_name,
                Severity::Warning,
                &format!(
                    "{} congested at depth {}, {} workers {} -> {}",
                    channel.name(),
                    channel.depth(),
                    stage.as_str(),
                    before,
                    before + spawned
                ),
            );
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn worker_finished(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn lock_book(&self) -> MutexGuard<'_, WorkerBook> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Await cluster code, turning panics into errors
async fn contain<T, F>(fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(panic_message(payload.as_ref()))),
    }
}

/// An extract that bubbled up the sink's refusal after suspension
fn is_suspension(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<ChannelError>(),
        Some(ChannelError::Suspended(_))
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic with non-string payload".to_string()
    }
}
