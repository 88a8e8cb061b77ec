//! Database subsystem
//!
//! Owns a [`DatabaseBackend`] on a dedicated task. Callers hold a cloneable
//! [`DatabaseHandle`] whose typed methods go through the task's inbox and a
//! [`Correlator`], so a stalled backend surfaces as a timeout instead of a
//! hang.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::correlator::{Correlator, Envelope};
use crate::error::CorrelatorError;
use crate::pipeline::types::{CompletionReport, RunConfig};

const SUBSYSTEM: &str = "database";

#[derive(Debug)]
pub enum DbRequest {
    GetConfig { module: String, name: String },
    PutConfig { module: String, config: RunConfig },
    RecordReport(Box<CompletionReport>),
    Reports { module: String, cluster: String },
    Ping,
}

#[derive(Debug)]
pub enum DbResponse {
    Config(Option<RunConfig>),
    Stored,
    Reports(Vec<CompletionReport>),
    Pong,
    Failed(String),
}

/// Storage behind the database subsystem
pub trait DatabaseBackend: Send + 'static {
    fn get_config(&self, module: &str, name: &str) -> anyhow::Result<Option<RunConfig>>;

    fn put_config(&mut self, module: &str, config: RunConfig) -> anyhow::Result<()>;

    fn record_report(&mut self, report: CompletionReport) -> anyhow::Result<()>;

    /// Most recent reports for a cluster, oldest first
    fn reports(&self, module: &str, cluster: &str) -> anyhow::Result<Vec<CompletionReport>>;
}

type Key = (String, String);

fn key(module: &str, name: &str) -> Key {
    (module.to_string(), name.to_string())
}

/// Configs and a bounded report history, kept in memory
#[derive(Debug)]
pub struct InMemoryDatabase {
    configs: HashMap<Key, RunConfig>,
    reports: HashMap<Key, VecDeque<CompletionReport>>,
    history: usize,
}

impl InMemoryDatabase {
    pub fn new(history: usize) -> Self {
        Self {
            configs: HashMap::new(),
            reports: HashMap::new(),
            history: history.max(1),
        }
    }
}

impl DatabaseBackend for InMemoryDatabase {
    fn get_config(&self, module: &str, name: &str) -> anyhow::Result<Option<RunConfig>> {
        Ok(self.configs.get(&key(module, name)).cloned())
    }

    fn put_config(&mut self, module: &str, config: RunConfig) -> anyhow::Result<()> {
        self.configs
            .insert(key(module, &config.identifier), config);
        Ok(())
    }

    fn record_report(&mut self, report: CompletionReport) -> anyhow::Result<()> {
        let ring = self
            .reports
            .entry(key(&report.module, &report.cluster))
            .or_default();
        while ring.len() >= self.history {
            ring.pop_front();
        }
        ring.push_back(report);
        Ok(())
    }

    fn reports(&self, module: &str, cluster: &str) -> anyhow::Result<Vec<CompletionReport>> {
        Ok(self
            .reports
            .get(&key(module, cluster))
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// Cloneable client of the database task
#[derive(Debug, Clone)]
pub struct DatabaseHandle {
    inbox: mpsc::Sender<Envelope<DbRequest>>,
    correlator: Correlator<DbResponse>,
}

impl DatabaseHandle {
    /// Start the database task; it stops once every handle is dropped
    pub fn spawn<B: DatabaseBackend>(
        backend: B,
        settings: &EngineSettings,
    ) -> (Self, JoinHandle<()>) {
        Self::spawn_with(backend, settings.db_inbox_capacity, settings.correlator_max_wait())
    }

    pub fn spawn_with<B: DatabaseBackend>(
        backend: B,
        inbox_capacity: usize,
        max_wait: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (inbox, rx) = mpsc::channel(inbox_capacity.max(1));
        let correlator = Correlator::new(SUBSYSTEM, max_wait);
        let task = tokio::spawn(serve(backend, rx, correlator.clone()));
        info!(
            inbox_capacity,
            max_wait_ms = max_wait.as_millis() as u64,
            "Database subsystem started"
        );
        (Self { inbox, correlator }, task)
    }

    /// Handle for a task that was started elsewhere
    pub fn from_parts(
        inbox: mpsc::Sender<Envelope<DbRequest>>,
        correlator: Correlator<DbResponse>,
    ) -> Self {
        Self { inbox, correlator }
    }

    pub async fn get_config(
        &self,
        module: &str,
        name: &str,
    ) -> Result<Option<RunConfig>, CorrelatorError> {
        let request = DbRequest::GetConfig {
            module: module.to_string(),
            name: name.to_string(),
        };
        match self.call(request).await? {
            DbResponse::Config(config) => Ok(config),
            other => Err(unexpected(other)),
        }
    }

    pub async fn put_config(&self, module: &str, config: RunConfig) -> Result<(), CorrelatorError> {
        let request = DbRequest::PutConfig {
            module: module.to_string(),
            config,
        };
        match self.call(request).await? {
            DbResponse::Stored => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn record_report(&self, report: CompletionReport) -> Result<(), CorrelatorError> {
        match self.call(DbRequest::RecordReport(Box::new(report))).await? {
            DbResponse::Stored => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn reports(
        &self,
        module: &str,
        cluster: &str,
    ) -> Result<Vec<CompletionReport>, CorrelatorError> {
        let request = DbRequest::Reports {
            module: module.to_string(),
            cluster: cluster.to_string(),
        };
        match self.call(request).await? {
            DbResponse::Reports(reports) => Ok(reports),
            other => Err(unexpected(other)),
        }
    }

    /// Liveness check; a timeout means the subsystem is unresponsive
    pub async fn ping(&self) -> Result<(), CorrelatorError> {
        match self.call(DbRequest::Ping).await {
            Ok(DbResponse::Pong) => Ok(()),
            Ok(other) => Err(unexpected(other)),
            Err(CorrelatorError::Timeout { .. }) => {
                Err(CorrelatorError::Unresponsive(SUBSYSTEM.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub fn pending(&self) -> usize {
        self.correlator.pending()
    }

    async fn call(&self, request: DbRequest) -> Result<DbResponse, CorrelatorError> {
        match self.correlator.call(&self.inbox, request).await? {
            DbResponse::Failed(reason) => Err(CorrelatorError::Failed {
                subsystem: SUBSYSTEM.to_string(),
                reason,
            }),
            response => Ok(response),
        }
    }
}

fn unexpected(response: DbResponse) -> CorrelatorError {
    warn!(?response, "Unexpected database response");
    CorrelatorError::UnexpectedResponse(SUBSYSTEM.to_string())
}

async fn serve<B: DatabaseBackend>(
    mut backend: B,
    mut inbox: mpsc::Receiver<Envelope<DbRequest>>,
    correlator: Correlator<DbResponse>,
) {
    while let Some(Envelope { nonce, body }) = inbox.recv().await {
        let response = handle(&mut backend, body);
        if !correlator.respond(nonce, response) {
            debug!(nonce, "Database response had no waiting caller");
        }
    }
    info!("Database subsystem stopped");
}

fn handle<B: DatabaseBackend>(backend: &mut B, request: DbRequest) -> DbResponse {
    let result = match request {
        DbRequest::GetConfig { module, name } => {
            backend.get_config(&module, &name).map(DbResponse::Config)
        }
        DbRequest::PutConfig { module, config } => {
            backend.put_config(&module, config).map(|_| DbResponse::Stored)
        }
        DbRequest::RecordReport(report) => {
            backend.record_report(*report).map(|_| DbResponse::Stored)
        }
        DbRequest::Reports { module, cluster } => {
            backend.reports(&module, &cluster).map(DbResponse::Reports)
        }
        DbRequest::Ping => Ok(DbResponse::Pong),
    };

    result.unwrap_or_else(|e| {
        warn!(error = %e, "Database request failed");
        DbResponse::Failed(format!("{e:#}"))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::state::LifecycleState;
    use crate::pipeline::types::Statistics;
    use chrono::Utc;

    fn report(cluster: &str, supervisor_id: u32) -> CompletionReport {
        CompletionReport {
            supervisor_id,
            module: "m".to_string(),
            cluster: cluster.to_string(),
            metadata: serde_json::json!({}),
            config: RunConfig::new(cluster),
            statistics: Statistics::default(),
            state: LifecycleState::Terminated,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            elapsed: Duration::ZERO,
            crashed: false,
        }
    }

    fn spawn(history: usize) -> DatabaseHandle {
        DatabaseHandle::spawn_with(InMemoryDatabase::new(history), 8, Duration::from_secs(1)).0
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = spawn(4);
        assert_eq!(db.get_config("m", "c").await.unwrap(), None);

        db.put_config("m", RunConfig::new("c").with_workers(2, 3)).await.unwrap();
        let config = db.get_config("m", "c").await.unwrap().unwrap();
        assert_eq!(config.start_with_transform, 2);
        assert_eq!(db.get_config("other", "c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_report_history_is_bounded() {
        let db = spawn(2);
        for id in 0..5 {
            db.record_report(report("c", id)).await.unwrap();
        }
        db.record_report(report("d", 9)).await.unwrap();

        let ids: Vec<u32> = db
            .reports("m", "c")
            .await
            .unwrap()
            .iter()
            .map(|r| r.supervisor_id)
            .collect();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(db.reports("m", "d").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ping() {
        let db = spawn(1);
        db.ping().await.unwrap();
        assert_eq!(db.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_without_service_is_unresponsive() {
        let (inbox, _rx) = mpsc::channel(4);
        let db = DatabaseHandle::from_parts(
            inbox,
            Correlator::new(SUBSYSTEM, Duration::from_millis(20)),
        );

        let err = db.ping().await.unwrap_err();
        assert_eq!(err, CorrelatorError::Unresponsive("database".to_string()));
        assert_eq!(db.pending(), 0);
    }

    struct Broken;

    impl DatabaseBackend for Broken {
        fn get_config(&self, _: &str, _: &str) -> anyhow::Result<Option<RunConfig>> {
            anyhow::bail!("disk on fire")
        }

        fn put_config(&mut self, _: &str, _: RunConfig) -> anyhow::Result<()> {
            anyhow::bail!("disk on fire")
        }

        fn record_report(&mut self, _: CompletionReport) -> anyhow::Result<()> {
            anyhow::bail!("disk on fire")
        }

        fn reports(&self, _: &str, _: &str) -> anyhow::Result<Vec<CompletionReport>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_backend_failure_is_reported() {
        let (db, _task) = DatabaseHandle::spawn_with(Broken, 4, Duration::from_secs(1));
        let err = db.get_config("m", "c").await.unwrap_err();
        assert!(matches!(
            err,
            CorrelatorError::Failed { ref reason, .. } if reason.contains("disk on fire")
        ));
    }
}
