//! Pipehost Engine
//!
//! Runs user-defined Extract/Transform/Load clusters as self-scaling
//! pipelines.
//!
//! # Layout
//!
//! - [`pipeline`]: backpressure channels, the [`Cluster`] trait and the
//!   [`Supervisor`] driving one run
//! - [`registry`]: live supervisors of a cluster
//! - [`provisioner`]: modules, clusters and the mount lifecycle
//! - [`correlator`]: nonce-tagged request/response between subsystems
//! - [`subsystems`]: the database task and the messenger
//!
//! # Example
//!
//! ```no_run
//! use pipehost_engine::{
//!     wordcount::{self, WordCount},
//!     Caller, DatabaseHandle, EngineSettings, InMemoryDatabase, Provisioner, TracingMessenger,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = EngineSettings::load()?;
//!     let backend = InMemoryDatabase::new(settings.stats_history);
//!     let (db, _task) = DatabaseHandle::spawn(backend, &settings);
//!     let provisioner = Provisioner::new(db, Arc::new(TracingMessenger));
//!
//!     let words = Arc::new(WordCount::new(vec!["to be or not to be".to_string()]));
//!     provisioner.register_module(wordcount::MODULE, words.module())?;
//!     provisioner.put_config(wordcount::MODULE, WordCount::config(&settings)).await?;
//!     provisioner.mount_module(wordcount::MODULE).await?;
//!     provisioner.mount_cluster(wordcount::MODULE, wordcount::CLUSTER).await?;
//!
//!     let mut done = provisioner.subscribe();
//!     provisioner
//!         .provision(
//!             wordcount::MODULE,
//!             wordcount::CLUSTER,
//!             serde_json::Value::Null,
//!             None,
//!             Caller::External,
//!         )
//!         .await?;
//!     let report = done.recv().await?;
//!     println!("{:?}", report.statistics);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod correlator;
pub mod error;
pub mod pipeline;
pub mod provisioner;
pub mod registry;
pub mod subsystems;
pub mod wordcount;

pub use config::EngineSettings;
pub use correlator::{Correlator, Envelope, Nonce};
pub use error::{
    ChannelError, CorrelatorError, EngineError, EngineResult, ProvisionError, TransitionError,
};
pub use pipeline::{
    BackpressureChannel, ChannelConfig, ChannelState, Cluster, CompletionReport, ExtractSink, Item,
    LifecycleState, OnCrash, RunConfig, RunMode, Stage, Statistics, Supervisor, SupervisorStatus,
};
pub use provisioner::{Caller, DeleteOutcome, ModuleInfo, Provisioner};
pub use registry::Registry;
pub use subsystems::{
    DatabaseHandle, InMemoryDatabase, MemoryMessenger, Messenger, Severity, TracingMessenger,
};
