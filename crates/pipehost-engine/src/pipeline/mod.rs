//! Extract/Transform/Load pipeline
//!
//! A [`Supervisor`] runs one [`Cluster`] to completion, connecting its stages
//! with [`BackpressureChannel`]s and growing the worker pools of congested
//! stages.

pub mod channel;
pub mod cluster;
pub mod state;
pub mod supervisor;
pub mod types;

pub use channel::{BackpressureChannel, ChannelState};
pub use cluster::{Cluster, ExtractSink};
pub use state::{Lifecycle, LifecycleEvent, LifecycleState};
pub use supervisor::{QueueStatus, Supervisor, SupervisorStatus};
pub use types::{
    ChannelConfig, CompletionReport, Item, OnCrash, RunConfig, RunMode, Stage, Statistics,
};
