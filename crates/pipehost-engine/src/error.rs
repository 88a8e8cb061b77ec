//! Engine error types

use std::time::Duration;
use thiserror::Error;

use crate::correlator::Nonce;
use crate::pipeline::state::{LifecycleEvent, LifecycleState};

/// Result type alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Backpressure channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel '{0}' is closed")]
    Closed(String),

    #[error("run feeding channel '{0}' is suspended")]
    Suspended(String),
}

/// Cross-subsystem call failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("request {nonce:#010x} timed out after {waited:?}")]
    Timeout { nonce: Nonce, waited: Duration },

    #[error("subsystem '{0}' is not accepting requests")]
    Unavailable(String),

    #[error("subsystem '{0}' is unresponsive")]
    Unresponsive(String),

    #[error("subsystem '{0}' answered with an unexpected response")]
    UnexpectedResponse(String),

    #[error("subsystem '{subsystem}' failed the request: {reason}")]
    Failed { subsystem: String, reason: String },
}

/// Illegal supervisor state transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot apply {event:?} in state {state:?}")]
pub struct TransitionError {
    pub state: LifecycleState,
    pub event: LifecycleEvent,
}

/// Rejections from the mount/provision lifecycle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("unknown cluster '{cluster}' in module '{module}'")]
    UnknownCluster { module: String, cluster: String },

    #[error("module '{0}' is not mounted")]
    ModuleNotMounted(String),

    #[error("cluster '{cluster}' in module '{module}' is not mounted")]
    ClusterNotMounted { module: String, cluster: String },

    #[error("'{0}' is marked for deletion")]
    MarkedForDeletion(String),

    #[error("no run config '{config}' for module '{module}'")]
    ConfigNotFound { module: String, config: String },

    #[error("cluster '{0}' runs as a stream and cannot be provisioned on request")]
    StreamNotProvisionable(String),

    #[error("module '{0}' is already registered")]
    DuplicateModule(String),

    #[error("cluster '{cluster}' is already registered in module '{module}'")]
    DuplicateCluster { module: String, cluster: String },

    #[error("invalid run config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Correlator(#[from] CorrelatorError),
}

/// Umbrella error for engine callers
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Correlator(#[from] CorrelatorError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Host error: {0}")]
    Host(#[from] pipehost_common::HostError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn provision_step() -> EngineResult<()> {
        Err::<(), _>(ProvisionError::ConfigNotFound {
            module: "m".to_string(),
            config: "c".to_string(),
        })?;
        Ok(())
    }

    #[test]
    fn test_provision_error_converts_to_engine_error() {
        let err = provision_step().unwrap_err();
        assert!(matches!(err, EngineError::Provision(ProvisionError::ConfigNotFound { .. })));
        assert_eq!(err.to_string(), "no run config 'c' for module 'm'");
    }

    #[test]
    fn test_correlator_error_is_transparent_inside_provision_error() {
        let err: ProvisionError = CorrelatorError::Unresponsive("database".to_string()).into();
        assert_eq!(err.to_string(), "subsystem 'database' is unresponsive");
    }

    #[test]
    fn test_timeout_message_shows_nonce_in_hex() {
        let err = CorrelatorError::Timeout {
            nonce: 0xbeef,
            waited: Duration::from_millis(5),
        };
        assert_eq!(err.to_string(), "request 0x0000beef timed out after 5ms");
    }
}
