//! Pipehost Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging setup for the pipehost workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`HostError`] and the [`Result`] alias
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`]
//!
//! # Example
//!
//! ```no_run
//! use pipehost_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> pipehost_common::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("host started");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{HostError, Result};
