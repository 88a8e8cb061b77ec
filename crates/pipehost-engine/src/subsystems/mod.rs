//! Host subsystems reached from the provisioner
//!
//! The database subsystem runs as its own task behind an inbox and is called
//! through a [`Correlator`](crate::correlator::Correlator). The messenger is
//! a plain trait object.

pub mod database;
pub mod messenger;

pub use database::{DatabaseBackend, DatabaseHandle, DbRequest, DbResponse, InMemoryDatabase};
pub use messenger::{MemoryMessenger, Messenger, MessengerLine, Severity, TracingMessenger};
