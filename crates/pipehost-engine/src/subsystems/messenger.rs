//! Per-cluster log lines for operators

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Fatal,
}

/// Sink for human-readable lines about a cluster's runs
pub trait Messenger: Send + Sync {
    fn send(&self, cluster: &str, severity: Severity, line: &str);

    /// No more lines will follow for the current run of `cluster`
    fn close(&self, cluster: &str);
}

/// Forwards every line to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMessenger;

impl Messenger for TracingMessenger {
    fn send(&self, cluster: &str, severity: Severity, line: &str) {
        match severity {
            Severity::Info => tracing::info!(target: "pipehost::messenger", cluster, "{line}"),
            Severity::Warning => tracing::warn!(target: "pipehost::messenger", cluster, "{line}"),
            Severity::Fatal => tracing::error!(target: "pipehost::messenger", cluster, "{line}"),
        }
    }

    fn close(&self, cluster: &str) {
        tracing::debug!(target: "pipehost::messenger", cluster, "Messenger closed");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessengerLine {
    pub cluster: String,
    pub severity: Severity,
    pub line: String,
}

/// Keeps every line in memory
#[derive(Debug, Default)]
pub struct MemoryMessenger {
    lines: Mutex<Vec<MessengerLine>>,
    closed: Mutex<Vec<String>>,
}

impl MemoryMessenger {
    pub fn lines(&self) -> Vec<MessengerLine> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn lines_for(&self, cluster: &str) -> Vec<MessengerLine> {
        self.lines()
            .into_iter()
            .filter(|l| l.cluster == cluster)
            .collect()
    }

    /// Clusters closed so far, in order, once per close
    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Messenger for MemoryMessenger {
    fn send(&self, cluster: &str, severity: Severity, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(MessengerLine {
                cluster: cluster.to_string(),
                severity,
                line: line.to_string(),
            });
    }

    fn close(&self, cluster: &str) {
        self.closed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(cluster.to_string());
    }
}
