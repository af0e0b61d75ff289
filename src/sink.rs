//! Central error reporting.
//!
//! Each [`ProxyConnection`](crate::ProxyConnection) is handed an [`ErrorSink`]
//! at construction. Pipe failures and fatal accept-loop failures are pushed
//! through it to whoever owns the receiving end, usually a single loop in
//! `main` that logs them.

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Ended one client's pipe; the listener keeps accepting.
    Pipe,
    /// Ended a connection's accept loop.
    Fatal,
}

#[derive(Debug)]
pub struct FailureReport {
    /// Display form of the forwarding rule the failure belongs to.
    pub rule: String,
    pub severity: Severity,
    pub error: ProxyError,
}

/// Sending half of the error channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<FailureReport>,
}

/// Creates a bounded error channel.
#[must_use]
pub fn error_channel(capacity: usize) -> (ErrorSink, mpsc::Receiver<FailureReport>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ErrorSink { tx }, rx)
}

impl ErrorSink {
    /// Reports a fatal failure, waiting for room in the channel.
    pub async fn report_fatal(&self, rule: impl Into<String>, error: ProxyError) {
        let report = FailureReport {
            rule: rule.into(),
            severity: Severity::Fatal,
            error,
        };
        if let Err(e) = self.tx.send(report).await {
            warn!(rule = %e.0.rule, error = %e.0.error, "Error sink closed, dropping report");
        }
    }

    /// Reports a pipe failure without waiting; the report is dropped if the
    /// channel is full.
    pub fn report_pipe(&self, rule: impl Into<String>, error: ProxyError) {
        let report = FailureReport {
            rule: rule.into(),
            severity: Severity::Pipe,
            error,
        };
        match self.tx.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(report)) => {
                warn!(rule = %report.rule, error = %report.error, "Error sink full, dropping report");
            }
            Err(TrySendError::Closed(report)) => {
                warn!(rule = %report.rule, error = %report.error, "Error sink closed, dropping report");
            }
        }
    }
}
