//! Turns a [`Config`] into running [`ProxyConnection`]s.
//!
//! Rules that fail validation or binding are logged and skipped; the rest are
//! served. A connection whose accept loop fails is reported to the error
//! sink and closed without touching the others.

use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::{
    config::{Config, Rule},
    connection::{CloseHandle, ProxyConnection},
    error::ProxyError,
    sink::ErrorSink,
};

/// A rule left out of service, with the reason.
#[derive(Debug)]
pub struct SkippedRule {
    pub rule: Rule,
    pub error: ProxyError,
}

pub struct Forwarder {
    connections: Vec<ProxyConnection>,
    skipped: Vec<SkippedRule>,
    sink: ErrorSink,
}

impl Forwarder {
    pub async fn from_config(config: &Config, sink: &ErrorSink) -> Self {
        let mut connections = Vec::with_capacity(config.connections.len());
        let mut skipped = Vec::new();

        for rule in &config.connections {
            match setup_rule(rule, config.connect_timeout(), sink).await {
                Ok(connection) => {
                    info!(rule = %rule, connection = %connection, "Rule active");
                    connections.push(connection);
                }
                Err(error) => {
                    warn!(rule = %rule, error = %error, "Skipping rule");
                    skipped.push(SkippedRule {
                        rule: rule.clone(),
                        error,
                    });
                }
            }
        }

        Self {
            connections,
            skipped,
            sink: sink.clone(),
        }
    }

    #[must_use]
    pub fn connections(&self) -> &[ProxyConnection] {
        &self.connections
    }

    #[must_use]
    pub fn skipped(&self) -> &[SkippedRule] {
        &self.skipped
    }

    /// Starts every accept loop on its own task.
    #[must_use]
    pub fn spawn(self) -> ForwarderHandle {
        let Self {
            connections, sink, ..
        } = self;
        let mut tasks = JoinSet::new();
        let mut closers = Vec::with_capacity(connections.len());

        for connection in connections {
            closers.push(connection.close_handle());
            tasks.spawn(supervise(connection, sink.clone()));
        }

        ForwarderHandle { tasks, closers }
    }
}

async fn setup_rule(
    rule: &Rule,
    connect_timeout: Duration,
    sink: &ErrorSink,
) -> Result<ProxyConnection, ProxyError> {
    let mut connection = ProxyConnection::new()
        .with_error_sink(sink.clone())
        .with_join_policy(rule.join_policy)
        .with_connect_timeout(connect_timeout);

    connection.bind_source(&rule.source_port).await?;
    connection.configure_destination(&rule.dst_port)?;
    Ok(connection)
}

/// Runs one accept loop to completion. A requested close ends it quietly;
/// any other failure is reported to `sink` and the connection is closed.
async fn supervise(mut connection: ProxyConnection, sink: ErrorSink) {
    let Err(e) = connection.start().await else {
        return;
    };
    let rule = connection.to_string();
    if matches!(e, ProxyError::Closed { .. }) {
        info!(rule = %rule, "Connection stopped");
        return;
    }

    error!(rule = %rule, error = %e, "Accept loop failed");
    sink.report_fatal(rule, e).await;
    if let Err(e) = connection.close() {
        warn!(error = %e, "Failed to close connection");
    }
}

/// Running accept loops started by [`Forwarder::spawn`].
pub struct ForwarderHandle {
    tasks: JoinSet<()>,
    closers: Vec<CloseHandle>,
}

impl ForwarderHandle {
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Closes every listener. In-flight pipes keep running.
    pub fn close(&self) {
        for closer in &self.closers {
            closer.close();
        }
    }

    /// Waits for every accept loop to return.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Accept loop task panicked");
            }
        }
    }
}
