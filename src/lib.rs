//! Static TCP Port Forwarder
//!
//! Listens on each configured local source port and relays every accepted
//! connection, byte for byte and in both directions, to a fixed local
//! destination port.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod forwarder;
pub mod pipe;
pub mod sink;

#[cfg(test)]
mod test_support;

// Re-export commonly used types and functions
pub use config::{Config, Rule, load_config};
pub use connection::{CloseHandle, ProxyConnection};
pub use endpoint::{Endpoint, EndpointSpec, Network};
pub use error::{ProxyError, ValidationError};
pub use forwarder::{Forwarder, ForwarderHandle, SkippedRule};
pub use pipe::{BUFFER_SIZE, Direction, DuplexPipe, JoinPolicy, PipeStats};
pub use sink::{ErrorSink, FailureReport, Severity, error_channel};
