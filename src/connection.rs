use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Notify,
};
use tracing::{debug, error, info};

use crate::{
    endpoint::{Endpoint, EndpointSpec, Network},
    error::ProxyError,
    pipe::{DEFAULT_CONNECT_TIMEOUT, DuplexPipe, JoinPolicy},
    sink::ErrorSink,
};

/// One forwarding rule bound to a live listener on the local host.
///
/// Lifecycle: [`bind_source`](Self::bind_source), then
/// [`configure_destination`](Self::configure_destination), then
/// [`start`](Self::start), which accepts until the listener fails or is
/// closed. Closing stops future accepts only; pipes already dispatched run
/// until their own streams end.
pub struct ProxyConnection {
    listener: Option<TcpListener>,
    source: Option<(Endpoint, SocketAddr)>,
    destination: Option<Endpoint>,
    policy: JoinPolicy,
    connect_timeout: Duration,
    sink: Option<ErrorSink>,
    close: Arc<Notify>,
}

/// Closes a [`ProxyConnection`] from outside the task running its accept loop.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    close: Arc<Notify>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.close.notify_one();
    }
}

impl Default for ProxyConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyConnection {
    #[must_use]
    pub fn new() -> Self {
        Self {
            listener: None,
            source: None,
            destination: None,
            policy: JoinPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            sink: None,
            close: Arc::new(Notify::new()),
        }
    }

    #[must_use]
    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_join_policy(mut self, policy: JoinPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Validates `spec` and binds a listener for it on the local host.
    ///
    /// On failure nothing is bound and the connection should be discarded.
    pub async fn bind_source(&mut self, spec: &EndpointSpec) -> Result<(), ProxyError> {
        let endpoint = spec.parse()?;
        let addr = endpoint.socket_addr();

        let listener = match endpoint.network {
            Network::Tcp => TcpListener::bind(addr)
                .await
                .map_err(|source| ProxyError::Bind { addr, source })?,
        };
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind { addr, source })?;

        info!(source = %endpoint, listen_addr = %local_addr, "Created listener");
        self.listener = Some(listener);
        self.source = Some((endpoint, local_addr));
        Ok(())
    }

    /// Validates `spec` and records it for dialing. No socket is opened until
    /// a client arrives.
    pub fn configure_destination(&mut self, spec: &EndpointSpec) -> Result<(), ProxyError> {
        let endpoint = spec.parse()?;
        debug!(destination = %endpoint, "Configured destination");
        self.destination = Some(endpoint);
        Ok(())
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.source.map(|(_, addr)| addr)
    }

    #[must_use]
    pub const fn destination(&self) -> Option<Endpoint> {
        self.destination
    }

    #[must_use]
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            close: Arc::clone(&self.close),
        }
    }

    /// Runs the accept loop, dispatching one [`DuplexPipe`] task per client.
    ///
    /// Only returns on failure: the listener erroring, or being closed. Pipe
    /// failures are logged and sent to the error sink, never returned here.
    pub async fn start(&mut self) -> Result<(), ProxyError> {
        if self.listener.is_none() {
            return Err(ProxyError::NotBound);
        }
        let destination = self
            .destination
            .ok_or(ProxyError::DestinationNotConfigured)?;
        let (listener, addr) = match (self.listener.take(), self.source) {
            (Some(listener), Some((_, addr))) => (listener, addr),
            _ => return Err(ProxyError::NotBound),
        };

        let rule = self.to_string();
        info!(rule = %rule, "Listening for clients");

        loop {
            let (stream, client_addr) = tokio::select! {
                accepted = listener.accept() => {
                    accepted.map_err(|source| ProxyError::Accept { addr, source })?
                }
                () = self.close.notified() => {
                    info!(rule = %rule, "Listener closed");
                    return Err(ProxyError::Closed { addr });
                }
            };

            self.dispatch(stream, client_addr, destination, &rule);
        }
    }

    fn dispatch(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
        destination: Endpoint,
        rule: &str,
    ) {
        debug!(client_addr = %client_addr, "Accepted client");

        let pipe = DuplexPipe::new(stream, client_addr, destination)
            .with_join_policy(self.policy)
            .with_connect_timeout(self.connect_timeout);
        let sink = self.sink.clone();
        let rule = rule.to_string();

        tokio::spawn(async move {
            if let Err(e) = pipe.run().await {
                error!(rule = %rule, client_addr = %client_addr, error = %e, "Pipe failed");
                if let Some(sink) = sink {
                    sink.report_pipe(rule, e);
                }
            }
        });
    }

    /// Closes the listener. A running [`start`](Self::start) returns
    /// [`ProxyError::Closed`]; in-flight pipes are left alone.
    pub fn close(&mut self) -> Result<(), ProxyError> {
        let Some((_, addr)) = self.source else {
            return Err(ProxyError::NotBound);
        };
        if self.listener.take().is_some() {
            debug!(listen_addr = %addr, "Dropped idle listener");
        }
        self.close.notify_one();
        Ok(())
    }
}

impl fmt::Display for ProxyConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            Some((endpoint, addr)) => write!(f, "{} {addr}", endpoint.network)?,
            None => f.write_str("unbound")?,
        }
        match self.destination {
            Some(destination) => write!(f, " ==> {}", destination.socket_addr()),
            None => f.write_str(" ==> unset"),
        }
    }
}
