use serde::Deserialize;
use std::{fmt, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    endpoint::{Endpoint, Network},
    error::ProxyError,
};

pub const BUFFER_SIZE: usize = 8192;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToDestination,
    DestinationToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToDestination => f.write_str("client->destination"),
            Self::DestinationToClient => f.write_str("destination->client"),
        }
    }
}

/// When a pipe tears down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoinPolicy {
    /// The first direction to end closes both connections, dropping anything
    /// the other direction had not delivered yet. Half-closed streams are not
    /// supported.
    #[default]
    FirstFinish,
    /// A finished direction half-closes the peer's write side and the pipe
    /// waits for the other direction. An error in either direction still
    /// closes both.
    BothFinish,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    pub client_to_destination: u64,
    pub destination_to_client: u64,
    /// `None` when both directions were awaited.
    pub first_finished: Option<Direction>,
}

/// Relays one accepted client to the destination.
///
/// Both sockets are owned by the pipe and closed when [`DuplexPipe::run`]
/// returns, whatever the outcome.
pub struct DuplexPipe {
    client: TcpStream,
    client_addr: SocketAddr,
    destination: Endpoint,
    policy: JoinPolicy,
    connect_timeout: Duration,
}

impl DuplexPipe {
    #[must_use]
    pub fn new(client: TcpStream, client_addr: SocketAddr, destination: Endpoint) -> Self {
        Self {
            client,
            client_addr,
            destination,
            policy: JoinPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
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

    /// Dials the destination and relays until the join policy is satisfied.
    ///
    /// A failed dial closes the client without starting any relay.
    #[tracing::instrument(skip(self), fields(client_addr = %self.client_addr, destination = %self.destination))]
    pub async fn run(self) -> Result<PipeStats, ProxyError> {
        let Self {
            client,
            destination,
            policy,
            connect_timeout,
            ..
        } = self;

        let upstream = dial(destination, connect_timeout).await?;
        info!(?policy, "Connected to destination");

        let stats = relay_streams(client, upstream, policy).await?;

        info!(
            client_to_destination = stats.client_to_destination,
            destination_to_client = stats.destination_to_client,
            first_finished = ?stats.first_finished,
            "Pipe closed"
        );
        Ok(stats)
    }
}

async fn dial(destination: Endpoint, connect_timeout: Duration) -> Result<TcpStream, ProxyError> {
    let addr = destination.socket_addr();
    debug!(%addr, "Attempting to connect to destination");

    match destination.network {
        Network::Tcp => timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::DialTimeout {
                addr,
                timeout: connect_timeout,
            })?
            .map_err(|source| ProxyError::Dial { addr, source }),
    }
}

async fn relay_streams(
    client: TcpStream,
    upstream: TcpStream,
    policy: JoinPolicy,
) -> Result<PipeStats, ProxyError> {
    let (client_reader, client_writer) = client.into_split();
    let (upstream_reader, upstream_writer) = upstream.into_split();

    let mut sent = 0;
    let mut received = 0;

    let first_finished = {
        let client_to_destination = relay(
            client_reader,
            upstream_writer,
            Direction::ClientToDestination,
            &mut sent,
        );
        let destination_to_client = relay(
            upstream_reader,
            client_writer,
            Direction::DestinationToClient,
            &mut received,
        );

        match policy {
            JoinPolicy::FirstFinish => {
                let (direction, result) = tokio::select! {
                    result = client_to_destination => (Direction::ClientToDestination, result),
                    result = destination_to_client => (Direction::DestinationToClient, result),
                };
                debug!(%direction, "First direction finished, tearing down pipe");
                result?;
                Some(direction)
            }
            JoinPolicy::BothFinish => {
                tokio::try_join!(client_to_destination, destination_to_client)?;
                None
            }
        }
    };

    Ok(PipeStats {
        client_to_destination: sent,
        destination_to_client: received,
        first_finished,
    })
}

/// Copies `reader` into `writer` until end of stream, then shuts down
/// `writer` so the peer sees the half-close.
async fn relay<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    transferred: &mut u64,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];

    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|source| ProxyError::Stream { direction, source })?;

        if n == 0 {
            debug!(%direction, "End of stream");
            if let Err(e) = writer.shutdown().await {
                debug!(%direction, error = %e, "Peer already gone on shutdown");
            }
            return Ok(());
        }

        debug!(%direction, bytes = n, "Forwarding data");
        writer
            .write_all(&buffer[..n])
            .await
            .map_err(|source| ProxyError::Stream { direction, source })?;
        *transferred += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{endpoint::EndpointSpec, test_support::*};
    use tokio::{
        net::TcpListener,
        sync::{mpsc, oneshot},
        time::sleep,
    };
    use tokio_test::{assert_err, assert_ok};

    type PipeResults = mpsc::UnboundedReceiver<Result<PipeStats, ProxyError>>;

    /// Accepts clients on a free port and runs a pipe for each, publishing
    /// every pipe's outcome.
    async fn start_pipe_listener(destination_port: u16, policy: JoinPolicy) -> (u16, PipeResults) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let destination = EndpointSpec::tcp(destination_port).parse().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, addr)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = DuplexPipe::new(stream, addr, destination)
                        .with_join_policy(policy)
                        .with_connect_timeout(TEST_TIMEOUT)
                        .run()
                        .await;
                    let _ = tx.send(result);
                });
            }
        });

        (port, rx)
    }

    async fn next_result(results: &mut PipeResults) -> Result<PipeStats, ProxyError> {
        timeout(TEST_TIMEOUT, results.recv())
            .await
            .expect("timed out waiting for pipe")
            .expect("pipe listener stopped")
    }

    /// Destination that waits for the client's EOF, then answers late.
    async fn start_late_reply_server(reply: &'static [u8]) -> (u16, oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut request = Vec::new();
                let _ = stream.read_to_end(&mut request).await;
                let _ = tx.send(request);
                sleep(DATA_PROCESSING_DELAY).await;
                let _ = stream.write_all(reply).await;
            }
        });

        (port, rx)
    }

    mod relaying {
        use super::*;

        #[tokio::test]
        async fn echoes_through_destination() {
            let echo_port = start_echo_server().await;
            let (port, mut results) = start_pipe_listener(echo_port, JoinPolicy::FirstFinish).await;

            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            client.write_all(b"Hello pipe!").await.unwrap();

            let mut reply = [0u8; 11];
            timeout(TEST_TIMEOUT, client.read_exact(&mut reply))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&reply, b"Hello pipe!");

            drop(client);
            let stats = assert_ok!(next_result(&mut results).await);
            assert_eq!(stats.client_to_destination, 11);
            assert_eq!(stats.destination_to_client, 11);
        }

        #[tokio::test]
        async fn preserves_large_payloads_in_order() {
            let echo_port = start_echo_server().await;
            let (port, _results) = start_pipe_listener(echo_port, JoinPolicy::FirstFinish).await;

            let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
            let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let (mut reader, mut writer) = client.into_split();

            let to_send = payload.clone();
            let write_task = tokio::spawn(async move {
                writer.write_all(&to_send).await.unwrap();
                writer
            });

            let mut received = vec![0u8; payload.len()];
            timeout(TEST_TIMEOUT * 5, reader.read_exact(&mut received))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, payload);
            let _writer = write_task.await.unwrap();
        }

        #[tokio::test]
        async fn forwards_destination_data_to_client() {
            let data = b"Data from destination".to_vec();
            let dest_port = start_sending_server(data.clone()).await;
            let (port, mut results) = start_pipe_listener(dest_port, JoinPolicy::FirstFinish).await;

            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let mut received = Vec::new();
            timeout(TEST_TIMEOUT, client.read_to_end(&mut received))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, data);

            let stats = assert_ok!(next_result(&mut results).await);
            assert_eq!(stats.first_finished, Some(Direction::DestinationToClient));
            assert_eq!(stats.destination_to_client, data.len() as u64);
        }

        #[tokio::test]
        async fn forwards_client_data_to_destination() {
            let (dest_port, mut captured) = start_capturing_server().await;
            let (port, mut results) = start_pipe_listener(dest_port, JoinPolicy::FirstFinish).await;

            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            client.write_all(b"first ").await.unwrap();
            client.write_all(b"second").await.unwrap();
            drop(client);

            assert_ok!(next_result(&mut results).await);
            let received = timeout(TEST_TIMEOUT, captured.recv()).await.unwrap().unwrap();
            assert_eq!(received, b"first second");
        }
    }

    mod teardown {
        use super::*;

        #[tokio::test]
        async fn client_eof_closes_destination_first_finish() {
            let (dest_port, request) = start_late_reply_server(b"late reply").await;
            let (port, mut results) = start_pipe_listener(dest_port, JoinPolicy::FirstFinish).await;

            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            client.write_all(b"request").await.unwrap();
            client.shutdown().await.unwrap();

            let stats = assert_ok!(next_result(&mut results).await);
            assert_eq!(stats.first_finished, Some(Direction::ClientToDestination));
            assert_eq!(timeout(TEST_TIMEOUT, request).await.unwrap().unwrap(), b"request");

            // The destination's reply arrives after teardown and is lost.
            let mut received = Vec::new();
            let _ = timeout(TEST_TIMEOUT, client.read_to_end(&mut received)).await.unwrap();
            assert!(received.is_empty());
        }

        #[tokio::test]
        async fn client_eof_is_half_close_with_both_finish() {
            let (dest_port, request) = start_late_reply_server(b"late reply").await;
            let (port, mut results) = start_pipe_listener(dest_port, JoinPolicy::BothFinish).await;

            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            client.write_all(b"request").await.unwrap();
            client.shutdown().await.unwrap();

            assert_eq!(timeout(TEST_TIMEOUT, request).await.unwrap().unwrap(), b"request");

            let mut received = Vec::new();
            timeout(TEST_TIMEOUT, client.read_to_end(&mut received))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, b"late reply");

            let stats = assert_ok!(next_result(&mut results).await);
            assert_eq!(stats.first_finished, None);
            assert_eq!(stats.client_to_destination, 7);
            assert_eq!(stats.destination_to_client, 10);
        }
    }

    mod dialing {
        use super::*;

        #[tokio::test]
        async fn unreachable_destination_closes_client() {
            let unused_port = find_free_port().await;
            let (port, mut results) = start_pipe_listener(unused_port, JoinPolicy::FirstFinish).await;

            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

            let err = assert_err!(next_result(&mut results).await);
            assert!(matches!(err, ProxyError::Dial { addr, .. } if addr.port() == unused_port));

            let mut buffer = [0u8; 16];
            let read = timeout(TEST_TIMEOUT, client.read(&mut buffer)).await.unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        #[tokio::test]
        async fn dial_reports_timeout() {
            let endpoint = EndpointSpec::tcp(find_free_port().await).parse().unwrap();
            let err = dial(endpoint, Duration::ZERO).await;
            // A zero budget either times out or, on a fast refusal, reports the refusal.
            assert!(matches!(
                err,
                Err(ProxyError::DialTimeout { .. } | ProxyError::Dial { .. })
            ));
        }
    }
}
