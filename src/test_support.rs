//! Loopback servers shared by the socket tests.

use std::{future::Future, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::sleep,
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(1);
pub const SERVER_STARTUP_DELAY: Duration = Duration::from_millis(100);
pub const DATA_PROCESSING_DELAY: Duration = Duration::from_millis(200);

/// A loopback port with nothing listening on it.
pub async fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Serves every accepted stream with `handler` on its own task.
pub async fn spawn_server<F, Fut>(handler: F) -> u16
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handler(stream));
        }
    });

    port
}

pub async fn start_echo_server() -> u16 {
    spawn_server(|mut stream| async move {
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    })
    .await
}

/// Publishes everything each connection sent once it reaches end of stream.
pub async fn start_capturing_server() -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let port = spawn_server(move |mut stream| {
        let tx = tx.clone();
        async move {
            let mut captured = Vec::new();
            let _ = stream.read_to_end(&mut captured).await;
            let _ = tx.send(captured);
        }
    })
    .await;
    (port, rx)
}

/// Writes `data` shortly after accepting, then closes.
pub async fn start_sending_server(data: Vec<u8>) -> u16 {
    spawn_server(move |mut stream| {
        let data = data.clone();
        async move {
            sleep(SERVER_STARTUP_DELAY).await;
            let _ = stream.write_all(&data).await;
        }
    })
    .await
}
