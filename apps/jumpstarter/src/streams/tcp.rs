use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use router_stream::{ByteStream, StreamResult};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use super::SocketStream;
use super::forward::forward;

/// Pause after a failed accept before trying again.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Opens the far end of a forwarded connection.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self) -> StreamResult<Box<dyn ByteStream>>;
}

/// Connects to a fixed TCP address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    chunk_size: usize,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            addr: addr.into(),
            chunk_size,
        }
    }
}

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn connect(&self) -> StreamResult<Box<dyn ByteStream>> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(SocketStream::with_chunk_size(
            stream,
            self.chunk_size,
        )))
    }
}

/// Listens locally and forwards every accepted connection to a stream opened
/// by the connector.
pub struct PortForward<C> {
    listener: TcpListener,
    connector: Arc<C>,
    chunk_size: usize,
}

impl<C: StreamConnector> PortForward<C> {
    pub async fn bind(addr: impl ToSocketAddrs, connector: C, chunk_size: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            connector: Arc::new(connector),
            chunk_size,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves. A failing connection
    /// is logged and does not stop the listener.
    pub async fn serve_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let (socket, peer) = tokio::select! {
                _ = &mut shutdown => return Ok(()),
                accepted = accept_retrying(|| self.listener.accept()) => accepted,
            };
            let connector = self.connector.clone();
            let chunk_size = self.chunk_size;
            tokio::spawn(async move {
                if let Err(err) = socket.set_nodelay(true) {
                    tracing::debug!(
                        target = "jumpstarter::streams::tcp",
                        %peer,
                        error = %err,
                        "set_nodelay failed"
                    );
                }
                let local = SocketStream::with_chunk_size(socket, chunk_size);
                let remote = match connector.connect().await {
                    Ok(remote) => remote,
                    Err(err) => {
                        tracing::warn!(
                            target = "jumpstarter::streams::tcp",
                            %peer,
                            error = %err,
                            "failed to open forwarded stream"
                        );
                        let _ = local.close().await;
                        return;
                    }
                };
                match forward(local, remote).await {
                    Ok(stats) => tracing::debug!(
                        target = "jumpstarter::streams::tcp",
                        %peer,
                        sent = stats.a_to_b,
                        received = stats.b_to_a,
                        "forwarded connection closed"
                    ),
                    Err(err) => tracing::warn!(
                        target = "jumpstarter::streams::tcp",
                        %peer,
                        error = %err,
                        "forwarded connection failed"
                    ),
                }
            });
        }
    }
}

/// Calls `accept` until it yields a connection. Failures such as running
/// out of descriptors are logged and followed by [`ACCEPT_BACKOFF`].
async fn accept_retrying<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(err) => {
                tracing::warn!(
                    target = "jumpstarter::streams::tcp",
                    error = %err,
                    backoff_ms = ACCEPT_BACKOFF.as_millis() as u64,
                    "accept failed"
                );
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = socket.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                    let _ = write.shutdown().await;
                });
            }
        });
        addr
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn forwards_to_tcp_target() {
        let target = echo_server().await;
        let forwarder = PortForward::bind(
            "127.0.0.1:0",
            TcpConnector::new(target.to_string(), 1024),
            1024,
        )
        .await
        .expect("bind forward");
        let listen = forwarder.local_addr().expect("addr");
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(forwarder.serve_until(async move {
            let _ = stop_rx.await;
        }));

        for round in 0..2 {
            let mut client = TcpStream::connect(listen).await.expect("connect");
            let message = format!("round {round}");
            client.write_all(message.as_bytes()).await.expect("write");
            client.shutdown().await.expect("half close");
            let mut echoed = String::new();
            client.read_to_string(&mut echoed).await.expect("read");
            assert_eq!(echoed, message);
        }

        let _ = stop_tx.send(());
        server.await.expect("join").expect("serve");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn failed_connect_keeps_listener_alive() {
        let unused = {
            let spare = TcpListener::bind("127.0.0.1:0").await.expect("spare");
            spare.local_addr().expect("addr")
        };
        let forwarder = PortForward::bind("127.0.0.1:0", TcpConnector::new(unused.to_string(), 1024), 1024)
            .await
            .expect("bind forward");
        let listen = forwarder.local_addr().expect("addr");
        let server = tokio::spawn(forwarder.serve_until(std::future::pending()));

        for _ in 0..2 {
            let mut client = TcpStream::connect(listen).await.expect("connect");
            let mut buf = Vec::new();
            // The forwarder closes our socket once the target refuses.
            client.read_to_end(&mut buf).await.expect("read");
            assert!(buf.is_empty());
        }
        server.abort();
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn accept_errors_back_off_before_retrying() {
        let attempts = std::cell::Cell::new(0u32);
        let started = tokio::time::Instant::now();
        let accepted = accept_retrying(|| {
            attempts.set(attempts.get() + 1);
            let attempt = attempts.get();
            async move {
                if attempt <= 3 {
                    Err(io::Error::from_raw_os_error(libc::EMFILE))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(accepted, 4);
        assert!(started.elapsed() >= ACCEPT_BACKOFF * 3);
        assert!(started.elapsed() < ACCEPT_BACKOFF * 4);
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn persistent_accept_errors_keep_retrying() {
        let failing = accept_retrying(|| async {
            Err::<(), _>(io::Error::from_raw_os_error(libc::EMFILE))
        });
        let stopped = tokio::time::timeout(ACCEPT_BACKOFF * 10, failing).await;
        assert!(stopped.is_err());
    }
}
