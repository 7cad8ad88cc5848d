use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use router_stream::{CallError, FrameCall, RequestCall, WireFrame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// A router call carried over a WebSocket, one frame per binary message.
///
/// A background task owns the socket. Finishing the write side only stops
/// outgoing frames; the socket stays open for reading until the peer closes
/// it or the call is aborted.
pub struct WebSocketCall {
    outgoing: parking_lot::Mutex<Option<mpsc::UnboundedSender<Message>>>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Result<WireFrame, CallError>>>,
    aborted: AtomicBool,
    task: JoinHandle<()>,
}

impl WebSocketCall {
    pub fn new<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_in, rx_in) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(ws, rx_out, tx_in));
        Self {
            outgoing: parking_lot::Mutex::new(Some(tx_out)),
            incoming: AsyncMutex::new(rx_in),
            aborted: AtomicBool::new(false),
            task,
        }
    }

    pub async fn connect(url: &str) -> Result<Self, tungstenite::Error> {
        let (ws, _response) = connect_async(url).await?;
        tracing::debug!(target = "jumpstarter::transport::websocket", url, "connected");
        Ok(Self::new::<MaybeTlsStream<tokio::net::TcpStream>>(ws))
    }

    pub async fn accept<S>(io: S) -> Result<Self, tungstenite::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ws = tokio_tungstenite::accept_async(io).await?;
        Ok(Self::new(ws))
    }

    fn check_aborted(&self) -> Result<(), CallError> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(CallError::Aborted);
        }
        Ok(())
    }
}

async fn pump<S>(
    ws: WebSocketStream<S>,
    mut rx_out: mpsc::UnboundedReceiver<Message>,
    tx_in: mpsc::UnboundedSender<Result<WireFrame, CallError>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx_out.recv().await {
            if let Err(err) = ws_sender.send(message).await {
                tracing::debug!(
                    target = "jumpstarter::transport::websocket",
                    error = %err,
                    "send failed"
                );
                break;
            }
        }
    });

    while let Some(message) = ws_receiver.next().await {
        let item = match message {
            Ok(Message::Binary(data)) => {
                WireFrame::decode(Bytes::from(data)).map_err(|err| CallError::Transport(err.to_string()))
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(text)) => {
                tracing::debug!(
                    target = "jumpstarter::transport::websocket",
                    len = text.len(),
                    "ignoring text message"
                );
                continue;
            }
            Ok(_) => continue,
            Err(err) => Err(CallError::Transport(err.to_string())),
        };
        let failed = item.is_err();
        if tx_in.send(item).is_err() || failed {
            break;
        }
    }

    send_task.abort();
    let _ = send_task.await;
}

#[async_trait]
impl FrameCall for WebSocketCall {
    async fn write(&self, frame: WireFrame) -> Result<(), CallError> {
        self.check_aborted()?;
        let encoded = frame
            .encode()
            .map_err(|err| CallError::Transport(err.to_string()))?;
        let sender = self.outgoing.lock().clone().ok_or(CallError::WriteClosed)?;
        sender
            .send(Message::Binary(encoded.to_vec()))
            .map_err(|_| CallError::Transport("websocket closed".into()))
    }

    async fn read(&self) -> Result<Option<WireFrame>, CallError> {
        self.check_aborted()?;
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(item) => item.map(Some),
            None => {
                self.check_aborted()?;
                Ok(None)
            }
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.outgoing.lock().take();
        self.task.abort();
    }
}

#[async_trait]
impl RequestCall for WebSocketCall {
    async fn done_writing(&self) -> Result<(), CallError> {
        self.outgoing.lock().take();
        Ok(())
    }
}

impl Drop for WebSocketCall {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use router_stream::{ByteStream, RequestCallStream, ResponseCallStream, StreamError};
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (WebSocketCall, WebSocketCall) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        (WebSocketCall::new(client), WebSocketCall::new(server))
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn byte_streams_over_websocket() {
        let (client, server) = ws_pair().await;
        let client = RequestCallStream::new(client);
        let server = ResponseCallStream::new(server);

        client.send(Bytes::from_static(b"over ws")).await.expect("send");
        client.send_eof().await.expect("eof");
        assert_eq!(server.receive().await.expect("recv"), Bytes::from_static(b"over ws"));
        assert_eq!(server.receive().await, Err(StreamError::EndOfStream));

        server.send(Bytes::from_static(b"reply")).await.expect("reply");
        server.send_eof().await.expect("eof");
        assert_eq!(client.receive().await.expect("recv"), Bytes::from_static(b"reply"));
        assert_eq!(client.receive().await, Err(StreamError::EndOfStream));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn aborted_call_rejects_io() {
        let (client, _server) = ws_pair().await;
        client.abort();
        assert_eq!(client.write(WireFrame::ping()).await, Err(CallError::Aborted));
        assert_eq!(client.read().await, Err(CallError::Aborted));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn peer_going_away_ends_reads() {
        let (client, server) = ws_pair().await;
        drop(server);
        let result = client.read().await;
        assert!(
            matches!(result, Ok(None) | Err(CallError::Transport(_))),
            "unexpected {result:?}"
        );
    }
}
