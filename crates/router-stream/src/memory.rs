//! In-process router calls backed by bounded channels.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::{CallError, FrameCall, RequestCall, WireFrame};

/// Shared abort flag. Either side aborting kills the whole call.
#[derive(Clone)]
struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    fn abort(&self) {
        self.tx.send_replace(true);
    }

    fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on abort.
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

struct Half {
    tx: Mutex<Option<mpsc::Sender<WireFrame>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<WireFrame>>,
    abort: AbortSignal,
}

impl Half {
    async fn write(&self, frame: WireFrame) -> Result<(), CallError> {
        if self.abort.is_aborted() {
            return Err(CallError::Aborted);
        }
        let sender = self.tx.lock().clone().ok_or(CallError::WriteClosed)?;
        tokio::select! {
            result = sender.send(frame) => {
                result.map_err(|_| CallError::Transport("peer dropped the call".into()))
            }
            _ = self.abort.aborted() => Err(CallError::Aborted),
        }
    }

    async fn read(&self) -> Result<Option<WireFrame>, CallError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            frame = rx.recv() => Ok(frame),
            _ = self.abort.aborted() => Err(CallError::Aborted),
        }
    }

    fn finish_writing(&self) {
        self.tx.lock().take();
    }
}

/// Client end of an in-memory call.
pub struct MemoryRequestCall {
    half: Half,
}

/// Server end of an in-memory call.
pub struct MemoryResponseCall {
    half: Half,
}

/// Builds a connected call. Each direction buffers up to `capacity` frames.
pub fn call_pair(capacity: usize) -> (MemoryRequestCall, MemoryResponseCall) {
    let capacity = capacity.max(1);
    let (client_tx, server_rx) = mpsc::channel(capacity);
    let (server_tx, client_rx) = mpsc::channel(capacity);
    let abort = AbortSignal::new();
    let client = MemoryRequestCall {
        half: Half {
            tx: Mutex::new(Some(client_tx)),
            rx: tokio::sync::Mutex::new(client_rx),
            abort: abort.clone(),
        },
    };
    let server = MemoryResponseCall {
        half: Half {
            tx: Mutex::new(Some(server_tx)),
            rx: tokio::sync::Mutex::new(server_rx),
            abort,
        },
    };
    (client, server)
}

#[async_trait]
impl FrameCall for MemoryRequestCall {
    async fn write(&self, frame: WireFrame) -> Result<(), CallError> {
        self.half.write(frame).await
    }

    async fn read(&self) -> Result<Option<WireFrame>, CallError> {
        self.half.read().await
    }

    fn abort(&self) {
        self.half.abort.abort();
    }
}

#[async_trait]
impl RequestCall for MemoryRequestCall {
    async fn done_writing(&self) -> Result<(), CallError> {
        self.half.finish_writing();
        Ok(())
    }
}

#[async_trait]
impl FrameCall for MemoryResponseCall {
    async fn write(&self, frame: WireFrame) -> Result<(), CallError> {
        self.half.write(frame).await
    }

    async fn read(&self) -> Result<Option<WireFrame>, CallError> {
        self.half.read().await
    }

    fn abort(&self) {
        self.half.abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (client, server) = call_pair(8);
        for chunk in [&b"a"[..], b"b", b"c"] {
            client
                .write(WireFrame::data(Bytes::copy_from_slice(chunk)))
                .await
                .expect("write");
        }
        for expected in [&b"a"[..], b"b", b"c"] {
            let frame = server.read().await.expect("read").expect("frame");
            assert_eq!(&frame.payload[..], expected);
        }
    }

    #[tokio::test]
    async fn write_after_done_writing_fails() {
        let (client, server) = call_pair(1);
        client.done_writing().await.expect("done");
        assert_eq!(
            client.write(WireFrame::ping()).await,
            Err(CallError::WriteClosed)
        );
        assert_eq!(server.read().await, Ok(None));
    }

    #[tokio::test]
    async fn abort_wakes_a_pending_reader() {
        let (client, server) = call_pair(1);
        let reader = tokio::spawn(async move { server.read().await });
        tokio::task::yield_now().await;
        client.abort();
        assert_eq!(reader.await.expect("join"), Err(CallError::Aborted));
    }
}
