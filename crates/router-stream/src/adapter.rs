use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    ByteStream, CallError, Frame, FrameCall, RequestCall, StreamError, StreamResult, WireFrame,
};

fn broken(err: CallError) -> StreamError {
    StreamError::BrokenResource(err.to_string())
}

/// Per-direction bookkeeping shared by both adapters.
struct CallState<C> {
    call: C,
    eof_sent: AtomicBool,
    eof_received: AtomicBool,
}

impl<C: FrameCall> CallState<C> {
    fn new(call: C) -> Self {
        Self {
            call,
            eof_sent: AtomicBool::new(false),
            eof_received: AtomicBool::new(false),
        }
    }

    async fn send(&self, data: Bytes) -> StreamResult<()> {
        if self.eof_sent.load(Ordering::Acquire) {
            return Err(StreamError::ClosedResource);
        }
        self.call.write(WireFrame::data(data)).await.map_err(broken)
    }

    async fn receive(&self) -> StreamResult<Bytes> {
        loop {
            if self.eof_received.load(Ordering::Acquire) {
                return Err(StreamError::EndOfStream);
            }
            let wire = match self.call.read().await.map_err(broken)? {
                Some(wire) => wire,
                None => {
                    self.eof_received.store(true, Ordering::Release);
                    return Err(StreamError::EndOfStream);
                }
            };
            match Frame::try_from(wire) {
                Ok(Frame::Data(payload)) => return Ok(payload),
                Ok(Frame::GoAway) => {
                    self.eof_received.store(true, Ordering::Release);
                    return Err(StreamError::EndOfStream);
                }
                Ok(Frame::Ping) => continue,
                Err(unknown) => {
                    tracing::debug!(
                        target = "router_stream::adapter",
                        frame_type = unknown.0,
                        "ignoring unrecognized frame"
                    );
                    continue;
                }
            }
        }
    }

    /// Writes `GOAWAY` once. Returns `false` if it was already sent.
    async fn send_goaway(&self) -> StreamResult<bool> {
        if self.eof_sent.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.call.write(WireFrame::goaway()).await.map_err(broken)?;
        Ok(true)
    }
}

/// Stream over the client side of a router call.
pub struct RequestCallStream<C> {
    state: CallState<C>,
}

impl<C: RequestCall> RequestCallStream<C> {
    pub fn new(call: C) -> Self {
        Self {
            state: CallState::new(call),
        }
    }

    pub fn call(&self) -> &C {
        &self.state.call
    }
}

#[async_trait]
impl<C: RequestCall> ByteStream for RequestCallStream<C> {
    async fn send(&self, data: Bytes) -> StreamResult<()> {
        self.state.send(data).await
    }

    async fn receive(&self) -> StreamResult<Bytes> {
        self.state.receive().await
    }

    async fn send_eof(&self) -> StreamResult<()> {
        if self.state.send_goaway().await? {
            self.state.call.done_writing().await.map_err(broken)?;
        }
        Ok(())
    }

    async fn close(&self) -> StreamResult<()> {
        if let Err(err) = self.send_eof().await {
            tracing::trace!(
                target = "router_stream::adapter",
                error = %err,
                "eof on close failed"
            );
        }
        self.state.call.abort();
        Ok(())
    }
}

/// Stream over the server side of a router call. The response direction has
/// no separate "done writing" step, so `GOAWAY` alone marks end of stream.
pub struct ResponseCallStream<C> {
    state: CallState<C>,
}

impl<C: FrameCall> ResponseCallStream<C> {
    pub fn new(call: C) -> Self {
        Self {
            state: CallState::new(call),
        }
    }

    pub fn call(&self) -> &C {
        &self.state.call
    }
}

#[async_trait]
impl<C: FrameCall> ByteStream for ResponseCallStream<C> {
    async fn send(&self, data: Bytes) -> StreamResult<()> {
        self.state.send(data).await
    }

    async fn receive(&self) -> StreamResult<Bytes> {
        self.state.receive().await
    }

    async fn send_eof(&self) -> StreamResult<()> {
        self.state.send_goaway().await.map(|_| ())
    }

    async fn close(&self) -> StreamResult<()> {
        if let Err(err) = self.send_eof().await {
            tracing::trace!(
                target = "router_stream::adapter",
                error = %err,
                "eof on close failed"
            );
        }
        self.state.call.abort();
        Ok(())
    }
}
