//! Byte streams carried over router calls.
//!
//! A router call is a bidirectional stream of [`WireFrame`]s. The adapters in
//! this crate turn one into a plain [`ByteStream`]: `DATA` frames carry bytes,
//! `GOAWAY` marks end of stream for one direction, `PING` is a keepalive that
//! never surfaces to readers.

mod adapter;
mod frame;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use adapter::{RequestCallStream, ResponseCallStream};
pub use frame::{Frame, FrameType, UnknownFrameType, WireCodecError, WireFrame};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("end of stream")]
    EndOfStream,
    #[error("broken resource: {0}")]
    BrokenResource(String),
    #[error("resource closed")]
    ClosedResource,
    #[error("{codec} stream error: {message}")]
    Codec {
        codec: &'static str,
        message: String,
    },
}

impl StreamError {
    /// Errors that just mean "the other side is gone". Forwarding treats these
    /// as a normal end of a copy leg.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            StreamError::EndOfStream | StreamError::BrokenResource(_) | StreamError::ClosedResource
        )
    }

    pub fn broken(err: impl std::fmt::Display) -> Self {
        StreamError::BrokenResource(err.to_string())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::BrokenResource(err.to_string())
    }
}

pub type StreamResult<T> = Result<T, StreamError>;

/// A duplex byte stream with explicit half-close.
///
/// `receive` returns [`StreamError::EndOfStream`] once the peer has finished
/// writing. `send_eof` finishes our write half but keeps the read half open.
/// `close` tears down both halves.
#[async_trait]
pub trait ByteStream: Send + Sync {
    async fn send(&self, data: Bytes) -> StreamResult<()>;
    async fn receive(&self) -> StreamResult<Bytes>;
    async fn send_eof(&self) -> StreamResult<()>;
    async fn close(&self) -> StreamResult<()>;
}

#[async_trait]
impl<T: ByteStream + ?Sized> ByteStream for Arc<T> {
    async fn send(&self, data: Bytes) -> StreamResult<()> {
        (**self).send(data).await
    }

    async fn receive(&self) -> StreamResult<Bytes> {
        (**self).receive().await
    }

    async fn send_eof(&self) -> StreamResult<()> {
        (**self).send_eof().await
    }

    async fn close(&self) -> StreamResult<()> {
        (**self).close().await
    }
}

#[async_trait]
impl<T: ByteStream + ?Sized> ByteStream for Box<T> {
    async fn send(&self, data: Bytes) -> StreamResult<()> {
        (**self).send(data).await
    }

    async fn receive(&self) -> StreamResult<Bytes> {
        (**self).receive().await
    }

    async fn send_eof(&self) -> StreamResult<()> {
        (**self).send_eof().await
    }

    async fn close(&self) -> StreamResult<()> {
        (**self).close().await
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("call aborted")]
    Aborted,
    #[error("call write side already finished")]
    WriteClosed,
    #[error("call transport error: {0}")]
    Transport(String),
}

/// One router RPC call, seen as a bidirectional stream of frames.
#[async_trait]
pub trait FrameCall: Send + Sync {
    async fn write(&self, frame: WireFrame) -> Result<(), CallError>;
    /// `Ok(None)` once the peer finished writing without an explicit `GOAWAY`.
    async fn read(&self) -> Result<Option<WireFrame>, CallError>;
    fn abort(&self);
}

/// Client side of a call. It can finish its request stream while still
/// reading responses.
#[async_trait]
pub trait RequestCall: FrameCall {
    async fn done_writing(&self) -> Result<(), CallError>;
}
