pub mod codec;
pub mod forward;
pub mod tcp;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

pub use router_stream::{ByteStream, StreamError, StreamResult};

pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// [`ByteStream`] over anything readable and writable: TCP and Unix sockets,
/// in-memory duplex pipes.
pub struct SocketStream<T> {
    reader: Mutex<ReadHalf<T>>,
    writer: Mutex<WriteHalf<T>>,
    chunk_size: usize,
    closed: AtomicBool,
}

impl<T> SocketStream<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: T) -> Self {
        Self::with_chunk_size(io, DEFAULT_READ_CHUNK)
    }

    pub fn with_chunk_size(io: T, chunk_size: usize) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            chunk_size: chunk_size.max(1),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> StreamResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::ClosedResource);
        }
        Ok(())
    }
}

#[async_trait]
impl<T> ByteStream for SocketStream<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, data: Bytes) -> StreamResult<()> {
        self.ensure_open()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await?;
        Ok(())
    }

    async fn receive(&self) -> StreamResult<Bytes> {
        self.ensure_open()?;
        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        let read = reader.read_buf(&mut buf).await?;
        if read == 0 {
            return Err(StreamError::EndOfStream);
        }
        Ok(buf.freeze())
    }

    async fn send_eof(&self) -> StreamResult<()> {
        self.ensure_open()?;
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    async fn close(&self) -> StreamResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            tracing::trace!(
                target = "jumpstarter::streams",
                error = %err,
                "shutdown on close failed"
            );
        }
        Ok(())
    }
}

/// Turns an async reader into a finite stream of chunks.
pub fn reader_chunks<R>(reader: R, chunk_size: usize) -> impl Stream<Item = io::Result<Bytes>> + Unpin
where
    R: AsyncRead + Unpin,
{
    let chunk_size = chunk_size.max(1);
    Box::pin(futures::stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        let mut buf = BytesMut::with_capacity(chunk_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((Ok(buf.freeze()), Some(reader))),
            Err(err) => Some((Err(err), None)),
        }
    }))
}
