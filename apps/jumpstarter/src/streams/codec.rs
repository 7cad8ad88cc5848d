//! Compression for byte streams: gzip, xz, bzip2 and zstd.
//!
//! Two entry points. [`compress_stream`] wraps a duplex [`ByteStream`] so that
//! writes are compressed and reads are decompressed. [`AutoDecompress`] wraps
//! a one-way chunk source, sniffs the leading bytes, and decompresses only if
//! a known signature is found.

use std::fmt;
use std::io::{self, Write};
use std::mem;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use clap::ValueEnum;
use futures::{Stream, StreamExt};
use router_stream::{ByteStream, StreamError, StreamResult};
use thiserror::Error;
use tokio::sync::Mutex;

/// Bytes needed to recognize every supported signature.
pub const SIGNATURE_BUFFER_SIZE: usize = 8;

const OUTPUT_CHUNK: usize = 32 * 1024;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const BZ2_MAGIC: &[u8] = &[0x42, 0x5a, 0x68];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Compression {
    Gzip,
    Xz,
    Bz2,
    Zstd,
}

impl Compression {
    pub fn name(self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Xz => "xz",
            Compression::Bz2 => "bz2",
            Compression::Zstd => "zstd",
        }
    }

    pub fn signature(self) -> &'static [u8] {
        match self {
            Compression::Gzip => GZIP_MAGIC,
            Compression::Xz => XZ_MAGIC,
            Compression::Bz2 => BZ2_MAGIC,
            Compression::Zstd => ZSTD_MAGIC,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compression {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(Compression::Gzip),
            "xz" => Ok(Compression::Xz),
            "bz2" | "bzip2" => Ok(Compression::Bz2),
            "zstd" | "zst" => Ok(Compression::Zstd),
            other => Err(CodecError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown compression '{0}'")]
    Unknown(String),
    #[error("{codec} stream is corrupt: {message}")]
    Corrupt {
        codec: Compression,
        message: String,
    },
    #[error("{codec} stream is truncated")]
    Truncated { codec: Compression },
    #[error("{codec} encoder failed: {source}")]
    Encode {
        codec: Compression,
        source: io::Error,
    },
    #[error("failed to read compressed source: {0}")]
    Source(#[from] io::Error),
}

impl CodecError {
    pub fn codec(&self) -> Option<Compression> {
        match self {
            CodecError::Corrupt { codec, .. }
            | CodecError::Truncated { codec }
            | CodecError::Encode { codec, .. } => Some(*codec),
            CodecError::Unknown(_) | CodecError::Source(_) => None,
        }
    }

    fn corrupt(codec: Compression, err: impl fmt::Display) -> Self {
        CodecError::Corrupt {
            codec,
            message: err.to_string(),
        }
    }
}

impl From<CodecError> for StreamError {
    fn from(err: CodecError) -> Self {
        match (&err, err.codec()) {
            (CodecError::Source(source), _) => StreamError::BrokenResource(source.to_string()),
            (_, Some(codec)) => StreamError::Codec {
                codec: codec.name(),
                message: err.to_string(),
            },
            (_, None) => StreamError::BrokenResource(err.to_string()),
        }
    }
}

/// Identifies the compression from a stream's leading bytes.
pub fn detect_compression(prefix: &[u8]) -> Option<Compression> {
    [
        Compression::Gzip,
        Compression::Xz,
        Compression::Bz2,
        Compression::Zstd,
    ]
    .into_iter()
    .find(|codec| prefix.starts_with(codec.signature()))
}

enum Encoder {
    Gzip(flate2::write::GzEncoder<Vec<u8>>),
    Xz(xz2::write::XzEncoder<Vec<u8>>),
    Bz2(bzip2::write::BzEncoder<Vec<u8>>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

impl Encoder {
    fn new(codec: Compression) -> Result<Self, CodecError> {
        Ok(match codec {
            Compression::Gzip => Encoder::Gzip(flate2::write::GzEncoder::new(
                Vec::new(),
                flate2::Compression::default(),
            )),
            Compression::Xz => Encoder::Xz(xz2::write::XzEncoder::new(Vec::new(), 6)),
            Compression::Bz2 => Encoder::Bz2(bzip2::write::BzEncoder::new(
                Vec::new(),
                bzip2::Compression::default(),
            )),
            Compression::Zstd => Encoder::Zstd(
                zstd::stream::write::Encoder::new(Vec::new(), 0)
                    .map_err(|source| CodecError::Encode { codec, source })?,
            ),
        })
    }

    fn codec(&self) -> Compression {
        match self {
            Encoder::Gzip(_) => Compression::Gzip,
            Encoder::Xz(_) => Compression::Xz,
            Encoder::Bz2(_) => Compression::Bz2,
            Encoder::Zstd(_) => Compression::Zstd,
        }
    }

    /// Compresses `data` and drains whatever output the encoder produced.
    fn write(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let codec = self.codec();
        let result = match self {
            Encoder::Gzip(enc) => enc.write_all(data).map(|_| mem::take(enc.get_mut())),
            Encoder::Xz(enc) => enc.write_all(data).map(|_| mem::take(enc.get_mut())),
            Encoder::Bz2(enc) => enc.write_all(data).map(|_| mem::take(enc.get_mut())),
            Encoder::Zstd(enc) => enc.write_all(data).map(|_| mem::take(enc.get_mut())),
        };
        result.map_err(|source| CodecError::Encode { codec, source })
    }

    fn finish(self) -> Result<Vec<u8>, CodecError> {
        let codec = self.codec();
        let result = match self {
            Encoder::Gzip(enc) => enc.finish(),
            Encoder::Xz(enc) => enc.finish(),
            Encoder::Bz2(enc) => enc.finish(),
            Encoder::Zstd(enc) => enc.finish(),
        };
        result.map_err(|source| CodecError::Encode { codec, source })
    }
}

enum DecoderState {
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Xz(xz2::stream::Stream),
    Bz2(bzip2::Decompress),
    Zstd(zstd::stream::raw::Decoder<'static>),
}

/// Incremental decompressor that knows whether it saw a complete stream.
struct Decoder {
    codec: Compression,
    state: DecoderState,
    complete: bool,
}

impl Decoder {
    fn new(codec: Compression) -> Result<Self, CodecError> {
        let state = match codec {
            Compression::Gzip => DecoderState::Gzip(flate2::write::GzDecoder::new(Vec::new())),
            Compression::Xz => DecoderState::Xz(
                xz2::stream::Stream::new_stream_decoder(u64::MAX, 0)
                    .map_err(|err| CodecError::corrupt(codec, err))?,
            ),
            Compression::Bz2 => DecoderState::Bz2(bzip2::Decompress::new(false)),
            Compression::Zstd => DecoderState::Zstd(
                zstd::stream::raw::Decoder::new()
                    .map_err(|err| CodecError::corrupt(codec, err))?,
            ),
        };
        Ok(Self {
            codec,
            state,
            complete: false,
        })
    }

    fn feed(&mut self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        let codec = self.codec;
        match &mut self.state {
            DecoderState::Gzip(dec) => {
                dec.write_all(input)
                    .map_err(|err| CodecError::corrupt(codec, err))?;
                Ok(mem::take(dec.get_mut()))
            }
            DecoderState::Xz(stream) => {
                let complete = &mut self.complete;
                drive(codec, input, complete, |input, out| {
                    let before = stream.total_in();
                    let status = stream
                        .process_vec(input, out, xz2::stream::Action::Run)
                        .map_err(|err| CodecError::corrupt(codec, err))?;
                    Ok((
                        (stream.total_in() - before) as usize,
                        status == xz2::stream::Status::StreamEnd,
                    ))
                })
            }
            DecoderState::Bz2(stream) => {
                let complete = &mut self.complete;
                drive(codec, input, complete, |input, out| {
                    let before = stream.total_in();
                    let status = stream
                        .decompress_vec(input, out)
                        .map_err(|err| CodecError::corrupt(codec, err))?;
                    Ok((
                        (stream.total_in() - before) as usize,
                        status == bzip2::Status::StreamEnd,
                    ))
                })
            }
            DecoderState::Zstd(dec) => feed_zstd(codec, dec, input, &mut self.complete),
        }
    }

    /// Ends the input. Fails unless the compressed stream was complete.
    fn finish(mut self) -> Result<Vec<u8>, CodecError> {
        let codec = self.codec;
        match &mut self.state {
            DecoderState::Gzip(dec) => {
                // A missing trailer is reported as a checksum failure here.
                dec.try_finish()
                    .map_err(|_| CodecError::Truncated { codec })?;
                Ok(mem::take(dec.get_mut()))
            }
            _ if self.complete => Ok(Vec::new()),
            _ => Err(CodecError::Truncated { codec }),
        }
    }
}

/// Runs a vec-filling decompress step until the input is used up and the
/// output stops growing. `step` returns the input consumed and whether the
/// end of the compressed stream was reached.
fn drive<F>(
    codec: Compression,
    mut input: &[u8],
    complete: &mut bool,
    mut step: F,
) -> Result<Vec<u8>, CodecError>
where
    F: FnMut(&[u8], &mut Vec<u8>) -> Result<(usize, bool), CodecError>,
{
    let mut out = Vec::with_capacity(OUTPUT_CHUNK);
    loop {
        if *complete {
            if !input.is_empty() {
                tracing::debug!(
                    target = "jumpstarter::streams::codec",
                    codec = %codec,
                    trailing = input.len(),
                    "ignoring bytes after end of compressed stream"
                );
            }
            return Ok(out);
        }
        if out.len() == out.capacity() {
            out.reserve(OUTPUT_CHUNK);
        }
        let produced_before = out.len();
        let (consumed, ended) = step(input, &mut out)?;
        input = &input[consumed..];
        *complete = ended;
        let produced = out.len() - produced_before;
        if input.is_empty() && out.len() < out.capacity() {
            return Ok(out);
        }
        if consumed == 0 && produced == 0 && !ended {
            return Err(CodecError::corrupt(codec, "decoder made no progress"));
        }
    }
}

fn feed_zstd(
    codec: Compression,
    dec: &mut zstd::stream::raw::Decoder<'static>,
    input: &[u8],
    complete: &mut bool,
) -> Result<Vec<u8>, CodecError> {
    use zstd::stream::raw::{InBuffer, Operation, OutBuffer};

    let mut out = Vec::new();
    let mut scratch = vec![0u8; OUTPUT_CHUNK];
    let mut src = InBuffer::around(input);
    loop {
        let consumed_before = src.pos();
        let (hint, written) = {
            let mut dst = OutBuffer::around(&mut scratch[..]);
            let hint = dec
                .run(&mut src, &mut dst)
                .map_err(|err| CodecError::corrupt(codec, err))?;
            (hint, dst.pos())
        };
        out.extend_from_slice(&scratch[..written]);
        if written > 0 || src.pos() > consumed_before {
            // zero means a frame was fully decoded and flushed
            *complete = hint == 0;
        }
        if src.pos() == input.len() && written < scratch.len() {
            return Ok(out);
        }
        if written == 0 && src.pos() == consumed_before {
            return Err(CodecError::corrupt(codec, "decoder made no progress"));
        }
    }
}

/// One-shot compression.
pub fn compress(codec: Compression, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = Encoder::new(codec)?;
    let mut out = encoder.write(data)?;
    out.extend(encoder.finish()?);
    Ok(out)
}

/// One-shot decompression of a complete compressed buffer.
pub fn decompress(codec: Compression, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = Decoder::new(codec)?;
    let mut out = decoder.feed(data)?;
    out.extend(decoder.finish()?);
    Ok(out)
}

struct ReadState {
    decoder: Option<Decoder>,
    finished: bool,
}

/// Duplex stream that compresses what it sends and decompresses what it
/// receives.
pub struct CompressedStream<S> {
    inner: S,
    codec: Compression,
    encoder: Mutex<Option<Encoder>>,
    reader: Mutex<ReadState>,
}

impl<S: ByteStream> CompressedStream<S> {
    pub fn new(inner: S, codec: Compression) -> Result<Self, CodecError> {
        Ok(Self {
            inner,
            codec,
            encoder: Mutex::new(Some(Encoder::new(codec)?)),
            reader: Mutex::new(ReadState {
                decoder: Some(Decoder::new(codec)?),
                finished: false,
            }),
        })
    }

    pub fn codec(&self) -> Compression {
        self.codec
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Writes out the compressor's tail. Only the first call does anything.
    async fn flush(&self) -> StreamResult<()> {
        let mut encoder = self.encoder.lock().await;
        let Some(active) = encoder.take() else {
            return Ok(());
        };
        let tail = active.finish()?;
        if !tail.is_empty() {
            self.inner.send(Bytes::from(tail)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ByteStream> ByteStream for CompressedStream<S> {
    async fn send(&self, data: Bytes) -> StreamResult<()> {
        let mut encoder = self.encoder.lock().await;
        let active = encoder.as_mut().ok_or(StreamError::ClosedResource)?;
        let compressed = active.write(&data)?;
        if compressed.is_empty() {
            return Ok(());
        }
        self.inner.send(Bytes::from(compressed)).await
    }

    async fn receive(&self) -> StreamResult<Bytes> {
        let mut state = self.reader.lock().await;
        loop {
            if state.finished {
                return Err(StreamError::EndOfStream);
            }
            match self.inner.receive().await {
                Ok(chunk) => {
                    let Some(decoder) = state.decoder.as_mut() else {
                        return Err(StreamError::EndOfStream);
                    };
                    let plain = decoder.feed(&chunk)?;
                    if !plain.is_empty() {
                        return Ok(Bytes::from(plain));
                    }
                }
                Err(StreamError::EndOfStream) => {
                    state.finished = true;
                    let tail = match state.decoder.take() {
                        Some(decoder) => decoder.finish()?,
                        None => Vec::new(),
                    };
                    if tail.is_empty() {
                        return Err(StreamError::EndOfStream);
                    }
                    return Ok(Bytes::from(tail));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_eof(&self) -> StreamResult<()> {
        self.flush().await?;
        self.inner.send_eof().await
    }

    async fn close(&self) -> StreamResult<()> {
        if let Err(err) = self.flush().await {
            tracing::debug!(
                target = "jumpstarter::streams::codec",
                codec = %self.codec,
                error = %err,
                "flush on close failed"
            );
        }
        self.inner.close().await
    }
}

/// Wraps `stream` in a codec, or returns it unchanged for `None`.
pub fn compress_stream<S>(
    stream: S,
    compression: Option<Compression>,
) -> Result<Box<dyn ByteStream>, CodecError>
where
    S: ByteStream + 'static,
{
    Ok(match compression {
        Some(codec) => Box::new(CompressedStream::new(stream, codec)?),
        None => Box::new(stream),
    })
}

enum AutoState {
    Probing,
    Passthrough,
    Decoding(Decoder),
    Done,
}

/// Decompresses a chunk source if it starts with a known signature, and
/// passes it through untouched otherwise. Consumes the source once.
pub struct AutoDecompress<S> {
    source: S,
    state: AutoState,
    detected: Option<Compression>,
}

impl<S> AutoDecompress<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: AutoState::Probing,
            detected: None,
        }
    }

    /// The codec picked during probing. `None` before the first chunk or for
    /// uncompressed input.
    pub fn detected(&self) -> Option<Compression> {
        self.detected
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, CodecError>> {
        loop {
            match &mut self.state {
                AutoState::Done => return None,
                AutoState::Probing => {
                    let head = match self.probe().await {
                        Ok(head) => head,
                        Err(err) => {
                            self.state = AutoState::Done;
                            return Some(Err(err));
                        }
                    };
                    if head.is_empty() {
                        self.state = AutoState::Done;
                        return None;
                    }
                    match self.detected {
                        Some(codec) => {
                            let decoder = match Decoder::new(codec) {
                                Ok(decoder) => decoder,
                                Err(err) => {
                                    self.state = AutoState::Done;
                                    return Some(Err(err));
                                }
                            };
                            self.state = AutoState::Decoding(decoder);
                            if let Some(out) = self.decode(&head) {
                                return Some(out);
                            }
                        }
                        None => {
                            self.state = AutoState::Passthrough;
                            return Some(Ok(head));
                        }
                    }
                }
                AutoState::Passthrough => match self.source.next().await {
                    Some(Ok(chunk)) => return Some(Ok(chunk)),
                    Some(Err(err)) => {
                        self.state = AutoState::Done;
                        return Some(Err(CodecError::Source(err)));
                    }
                    None => {
                        self.state = AutoState::Done;
                        return None;
                    }
                },
                AutoState::Decoding(_) => match self.source.next().await {
                    Some(Ok(chunk)) => {
                        if let Some(out) = self.decode(&chunk) {
                            return Some(out);
                        }
                    }
                    Some(Err(err)) => {
                        self.state = AutoState::Done;
                        return Some(Err(CodecError::Source(err)));
                    }
                    None => {
                        let AutoState::Decoding(decoder) =
                            mem::replace(&mut self.state, AutoState::Done)
                        else {
                            return None;
                        };
                        return match decoder.finish() {
                            Ok(tail) if tail.is_empty() => None,
                            Ok(tail) => Some(Ok(Bytes::from(tail))),
                            Err(err) => Some(Err(err)),
                        };
                    }
                },
            }
        }
    }

    /// Reads just enough chunks to fill the signature buffer, or until the
    /// source ends, and records the detected codec.
    async fn probe(&mut self) -> Result<Bytes, CodecError> {
        let mut head = BytesMut::new();
        while head.len() < SIGNATURE_BUFFER_SIZE {
            match self.source.next().await {
                Some(chunk) => head.extend_from_slice(&chunk?),
                None => break,
            }
        }
        self.detected = detect_compression(&head);
        tracing::debug!(
            target = "jumpstarter::streams::codec",
            detected = self.detected.map(Compression::name).unwrap_or("none"),
            probed = head.len(),
            "probed stream signature"
        );
        Ok(head.freeze())
    }

    /// Feeds the decoder. `None` means "no output yet, keep reading".
    fn decode(&mut self, chunk: &[u8]) -> Option<Result<Bytes, CodecError>> {
        let AutoState::Decoding(decoder) = &mut self.state else {
            return None;
        };
        match decoder.feed(chunk) {
            Ok(out) if out.is_empty() => None,
            Ok(out) => Some(Ok(Bytes::from(out))),
            Err(err) => {
                self.state = AutoState::Done;
                Some(Err(err))
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, CodecError>> {
        futures::stream::unfold(self, |mut auto| async move {
            auto.next_chunk().await.map(|item| (item, auto))
        })
    }
}
