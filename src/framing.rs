//! Multi-file batch framing
//!
//! A batch download is one continuous octet stream. Each file is preceded by
//! an ASCII header carrying its hash and exact length:
//!
//! ```text
//! #HASH1:2#AB#HASH2:3#CDE
//! └──────┘  └──────┘
//!  header    header
//! ```
//!
//! Files are opened and streamed one at a time as the body is polled, so a
//! large batch never needs more than one open handle. Files that cannot be
//! resolved are skipped without a header.

use crate::error::FileError;
use crate::hash::ContentHash;
use crate::metrics::{
    Metrics, COUNTER_BYTES_SERVED, COUNTER_REQUESTED_BYTES, GAUGE_CURRENT_DOWNLOADS,
};
use crate::provider::CachedFileProvider;
use crate::queue::FinishGuard;
use bytes::Bytes;
use futures_util::future;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// Header preceding a file's bytes
pub fn frame_header(name: &str, len: u64) -> Bytes {
    Bytes::from(format!("#{}:{}#", name, len))
}

/// One file to be framed: the reader yields at least `len` bytes
pub struct FramePart<R> {
    pub name: String,
    pub len: u64,
    pub reader: R,
}

/// Concatenate parts into a framed stream, pulling the next part only after
/// the current one is exhausted. Exactly `len` bytes are emitted per part.
pub fn frame_stream<S, R>(parts: S) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    S: Stream<Item = FramePart<R>> + Send,
    R: AsyncRead + Send,
{
    parts.flat_map(|FramePart { name, len, reader }| {
        stream::once(future::ready(Ok(frame_header(&name, len))))
            .chain(ReaderStream::new(reader.take(len)))
    })
}

/// Framed stream of `hashes`, resolved through the provider in order.
///
/// Unavailable files, including ones whose lookup fails, are left out.
pub fn batch_stream(
    provider: Arc<CachedFileProvider>,
    hashes: Vec<ContentHash>,
    metrics: Arc<Metrics>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let parts = stream::iter(hashes)
        .then(move |hash| {
            let provider = Arc::clone(&provider);
            async move {
                match provider.fetch(&hash).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(hash = %hash, error = %e, "Skipping file that failed to resolve");
                        None
                    }
                }
            }
        })
        .filter_map(move |served| {
            let metrics = Arc::clone(&metrics);
            async move {
                let served = served?;
                metrics.add_counter(COUNTER_REQUESTED_BYTES, served.size);
                Some(FramePart {
                    name: served.hash.to_string(),
                    len: served.size,
                    reader: served.file,
                })
            }
        });

    frame_stream(parts)
}

// ============================================================================
// Download accounting
// ============================================================================

/// Held for the lifetime of a download body. Increments the in-flight gauge
/// on creation; on drop it decrements it and finishes the request.
pub struct InFlight {
    metrics: Arc<Metrics>,
    guard: FinishGuard,
}

impl InFlight {
    pub fn new(metrics: Arc<Metrics>, guard: FinishGuard) -> Self {
        metrics.inc_gauge(GAUGE_CURRENT_DOWNLOADS);
        Self { metrics, guard }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.metrics.dec_gauge(GAUGE_CURRENT_DOWNLOADS);
    }
}

/// Stream wrapper counting bytes that actually went out
pub struct CountingStream {
    inner: BoxStream<'static, io::Result<Bytes>>,
    metrics: Arc<Metrics>,
    sent: u64,
    in_flight: Option<InFlight>,
}

impl CountingStream {
    pub fn new<S>(inner: S, metrics: Arc<Metrics>, in_flight: Option<InFlight>) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: inner.boxed(),
            metrics,
            sent: 0,
            in_flight,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }
}

impl Stream for CountingStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &polled {
            this.sent += chunk.len() as u64;
            this.metrics.add_counter(COUNTER_BYTES_SERVED, chunk.len() as u64);
        }
        polled
    }
}

impl Drop for CountingStream {
    fn drop(&mut self) {
        if let Some(in_flight) = &self.in_flight {
            info!(request_id = %in_flight.guard.id(), bytes = self.sent, "Batch download ended");
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Split a complete framed body back into `(name, bytes)` pairs
pub fn decode_frames(body: &[u8]) -> Result<Vec<(String, Bytes)>, FileError> {
    let mut frames = Vec::new();
    let mut rest = body;

    while !rest.is_empty() {
        if rest[0] != b'#' {
            return Err(FileError::Frame("expected '#' at frame start".into()));
        }
        let header_end = rest[1..]
            .iter()
            .position(|b| *b == b'#')
            .map(|i| i + 1)
            .ok_or_else(|| FileError::Frame("unterminated header".into()))?;
        let header = std::str::from_utf8(&rest[1..header_end])
            .map_err(|_| FileError::Frame("header is not ASCII".into()))?;
        let (name, len) = header
            .rsplit_once(':')
            .ok_or_else(|| FileError::Frame(format!("header without length: {}", header)))?;
        let len: usize = len
            .parse()
            .map_err(|_| FileError::Frame(format!("bad length in header: {}", header)))?;

        let data_start = header_end + 1;
        let data_end = data_start + len;
        if data_end > rest.len() {
            return Err(FileError::Frame(format!("truncated body for {}", name)));
        }
        frames.push((name.to_string(), Bytes::copy_from_slice(&rest[data_start..data_end])));
        rest = &rest[data_end..];
    }

    Ok(frames)
}
