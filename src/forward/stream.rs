//! Chunk-at-a-time relay of upstream response bodies.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tracing::{debug, warn};

use crate::error::ForwardFailure;

/// The client went away; nothing more can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client connection closed")]
pub struct SinkClosed;

/// Write side supplied by the transport that owns the client connection.
#[async_trait]
pub trait ChunkSink: Send {
    async fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<(), SinkClosed>;
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), SinkClosed>;
    /// The upstream failed after the head went out. The client must see a broken body, not a
    /// clean end of stream.
    async fn abort(&mut self, failure: &ForwardFailure);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    ClientDisconnected,
    UpstreamFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub bytes: u64,
    pub chunks: u64,
    pub outcome: RelayOutcome,
}

/// Pass-through for a single response chunk.
pub fn forward_stream_chunk(chunk: Bytes) -> Bytes {
    chunk
}

/// Copies `body` into `sink` one chunk at a time until the upstream ends, fails, or the
/// client disconnects. Empty chunks are dropped so they cannot read as end-of-stream.
pub async fn relay_stream<S>(mut body: S, sink: &mut dyn ChunkSink) -> RelaySummary
where
    S: Stream<Item = Result<Bytes, ForwardFailure>> + Unpin,
{
    let mut bytes = 0u64;
    let mut chunks = 0u64;

    while let Some(item) = body.next().await {
        let chunk = match item {
            Ok(chunk) => forward_stream_chunk(chunk),
            Err(err) => {
                warn!(error = %err, bytes, chunks, "upstream stream failed mid-response");
                sink.abort(&err).await;
                return RelaySummary {
                    bytes,
                    chunks,
                    outcome: RelayOutcome::UpstreamFailed,
                };
            }
        };
        if chunk.is_empty() {
            continue;
        }

        let len = chunk.len() as u64;
        if sink.send_chunk(chunk).await.is_err() {
            debug!(bytes, chunks, "client disconnected; stopping stream");
            return RelaySummary {
                bytes,
                chunks,
                outcome: RelayOutcome::ClientDisconnected,
            };
        }
        bytes += len;
        chunks += 1;
    }

    debug!(bytes, chunks, "stream completed");
    RelaySummary {
        bytes,
        chunks,
        outcome: RelayOutcome::Completed,
    }
}

/// In-memory sink used by tests and embedders that buffer deliberately.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub chunks: Vec<Bytes>,
    /// Accept this many chunks, then report the client as gone.
    pub close_after: Option<usize>,
    pub aborted: Option<ForwardFailure>,
}

impl CollectingSink {
    pub fn body(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|chunk| chunk.iter().copied()).collect()
    }
}

#[async_trait]
impl ChunkSink for CollectingSink {
    async fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<(), SinkClosed> {
        self.status = Some(status);
        self.headers = headers.clone();
        Ok(())
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        if self
            .close_after
            .is_some_and(|limit| self.chunks.len() >= limit)
        {
            return Err(SinkClosed);
        }
        self.chunks.push(chunk);
        Ok(())
    }

    async fn abort(&mut self, failure: &ForwardFailure) {
        self.aborted = Some(failure.clone());
    }
}
