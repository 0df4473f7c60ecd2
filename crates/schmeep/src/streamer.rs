//! Outgoing response framing.
//!
//! Every logical message (one result, one interrupt status, one chunk of
//! partial output) is written under the writer lock, so bytes from two
//! producers never interleave on the wire. The lock is released between
//! messages, and a write stuck on a peer that stopped reading gives it up
//! as soon as the stream is closed.

use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use schmeep_bridge::{Frame, FrameCodec, FrameError, split_blocks};

use crate::transport::BoxedWriter;

type FrameWriter = FramedWrite<BoxedWriter, FrameCodec>;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("response stream closed")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Shared handle to a connection's output stream.
#[derive(Clone)]
pub struct ResponseStreamer {
    writer: Arc<Mutex<Option<FrameWriter>>>,
    closing: CancellationToken,
}

impl ResponseStreamer {
    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Some(FramedWrite::new(writer, FrameCodec::host())))),
            closing: CancellationToken::new(),
        }
    }

    /// Send `text` plus a trailing newline, then the completion marker.
    pub async fn send_result(&self, text: &str) -> Result<(), StreamError> {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(b'\n');

        self.write_message(Bytes::from(payload), true).await?;
        tracing::trace!(len = text.len() + 1, "Sent result");
        Ok(())
    }

    /// Send incremental output. No completion marker follows.
    pub async fn send_partial(&self, text: &str) -> Result<(), StreamError> {
        if text.is_empty() {
            return Ok(());
        }

        self.write_message(Bytes::copy_from_slice(text.as_bytes()), false)
            .await?;
        tracing::trace!(len = text.len(), "Sent partial output");
        Ok(())
    }

    /// Drop the writer. Later sends fail with [`StreamError::Closed`].
    ///
    /// A send blocked on a full stream is abandoned, releasing the lock.
    pub async fn close(&self) {
        self.closing.cancel();
        if self.writer.lock().await.take().is_some() {
            tracing::trace!("Response stream closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.closing.is_cancelled() || self.writer.lock().await.is_none()
    }

    async fn write_message(&self, payload: Bytes, complete: bool) -> Result<(), StreamError> {
        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(StreamError::Closed),
            result = async {
                let mut guard = self.writer.lock().await;
                let writer = guard.as_mut().ok_or(StreamError::Closed)?;
                write_blocks(writer, payload).await?;
                if complete {
                    writer.send(Frame::Complete).await?;
                }
                Ok::<(), StreamError>(())
            } => result,
        }
    }
}

/// One block per send; `SinkExt::send` flushes each before the next.
async fn write_blocks(writer: &mut FrameWriter, payload: Bytes) -> Result<(), FrameError> {
    for block in split_blocks(payload) {
        writer.send(block).await?;
    }
    Ok(())
}
