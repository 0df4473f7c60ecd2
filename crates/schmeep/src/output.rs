//! Side-channel output pushed by the evaluator while it runs.
//!
//! The evaluator writes from a blocking thread, so messages go through an
//! unbounded channel to a forwarder task that owns no state beyond the
//! current connection's [`ResponseStreamer`].

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::session::SessionId;
use crate::streamer::ResponseStreamer;

#[derive(Debug)]
pub(crate) enum PartialMessage {
    Output(String),
    /// Acknowledged once every earlier message has been written.
    Barrier(oneshot::Sender<()>),
}

/// Handle the evaluator uses to emit partial output.
///
/// Cheap to clone. Output sent while no client is connected is dropped.
#[derive(Clone, Default)]
pub struct OutputSink {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<PartialMessage>>>>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `text` for the connected client. Returns false if dropped.
    pub fn send(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        if text.is_empty() {
            return true;
        }
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) if tx.send(PartialMessage::Output(text)).is_ok() => true,
            _ => {
                tracing::debug!("No client connected, dropping partial output");
                false
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Route output to `streamer` until the next `detach`.
    pub(crate) fn attach(&self, streamer: ResponseStreamer, session_id: SessionId) -> JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        tokio::spawn(forward(rx, streamer, session_id))
    }

    /// Stop routing output. The forwarder exits once its queue drains.
    pub(crate) fn detach(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Wait until everything sent so far has been written (or discarded).
    pub(crate) async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        let queued = {
            let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            guard
                .as_ref()
                .is_some_and(|tx| tx.send(PartialMessage::Barrier(done_tx)).is_ok())
        };
        if queued {
            // Err means the forwarder is gone, which is also "flushed".
            let _ = done_rx.await;
        }
    }
}

async fn forward(
    mut rx: mpsc::UnboundedReceiver<PartialMessage>,
    streamer: ResponseStreamer,
    session_id: SessionId,
) {
    let mut broken = false;
    while let Some(msg) = rx.recv().await {
        match msg {
            PartialMessage::Output(text) if !broken => {
                if let Err(e) = streamer.send_partial(&text).await {
                    tracing::warn!(%session_id, error = %e, "Failed to forward partial output");
                    broken = true;
                }
            }
            PartialMessage::Output(_) => {}
            PartialMessage::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::trace!(%session_id, "Output forwarder exiting");
}
