//! Out-of-band interrupt delivery.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::assembler::ExpressionAssembler;
use crate::evaluator::{Evaluator, run_blocking};
use crate::session::SessionId;
use crate::streamer::ResponseStreamer;

/// Delivers INTERRUPT to the evaluator without waiting on the evaluation
/// queue or blocking the receive loop.
pub struct InterruptChannel {
    evaluator: Arc<dyn Evaluator>,
    sink: ResponseStreamer,
    tracker: TaskTracker,
    session_id: SessionId,
}

impl InterruptChannel {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        sink: ResponseStreamer,
        tracker: TaskTracker,
        session_id: SessionId,
    ) -> Self {
        Self {
            evaluator,
            sink,
            tracker,
            session_id,
        }
    }

    /// Discard the partial expression now; interrupt the evaluator in the
    /// background. A status string from the evaluator is sent back as a
    /// normal response.
    pub fn signal(&self, assembler: &mut ExpressionAssembler) -> JoinHandle<()> {
        if !assembler.is_empty() {
            tracing::debug!(session_id = %self.session_id, discarded = assembler.len(), "Interrupt discarded partial expression");
        }
        assembler.reset();

        let evaluator = Arc::clone(&self.evaluator);
        let sink = self.sink.clone();
        let session_id = self.session_id;
        self.tracker.spawn(async move {
            tracing::debug!(%session_id, "Interrupting evaluator");
            let reply = match run_blocking(move || evaluator.interrupt()).await {
                Ok(Some(status)) => status,
                Ok(None) => return,
                Err(e) => e.render(),
            };
            if let Err(e) = sink.send_result(&reply).await {
                tracing::warn!(%session_id, error = %e, "Failed to send interrupt status");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvalError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    struct Interruptible {
        interrupts: AtomicUsize,
        reply: Result<Option<String>, EvalError>,
    }

    impl Evaluator for Interruptible {
        fn evaluate(&self, _expression: &str) -> Result<String, EvalError> {
            Ok(String::new())
        }

        fn interrupt(&self) -> Result<Option<String>, EvalError> {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn channel(
        reply: Result<Option<String>, EvalError>,
    ) -> (InterruptChannel, Arc<Interruptible>, tokio::io::DuplexStream) {
        let evaluator = Arc::new(Interruptible {
            interrupts: AtomicUsize::new(0),
            reply,
        });
        let (host, client) = tokio::io::duplex(1024);
        let channel = InterruptChannel::new(
            evaluator.clone(),
            ResponseStreamer::new(Box::new(host)),
            TaskTracker::new(),
            SessionId::new(),
        );
        (channel, evaluator, client)
    }

    #[tokio::test]
    async fn clears_buffer_and_interrupts() {
        let (channel, evaluator, _client) = channel(Ok(None));
        let mut assembler = ExpressionAssembler::new(64);
        assembler.append(b"(let loop ()").unwrap();

        let handle = channel.signal(&mut assembler);
        assert!(assembler.is_empty(), "buffer must be cleared synchronously");

        handle.await.unwrap();
        assert_eq!(evaluator.interrupts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn status_is_sent_as_response() {
        let (channel, _evaluator, mut client) = channel(Ok(Some("Interrupted.".to_string())));
        let mut assembler = ExpressionAssembler::new(64);
        channel.signal(&mut assembler).await.unwrap();

        let mut buf = vec![0u8; 1 + 13 + 1];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 13);
        assert_eq!(&buf[1..14], b"Interrupted.\n");
        assert_eq!(buf[14], 255);
    }

    #[tokio::test]
    async fn interrupt_error_is_rendered() {
        let (channel, _evaluator, mut client) = channel(Err(EvalError::failed("no evaluation running")));
        let mut assembler = ExpressionAssembler::new(64);
        channel.signal(&mut assembler).await.unwrap();

        let expected = b"Error: no evaluation running\n";
        let mut buf = vec![0u8; expected.len() + 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[1..buf.len() - 1], expected);
    }
}
