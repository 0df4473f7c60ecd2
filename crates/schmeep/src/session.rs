//! One accepted client connection.
//!
//! A [`Connection`] is created on accept and owned by the accept loop for
//! its whole life. Its receive loop is the only writer of the expression
//! buffer; evaluation and interrupt work run on tracked tasks.

use std::fmt;
use std::io;
use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use schmeep_bridge::{Frame, FrameCodec, FrameError};

use crate::assembler::{Assembly, ExpressionAssembler};
use crate::config::{IncompletePolicy, SupervisorConfig};
use crate::dispatcher::{EvaluationDispatcher, EvaluationRequest};
use crate::evaluator::Evaluator;
use crate::interrupt::InterruptChannel;
use crate::output::OutputSink;
use crate::status::StatusReporter;
use crate::streamer::ResponseStreamer;
use crate::transport::{Accepted, BoxedReader};

/// Correlation ID for one session, logged as `session_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reply for EVALUATE on an incomplete buffer under [`IncompletePolicy::Reject`].
pub const INCOMPLETE_EXPRESSION: &str = "Error: incomplete expression";

/// Why a session loop returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer closed the stream on a frame boundary.
    ClientClosed,
    /// The supervisor is stopping.
    Stopped,
}

/// Connection-scoped failures. They end the session, never the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Frame(#[from] FrameError),

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// Per-supervisor collaborators shared by every connection.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub evaluator: Arc<dyn Evaluator>,
    pub reporter: StatusReporter,
    pub output: OutputSink,
    pub tracker: TaskTracker,
    pub config: SupervisorConfig,
}

pub struct Connection {
    id: SessionId,
    peer: String,
    frames: FramedRead<BoxedReader, FrameCodec>,
    streamer: ResponseStreamer,
    assembler: ExpressionAssembler,
    dispatcher: EvaluationDispatcher,
    interrupts: InterruptChannel,
    evaluator: Arc<dyn Evaluator>,
    output: OutputSink,
    forwarder: JoinHandle<()>,
    policy: IncompletePolicy,
    cancel: CancellationToken,
}

impl Connection {
    /// Wire the per-connection components to `accepted`'s streams.
    ///
    /// `parent` cancellation (supervisor stop) ends the session too.
    pub(crate) fn open(
        accepted: Accepted,
        ctx: &SessionContext,
        parent: &CancellationToken,
    ) -> Self {
        let id = SessionId::new();
        let cancel = parent.child_token();
        let streamer = ResponseStreamer::new(accepted.writer);
        let forwarder = ctx.output.attach(streamer.clone(), id);

        let dispatcher = EvaluationDispatcher::spawn(
            Arc::clone(&ctx.evaluator),
            ctx.reporter.clone(),
            ctx.output.clone(),
            &ctx.tracker,
            cancel.clone(),
            id,
        );
        let interrupts = InterruptChannel::new(
            Arc::clone(&ctx.evaluator),
            streamer.clone(),
            ctx.tracker.clone(),
            id,
        );

        tracing::info!(session_id = %id, peer = %accepted.peer, "Client connected");

        Self {
            id,
            peer: accepted.peer,
            frames: FramedRead::new(accepted.reader, FrameCodec::host()),
            streamer,
            assembler: ExpressionAssembler::new(ctx.config.max_expression_bytes),
            dispatcher,
            interrupts,
            evaluator: Arc::clone(&ctx.evaluator),
            output: ctx.output.clone(),
            forwarder,
            policy: ctx.config.incomplete_policy,
            cancel,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Decode and handle frames until the peer leaves, the stream fails,
    /// or the session is cancelled.
    pub async fn run(&mut self) -> Result<SessionEnd, SessionError> {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(SessionEnd::Stopped),
                item = self.frames.next() => item,
            };

            match item {
                None => {
                    tracing::info!(session_id = %self.id, "Client closed connection");
                    return Ok(SessionEnd::ClientClosed);
                }
                Some(Err(e)) => {
                    tracing::warn!(session_id = %self.id, error = %e, "Read failed");
                    return Err(e.into());
                }
                Some(Ok(Err(invalid))) => {
                    tracing::warn!(session_id = %self.id, byte = invalid.byte, "Ignoring invalid frame");
                }
                Some(Ok(Ok(frame))) => self.handle_frame(frame),
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Block(payload) => {
                tracing::trace!(session_id = %self.id, len = payload.len(), "Block received");
                if let Err(overflow) = self.assembler.append(&payload) {
                    self.dispatcher
                        .reply(format!("Error: {overflow}"), self.streamer.clone());
                }
            }
            Frame::Evaluate => match self.assembler.try_complete(self.evaluator.as_ref()) {
                Assembly::Empty => {
                    tracing::debug!(session_id = %self.id, "EVALUATE with empty buffer, ignoring");
                }
                Assembly::Incomplete => match self.policy {
                    IncompletePolicy::Wait => {
                        tracing::debug!(
                            session_id = %self.id,
                            buffered = self.assembler.len(),
                            "Expression incomplete, waiting for more"
                        );
                    }
                    IncompletePolicy::Reject => {
                        tracing::debug!(session_id = %self.id, "Rejecting incomplete expression");
                        self.assembler.reset();
                        self.dispatcher
                            .reply(INCOMPLETE_EXPRESSION, self.streamer.clone());
                    }
                },
                Assembly::Complete(expression) => {
                    self.dispatcher
                        .dispatch(EvaluationRequest::new(expression, self.streamer.clone()));
                }
            },
            Frame::Interrupt => {
                tracing::debug!(session_id = %self.id, "Interrupt received");
                drop(self.interrupts.signal(&mut self.assembler));
            }
            Frame::Complete => {
                // The host codec never yields this.
                tracing::warn!(session_id = %self.id, "Unexpected completion marker from client");
            }
        }
    }

    /// Close the streams and release the connection's resources.
    ///
    /// In-flight evaluation keeps running on the tracker; its result is
    /// discarded because the output stream is gone.
    pub async fn teardown(self) {
        let Self {
            id,
            mut assembler,
            streamer,
            output,
            forwarder,
            cancel,
            frames,
            dispatcher,
            ..
        } = self;

        cancel.cancel();
        drop(dispatcher);
        drop(frames);
        output.detach();
        streamer.close().await;
        assembler.reset();
        if let Err(e) = forwarder.await {
            tracing::warn!(session_id = %id, error = %e, "Output forwarder failed");
        }
        tracing::debug!(session_id = %id, "Connection torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvalError;
    use crate::status::{ChannelObserver, UiEvent};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct Upcase;

    impl Evaluator for Upcase {
        fn evaluate(&self, expression: &str) -> Result<String, EvalError> {
            Ok(expression.to_uppercase())
        }

        fn interrupt(&self) -> Result<Option<String>, EvalError> {
            Ok(None)
        }
    }

    fn open(
        config: SupervisorConfig,
    ) -> (
        Connection,
        DuplexStream,
        tokio::sync::mpsc::UnboundedReceiver<UiEvent>,
        CancellationToken,
    ) {
        let (observer, events) = ChannelObserver::new();
        let ctx = SessionContext {
            evaluator: Arc::new(Upcase),
            reporter: StatusReporter::new(Arc::new(observer)),
            output: OutputSink::new(),
            tracker: TaskTracker::new(),
            config,
        };
        let (host, client) = tokio::io::duplex(4096);
        let parent = CancellationToken::new();
        let conn = Connection::open(Accepted::from_stream(host, "test"), &ctx, &parent);
        (conn, client, events, parent)
    }

    async fn read_response(client: &mut DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let lead = client.read_u8().await.unwrap();
            if lead == 255 {
                return out;
            }
            let mut block = vec![0u8; usize::from(lead)];
            client.read_exact(&mut block).await.unwrap();
            out.extend_from_slice(&block);
        }
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        assert_eq!(SessionId::new().to_string().len(), 36);
    }

    #[tokio::test]
    async fn evaluates_and_ends_on_client_close() {
        let (mut conn, mut client, mut events, _parent) = open(SupervisorConfig::default());
        let session = tokio::spawn(async move {
            let end = conn.run().await;
            conn.teardown().await;
            end
        });

        client.write_all(&[4]).await.unwrap();
        client.write_all(b"(a b").await.unwrap();
        client.write_all(&[1, b')', 254]).await.unwrap();
        assert_eq!(read_response(&mut client).await, b"(A B)\n");

        assert_eq!(
            events.recv().await.unwrap(),
            UiEvent::Expression {
                expression: "(a b)".to_string()
            }
        );

        drop(client);
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::ClientClosed);
    }

    #[tokio::test]
    async fn reject_policy_answers_incomplete() {
        let config = SupervisorConfig::default()
            .with_incomplete_policy(IncompletePolicy::Reject);
        let (mut conn, mut client, _events, _parent) = open(config);
        tokio::spawn(async move { conn.run().await });

        client.write_all(&[2, b'(', b'a', 254]).await.unwrap();
        assert_eq!(
            read_response(&mut client).await,
            b"Error: incomplete expression\n"
        );

        // The buffer was discarded: this is a fresh expression.
        client.write_all(&[3, b'(', b'b', b')', 254]).await.unwrap();
        assert_eq!(read_response(&mut client).await, b"(B)\n");
    }

    #[tokio::test]
    async fn wait_policy_keeps_buffer() {
        let (mut conn, mut client, _events, _parent) = open(SupervisorConfig::default());
        tokio::spawn(async move { conn.run().await });

        client.write_all(&[2, b'(', b'a', 254]).await.unwrap();
        client.write_all(&[1, b')', 254]).await.unwrap();
        assert_eq!(read_response(&mut client).await, b"(A)\n");
    }

    #[tokio::test]
    async fn overflow_is_reported_to_client() {
        let config = SupervisorConfig::default().with_max_expression_bytes(4);
        let (mut conn, mut client, _events, _parent) = open(config);
        tokio::spawn(async move { conn.run().await });

        client.write_all(&[5, b'(', b'a', b' ', b'b', b')']).await.unwrap();
        assert_eq!(
            read_response(&mut client).await,
            b"Error: expression exceeds 4 bytes\n"
        );
    }

    #[tokio::test]
    async fn truncated_block_is_a_read_failure() {
        let (mut conn, mut client, _events, _parent) = open(SupervisorConfig::default());
        let session = tokio::spawn(async move { conn.run().await });

        client.write_all(&[10, b'(', b'a']).await.unwrap();
        drop(client);

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Frame(FrameError::ConnectionClosed {
                expected: 10,
                received: 2
            })
        ));
    }

    #[tokio::test]
    async fn parent_cancel_stops_session() {
        let (mut conn, _client, mut events, parent) = open(SupervisorConfig::default());
        let session = tokio::spawn(async move { conn.run().await });

        parent.cancel();
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Stopped);
        assert!(events.try_recv().is_err(), "session reports no status itself");
    }
}
