//! Evaluation dispatch for one connection.
//!
//! The receive loop hands complete expressions to [`EvaluationDispatcher`]
//! and goes straight back to decoding, so an INTERRUPT for the running
//! evaluation is always readable. Requests are queued to a single worker
//! task: at most one evaluation runs per connection, in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::evaluator::{Evaluator, run_blocking};
use crate::output::OutputSink;
use crate::session::SessionId;
use crate::status::{ConnectionStatus, StatusReporter, escape_newlines};
use crate::streamer::ResponseStreamer;

/// A complete expression and where its result goes. Consumed exactly once.
pub struct EvaluationRequest {
    pub expression: String,
    pub sink: ResponseStreamer,
}

impl EvaluationRequest {
    pub fn new(expression: impl Into<String>, sink: ResponseStreamer) -> Self {
        Self {
            expression: expression.into(),
            sink,
        }
    }
}

enum Job {
    Evaluate(EvaluationRequest),
    /// Protocol-level reply (overflow, rejected expression), ordered with results.
    Reply(String, ResponseStreamer),
}

pub struct EvaluationDispatcher {
    jobs: mpsc::UnboundedSender<Job>,
    reporter: StatusReporter,
    pending: Arc<AtomicUsize>,
    session_id: SessionId,
}

impl EvaluationDispatcher {
    /// Start the worker for one session. It exits when `session` is cancelled
    /// or the dispatcher is dropped; an evaluation already running is allowed
    /// to finish.
    pub fn spawn(
        evaluator: Arc<dyn Evaluator>,
        reporter: StatusReporter,
        output: OutputSink,
        tracker: &TaskTracker,
        session: CancellationToken,
        session_id: SessionId,
    ) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = Worker {
            evaluator,
            reporter: reporter.clone(),
            output,
            pending: Arc::clone(&pending),
            session,
            session_id,
        };
        tracker.spawn(worker.run(rx));

        Self {
            jobs,
            reporter,
            pending,
            session_id,
        }
    }

    /// Queue `request` and return immediately.
    pub fn dispatch(&self, request: EvaluationRequest) {
        tracing::debug!(
            session_id = %self.session_id,
            expression = %escape_newlines(&request.expression),
            "Dispatching expression"
        );
        self.reporter.expression(&request.expression);
        self.reporter.report(ConnectionStatus::Evaluating);
        self.pending.fetch_add(1, Ordering::AcqRel);

        if let Err(mpsc::error::SendError(job)) = self.jobs.send(Job::Evaluate(request)) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            if let Job::Evaluate(request) = job {
                tracing::warn!(
                    session_id = %self.session_id,
                    expression = %escape_newlines(&request.expression),
                    "Evaluation worker gone, dropping expression"
                );
            }
        }
    }

    /// Queue a plain response behind any pending evaluations.
    pub fn reply(&self, text: impl Into<String>, sink: ResponseStreamer) {
        if self.jobs.send(Job::Reply(text.into(), sink)).is_err() {
            tracing::warn!(session_id = %self.session_id, "Evaluation worker gone, dropping reply");
        }
    }

    /// Evaluations queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

struct Worker {
    evaluator: Arc<dyn Evaluator>,
    reporter: StatusReporter,
    output: OutputSink,
    pending: Arc<AtomicUsize>,
    session: CancellationToken,
    session_id: SessionId,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>) {
        loop {
            let job = tokio::select! {
                biased;
                _ = self.session.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            match job {
                Job::Evaluate(request) => self.evaluate(request).await,
                Job::Reply(text, sink) => {
                    if let Err(e) = sink.send_result(&text).await {
                        tracing::warn!(session_id = %self.session_id, error = %e, "Failed to send reply");
                    }
                }
            }
        }

        tracing::trace!(session_id = %self.session_id, "Evaluation worker exiting");
    }

    async fn evaluate(&self, request: EvaluationRequest) {
        let EvaluationRequest { expression, sink } = request;
        let started = Instant::now();

        let evaluator = Arc::clone(&self.evaluator);
        let input = expression.clone();
        let text = match run_blocking(move || evaluator.evaluate(&input)).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(session_id = %self.session_id, error = %e, "Evaluation failed");
                e.render()
            }
        };

        // Partial output produced during this evaluation goes out before its result.
        self.output.flush().await;

        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 && !self.session.is_cancelled() {
            self.reporter.report(ConnectionStatus::Connected);
        }

        match sink.send_result(&text).await {
            Ok(()) => tracing::debug!(
                session_id = %self.session_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                result = %escape_newlines(&text),
                "Evaluation complete"
            ),
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to send result")
            }
        }

        self.reporter.result(&expression, &text);
    }
}
