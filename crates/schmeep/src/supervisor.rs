//! Connection supervisor: bind once, then accept one client at a time.
//!
//! ```text
//! start ─► AwaitingConnection ─► WaitingForConnection ─► Connected ⇄ Evaluating
//!                                      ▲                      │
//!                                      └── cooldown ◄── ConnectionFailed / client left
//! stop ─► Disconnected
//! ```
//!
//! Accept and session failures are connection-scoped: the connection is torn
//! down and the loop retries after the cooldown. Readiness and bind failures
//! are reported once and end `start`.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::config::SupervisorConfig;
use crate::evaluator::Evaluator;
use crate::output::OutputSink;
use crate::session::{Connection, SessionContext, SessionEnd, SessionError};
use crate::status::{ConnectionStatus, Observer, StatusEvent, StatusReporter};
use crate::transport::{Listener, Readiness, Transport};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("transport not ready: {0}")]
    NotReady(Readiness),

    #[error("failed to start server: {0}")]
    Bind(#[source] std::io::Error),
}

struct Running {
    cancel: CancellationToken,
    accept_loop: JoinHandle<()>,
    local: String,
}

pub struct ConnectionSupervisor {
    evaluator: Arc<dyn Evaluator>,
    reporter: StatusReporter,
    output: OutputSink,
    config: SupervisorConfig,
    tracker: TaskTracker,
    state: Mutex<Option<Running>>,
}

impl ConnectionSupervisor {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        observer: Arc<dyn Observer>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            evaluator,
            reporter: StatusReporter::new(observer),
            output: OutputSink::new(),
            config,
            tracker: TaskTracker::new(),
            state: Mutex::new(None),
        }
    }

    /// Bind `transport` and start accepting. No-op while already running.
    pub async fn start(&self, transport: &dyn Transport) -> Result<(), StartError> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref() {
            tracing::debug!(listener = %running.local, "Supervisor already running");
            return Ok(());
        }

        let readiness = transport.readiness();
        if let Some(status) = readiness.status() {
            tracing::warn!(%readiness, "Transport not ready");
            self.reporter.report(status);
            return Err(StartError::NotReady(readiness));
        }

        let listener = match transport.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(error = %e, "Failed to bind listener");
                self.reporter.report_with(
                    ConnectionStatus::FailedToStart,
                    format!("Failed to start server: {e}"),
                );
                return Err(StartError::Bind(e));
            }
        };

        let local = listener.local_description();
        tracing::info!(listener = %local, "REPL server started");
        self.reporter.report(ConnectionStatus::AwaitingConnection);

        let cancel = CancellationToken::new();
        let ctx = SessionContext {
            evaluator: Arc::clone(&self.evaluator),
            reporter: self.reporter.clone(),
            output: self.output.clone(),
            tracker: self.tracker.clone(),
            config: self.config.clone(),
        };
        let accept_loop = tokio::spawn(accept_loop(listener, ctx, cancel.clone()));

        *state = Some(Running {
            cancel,
            accept_loop,
            local,
        });
        Ok(())
    }

    /// Stop accepting, close the current connection and publish
    /// `Disconnected`. Safe to call repeatedly; only the first call after a
    /// `start` does anything.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            tracing::debug!("Supervisor not running, stop ignored");
            return;
        };

        tracing::info!(listener = %running.local, "Stopping REPL server");
        running.cancel.cancel();
        if let Err(e) = running.accept_loop.await {
            tracing::error!(error = %e, "Accept loop panicked");
        }

        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = self.tracker.len(),
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "Evaluator tasks still running after shutdown grace period"
            );
        }
        self.tracker.reopen();

        self.reporter.report(ConnectionStatus::Disconnected);
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Listener description while running, e.g. `tcp://127.0.0.1:4040`.
    pub async fn local_description(&self) -> Option<String> {
        self.state.lock().await.as_ref().map(|r| r.local.clone())
    }

    pub fn status(&self) -> StatusEvent {
        self.reporter.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusEvent> {
        self.reporter.subscribe()
    }

    /// Handle for the evaluator's partial output.
    pub fn output_sink(&self) -> OutputSink {
        self.output.clone()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }
}

async fn accept_loop(mut listener: Box<dyn Listener>, ctx: SessionContext, cancel: CancellationToken) {
    let reporter = ctx.reporter.clone();

    loop {
        reporter.report(ConnectionStatus::WaitingForConnection);

        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let outcome = match accepted {
            Ok(accepted) => {
                let mut conn = Connection::open(accepted, &ctx, &cancel);
                let span = tracing::info_span!("session", session_id = %conn.id());
                async {
                    reporter.report(ConnectionStatus::Connected);
                    let outcome = conn.run().await;
                    if let Err(e) = &outcome {
                        reporter.report_with(
                            ConnectionStatus::ConnectionFailed,
                            format!("Connection failed - {e}"),
                        );
                    }
                    conn.teardown().await;
                    outcome
                }
                .instrument(span)
                .await
            }
            Err(e) => {
                let e = SessionError::Accept(e);
                tracing::warn!(error = %e, "Accept failed");
                reporter.report_with(
                    ConnectionStatus::ConnectionFailed,
                    format!("Connection failed - {e}"),
                );
                Err(e)
            }
        };

        if cancel.is_cancelled() || matches!(outcome, Ok(SessionEnd::Stopped)) {
            break;
        }
        if !matches!(outcome, Err(SessionError::Accept(_))) {
            reporter.report_with(
                ConnectionStatus::AwaitingConnection,
                "Client disconnected.  Waiting for new connection.",
            );
        }

        tracing::debug!(cooldown_ms = ctx.config.cooldown.as_millis() as u64, "Cooling down before next accept");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(ctx.config.cooldown) => {}
        }
    }

    drop(listener);
    tracing::debug!("Accept loop exited");
}
