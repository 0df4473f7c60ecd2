//! Connection status reporting for the UI layer.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

/// Lifecycle state of the REPL service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    /// No transport hardware/stack on this device.
    NotSupported,
    /// Transport switched off (initial state before `start`).
    Disabled,
    PermissionsRequired,
    /// Listening socket could not be bound
    FailedToStart,
    /// Listening, no client has connected yet
    AwaitingConnection,
    /// Blocked in accept
    WaitingForConnection,
    Connected,
    /// Transient, nested under Connected
    Evaluating,
    ConnectionFailed,
    /// Stopped
    Disconnected,
}

/// Display classification used by the status bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Connected,
    Evaluating,
    Error,
    Warning,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSupported => "not-supported",
            Self::Disabled => "disabled",
            Self::PermissionsRequired => "permissions-required",
            Self::FailedToStart => "failed-to-start",
            Self::AwaitingConnection => "awaiting-connection",
            Self::WaitingForConnection => "waiting-for-connection",
            Self::Connected => "connected",
            Self::Evaluating => "evaluating",
            Self::ConnectionFailed => "connection-failed",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            Self::NotSupported => "Transport not supported.",
            Self::Disabled => "Transport disabled.",
            Self::PermissionsRequired => "Transport permissions required.",
            Self::FailedToStart => "Failed to start server.",
            Self::AwaitingConnection => "Server started.  Waiting for connections.",
            Self::WaitingForConnection => "Waiting for client connection.",
            Self::Connected => "Client connected.",
            Self::Evaluating => "Evaluating expression.",
            Self::ConnectionFailed => "Connection failed.",
            Self::Disconnected => "Disconnected.",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Connected => Severity::Connected,
            Self::Evaluating => Severity::Evaluating,
            Self::NotSupported | Self::Disabled | Self::FailedToStart | Self::ConnectionFailed => {
                Severity::Error
            }
            Self::PermissionsRequired
            | Self::AwaitingConnection
            | Self::WaitingForConnection
            | Self::Disconnected => Severity::Warning,
        }
    }

    /// Statuses that the supervisor never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotSupported
                | Self::Disabled
                | Self::PermissionsRequired
                | Self::FailedToStart
                | Self::Disconnected
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status transition with its human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: ConnectionStatus,
    pub message: String,
}

impl StatusEvent {
    pub fn new(status: ConnectionStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// UI collaborator. All methods default to no-ops.
pub trait Observer: Send + Sync + 'static {
    fn on_status(&self, _status: ConnectionStatus, _message: &str) {}

    /// A complete expression was received and is about to be evaluated.
    fn on_expression(&self, _expression: &str) {}

    fn on_result(&self, _expression: &str, _result: &str) {}
}

/// Events delivered by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    Status {
        status: ConnectionStatus,
        message: String,
    },
    Expression {
        expression: String,
    },
    Result {
        expression: String,
        result: String,
    },
}

/// Observer that forwards every event into an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: UiEvent) {
        // Receiver gone means nobody is displaying; not an error.
        let _ = self.tx.send(event);
    }
}

impl Observer for ChannelObserver {
    fn on_status(&self, status: ConnectionStatus, message: &str) {
        self.forward(UiEvent::Status {
            status,
            message: message.to_string(),
        });
    }

    fn on_expression(&self, expression: &str) {
        self.forward(UiEvent::Expression {
            expression: expression.to_string(),
        });
    }

    fn on_result(&self, expression: &str, result: &str) {
        self.forward(UiEvent::Result {
            expression: expression.to_string(),
            result: result.to_string(),
        });
    }
}

/// Observer that only logs. Used when there is no UI.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn on_status(&self, status: ConnectionStatus, message: &str) {
        tracing::info!(target: "schmeep::ui", %status, severity = ?status.severity(), "{}", message);
    }

    fn on_expression(&self, expression: &str) {
        tracing::info!(target: "schmeep::ui", expression = %escape_newlines(expression), "Expression received");
    }

    fn on_result(&self, expression: &str, result: &str) {
        tracing::info!(
            target: "schmeep::ui",
            expression = %escape_newlines(expression),
            result = %escape_newlines(result),
            "Result"
        );
    }
}

/// Log-friendly single-line rendering.
pub(crate) fn escape_newlines(text: &str) -> String {
    text.replace('\n', "\\n")
}

/// Publishes status transitions to the observer and to watchers.
#[derive(Clone)]
pub struct StatusReporter {
    observer: Arc<dyn Observer>,
    tx: Arc<watch::Sender<StatusEvent>>,
}

impl StatusReporter {
    pub fn new(observer: Arc<dyn Observer>) -> Self {
        let initial = StatusEvent::new(
            ConnectionStatus::Disabled,
            ConnectionStatus::Disabled.default_message(),
        );
        let (tx, _rx) = watch::channel(initial);
        Self {
            observer,
            tx: Arc::new(tx),
        }
    }

    pub fn report(&self, status: ConnectionStatus) {
        self.report_with(status, status.default_message());
    }

    pub fn report_with(&self, status: ConnectionStatus, message: impl Into<String>) {
        let event = StatusEvent::new(status, message);
        tracing::debug!(%status, message = %event.message, "Status changed");
        self.observer.on_status(status, &event.message);
        self.tx.send_replace(event);
    }

    pub fn expression(&self, expression: &str) {
        self.observer.on_expression(expression);
    }

    pub fn result(&self, expression: &str, result: &str) {
        self.observer.on_result(expression, result);
    }

    pub fn current(&self) -> StatusEvent {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}
