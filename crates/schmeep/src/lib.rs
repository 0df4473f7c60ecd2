//! schmeep: connection supervisor and protocol engine for a remote Scheme REPL.
//!
//! A client sends expressions as length-prefixed data blocks followed by an
//! EVALUATE command; the host evaluates them off the receive loop and streams
//! the result back, terminated by a completion marker. INTERRUPT is accepted
//! at any time, including mid-evaluation.
//!
//! The evaluator itself is an external collaborator behind [`Evaluator`].

pub mod assembler;
pub mod client;
pub mod completeness;
pub mod config;
pub mod dispatcher;
pub mod evaluator;
pub mod interrupt;
pub mod output;
pub mod session;
pub mod status;
pub mod streamer;
pub mod supervisor;
pub mod transport;

pub use assembler::{Assembly, ExpressionAssembler, Overflow};
pub use client::{ClientError, ClientEvent, ReplClient};
pub use completeness::is_balanced_expression;
pub use config::{IncompletePolicy, SupervisorConfig};
pub use dispatcher::{EvaluationDispatcher, EvaluationRequest};
pub use evaluator::{EvalError, Evaluator};
pub use interrupt::InterruptChannel;
pub use output::OutputSink;
pub use session::{Connection, INCOMPLETE_EXPRESSION, SessionEnd, SessionError, SessionId};
pub use status::{
    ChannelObserver, ConnectionStatus, LoggingObserver, Observer, Severity, StatusEvent,
    StatusReporter, UiEvent,
};
pub use streamer::{ResponseStreamer, StreamError};
pub use supervisor::{ConnectionSupervisor, StartError};
pub use transport::{
    Accepted, BoxedReader, BoxedWriter, Listener, MemoryConnector, MemoryTransport, Readiness,
    TcpTransport, Transport,
};
#[cfg(unix)]
pub use transport::UnixTransport;

// Re-export for users of the protocol crate
pub use schmeep_bridge as bridge;
