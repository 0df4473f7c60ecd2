//! Listening transports.
//!
//! The supervisor only needs "bind once, accept many" over an ordered,
//! reliable byte stream. Discovery, pairing and service advertisement are the
//! transport's own business.
//!
//! - **TcpTransport**: first bindable address from an ordered candidate list
//! - **UnixTransport**: filesystem socket (unix only)
//! - **MemoryTransport**: in-process duplex pipes

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::status::ConnectionStatus;

mod memory;
mod tcp;
#[cfg(unix)]
mod unix;

pub use memory::{MemoryConnector, MemoryTransport};
pub use tcp::TcpTransport;
#[cfg(unix)]
pub use unix::UnixTransport;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Whether the transport can be used at all right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotSupported,
    Disabled,
    PermissionsRequired,
}

impl Readiness {
    /// Status to publish when the transport is not ready.
    pub fn status(&self) -> Option<ConnectionStatus> {
        match self {
            Self::Ready => None,
            Self::NotSupported => Some(ConnectionStatus::NotSupported),
            Self::Disabled => Some(ConnectionStatus::Disabled),
            Self::PermissionsRequired => Some(ConnectionStatus::PermissionsRequired),
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::NotSupported => f.write_str("not supported"),
            Self::Disabled => f.write_str("disabled"),
            Self::PermissionsRequired => f.write_str("permissions required"),
        }
    }
}

/// An accepted client: both halves of its stream plus a printable peer name.
pub struct Accepted {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub peer: String,
}

impl Accepted {
    pub fn new(reader: BoxedReader, writer: BoxedWriter, peer: impl Into<String>) -> Self {
        Self {
            reader,
            writer,
            peer: peer.into(),
        }
    }

    /// Split a bidirectional stream into boxed halves.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(Box::new(reader), Box::new(writer), peer)
    }
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted").field("peer", &self.peer).finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn readiness(&self) -> Readiness {
        Readiness::Ready
    }

    /// Bind the listening socket. Called once per `start`.
    async fn bind(&self) -> io::Result<Box<dyn Listener>>;
}

/// A bound listening socket. Dropping it stops listening.
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> io::Result<Accepted>;

    fn local_description(&self) -> String;
}
