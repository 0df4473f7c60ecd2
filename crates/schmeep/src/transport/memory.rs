use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};

use super::{Accepted, Listener, Readiness, Transport};

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// In-process transport over `tokio::io::duplex` pipes.
///
/// The transport can be bound again after its listener drops, so one
/// instance survives supervisor restarts.
pub struct MemoryTransport {
    incoming: Arc<Mutex<mpsc::UnboundedReceiver<DuplexStream>>>,
    readiness: Readiness,
    bind_error: Option<io::ErrorKind>,
}

/// Dials a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
    capacity: usize,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryConnector) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            incoming: Arc::new(Mutex::new(rx)),
            readiness: Readiness::Ready,
            bind_error: None,
        };
        let connector = MemoryConnector {
            tx,
            capacity: DEFAULT_PIPE_CAPACITY,
        };
        (transport, connector)
    }

    /// Report `readiness` instead of `Ready`.
    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Make every `bind` fail with `kind`.
    pub fn with_bind_error(mut self, kind: io::ErrorKind) -> Self {
        self.bind_error = Some(kind);
        self
    }
}

impl MemoryConnector {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Open a connection. It is queued until the listener accepts it.
    pub fn connect(&self) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(self.capacity);
        self.tx.send(server).map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "memory transport dropped")
        })?;
        Ok(client)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn readiness(&self) -> Readiness {
        self.readiness
    }

    async fn bind(&self) -> io::Result<Box<dyn Listener>> {
        if let Some(kind) = self.bind_error {
            return Err(io::Error::new(kind, "memory transport bind refused"));
        }
        Ok(Box::new(MemoryListener {
            incoming: Arc::clone(&self.incoming),
            accepted: 0,
        }))
    }
}

struct MemoryListener {
    incoming: Arc<Mutex<mpsc::UnboundedReceiver<DuplexStream>>>,
    accepted: u64,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> io::Result<Accepted> {
        let stream = self.incoming.lock().await.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionAborted, "all connectors dropped")
        })?;
        self.accepted += 1;
        Ok(Accepted::from_stream(stream, format!("memory-{}", self.accepted)))
    }

    fn local_description(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connect_then_accept() {
        let (transport, connector) = MemoryTransport::new();
        let mut listener = transport.bind().await.unwrap();

        let mut client = connector.connect().unwrap();
        client.write_all(b"hi").await.unwrap();

        let mut accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.peer, "memory-1");
        let mut buf = [0u8; 2];
        accepted.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn rebind_after_listener_drop() {
        let (transport, connector) = MemoryTransport::new();
        drop(transport.bind().await.unwrap());

        let mut listener = transport.bind().await.unwrap();
        let _client = connector.connect().unwrap();
        assert!(listener.accept().await.is_ok());
    }

    #[tokio::test]
    async fn configured_failures() {
        let (transport, _connector) = MemoryTransport::new();
        let transport = transport
            .with_readiness(Readiness::PermissionsRequired)
            .with_bind_error(io::ErrorKind::AddrInUse);
        assert_eq!(transport.readiness(), Readiness::PermissionsRequired);
        let err = transport.bind().await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn connect_fails_once_transport_dropped() {
        let (transport, connector) = MemoryTransport::new();
        drop(transport);
        let err = connector.connect().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
