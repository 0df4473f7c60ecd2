use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpListener;

use super::{Accepted, Listener, Transport};

/// TCP transport over an ordered list of candidate addresses.
///
/// `bind` tries each candidate in turn and keeps the first that succeeds,
/// the same way an RFCOMM server falls back from its own service UUID to the
/// generic serial-port one.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    candidates: Vec<SocketAddr>,
}

impl TcpTransport {
    pub fn new(candidates: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            candidates: candidates.into_iter().collect(),
        }
    }

    pub fn candidates(&self) -> &[SocketAddr] {
        &self.candidates
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(&self) -> io::Result<Box<dyn Listener>> {
        let mut last_error = None;

        for addr in &self.candidates {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    tracing::debug!(transport_type = "tcp", %addr, "Bound listener");
                    return Ok(Box::new(TcpListenerHandle { listener }));
                }
                Err(e) => {
                    tracing::debug!(transport_type = "tcp", %addr, error = %e, "Bind failed, trying next address");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no listen addresses configured")
        }))
    }
}

struct TcpListenerHandle {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpListenerHandle {
    async fn accept(&mut self) -> io::Result<Accepted> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Accepted::new(Box::new(reader), Box::new(writer), peer.to_string()))
    }

    fn local_description(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("tcp://{addr}"),
            Err(_) => "tcp://(unknown)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn empty_candidate_list_fails() {
        let transport = TcpTransport::new([]);
        let err = transport.bind().await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn falls_back_to_next_candidate() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_addr = taken.local_addr().unwrap();

        let transport = TcpTransport::new([taken_addr, "127.0.0.1:0".parse().unwrap()]);
        let listener = transport.bind().await.unwrap();
        let description = listener.local_description();
        assert!(description.starts_with("tcp://127.0.0.1:"));
        assert_ne!(description, format!("tcp://{taken_addr}"));
    }

    #[tokio::test]
    async fn accepts_and_splits_stream() {
        let transport = TcpTransport::new(["127.0.0.1:0".parse().unwrap()]);
        let mut listener = transport.bind().await.unwrap();
        let addr = listener
            .local_description()
            .trim_start_matches("tcp://")
            .to_string();

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut accepted = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        accepted.writer.write_all(b"pong").await.unwrap();

        assert_eq!(&client.await.unwrap(), b"pong");
    }
}
