use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::UnixListener;

use super::{Accepted, Listener, Transport};

/// Filesystem socket transport.
///
/// A stale socket file left by a previous run is removed before binding.
/// The file is removed again when the listener drops.
#[derive(Debug, Clone)]
pub struct UnixTransport {
    path: PathBuf,
}

impl UnixTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn bind(&self) -> io::Result<Box<dyn Listener>> {
        if self.path.exists() {
            tracing::debug!(path = %self.path.display(), "Removing stale socket");
            std::fs::remove_file(&self.path)?;
        }

        let listener = UnixListener::bind(&self.path)?;
        tracing::debug!(transport_type = "unix", path = %self.path.display(), "Bound listener");

        Ok(Box::new(UnixListenerHandle {
            listener,
            path: self.path.clone(),
            accepted: 0,
        }))
    }
}

struct UnixListenerHandle {
    listener: UnixListener,
    path: PathBuf,
    accepted: u64,
}

#[async_trait]
impl Listener for UnixListenerHandle {
    async fn accept(&mut self) -> io::Result<Accepted> {
        let (stream, _) = self.listener.accept().await?;
        self.accepted += 1;
        let (reader, writer) = stream.into_split();
        Ok(Accepted::new(
            Box::new(reader),
            Box::new(writer),
            format!("unix-client-{}", self.accepted),
        ))
    }

    fn local_description(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}

impl Drop for UnixListenerHandle {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::trace!(path = %self.path.display(), "Removed socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove socket")
            }
        }
    }
}
