//! Client side of the REPL protocol.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use schmeep_bridge::{Frame, FrameCodec, FrameError, split_blocks};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("server closed the connection")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One item of server output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Output(Bytes),
    /// The current response is finished.
    Complete,
}

pub struct ReplClient<R, W> {
    reader: FramedRead<R, FrameCodec>,
    writer: FramedWrite<W, FrameCodec>,
}

impl<S> ReplClient<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn from_stream(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl<R, W> ReplClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, FrameCodec::client()),
            writer: FramedWrite::new(writer, FrameCodec::client()),
        }
    }

    /// Send `text` as data blocks followed by EVALUATE.
    pub async fn send_expression(&mut self, text: &str) -> Result<(), ClientError> {
        self.send_data(text.as_bytes()).await?;
        self.writer.send(Frame::Evaluate).await?;
        Ok(())
    }

    /// Send data blocks without EVALUATE.
    pub async fn send_data(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        for block in split_blocks(Bytes::copy_from_slice(payload)) {
            self.writer.send(block).await?;
        }
        Ok(())
    }

    pub async fn interrupt(&mut self) -> Result<(), ClientError> {
        self.writer.send(Frame::Interrupt).await?;
        Ok(())
    }

    /// Write bytes straight to the stream, bypassing framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        let io = self.writer.get_mut();
        io.write_all(bytes).await?;
        io.flush().await?;
        Ok(())
    }

    /// Next output block or completion marker. `None` on clean EOF.
    pub async fn next_event(&mut self) -> Result<Option<ClientEvent>, ClientError> {
        loop {
            match self.reader.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Err(invalid))) => {
                    tracing::warn!(byte = invalid.byte, "Ignoring invalid frame from server");
                }
                Some(Ok(Ok(Frame::Block(payload)))) => return Ok(Some(ClientEvent::Output(payload))),
                Some(Ok(Ok(Frame::Complete))) => return Ok(Some(ClientEvent::Complete)),
                Some(Ok(Ok(other))) => {
                    tracing::warn!(frame = other.name(), "Unexpected frame from server");
                }
            }
        }
    }

    /// Collect output up to the next completion marker.
    pub async fn read_response(&mut self) -> Result<String, ClientError> {
        let mut buf = BytesMut::new();
        loop {
            match self.next_event().await? {
                Some(ClientEvent::Output(payload)) => buf.extend_from_slice(&payload),
                Some(ClientEvent::Complete) => {
                    return Ok(String::from_utf8_lossy(&buf).into_owned());
                }
                None => return Err(ClientError::Closed),
            }
        }
    }

    /// Send `text` for evaluation and wait for the whole response.
    pub async fn evaluate(&mut self, text: &str) -> Result<String, ClientError> {
        self.send_expression(text).await?;
        self.read_response().await
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader.into_inner(), self.writer.into_inner())
    }
}
