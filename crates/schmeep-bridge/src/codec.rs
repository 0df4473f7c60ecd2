//! Framed codec for the REPL byte stream.
//!
//! Works over any AsyncRead/AsyncWrite (RFCOMM sockets, TCP, pipes).
//! Partial reads are absorbed by the `FramedRead` buffer: a data block is
//! only yielded once all of its payload bytes have arrived.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{Direction, Frame, InvalidFrame, Leading, MAX_BLOCK_LEN, classify};

/// Fatal codec errors. These end the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed while reading data block ({received} of {expected} bytes)")]
    ConnectionClosed { expected: usize, received: usize },

    #[error("block length {0} outside 1..={MAX_BLOCK_LEN}")]
    InvalidBlockLength(usize),

    #[error("{frame} frame cannot be sent {direction}")]
    Unencodable {
        frame: &'static str,
        direction: Direction,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Codec for one side of a connection.
///
/// Decodes frames arriving from the peer and encodes frames going to it.
/// Invalid leading bytes are yielded as `Err(InvalidFrame)` items rather
/// than codec errors, so the framed stream keeps running after line noise.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    inbound: Direction,
}

impl FrameCodec {
    /// Host side: reads client commands, writes responses.
    pub fn host() -> Self {
        Self {
            inbound: Direction::ClientToHost,
        }
    }

    /// Client side: reads responses, writes client commands.
    pub fn client() -> Self {
        Self {
            inbound: Direction::HostToClient,
        }
    }

    pub fn inbound(&self) -> Direction {
        self.inbound
    }

    pub fn outbound(&self) -> Direction {
        self.inbound.reverse()
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Frame, InvalidFrame>;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&leading) = src.first() else {
            return Ok(None);
        };

        match classify(leading, self.inbound) {
            Err(invalid) => {
                src.advance(1);
                Ok(Some(Err(invalid)))
            }
            Ok(Leading::Command(frame)) => {
                src.advance(1);
                Ok(Some(Ok(frame)))
            }
            Ok(Leading::Block(len)) => {
                if src.len() < 1 + len {
                    src.reserve(1 + len - src.len());
                    return Ok(None);
                }
                src.advance(1);
                let payload = src.split_to(len).freeze();
                tracing::trace!(len, "Decoded data block");
                Ok(Some(Ok(Frame::Block(payload))))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed {
                expected: usize::from(src[0]),
                received: src.len() - 1,
            }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let direction = self.outbound();
        match frame {
            Frame::Block(payload) => {
                let len = payload.len();
                if len == 0 || len > MAX_BLOCK_LEN {
                    return Err(FrameError::InvalidBlockLength(len));
                }
                dst.reserve(1 + len);
                // Checked above: len fits in the block-length range.
                dst.put_u8(len as u8);
                dst.extend_from_slice(&payload);
                tracing::trace!(len, "Encoded data block");
            }
            command => {
                let byte = command
                    .command_byte(direction)
                    .ok_or(FrameError::Unencodable {
                        frame: command.name(),
                        direction,
                    })?;
                dst.put_u8(byte);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    use crate::protocol::split_blocks;

    fn decode_all(codec: &mut FrameCodec, bytes: &[u8]) -> Vec<Result<Frame, InvalidFrame>> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn decodes_blocks_and_commands() {
        let mut codec = FrameCodec::host();
        let mut wire = vec![4];
        wire.extend_from_slice(b"(+ 1");
        wire.push(3);
        wire.extend_from_slice(b" 2)");
        wire.push(254);
        wire.push(255);

        let frames = decode_all(&mut codec, &wire);
        assert_eq!(
            frames,
            vec![
                Ok(Frame::block("(+ 1")),
                Ok(Frame::block(" 2)")),
                Ok(Frame::Evaluate),
                Ok(Frame::Interrupt),
            ]
        );
    }

    #[test]
    fn waits_for_full_block() {
        let mut codec = FrameCodec::host();
        let mut buf = BytesMut::from(&[4u8, b'a', b'b'][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3, "partial block must stay buffered");

        buf.extend_from_slice(b"cd");
        let frame = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(frame, Frame::block("abcd"));
        assert!(buf.is_empty());
    }

    #[test]
    fn invalid_byte_is_recoverable() {
        let mut codec = FrameCodec::host();
        let frames = decode_all(&mut codec, &[0, 2, b'o', b'k', 254]);
        assert_eq!(
            frames,
            vec![
                Err(InvalidFrame {
                    byte: 0,
                    direction: Direction::ClientToHost
                }),
                Ok(Frame::block("ok")),
                Ok(Frame::Evaluate),
            ]
        );
    }

    #[test]
    fn client_side_sees_completion_marker() {
        let mut codec = FrameCodec::client();
        let frames = decode_all(&mut codec, &[2, b'3', b'\n', 255, 254]);
        assert_eq!(frames[0], Ok(Frame::block("3\n")));
        assert_eq!(frames[1], Ok(Frame::Complete));
        assert!(frames[2].is_err());
    }

    #[test]
    fn eof_inside_block_is_connection_closed() {
        let mut codec = FrameCodec::host();
        let mut buf = BytesMut::from(&[10u8, b'a', b'b', b'c'][..]);
        match codec.decode_eof(&mut buf) {
            Err(FrameError::ConnectionClosed { expected, received }) => {
                assert_eq!(expected, 10);
                assert_eq!(received, 3);
            }
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[test]
    fn eof_on_boundary_is_clean() {
        let mut codec = FrameCodec::host();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encodes_response_frames() {
        let mut codec = FrameCodec::host();
        let mut buf = BytesMut::new();
        codec.encode(Frame::block("3\n"), &mut buf).unwrap();
        codec.encode(Frame::Complete, &mut buf).unwrap();
        assert_eq!(&buf[..], &[2, b'3', b'\n', 255]);
    }

    #[test]
    fn rejects_frames_that_do_not_exist_in_direction() {
        let mut codec = FrameCodec::host();
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(Frame::Evaluate, &mut buf),
            Err(FrameError::Unencodable {
                frame: "evaluate",
                ..
            })
        ));
        assert!(matches!(
            codec.encode(Frame::block(Bytes::new()), &mut buf),
            Err(FrameError::InvalidBlockLength(0))
        ));
        assert!(matches!(
            codec.encode(Frame::block(vec![0u8; 254]), &mut buf),
            Err(FrameError::InvalidBlockLength(254))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn block_roundtrip_across_sizes() {
        for n in [0usize, 1, 254, 255, 600] {
            let payload: Vec<u8> = (0..n).map(|i| (i * 7 % 251) as u8).collect();

            let mut host = FrameCodec::host();
            let mut wire = BytesMut::new();
            for frame in split_blocks(Bytes::from(payload.clone())) {
                host.encode(frame, &mut wire).unwrap();
            }

            let mut client = FrameCodec::client();
            let mut decoded = Vec::new();
            while let Some(item) = client.decode(&mut wire).unwrap() {
                match item.unwrap() {
                    Frame::Block(b) => decoded.extend_from_slice(&b),
                    other => panic!("unexpected {other:?}"),
                }
            }
            assert_eq!(decoded, payload, "payload of {n} bytes");
        }
    }

    #[tokio::test]
    async fn framed_read_survives_fragmented_stream() {
        let (mut tx, rx) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in [&[8u8, b'('][..], b"displ", b"ay", &[0, 254][..]] {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut framed = FramedRead::new(rx, FrameCodec::host());
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            Ok(Frame::block("(display"))
        );
        assert!(framed.next().await.unwrap().unwrap().is_err());
        assert_eq!(framed.next().await.unwrap().unwrap(), Ok(Frame::Evaluate));
        writer.await.unwrap();
        assert!(framed.next().await.is_none());
    }
}
