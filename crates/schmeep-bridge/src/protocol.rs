//! Wire protocol types.
//!
//! Every frame starts with one leading byte. Its meaning depends on the
//! direction of travel:
//!
//! | leading byte        | client → host | host → client         |
//! |---------------------|---------------|-----------------------|
//! | `1..=MAX_BLOCK_LEN` | data block    | data block            |
//! | `254`               | EVALUATE      | (invalid)             |
//! | `255`               | INTERRUPT     | EVALUATION_COMPLETE   |
//!
//! The raw byte is only looked at here. Everything above the codec works
//! with [`Frame`].

use std::fmt;

use bytes::Bytes;

/// Largest payload a single data block may carry.
///
/// Must stay below the command range so a length byte is never mistaken
/// for a command.
pub const MAX_BLOCK_LEN: usize = 253;

/// Client → host: evaluate the buffered expression.
pub const CMD_EVALUATE: u8 = 254;

/// Client → host: interrupt the running evaluation.
pub const CMD_INTERRUPT: u8 = 255;

/// Host → client: the response to one request is complete.
pub const CMD_EVALUATION_COMPLETE: u8 = 255;

/// Which way a frame travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToHost,
    HostToClient,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Self::ClientToHost => Self::HostToClient,
            Self::HostToClient => Self::ClientToHost,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToHost => f.write_str("client-to-host"),
            Self::HostToClient => f.write_str("host-to-client"),
        }
    }
}

/// One decoded wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Data block payload (never empty, at most [`MAX_BLOCK_LEN`] bytes).
    Block(Bytes),
    Evaluate,
    Interrupt,
    /// End of one response (host → client only).
    Complete,
}

impl Frame {
    pub fn block(payload: impl Into<Bytes>) -> Self {
        Self::Block(payload.into())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Block(_) => "block",
            Self::Evaluate => "evaluate",
            Self::Interrupt => "interrupt",
            Self::Complete => "complete",
        }
    }

    pub fn is_command(&self) -> bool {
        !matches!(self, Self::Block(_))
    }

    /// Leading byte for a command frame travelling in `direction`.
    ///
    /// Returns `None` for blocks and for commands that don't exist in that
    /// direction.
    pub fn command_byte(&self, direction: Direction) -> Option<u8> {
        match (self, direction) {
            (Self::Evaluate, Direction::ClientToHost) => Some(CMD_EVALUATE),
            (Self::Interrupt, Direction::ClientToHost) => Some(CMD_INTERRUPT),
            (Self::Complete, Direction::HostToClient) => Some(CMD_EVALUATION_COMPLETE),
            _ => None,
        }
    }
}

/// Leading byte that is neither a valid block length nor a command.
///
/// Recoverable: the byte is skipped and decoding continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid leading byte {byte} ({direction})")]
pub struct InvalidFrame {
    pub byte: u8,
    pub direction: Direction,
}

/// Classification of a leading byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Leading {
    /// Data block with this many payload bytes to follow.
    Block(usize),
    /// Complete single-byte frame.
    Command(Frame),
}

pub(crate) fn classify(byte: u8, direction: Direction) -> Result<Leading, InvalidFrame> {
    let len = usize::from(byte);
    match (byte, direction) {
        (1.., _) if len <= MAX_BLOCK_LEN => Ok(Leading::Block(len)),
        (CMD_EVALUATE, Direction::ClientToHost) => Ok(Leading::Command(Frame::Evaluate)),
        (CMD_INTERRUPT, Direction::ClientToHost) => Ok(Leading::Command(Frame::Interrupt)),
        (CMD_EVALUATION_COMPLETE, Direction::HostToClient) => {
            Ok(Leading::Command(Frame::Complete))
        }
        _ => Err(InvalidFrame { byte, direction }),
    }
}

/// Split `payload` into data blocks of at most [`MAX_BLOCK_LEN`] bytes.
///
/// An empty payload yields no blocks. Slicing shares the underlying buffer.
pub fn split_blocks(payload: Bytes) -> impl Iterator<Item = Frame> {
    let total = payload.len();
    (0..total)
        .step_by(MAX_BLOCK_LEN)
        .map(move |start| Frame::Block(payload.slice(start..total.min(start + MAX_BLOCK_LEN))))
}
