//! Wire protocol for schmeep host-client communication.
//!
//! A single ordered byte stream per connection carries an interleaving of
//! length-prefixed data blocks and single-byte commands.
//!
//! # Architecture
//!
//! - **protocol**: Frame variants, reserved bytes, block splitting
//! - **codec**: `tokio_util` codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;

pub use codec::{FrameCodec, FrameError};
pub use protocol::{
    CMD_EVALUATE, CMD_EVALUATION_COMPLETE, CMD_INTERRUPT, Direction, Frame, InvalidFrame,
    MAX_BLOCK_LEN, split_blocks,
};
