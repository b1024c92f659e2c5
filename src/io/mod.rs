//! Block-granular synchronous I/O.
//!
//! An archive file is an array of fixed-size blocks (power-of-two size,
//! 32 bytes through 1GB). The last 32 bytes of every block form a footer
//! carrying the block's type tag, its index value, the owning subfile id,
//! and a two-part checksum over the rest of the block. Reads of committed
//! blocks always verify the footer; writes stamp it and seal the
//! checksums when the block is flushed back to the device.
//!
//! I/O happens through [`IoSession`]s checked out of a bounded pool on
//! [`BlockIo`]. A session owns one block-sized scratch buffer; pointers
//! into it are valid until the session loads a different block, which
//! bumps the device-wide `pointer_version`. Consumers that cache derived
//! state key it against that version and refresh on mismatch.

use std::io;

use snafu::Snafu;

mod block;
mod checksum;
mod device;
mod session;

pub use self::block::{
    seal_block, verify_block, BlockFooter, BlockType, FOOTER_LEN, MAX_BLOCK_SIZE_LOG2,
    MIN_BLOCK_SIZE_LOG2,
};
pub use self::checksum::{block_checksum, murmur3_x64_128};
pub use self::device::{BlockDevice, FileDevice, MemoryDevice};
pub use self::session::{BlockIo, IoSession};

/// Error produced by the block I/O layer.
#[derive(Debug, Snafu)]
pub enum BlockIoError {
    /// A general I/O error occurred against the backing device.
    #[snafu(display("block I/O error: {source}"))]
    Io { source: io::Error },

    /// A committed block failed checksum verification.
    ///
    /// The block's contents are not returned to the caller; a checksum
    /// mismatch on committed data means the file is damaged.
    #[snafu(display("checksum mismatch reading block {address}"))]
    ChecksumMismatch { address: u32 },

    /// A committed block carried an unexpected type tag.
    #[snafu(display(
        "block {address} has type {actual:#04x}, expected {expected:#04x}"
    ))]
    BlockTypeMismatch {
        address: u32,
        expected: u8,
        actual: u8,
    },

    /// A committed block carried an unexpected index value in its footer.
    #[snafu(display("block {address} carries index value {actual}, expected {expected}"))]
    IndexNumberMismatch {
        address: u32,
        expected: u32,
        actual: u32,
    },

    /// A committed block carried an unexpected subfile id in its footer.
    #[snafu(display("block {address} carries subfile id {actual}, expected {expected}"))]
    FileIdMismatch {
        address: u32,
        expected: u32,
        actual: u32,
    },

    /// The bounded session pool for this device is exhausted.
    ///
    /// This is a programmer error: some component is holding more
    /// concurrent sessions than the device was configured for.
    #[snafu(display("all {limit} I/O sessions for this device are in use"))]
    NoRemainingIoSessions { limit: usize },

    /// An attempt was made to mutate a block at or below the committed
    /// frontier.
    ///
    /// Committed blocks are immutable; the shadow-copy allocator must be
    /// used to produce a writable copy above the frontier instead.
    #[snafu(display(
        "block {address} is at or below the committed frontier {frontier} and cannot be mutated"
    ))]
    ReadOnlyViolation { address: u32, frontier: u32 },

    /// A block footer carried a type tag this build does not know.
    #[snafu(display("unknown block type tag {tag:#04x}"))]
    UnknownBlockType { tag: u8 },
}

impl From<io::Error> for BlockIoError {
    fn from(source: io::Error) -> Self {
        BlockIoError::Io { source }
    }
}
