//! Transactional, shadow-paged archive files.
//!
//! An archive file is a block device wearing a versioned header block.
//! The header owns a directory of up to 64 subfiles; each subfile is a
//! logical stream of data blocks reached through up to four levels of
//! indirect blocks. All mutation happens inside a single edit session:
//! blocks at or below the committed frontier are immutable, and the
//! shadow-copy allocator produces writable copies above it, rewriting
//! the indirect path as it goes. Commit serializes the new header
//! generation over the header replicas, syncs the device, and publishes
//! the generation atomically; rollback simply forgets everything above
//! the frontier.
//!
//! Readers pin one committed generation each and verify every block
//! footer they touch. They never block the writer and the writer never
//! blocks them.

use std::io;

use snafu::Snafu;

use crate::io::BlockIoError;

mod header;
mod index;
mod shadow;
mod stream;
mod structure;
mod subfile;

pub use self::header::{FileHeaderBlock, HEADER_VERSION};
pub use self::index::{IndexPosition, IndexTier};
pub use self::stream::{SubFileEditStream, SubFileReadStream};
pub use self::structure::{
    ArchiveCreateOptions, EditSession, ReadSnapshot, TransactionalFileStructure,
};
pub use self::subfile::{SubFileFlags, SubFileHeader, SubFileName, MAX_SUBFILES};

/// Error produced by the archive-file layer.
#[derive(Debug, Snafu)]
pub enum FileError {
    /// A block-level failure: checksum, footer identity, session pool.
    #[snafu(display("block layer error: {source}"))]
    Block { source: BlockIoError },

    /// A general I/O error outside block-granular access.
    #[snafu(display("file I/O error: {source}"))]
    Io { source: io::Error },

    /// The file does not start with the archive magic string.
    #[snafu(display("not an archive file (bad magic)"))]
    InvalidMagic,

    /// The file was written on a big-endian layout.
    #[snafu(display("archive file is not little-endian"))]
    EndianMismatch,

    /// The file requires a reader newer than this build.
    #[snafu(display("archive requires reader version {version}, this build reads up to {supported}"))]
    VersionNotRecognized { version: i16, supported: i16 },

    /// The block-size exponent is outside `5..=30`.
    #[snafu(display("block size exponent {log2} is outside the supported 5..=30 range"))]
    InvalidBlockSize { log2: u8 },

    /// The serialized header does not fit in one block payload.
    #[snafu(display(
        "block size {block_size} too small: header needs {required} bytes of payload"
    ))]
    BlockSizeTooSmall { block_size: u32, required: usize },

    /// The header bytes failed structural validation.
    #[snafu(display("corrupt file header: {reason}"))]
    CorruptHeader { reason: String },

    /// A subfile with the requested name already exists.
    #[snafu(display("a subfile with this name already exists"))]
    DuplicateName,

    /// The per-file subfile directory is full.
    #[snafu(display("subfile directory is full ({limit} subfiles)"))]
    FileCountOverflow { limit: usize },

    /// No subfile matches the requested index or name.
    #[snafu(display("no such subfile"))]
    SubFileNotFound,

    /// A mutating operation hit a read-only header or structure.
    #[snafu(display("structure is read-only"))]
    ReadOnlyViolation,

    /// A second edit session was requested while one is active.
    #[snafu(display("an edit transaction is already active"))]
    TransactionAlreadyActive,

    /// Commit was requested while subfile streams remain open.
    #[snafu(display("{count} subfile stream(s) still open; dispose them before commit"))]
    StreamsStillOpen { count: usize },

    /// The 32-bit block address space is exhausted.
    #[snafu(display("file is out of block addresses"))]
    OutOfBlockAddresses,
}

impl From<BlockIoError> for FileError {
    fn from(source: BlockIoError) -> Self {
        FileError::Block { source }
    }
}

impl From<io::Error> for FileError {
    fn from(source: io::Error) -> Self {
        FileError::Io { source }
    }
}
