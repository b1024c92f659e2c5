//! The sorted-tree engine.
//!
//! A sorted tree lives inside one subfile: virtual block 0 holds the
//! tree header (root address, root level, allocation cursor, encoding
//! definition) and every other block is a tree node. Leaves hold
//! `(key, value)` pairs through a pluggable pair encoding; interior
//! levels are always fixed-encoded `(dividing key, child address)`
//! nodes maintained by the sparse index.
//!
//! Node addresses are subfile virtual indices, so the tree rides on
//! the shadow-paged file layer: an edit session's tree mutations
//! become visible exactly when the file structure commits.

use snafu::Snafu;

use crate::file::{FileError, SubFileEditStream, SubFileReadStream};

pub(crate) mod node;

mod header;
mod scanner;
mod sequential;
mod sorted_tree;
mod sparse;
mod table;

pub use self::header::TreeHeader;
pub use self::scanner::TreeScanner;
pub use self::sequential::{SequentialTreeWriter, SortedPointStream, UnionStream, VecStream};
pub use self::sorted_tree::SortedTree;
pub use self::table::{ArchiveTable, TableEditor, TableSnapshot};

/// Error produced by the sorted-tree engine.
#[derive(Debug, Snafu)]
pub enum TreeError {
    /// The backing subfile stream failed.
    #[snafu(display("tree storage error: {source}"))]
    Storage { source: FileError },

    /// The encoding definition could not be resolved.
    #[snafu(display("tree encoding error: {source}"))]
    Encoding {
        source: crate::encoding::EncodingError,
    },

    /// An insert found the key already present.
    #[snafu(display("key already exists in tree"))]
    DuplicateKey,

    /// A remove or update did not find the key.
    #[snafu(display("key not found in tree"))]
    KeyNotFound,

    /// The block size leaves room for fewer than four fixed records.
    #[snafu(display("node capacity {capacity} is below the minimum of 4"))]
    NodeCapacityTooSmall { capacity: usize },

    /// A node failed structural validation.
    #[snafu(display("corrupt tree node at block {address}: {reason}"))]
    CorruptNode { address: u32, reason: String },

    /// The sparse index would exceed the 250-level cap.
    #[snafu(display("tree depth limit of 250 levels exceeded"))]
    TreeDepthExceeded,

    /// A key update would break the ordering of its node.
    #[snafu(display("key update would violate node ordering"))]
    OrderViolation,

    /// A mutating operation reached a read-only store.
    #[snafu(display("tree store is read-only"))]
    StoreReadOnly,

    /// A bulk-load input stream did not declare sequential ordering.
    #[snafu(display("input stream is not guaranteed sequential"))]
    NotSequential,

    /// A bulk-load input stream did not declare itself duplicate-free.
    #[snafu(display("input stream may contain duplicate keys"))]
    ContainsDuplicates,

    /// The subfile's 32-bit virtual address space is exhausted.
    #[snafu(display("tree is out of node addresses"))]
    OutOfNodeAddresses,
}

impl From<FileError> for TreeError {
    fn from(source: FileError) -> Self {
        TreeError::Storage { source }
    }
}

impl From<crate::encoding::EncodingError> for TreeError {
    fn from(source: crate::encoding::EncodingError) -> Self {
        TreeError::Encoding { source }
    }
}

/// Block-granular storage a tree runs on.
///
/// Addresses are subfile virtual indices. Implementations exist for
/// edit streams (read/write) and read streams (read-only); tests also
/// provide plain in-memory stores.
pub trait TreeStore {
    /// Usable bytes per node block.
    fn payload_size(&self) -> usize;

    /// Reads the node block at `address` into `buf`.
    fn read_block(&mut self, address: u32, buf: &mut [u8]) -> Result<(), TreeError>;

    /// Writes a full node block at `address`.
    fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), TreeError>;

    fn is_writable(&self) -> bool;
}

impl TreeStore for SubFileEditStream {
    fn payload_size(&self) -> usize {
        SubFileEditStream::payload_size(self)
    }

    fn read_block(&mut self, address: u32, buf: &mut [u8]) -> Result<(), TreeError> {
        self.read_into(address, buf).map_err(Into::into)
    }

    fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), TreeError> {
        self.write(address, data).map_err(Into::into)
    }

    fn is_writable(&self) -> bool {
        true
    }
}

impl TreeStore for SubFileReadStream {
    fn payload_size(&self) -> usize {
        SubFileReadStream::payload_size(self)
    }

    fn read_block(&mut self, address: u32, buf: &mut [u8]) -> Result<(), TreeError> {
        self.read_into(address, buf).map_err(Into::into)
    }

    fn write_block(&mut self, _address: u32, _data: &[u8]) -> Result<(), TreeError> {
        Err(TreeError::StoreReadOnly)
    }

    fn is_writable(&self) -> bool {
        false
    }
}

#[cfg(test)]
pub(crate) mod test_store {
    use super::{TreeError, TreeStore};

    /// Plain in-memory store for node-level unit tests.
    pub struct VecStore {
        blocks: Vec<Vec<u8>>,
        payload_size: usize,
    }

    impl VecStore {
        pub fn new(payload_size: usize) -> Self {
            Self {
                blocks: Vec::new(),
                payload_size,
            }
        }
    }

    impl TreeStore for VecStore {
        fn payload_size(&self) -> usize {
            self.payload_size
        }

        fn read_block(&mut self, address: u32, buf: &mut [u8]) -> Result<(), TreeError> {
            match self.blocks.get(address as usize) {
                Some(block) => {
                    buf.copy_from_slice(block);
                    Ok(())
                }
                None => {
                    buf.fill(0);
                    Ok(())
                }
            }
        }

        fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), TreeError> {
            let index = address as usize;
            while self.blocks.len() <= index {
                self.blocks.push(vec![0u8; self.payload_size]);
            }
            self.blocks[index].copy_from_slice(data);
            Ok(())
        }

        fn is_writable(&self) -> bool {
            true
        }
    }
}
