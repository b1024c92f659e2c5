//! Block footer layout and verification.
//!
//! Footer layout, offsets relative to the end of the block:
//!
//! ```text
//!   -32  block type tag     u8
//!   -31  zero padding       [u8; 3]
//!   -28  index value        u32 LE
//!   -24  subfile id         u32 LE
//!   -20  zero padding       [u8; 4]
//!   -16  checksum (64-bit)  i64 LE
//!    -8  checksum (32-bit)  i32 LE
//!    -4  zero padding       [u8; 4]
//! ```
//!
//! The checksums cover `[0, size - 16)`, which includes the first half of
//! the footer itself, so corruption of the type tag or index value is
//! caught by the checksum as well as by the field comparisons.

use byteorder::{ByteOrder, LittleEndian};

use super::{checksum::block_checksum, BlockIoError};

/// Size of the per-block footer, in bytes.
pub const FOOTER_LEN: usize = 32;

/// Smallest supported block size is `2^5` = 32 bytes.
pub const MIN_BLOCK_SIZE_LOG2: u8 = 5;
/// Largest supported block size is `2^30` = 1GB.
pub const MAX_BLOCK_SIZE_LOG2: u8 = 30;

/// Type tag stored in every block footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    /// A replica of the archive's file header block.
    FileHeader = 0,
    /// A data block belonging to a subfile.
    Data = 1,
    /// First-level indirect block: entries point at data blocks.
    IndexIndirect1 = 2,
    /// Second-level indirect block: entries point at first-level blocks.
    IndexIndirect2 = 3,
    /// Third-level indirect block.
    IndexIndirect3 = 4,
    /// Fourth-level indirect block.
    IndexIndirect4 = 5,
}

impl BlockType {
    pub fn from_tag(tag: u8) -> Result<Self, BlockIoError> {
        match tag {
            0 => Ok(BlockType::FileHeader),
            1 => Ok(BlockType::Data),
            2 => Ok(BlockType::IndexIndirect1),
            3 => Ok(BlockType::IndexIndirect2),
            4 => Ok(BlockType::IndexIndirect3),
            5 => Ok(BlockType::IndexIndirect4),
            tag => Err(BlockIoError::UnknownBlockType { tag }),
        }
    }

    /// The indirect block type for an indirection level in `1..=4`.
    pub fn indirect(level: u8) -> Self {
        match level {
            1 => BlockType::IndexIndirect1,
            2 => BlockType::IndexIndirect2,
            3 => BlockType::IndexIndirect3,
            4 => BlockType::IndexIndirect4,
            other => unreachable!("indirection level {other} out of range"),
        }
    }
}

/// The identity fields of a block footer.
///
/// For data blocks the index value is the block's virtual index within
/// its subfile and the subfile id identifies the owner. For indirect
/// blocks the index value is the base virtual index of the subtree the
/// block addresses. Header blocks use zero for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFooter {
    pub block_type: BlockType,
    pub index_value: u32,
    pub file_id: u32,
}

impl BlockFooter {
    pub fn new(block_type: BlockType, index_value: u32, file_id: u32) -> Self {
        Self {
            block_type,
            index_value,
            file_id,
        }
    }

    pub fn header() -> Self {
        Self::new(BlockType::FileHeader, 0, 0)
    }

    /// Stamps the identity fields into the footer region of `block`.
    ///
    /// The checksum slots are zeroed; [`seal_block`] fills them when the
    /// block is flushed.
    pub fn stamp(&self, block: &mut [u8]) {
        let len = block.len();
        let footer = &mut block[len - FOOTER_LEN..];
        footer.fill(0);
        footer[0] = self.block_type as u8;
        LittleEndian::write_u32(&mut footer[4..8], self.index_value);
        LittleEndian::write_u32(&mut footer[8..12], self.file_id);
    }

    /// Reads the identity fields back out of the footer region.
    pub fn read(block: &[u8]) -> Result<Self, BlockIoError> {
        let len = block.len();
        let footer = &block[len - FOOTER_LEN..];
        Ok(Self {
            block_type: BlockType::from_tag(footer[0])?,
            index_value: LittleEndian::read_u32(&footer[4..8]),
            file_id: LittleEndian::read_u32(&footer[8..12]),
        })
    }
}

/// Computes and stores the checksum halves for a fully-stamped block.
pub fn seal_block(block: &mut [u8]) {
    let len = block.len();
    let (sum64, sum32) = block_checksum(&block[..len - 16]);
    LittleEndian::write_u64(&mut block[len - 16..len - 8], sum64);
    LittleEndian::write_u32(&mut block[len - 8..len - 4], sum32);
    block[len - 4..].fill(0);
}

/// Verifies a committed block against its expected footer identity.
///
/// Checks run cheapest-signal-first: checksums, then type tag, then
/// index value, then subfile id. Any failure means the block must not be
/// returned to the caller.
pub fn verify_block(
    block: &[u8],
    address: u32,
    expected: &BlockFooter,
) -> Result<(), BlockIoError> {
    let len = block.len();
    let (sum64, sum32) = block_checksum(&block[..len - 16]);
    let stored64 = LittleEndian::read_u64(&block[len - 16..len - 8]);
    let stored32 = LittleEndian::read_u32(&block[len - 8..len - 4]);
    if sum64 != stored64 || sum32 != stored32 {
        return Err(BlockIoError::ChecksumMismatch { address });
    }

    let actual = BlockFooter::read(block)?;
    if actual.block_type != expected.block_type {
        return Err(BlockIoError::BlockTypeMismatch {
            address,
            expected: expected.block_type as u8,
            actual: actual.block_type as u8,
        });
    }
    if actual.index_value != expected.index_value {
        return Err(BlockIoError::IndexNumberMismatch {
            address,
            expected: expected.index_value,
            actual: actual.index_value,
        });
    }
    if actual.file_id != expected.file_id {
        return Err(BlockIoError::FileIdMismatch {
            address,
            expected: expected.file_id,
            actual: actual.file_id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_seal_verify_round_trip() {
        let mut block = vec![0u8; 4096];
        block[0] = 0x42;
        let footer = BlockFooter::new(BlockType::Data, 17, 3);
        footer.stamp(&mut block);
        seal_block(&mut block);
        verify_block(&block, 20, &footer).expect("sealed block must verify");
        assert_eq!(BlockFooter::read(&block).unwrap(), footer);
    }

    #[test]
    fn corruption_is_detected() {
        let mut block = vec![0u8; 256];
        let footer = BlockFooter::new(BlockType::IndexIndirect1, 0, 1);
        footer.stamp(&mut block);
        seal_block(&mut block);

        block[5] ^= 0x80;
        assert!(matches!(
            verify_block(&block, 9, &footer),
            Err(BlockIoError::ChecksumMismatch { address: 9 })
        ));
    }

    #[test]
    fn footer_mismatches_are_distinguished() {
        let mut block = vec![0u8; 256];
        let footer = BlockFooter::new(BlockType::Data, 5, 2);
        footer.stamp(&mut block);
        seal_block(&mut block);

        let wrong_type = BlockFooter::new(BlockType::IndexIndirect2, 5, 2);
        assert!(matches!(
            verify_block(&block, 1, &wrong_type),
            Err(BlockIoError::BlockTypeMismatch { .. })
        ));

        let wrong_index = BlockFooter::new(BlockType::Data, 6, 2);
        assert!(matches!(
            verify_block(&block, 1, &wrong_index),
            Err(BlockIoError::IndexNumberMismatch { .. })
        ));

        let wrong_file = BlockFooter::new(BlockType::Data, 5, 9);
        assert!(matches!(
            verify_block(&block, 1, &wrong_file),
            Err(BlockIoError::FileIdMismatch { .. })
        ));
    }

    #[test]
    fn minimum_block_size_has_room_for_footer_only() {
        let mut block = vec![0u8; 32];
        let footer = BlockFooter::header();
        footer.stamp(&mut block);
        seal_block(&mut block);
        verify_block(&block, 0, &footer).expect("32-byte block still verifies");
    }
}
