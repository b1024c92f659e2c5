//! The tree header, persisted at subfile virtual block 0.

use byteorder::{ByteOrder, LittleEndian};

use crate::encoding::EncodingDefinition;
use crate::tree::TreeError;

const TREE_HEADER_VERSION: u8 = 0;
const TREE_HEADER_LEN: usize = 14 + crate::encoding::DEFINITION_LEN;

/// Root pointer and allocation cursor of one sorted tree.
///
/// The dirty flag lives in memory only; the header is rewritten at
/// flush time whenever the root moved or blocks were allocated.
#[derive(Debug, Clone)]
pub struct TreeHeader {
    pub root_address: u32,
    pub root_level: u8,
    /// Highest virtual block index handed out within this subfile;
    /// block 0 is the header itself.
    pub last_allocated_block: u32,
    pub block_size: u32,
    pub encoding: EncodingDefinition,
    pub(crate) dirty: bool,
}

impl TreeHeader {
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Serializes into the head of a block payload.
    pub(crate) fn save_to(&self, payload: &mut [u8]) {
        payload.fill(0);
        payload[0] = TREE_HEADER_VERSION;
        payload[1] = self.root_level;
        LittleEndian::write_u32(&mut payload[2..6], self.root_address);
        LittleEndian::write_u32(&mut payload[6..10], self.last_allocated_block);
        LittleEndian::write_u32(&mut payload[10..14], self.block_size);
        self.encoding.write_to(&mut payload[14..TREE_HEADER_LEN]);
    }

    /// Parses a tree header back out of block 0.
    pub(crate) fn load_from(payload: &[u8]) -> Result<Self, TreeError> {
        if payload.len() < TREE_HEADER_LEN {
            return Err(TreeError::CorruptNode {
                address: 0,
                reason: "block too small for tree header".to_string(),
            });
        }
        if payload[0] != TREE_HEADER_VERSION {
            return Err(TreeError::CorruptNode {
                address: 0,
                reason: format!("unknown tree header version {}", payload[0]),
            });
        }
        let root_level = payload[1];
        let root_address = LittleEndian::read_u32(&payload[2..6]);
        let last_allocated_block = LittleEndian::read_u32(&payload[6..10]);
        if root_address == 0 || root_address > last_allocated_block {
            return Err(TreeError::CorruptNode {
                address: 0,
                reason: format!(
                    "root address {root_address} outside allocated range 1..={last_allocated_block}"
                ),
            });
        }
        Ok(Self {
            root_address,
            root_level,
            last_allocated_block,
            block_size: LittleEndian::read_u32(&payload[10..14]),
            encoding: EncodingDefinition::read_from(&payload[14..TREE_HEADER_LEN]),
            dirty: false,
        })
    }
}
