//! Virtual-to-physical translation through the indirect block tree.
//!
//! Every subfile addresses its data blocks by virtual index. Index 0 is
//! reached through the directory entry's `direct_block`; everything
//! else descends from one of the four indirection roots. With `E`
//! pointer entries per block, the single tier covers virtual indices
//! `1..E`, the double tier `E..E^2`, the triple tier `E^2..E^3`, and
//! the quadruple tier `E^3..E^4`: each tier starts at the first index
//! the previous tier cannot address.
//!
//! The per-level offsets come from successive division of the virtual
//! index by `E`; the occupied tier is the highest level with a non-zero
//! offset. Entries are 4-byte little-endian child addresses packed into
//! the block payload, so `E = (block_size - 32) / 4`.

use crate::io::{BlockFooter, BlockType, IoSession};

use super::{subfile::SubFileHeader, FileError};

/// Which indirection root a virtual index descends from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexTier {
    /// Virtual index 0: the directory entry's direct block.
    Immediate,
    Single,
    Double,
    Triple,
    Quadruple,
}

impl IndexTier {
    /// The number of indirect levels between the root and the data.
    pub fn level_count(self) -> u8 {
        match self {
            IndexTier::Immediate => 0,
            IndexTier::Single => 1,
            IndexTier::Double => 2,
            IndexTier::Triple => 3,
            IndexTier::Quadruple => 4,
        }
    }
}

/// The decomposed form of one virtual data-block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexPosition {
    pub virtual_index: u32,
    /// Offset within the level-1 (innermost) indirect block.
    pub offset1: u32,
    /// Offset within the level-2 indirect block.
    pub offset2: u32,
    /// Offset within the level-3 indirect block.
    pub offset3: u32,
    /// Offset within the level-4 (outermost) indirect block.
    pub offset4: u32,
    pub tier: IndexTier,
}

impl IndexPosition {
    /// Maps a virtual index to per-level offsets by successive division.
    pub fn map(entries_per_block: u32, virtual_index: u32) -> Self {
        let e = u64::from(entries_per_block);
        let i = u64::from(virtual_index);

        let offset1 = i % e;
        let rest = i / e;
        let offset2 = rest % e;
        let rest = rest / e;
        let offset3 = rest % e;
        let offset4 = rest / e;

        let tier = if offset4 > 0 {
            IndexTier::Quadruple
        } else if offset3 > 0 {
            IndexTier::Triple
        } else if offset2 > 0 {
            IndexTier::Double
        } else if offset1 > 0 {
            IndexTier::Single
        } else {
            IndexTier::Immediate
        };

        Self {
            virtual_index,
            offset1: offset1 as u32,
            offset2: offset2 as u32,
            offset3: offset3 as u32,
            offset4: offset4 as u32,
            tier,
        }
    }

    /// The offset within the level-`level` indirect block.
    pub fn offset_at(&self, level: u8) -> u32 {
        match level {
            1 => self.offset1,
            2 => self.offset2,
            3 => self.offset3,
            4 => self.offset4,
            other => unreachable!("indirection level {other} out of range"),
        }
    }

    /// Base virtual index of the level-`level` block on this path.
    ///
    /// This value is stamped into the footer of the indirect block, so
    /// a block read through the wrong path fails `IndexNumberMismatch`.
    pub fn base_index_at(&self, entries_per_block: u32, level: u8) -> u32 {
        let span = u64::from(entries_per_block).pow(u32::from(level));
        let i = u64::from(self.virtual_index);
        ((i / span) * span) as u32
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LevelCache {
    /// Physical address of the indirect block at this level (0 absent).
    block_address: u32,
    /// Base virtual index the cached entry was resolved under.
    base_index: u32,
    /// Offset the cached child was read from.
    offset: u32,
    /// Child address read from the entry slot.
    child_address: u32,
    valid: bool,
}

/// Stateful virtual-to-physical resolver for one subfile stream.
///
/// Keeps one cache entry per indirection level; a change in any
/// higher-level offset invalidates everything below it and forces a
/// re-walk from the appropriate indirection root.
pub(crate) struct IndexParser {
    entries_per_block: u32,
    levels: [LevelCache; 4],
    data_cluster_address: u32,
}

impl IndexParser {
    pub fn new(entries_per_block: u32) -> Self {
        Self {
            entries_per_block,
            levels: [LevelCache::default(); 4],
            data_cluster_address: 0,
        }
    }

    pub fn entries_per_block(&self) -> u32 {
        self.entries_per_block
    }

    /// The physical address resolved by the last lookup (0 if absent).
    pub fn data_cluster_address(&self) -> u32 {
        self.data_cluster_address
    }

    /// Physical address of the indirect block at `level` on the current
    /// path (0 if absent or level unused by the tier).
    pub fn level_block_address(&self, level: u8) -> u32 {
        let cache = self.levels[level as usize - 1];
        if cache.valid {
            cache.block_address
        } else {
            0
        }
    }

    /// Drops all cached state, forcing the next lookup to re-walk.
    pub fn clear_cache(&mut self) {
        self.levels = [LevelCache::default(); 4];
        self.data_cluster_address = 0;
    }

    /// Resolves `virtual_index` to a physical data block address.
    ///
    /// Returns 0 when the path ends early (the position has never been
    /// written). Committed blocks on the path are footer-verified
    /// against the expected indirect type and base index.
    pub fn lookup(
        &mut self,
        session: &mut IoSession,
        subfile: &SubFileHeader,
        frontier: u32,
        virtual_index: u32,
    ) -> Result<IndexPosition, FileError> {
        let position = IndexPosition::map(self.entries_per_block, virtual_index);
        let top_level = position.tier.level_count();

        if top_level == 0 {
            self.levels = [LevelCache::default(); 4];
            self.data_cluster_address = subfile.direct_block;
            return Ok(position);
        }

        let mut child = root_address(subfile, position.tier);
        let mut walked_from = top_level;

        // Reuse cached entries from the top down while the path prefix
        // is unchanged; the first divergence invalidates everything
        // below it.
        for level in (1..=top_level).rev() {
            let cache = self.levels[level as usize - 1];
            let base = position.base_index_at(self.entries_per_block, level);
            if cache.valid
                && cache.block_address == child
                && cache.base_index == base
                && cache.offset == position.offset_at(level)
            {
                child = cache.child_address;
                walked_from = level - 1;
            } else {
                break;
            }
        }

        for level in (1..=walked_from).rev() {
            if child == 0 {
                self.levels[level as usize - 1] = LevelCache::default();
                continue;
            }
            let base = position.base_index_at(self.entries_per_block, level);
            let offset = position.offset_at(level);
            let footer = BlockFooter::new(
                BlockType::indirect(level),
                base,
                u32::from(subfile.file_id),
            );
            let payload = session.read(child, frontier, &footer)?;
            let entry = read_entry(payload, offset);
            self.levels[level as usize - 1] = LevelCache {
                block_address: child,
                base_index: base,
                offset,
                child_address: entry,
                valid: true,
            };
            child = entry;
        }

        for level in top_level + 1..=4 {
            self.levels[level as usize - 1] = LevelCache::default();
        }
        self.data_cluster_address = child;
        Ok(position)
    }
}

/// The indirection root of a tier, from the directory entry.
pub(crate) fn root_address(subfile: &SubFileHeader, tier: IndexTier) -> u32 {
    match tier {
        IndexTier::Immediate => subfile.direct_block,
        IndexTier::Single => subfile.single_indirect_block,
        IndexTier::Double => subfile.double_indirect_block,
        IndexTier::Triple => subfile.triple_indirect_block,
        IndexTier::Quadruple => subfile.quadruple_indirect_block,
    }
}

pub(crate) fn set_root_address(subfile: &mut SubFileHeader, tier: IndexTier, address: u32) {
    match tier {
        IndexTier::Immediate => subfile.direct_block = address,
        IndexTier::Single => subfile.single_indirect_block = address,
        IndexTier::Double => subfile.double_indirect_block = address,
        IndexTier::Triple => subfile.triple_indirect_block = address,
        IndexTier::Quadruple => subfile.quadruple_indirect_block = address,
    }
}

pub(crate) fn read_entry(payload: &[u8], offset: u32) -> u32 {
    let at = offset as usize * 4;
    u32::from_le_bytes([
        payload[at],
        payload[at + 1],
        payload[at + 2],
        payload[at + 3],
    ])
}

pub(crate) fn write_entry(payload: &mut [u8], offset: u32, address: u32) {
    let at = offset as usize * 4;
    payload[at..at + 4].copy_from_slice(&address.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_boundaries_follow_entry_capacity() {
        let e = 1016; // 4096-byte blocks
        assert_eq!(IndexPosition::map(e, 0).tier, IndexTier::Immediate);
        assert_eq!(IndexPosition::map(e, 1).tier, IndexTier::Single);
        assert_eq!(IndexPosition::map(e, e - 1).tier, IndexTier::Single);
        assert_eq!(IndexPosition::map(e, e).tier, IndexTier::Double);
        assert_eq!(IndexPosition::map(e, e * e - 1).tier, IndexTier::Double);
        assert_eq!(IndexPosition::map(e, e * e).tier, IndexTier::Triple);
    }

    #[test]
    fn offsets_decompose_by_successive_division() {
        let e = 100;
        let position = IndexPosition::map(e, 3_040_506);
        // 3_040_506 = ((3 * 100 + 4) * 100 + 5) * 100 + 6
        assert_eq!(position.offset1, 6);
        assert_eq!(position.offset2, 5);
        assert_eq!(position.offset3, 4);
        assert_eq!(position.offset4, 3);
        assert_eq!(position.tier, IndexTier::Quadruple);
    }

    #[test]
    fn base_index_truncates_to_level_span() {
        let e = 100;
        let position = IndexPosition::map(e, 12_345);
        assert_eq!(position.base_index_at(e, 1), 12_300);
        assert_eq!(position.base_index_at(e, 2), 10_000);
        assert_eq!(position.base_index_at(e, 3), 0);
    }

    #[test]
    fn entry_read_write_round_trip() {
        let mut payload = vec![0u8; 64];
        write_entry(&mut payload, 3, 0xdead_beef);
        assert_eq!(read_entry(&payload, 3), 0xdead_beef);
        assert_eq!(read_entry(&payload, 2), 0);
    }
}
