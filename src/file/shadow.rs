//! Copy-on-write preparation of a subfile write path.
//!
//! Before a data block can be written at some virtual position, every
//! block on the path from the subfile's indirection root down to that
//! data block must live above the frontier. The allocator walks that
//! path: absent blocks are allocated and zeroed, committed blocks are
//! copied to fresh addresses, and already-shadowed blocks only have
//! their child slot patched. When a block's slot already holds the
//! expected child, nothing above it can have changed either, so the
//! remaining levels are left untouched and their footers are not
//! re-stamped.
//!
//! Nothing here is durable until commit: rollback resets the high-water
//! mark, which forgets every address this allocator handed out.

use crate::io::{BlockFooter, BlockType, IoSession};

use super::{
    header::FileHeaderBlock,
    index::{read_entry, root_address, set_root_address, write_entry, IndexParser},
    FileError,
};

/// One-shot walker that makes a virtual position writable.
pub(crate) struct ShadowCopyAllocator<'a> {
    pub header: &'a mut FileHeaderBlock,
    pub file_index: usize,
    pub frontier: u32,
    pub session: &'a mut IoSession,
    pub copy_session: &'a mut IoSession,
    pub parser: &'a mut IndexParser,
}

impl ShadowCopyAllocator<'_> {
    /// Returns the writable physical address for `virtual_index`.
    ///
    /// On return, the data block and every indirect block on its path
    /// are above the frontier and the subfile's directory entry points
    /// at the rewritten path.
    pub fn prepare_for_write(&mut self, virtual_index: u32) -> Result<u32, FileError> {
        let subfile = self.header.subfile(self.file_index)?.clone();
        let file_id = u32::from(subfile.file_id);
        let entries_per_block = self.parser.entries_per_block();

        let position =
            self.parser
                .lookup(self.session, &subfile, self.frontier, virtual_index)?;
        let top_level = position.tier.level_count();

        // Shadow the data block itself.
        let old_data = self.parser.data_cluster_address();
        let data_footer = BlockFooter::new(BlockType::Data, virtual_index, file_id);
        let (data_address, data_changed) = if old_data == 0 {
            let address = self.header.allocate_free_blocks(1)?;
            self.session.write_to_new_block(address, &data_footer)?;
            self.session.flush()?;
            let subfile = self.header.subfile_mut(self.file_index)?;
            subfile.data_block_count += 1;
            subfile.total_block_count += 1;
            (address, true)
        } else if old_data <= self.frontier {
            let address = self.header.allocate_free_blocks(1)?;
            let src = self
                .copy_session
                .read(old_data, self.frontier, &data_footer)?;
            let dst = self.session.write_to_new_block(address, &data_footer)?;
            dst.copy_from_slice(src);
            self.session.flush()?;
            (address, true)
        } else {
            (old_data, false)
        };

        // Walk the indirect levels from the data outward, patching each
        // level's child slot as the level below moves.
        let mut child_address = data_address;
        let mut child_changed = data_changed;
        for level in 1..=top_level {
            let old_address = self.parser.level_block_address(level);
            let base_index = position.base_index_at(entries_per_block, level);
            let offset = position.offset_at(level);
            let footer = BlockFooter::new(BlockType::indirect(level), base_index, file_id);

            if old_address == 0 {
                let address = self.header.allocate_free_blocks(1)?;
                let payload = self.session.write_to_new_block(address, &footer)?;
                write_entry(payload, offset, child_address);
                self.session.flush()?;
                self.header.subfile_mut(self.file_index)?.total_block_count += 1;
                child_address = address;
                child_changed = true;
            } else if old_address <= self.frontier {
                let address = self.header.allocate_free_blocks(1)?;
                let src = self
                    .copy_session
                    .read(old_address, self.frontier, &footer)?;
                let dst = self.session.write_to_new_block(address, &footer)?;
                dst.copy_from_slice(src);
                write_entry(dst, offset, child_address);
                self.session.flush()?;
                child_address = address;
                child_changed = true;
            } else {
                if child_changed {
                    let payload =
                        self.session
                            .write_to_existing_block(old_address, self.frontier, &footer)?;
                    if read_entry(payload, offset) != child_address {
                        write_entry(payload, offset, child_address);
                    }
                    self.session.flush()?;
                }
                child_address = old_address;
                child_changed = false;
            }
        }

        // If the top of the affected chain moved, re-anchor the
        // directory entry.
        let original_root = root_address(&subfile, position.tier);
        let new_root = if top_level == 0 {
            data_address
        } else {
            child_address
        };
        if new_root != original_root {
            set_root_address(
                self.header.subfile_mut(self.file_index)?,
                position.tier,
                new_root,
            );
        }

        // Physical addresses along the path changed out from under the
        // cache.
        self.parser.clear_cache();

        Ok(data_address)
    }
}
