//! Block-granular subfile streams.
//!
//! A stream binds one subfile to one header generation. Read streams
//! resolve virtual indices through the indirect tree and verify every
//! committed block they touch; edit streams additionally route writes
//! through the shadow-copy allocator so that nothing at or below the
//! frontier is ever mutated.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::io::{BlockFooter, BlockType, IoSession};

use super::{
    header::FileHeaderBlock, index::IndexParser, shadow::ShadowCopyAllocator, FileError,
};

/// Read-only positioned access to one subfile of a pinned snapshot.
pub struct SubFileReadStream {
    header: Arc<FileHeaderBlock>,
    file_index: usize,
    frontier: u32,
    session: IoSession,
    parser: IndexParser,
    payload_size: usize,
}

impl SubFileReadStream {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        header: Arc<FileHeaderBlock>,
        file_index: usize,
        frontier: u32,
        session: IoSession,
        parser: IndexParser,
        payload_size: usize,
    ) -> Self {
        Self {
            header,
            file_index,
            frontier,
            session,
            parser,
            payload_size,
        }
    }

    /// Usable bytes per data block.
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn data_block_count(&self) -> u32 {
        self.header
            .subfile(self.file_index)
            .map(|subfile| subfile.data_block_count)
            .unwrap_or(0)
    }

    /// Reads the data block at `virtual_index` into `buf`.
    ///
    /// Positions that were never written read back as zeros, matching
    /// sparse-file semantics.
    pub fn read_into(&mut self, virtual_index: u32, buf: &mut [u8]) -> Result<(), FileError> {
        debug_assert_eq!(buf.len(), self.payload_size);
        let subfile = self.header.subfile(self.file_index)?;
        self.parser
            .lookup(&mut self.session, subfile, self.frontier, virtual_index)?;
        let address = self.parser.data_cluster_address();
        if address == 0 {
            buf.fill(0);
            return Ok(());
        }

        let footer = BlockFooter::new(
            BlockType::Data,
            virtual_index,
            u32::from(subfile.file_id),
        );
        let payload = self.session.read(address, self.frontier, &footer)?;
        buf.copy_from_slice(payload);
        Ok(())
    }
}

/// Writable positioned access to one subfile of the active edit.
pub struct SubFileEditStream {
    header: Arc<Mutex<FileHeaderBlock>>,
    file_index: usize,
    frontier: u32,
    session: IoSession,
    copy_session: IoSession,
    parser: IndexParser,
    open_streams: Arc<AtomicUsize>,
    payload_size: usize,
}

impl SubFileEditStream {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        header: Arc<Mutex<FileHeaderBlock>>,
        file_index: usize,
        frontier: u32,
        session: IoSession,
        copy_session: IoSession,
        parser: IndexParser,
        open_streams: Arc<AtomicUsize>,
        payload_size: usize,
    ) -> Self {
        Self {
            header,
            file_index,
            frontier,
            session,
            copy_session,
            parser,
            open_streams,
            payload_size,
        }
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn data_block_count(&self) -> u32 {
        self.header
            .lock()
            .subfile(self.file_index)
            .map(|subfile| subfile.data_block_count)
            .unwrap_or(0)
    }

    /// Reads the data block at `virtual_index`, seeing this
    /// transaction's own writes.
    pub fn read_into(&mut self, virtual_index: u32, buf: &mut [u8]) -> Result<(), FileError> {
        debug_assert_eq!(buf.len(), self.payload_size);
        let subfile = self.header.lock().subfile(self.file_index)?.clone();
        self.parser
            .lookup(&mut self.session, &subfile, self.frontier, virtual_index)?;
        let address = self.parser.data_cluster_address();
        if address == 0 {
            buf.fill(0);
            return Ok(());
        }

        let footer = BlockFooter::new(
            BlockType::Data,
            virtual_index,
            u32::from(subfile.file_id),
        );
        let payload = self.session.read(address, self.frontier, &footer)?;
        buf.copy_from_slice(payload);
        Ok(())
    }

    /// Writes a full data block at `virtual_index`.
    ///
    /// The shadow-copy allocator first makes the position writable:
    /// fresh blocks are allocated, committed blocks are copied above
    /// the frontier, and the indirect path plus directory entry are
    /// rewritten to match.
    pub fn write(&mut self, virtual_index: u32, data: &[u8]) -> Result<(), FileError> {
        debug_assert_eq!(data.len(), self.payload_size);
        let mut guard = self.header.lock();
        let file_id = u32::from(guard.subfile(self.file_index)?.file_id);

        let address = {
            let mut allocator = ShadowCopyAllocator {
                header: &mut guard,
                file_index: self.file_index,
                frontier: self.frontier,
                session: &mut self.session,
                copy_session: &mut self.copy_session,
                parser: &mut self.parser,
            };
            allocator.prepare_for_write(virtual_index)?
        };
        drop(guard);

        let footer = BlockFooter::new(BlockType::Data, virtual_index, file_id);
        let payload = self
            .session
            .write_to_existing_block(address, self.frontier, &footer)?;
        payload.copy_from_slice(data);
        Ok(())
    }

    /// Forces buffered block writes down to the device.
    pub fn flush(&mut self) -> Result<(), FileError> {
        self.session.flush()?;
        self.copy_session.flush()?;
        Ok(())
    }
}

impl Drop for SubFileEditStream {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            error!(%error, "Failed to flush subfile edit stream during drop.");
        }
        self.open_streams.fetch_sub(1, Ordering::AcqRel);
    }
}
