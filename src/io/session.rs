//! I/O sessions and the bounded session pool.
//!
//! An [`IoSession`] owns one block-sized scratch buffer and the identity
//! of the block currently loaded into it. Slices returned by a session
//! borrow that buffer, so the borrow checker enforces the pointer
//! contract locally; the device-wide `pointer_version` exists for
//! consumers that cache *derived* state (decoded records, cached index
//! offsets) across calls and need to know when to refresh it.
//!
//! Invariant: a given block is mutated through at most one session at a
//! time. Sessions flush their dirty block before loading another, so any
//! block not currently loaded dirty somewhere is fully present on the
//! device.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use super::{
    block::{seal_block, verify_block, BlockFooter, FOOTER_LEN},
    BlockDevice, BlockIoError,
};

/// Default bound on concurrently checked-out sessions per device.
pub(crate) const DEFAULT_SESSION_LIMIT: usize = 8;

/// Shared I/O state for one block device.
pub struct BlockIo {
    device: Arc<dyn BlockDevice>,
    pointer_version: Arc<AtomicU64>,
    sessions_in_use: Arc<AtomicUsize>,
    session_limit: usize,
}

impl BlockIo {
    pub fn new(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        Self::with_session_limit(device, DEFAULT_SESSION_LIMIT)
    }

    pub fn with_session_limit(device: Arc<dyn BlockDevice>, session_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            device,
            pointer_version: Arc::new(AtomicU64::new(0)),
            sessions_in_use: Arc::new(AtomicUsize::new(0)),
            session_limit,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.device.block_size()
    }

    /// Usable bytes per block once the footer is excluded.
    pub fn payload_size(&self) -> usize {
        self.device.block_size() as usize - FOOTER_LEN
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// The current pointer version. Bumped whenever any session re-points
    /// its buffer at a different block.
    pub fn pointer_version(&self) -> u64 {
        self.pointer_version.load(Ordering::Acquire)
    }

    /// Checks a session out of the bounded pool.
    ///
    /// # Errors
    ///
    /// Fails with `NoRemainingIoSessions` when the configured limit of
    /// concurrent sessions is already checked out.
    pub fn acquire_session(&self) -> Result<IoSession, BlockIoError> {
        let limit = self.session_limit;
        let result = self
            .sessions_in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                if in_use < limit {
                    Some(in_use + 1)
                } else {
                    None
                }
            });
        if result.is_err() {
            return Err(BlockIoError::NoRemainingIoSessions { limit });
        }

        let block_size = self.device.block_size() as usize;
        Ok(IoSession {
            device: Arc::clone(&self.device),
            pointer_version: Arc::clone(&self.pointer_version),
            sessions_in_use: Arc::clone(&self.sessions_in_use),
            buffer: vec![0u8; block_size],
            loaded: None,
            version: self.pointer_version(),
        })
    }

    pub fn sync_data(&self) -> Result<(), BlockIoError> {
        self.device.sync_data().map_err(Into::into)
    }
}

#[derive(Debug, Clone, Copy)]
struct LoadedBlock {
    address: u32,
    footer: BlockFooter,
    writable: bool,
    dirty: bool,
}

/// One checked-out scratch buffer over a [`BlockIo`].
pub struct IoSession {
    device: Arc<dyn BlockDevice>,
    pointer_version: Arc<AtomicU64>,
    sessions_in_use: Arc<AtomicUsize>,
    buffer: Vec<u8>,
    loaded: Option<LoadedBlock>,
    version: u64,
}

impl IoSession {
    /// The address of the block currently loaded, if any.
    pub fn current_address(&self) -> Option<u32> {
        self.loaded.map(|loaded| loaded.address)
    }

    /// The pointer version this session's buffer was loaded under.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn bump_pointer_version(&self) -> u64 {
        self.pointer_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn payload_len(&self) -> usize {
        self.buffer.len() - FOOTER_LEN
    }

    /// Reads a block for inspection.
    ///
    /// Blocks at or below `frontier` are committed data and have their
    /// footer fully verified; blocks above it belong to the current edit
    /// and may not be sealed yet, so only their stamped identity is
    /// checked.
    ///
    /// # Errors
    ///
    /// Any footer verification failure (`ChecksumMismatch`,
    /// `BlockTypeMismatch`, `IndexNumberMismatch`, `FileIdMismatch`)
    /// refuses to return the block.
    pub fn read(
        &mut self,
        address: u32,
        frontier: u32,
        expected: &BlockFooter,
    ) -> Result<&[u8], BlockIoError> {
        if let Some(loaded) = self.loaded {
            if loaded.address == address && loaded.footer == *expected {
                let payload_len = self.payload_len();
                return Ok(&self.buffer[..payload_len]);
            }
        }

        self.flush()?;
        self.device.read_block(address, &mut self.buffer)?;
        self.version = self.bump_pointer_version();

        if address <= frontier {
            verify_block(&self.buffer, address, expected)?;
        } else {
            let actual = BlockFooter::read(&self.buffer)?;
            if actual != *expected {
                return Err(BlockIoError::BlockTypeMismatch {
                    address,
                    expected: expected.block_type as u8,
                    actual: actual.block_type as u8,
                });
            }
        }

        self.loaded = Some(LoadedBlock {
            address,
            footer: *expected,
            writable: false,
            dirty: false,
        });
        let payload_len = self.payload_len();
        Ok(&self.buffer[..payload_len])
    }

    /// Reserves a block for fresh writing, with no prior-content read.
    ///
    /// The buffer comes back zeroed with the footer identity stamped;
    /// the caller must fill the payload before the session flushes.
    pub fn write_to_new_block(
        &mut self,
        address: u32,
        footer: &BlockFooter,
    ) -> Result<&mut [u8], BlockIoError> {
        self.flush()?;
        self.buffer.fill(0);
        footer.stamp(&mut self.buffer);
        self.version = self.bump_pointer_version();
        self.loaded = Some(LoadedBlock {
            address,
            footer: *footer,
            writable: true,
            dirty: true,
        });
        let payload_len = self.payload_len();
        Ok(&mut self.buffer[..payload_len])
    }

    /// Acquires a writable pointer to a block written earlier in the
    /// current transaction.
    ///
    /// # Errors
    ///
    /// Fails with `ReadOnlyViolation` if `address` is at or below the
    /// committed frontier; committed blocks must be shadow-copied, not
    /// mutated.
    pub fn write_to_existing_block(
        &mut self,
        address: u32,
        frontier: u32,
        footer: &BlockFooter,
    ) -> Result<&mut [u8], BlockIoError> {
        if address <= frontier {
            return Err(BlockIoError::ReadOnlyViolation { address, frontier });
        }

        let already_loaded = match self.loaded {
            Some(loaded) => loaded.address == address,
            None => false,
        };
        if !already_loaded {
            self.flush()?;
            self.device.read_block(address, &mut self.buffer)?;
            self.version = self.bump_pointer_version();
        }

        footer.stamp(&mut self.buffer);
        self.loaded = Some(LoadedBlock {
            address,
            footer: *footer,
            writable: true,
            dirty: true,
        });
        let payload_len = self.payload_len();
        Ok(&mut self.buffer[..payload_len])
    }

    /// Seals and writes back the loaded block if it is dirty.
    pub fn flush(&mut self) -> Result<(), BlockIoError> {
        if let Some(loaded) = &mut self.loaded {
            if loaded.dirty {
                seal_block(&mut self.buffer);
                self.device.write_block(loaded.address, &self.buffer)?;
                loaded.dirty = false;
            }
        }
        Ok(())
    }

    /// Drops the loaded block without writing it back.
    pub fn clear(&mut self) {
        self.loaded = None;
    }
}

impl Drop for IoSession {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            error!(%error, "Failed to flush I/O session during drop.");
        }
        self.sessions_in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{BlockType, MemoryDevice};

    fn io_over_memory(block_size: u32) -> Arc<BlockIo> {
        BlockIo::new(Arc::new(MemoryDevice::new(block_size)))
    }

    #[test]
    fn session_pool_is_bounded() {
        let io = BlockIo::with_session_limit(Arc::new(MemoryDevice::new(64)), 2);
        let first = io.acquire_session().unwrap();
        let _second = io.acquire_session().unwrap();
        assert!(matches!(
            io.acquire_session(),
            Err(BlockIoError::NoRemainingIoSessions { limit: 2 })
        ));

        drop(first);
        io.acquire_session().expect("slot freed on drop");
    }

    #[test]
    fn fresh_write_then_committed_read_verifies() {
        let io = io_over_memory(256);
        let footer = BlockFooter::new(BlockType::Data, 4, 1);
        {
            let mut session = io.acquire_session().unwrap();
            let payload = session.write_to_new_block(10, &footer).unwrap();
            payload[0] = 0xaa;
            session.flush().unwrap();
        }

        let mut session = io.acquire_session().unwrap();
        // Treat block 10 as committed; verification must pass.
        let payload = session.read(10, 10, &footer).unwrap();
        assert_eq!(payload[0], 0xaa);
        assert_eq!(payload.len(), 256 - FOOTER_LEN);
    }

    #[test]
    fn committed_blocks_cannot_be_reacquired_writable() {
        let io = io_over_memory(64);
        let footer = BlockFooter::new(BlockType::Data, 0, 1);
        let mut session = io.acquire_session().unwrap();
        session.write_to_new_block(3, &footer).unwrap();
        session.flush().unwrap();

        assert!(matches!(
            session.write_to_existing_block(3, 5, &footer),
            Err(BlockIoError::ReadOnlyViolation {
                address: 3,
                frontier: 5
            })
        ));
    }

    #[test]
    fn uncommitted_blocks_can_be_rewritten() {
        let io = io_over_memory(64);
        let footer = BlockFooter::new(BlockType::Data, 0, 1);
        let mut session = io.acquire_session().unwrap();
        let payload = session.write_to_new_block(7, &footer).unwrap();
        payload[1] = 1;
        session.flush().unwrap();

        let payload = session.write_to_existing_block(7, 2, &footer).unwrap();
        assert_eq!(payload[1], 1);
        payload[2] = 2;
        session.flush().unwrap();

        let payload = session.read(7, 0, &footer).unwrap();
        assert_eq!(&payload[1..3], &[1, 2]);
    }

    #[test]
    fn pointer_version_bumps_on_reload() {
        let io = io_over_memory(64);
        let footer_a = BlockFooter::new(BlockType::Data, 0, 1);
        let footer_b = BlockFooter::new(BlockType::Data, 1, 1);
        let mut session = io.acquire_session().unwrap();
        session.write_to_new_block(1, &footer_a).unwrap();
        let v1 = session.version();
        session.write_to_new_block(2, &footer_b).unwrap();
        assert!(session.version() > v1);
    }
}
