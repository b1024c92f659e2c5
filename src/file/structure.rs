//! The transactional file structure: snapshots and the single edit.
//!
//! One committed header generation is always published through an
//! atomic snapshot slot. Readers grab the slot and keep reading that
//! generation for as long as they hold it. The writer claims the single
//! edit slot with a compare-exchange, mutates a cloned header plus
//! freshly-allocated blocks, and either commits (serialize header
//! replicas, fsync, publish, release slot, in that order) or rolls back
//! (release the slot; everything above the frontier is forgotten).

use std::{
    fs,
    io::Read,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::io::{
    BlockDevice, BlockFooter, BlockIo, FileDevice, MemoryDevice, MAX_BLOCK_SIZE_LOG2,
    MIN_BLOCK_SIZE_LOG2,
};

use super::{
    header::FileHeaderBlock,
    index::IndexParser,
    stream::{SubFileEditStream, SubFileReadStream},
    subfile::SubFileName,
    FileError,
};

/// Creation options for a new archive file.
#[derive(Debug, Clone, Default)]
pub struct ArchiveCreateOptions {
    /// Simplified files carry a single header replica and exist for
    /// bulk-written, immediately-sealed archives and in-memory tables.
    pub simplified: bool,
    /// Flag ids recorded in the header at birth.
    pub flags: Vec<Uuid>,
    /// Archive id to stamp into the header; a fresh random id when
    /// absent. The write pipeline names files after this id, so it
    /// picks the id before the file exists.
    pub archive_id: Option<Uuid>,
}

/// State shared between a file structure and its edit sessions.
struct StructureShared {
    io: Arc<BlockIo>,
    committed: ArcSwap<FileHeaderBlock>,
    edit_active: AtomicBool,
    read_only: bool,
}

/// A transactional, shadow-paged block file.
pub struct TransactionalFileStructure {
    shared: Arc<StructureShared>,
}

impl TransactionalFileStructure {
    /// Creates a new archive backed by plain memory.
    pub fn create_in_memory(
        block_size: u32,
        options: ArchiveCreateOptions,
    ) -> Result<Arc<Self>, FileError> {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(block_size));
        Self::create_over(device, block_size, options)
    }

    /// Creates a new archive file on disk. Fails if the path exists.
    pub fn create_file(
        path: &Path,
        block_size: u32,
        options: ArchiveCreateOptions,
    ) -> Result<Arc<Self>, FileError> {
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::create(path, block_size)?);
        Self::create_over(device, block_size, options)
    }

    fn create_over(
        device: Arc<dyn BlockDevice>,
        block_size: u32,
        options: ArchiveCreateOptions,
    ) -> Result<Arc<Self>, FileError> {
        let header =
            FileHeaderBlock::create_new(block_size, options.simplified, options.flags)?
                .with_archive_id(options.archive_id);
        let io = BlockIo::new(device);
        write_header_replicas(&io, &header)?;
        io.sync_data()?;

        Ok(Arc::new(Self {
            shared: Arc::new(StructureShared {
                io,
                committed: ArcSwap::from_pointee(header),
                edit_active: AtomicBool::new(false),
                read_only: false,
            }),
        }))
    }

    /// Opens an existing archive file.
    ///
    /// The prologue (magic, endianness marker, block-size exponent) is
    /// read raw before the block device exists, because the block size
    /// itself comes from it. Corrupt header replicas are skipped with a
    /// warning as long as one replica still validates.
    pub fn open_file(path: &Path, read_only: bool) -> Result<Arc<Self>, FileError> {
        let mut prologue = [0u8; 28];
        let mut raw = fs::File::open(path)?;
        raw.read_exact(&mut prologue)?;
        drop(raw);

        if &prologue[0..26] != b"openHistorian 2.0 Archive\0" {
            return Err(FileError::InvalidMagic);
        }
        if prologue[26] != b'L' {
            return Err(FileError::EndianMismatch);
        }
        let log2 = prologue[27];
        if !(MIN_BLOCK_SIZE_LOG2..=MAX_BLOCK_SIZE_LOG2).contains(&log2) {
            return Err(FileError::InvalidBlockSize { log2 });
        }
        let block_size = 1u32 << log2;

        let device: Arc<dyn BlockDevice> =
            Arc::new(FileDevice::open(path, block_size, read_only)?);
        let io = BlockIo::new(device);

        let header = load_any_replica(&io)?;
        Ok(Arc::new(Self {
            shared: Arc::new(StructureShared {
                io,
                committed: ArcSwap::from_pointee(header),
                edit_active: AtomicBool::new(false),
                read_only,
            }),
        }))
    }

    pub fn block_size(&self) -> u32 {
        self.shared.io.block_size()
    }

    /// Usable bytes per data block.
    pub fn payload_size(&self) -> usize {
        self.shared.io.payload_size()
    }

    pub fn archive_id(&self) -> Uuid {
        self.shared.committed.load().archive_id()
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only
    }

    /// Total bytes addressed by the committed generation.
    pub fn committed_size_bytes(&self) -> u64 {
        let header = self.shared.committed.load();
        (u64::from(header.last_allocated_block()) + 1) * u64::from(header.block_size())
    }

    /// Pins the latest committed generation for reading.
    pub fn snapshot(&self) -> ReadSnapshot {
        ReadSnapshot {
            io: Arc::clone(&self.shared.io),
            header: self.shared.committed.load_full(),
        }
    }

    /// Claims the single edit slot and starts a transaction.
    ///
    /// # Errors
    ///
    /// Fails with `TransactionAlreadyActive` while another edit session
    /// exists, or `ReadOnlyViolation` on a read-only structure.
    pub fn begin_edit(&self) -> Result<EditSession, FileError> {
        if self.shared.read_only {
            return Err(FileError::ReadOnlyViolation);
        }
        if self
            .shared
            .edit_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FileError::TransactionAlreadyActive);
        }

        let committed = self.shared.committed.load_full();
        let frontier = committed.last_allocated_block();
        let editable = committed.clone_editable();

        Ok(EditSession {
            shared: Arc::clone(&self.shared),
            header: Arc::new(Mutex::new(editable)),
            frontier,
            open_streams: Arc::new(AtomicUsize::new(0)),
            resolved: false,
        })
    }
}

/// A pinned, immutable view of one committed generation.
pub struct ReadSnapshot {
    io: Arc<BlockIo>,
    header: Arc<FileHeaderBlock>,
}

impl ReadSnapshot {
    pub fn header(&self) -> &FileHeaderBlock {
        &self.header
    }

    pub fn file_count(&self) -> usize {
        self.header.file_count()
    }

    pub fn index_of_name(&self, name: &SubFileName) -> Option<usize> {
        self.header.index_of_name(name)
    }

    /// Opens a subfile for reading within this snapshot.
    pub fn open_file(&self, index: usize) -> Result<SubFileReadStream, FileError> {
        self.header.subfile(index)?;
        let session = self.io.acquire_session()?;
        let entries_per_block = (self.io.payload_size() / 4) as u32;
        Ok(SubFileReadStream::new(
            Arc::clone(&self.header),
            index,
            self.header.last_allocated_block(),
            session,
            IndexParser::new(entries_per_block),
            self.io.payload_size(),
        ))
    }

    pub fn open_file_by_name(&self, name: &SubFileName) -> Result<SubFileReadStream, FileError> {
        let index = self
            .index_of_name(name)
            .ok_or(FileError::SubFileNotFound)?;
        self.open_file(index)
    }
}

/// The single in-flight transaction over a file structure.
///
/// Dropping an unresolved session is equivalent to rollback, with a
/// warning; commit and rollback must otherwise be exhaustive on all
/// exit paths.
pub struct EditSession {
    shared: Arc<StructureShared>,
    header: Arc<Mutex<FileHeaderBlock>>,
    frontier: u32,
    open_streams: Arc<AtomicUsize>,
    resolved: bool,
}

impl EditSession {
    /// The committed high-water mark this edit observes; every block at
    /// or below it is immutable for the lifetime of the transaction.
    pub fn frontier(&self) -> u32 {
        self.frontier
    }

    pub fn file_count(&self) -> usize {
        self.header.lock().file_count()
    }

    pub fn index_of_name(&self, name: &SubFileName) -> Option<usize> {
        self.header.lock().index_of_name(name)
    }

    /// Appends a new subfile to this generation's directory.
    pub fn create_file(&self, name: SubFileName) -> Result<usize, FileError> {
        self.header.lock().create_new_file(name)
    }

    /// Opens a subfile for writing within this transaction.
    pub fn open_file(&self, index: usize) -> Result<SubFileEditStream, FileError> {
        self.header.lock().subfile(index)?;
        let session = self.shared.io.acquire_session()?;
        let copy_session = self.shared.io.acquire_session()?;
        let entries_per_block = (self.shared.io.payload_size() / 4) as u32;
        self.open_streams.fetch_add(1, Ordering::AcqRel);
        Ok(SubFileEditStream::new(
            Arc::clone(&self.header),
            index,
            self.frontier,
            session,
            copy_session,
            IndexParser::new(entries_per_block),
            Arc::clone(&self.open_streams),
            self.shared.io.payload_size(),
        ))
    }

    pub fn open_file_by_name(&self, name: &SubFileName) -> Result<SubFileEditStream, FileError> {
        let index = self
            .index_of_name(name)
            .ok_or(FileError::SubFileNotFound)?;
        self.open_file(index)
    }

    /// Atomically commits this transaction and consumes the session.
    ///
    /// Dirty data blocks were already written through their shadow
    /// copies; what remains is serializing the header generation over
    /// its replicas, forcing everything to durable storage, and then
    /// publishing the generation. The edit slot is released only after
    /// the publish, so a concurrent `begin_edit` can never observe the
    /// old generation after claiming the slot.
    ///
    /// # Errors
    ///
    /// Fails with `StreamsStillOpen` if any subfile stream from this
    /// session is still alive. On any error the transaction is rolled
    /// back.
    pub fn commit_and_dispose(mut self) -> Result<(), FileError> {
        let open = self.open_streams.load(Ordering::Acquire);
        if open > 0 {
            self.release();
            return Err(FileError::StreamsStillOpen { count: open });
        }

        let header = self.header.lock().clone().finalize_read_only();
        if let Err(error) = write_header_replicas(&self.shared.io, &header) {
            self.release();
            return Err(error);
        }
        if let Err(error) = self.shared.io.sync_data() {
            self.release();
            return Err(error.into());
        }

        debug!(
            sequence = header.snapshot_sequence_number(),
            last_allocated_block = header.last_allocated_block(),
            "Committed archive generation."
        );
        self.shared.committed.store(Arc::new(header));
        self.release();
        Ok(())
    }

    /// Discards every allocation above the frontier and consumes the
    /// session. The committed generation is untouched.
    pub fn rollback_and_dispose(mut self) {
        trace!(frontier = self.frontier, "Rolled back archive edit.");
        self.release();
    }

    fn release(&mut self) {
        if !self.resolved {
            self.resolved = true;
            self.shared.edit_active.store(false, Ordering::Release);
        }
    }
}

impl Drop for EditSession {
    fn drop(&mut self) {
        if !self.resolved {
            warn!("Edit session dropped without commit or rollback; rolling back.");
            self.release();
        }
    }
}

fn write_header_replicas(io: &Arc<BlockIo>, header: &FileHeaderBlock) -> Result<(), FileError> {
    let mut session = io.acquire_session()?;
    let footer = BlockFooter::header();
    for address in 0..header.header_block_count() {
        let payload = session.write_to_new_block(address, &footer)?;
        header.save_to(payload)?;
        session.flush()?;
    }
    Ok(())
}

fn load_any_replica(io: &Arc<BlockIo>) -> Result<FileHeaderBlock, FileError> {
    let mut session = io.acquire_session()?;
    let footer = BlockFooter::header();
    let mut last_error = None;

    // Full-mode files carry ten replicas; simplified files carry one.
    // Past the first replica we are probing, so failures are expected
    // once we run off the end of the replica run.
    for address in 0..10u32 {
        let attempt = session
            .read(address, u32::MAX - 1, &footer)
            .map_err(FileError::from)
            .and_then(FileHeaderBlock::load_from);
        match attempt {
            Ok(header) => {
                if address != 0 {
                    warn!(
                        replica = address,
                        "Primary header replica was corrupt; recovered from a later replica."
                    );
                }
                return Ok(header);
            }
            Err(error) => {
                if address == 0 {
                    debug!(%error, "Header replica 0 failed to load; probing replicas.");
                }
                last_error = Some(error);
            }
        }
        session.clear();
    }

    Err(last_error.unwrap_or(FileError::InvalidMagic))
}
