//! Backing block devices.
//!
//! A [`BlockDevice`] is a dumb array of fixed-size blocks; everything
//! transactional lives above it. Two implementations exist: a plain file
//! and an in-memory vector of blocks (the in-memory archive option). We
//! allow parameterizing the device for ease of testing as well: tests
//! that need fault injection wrap one of these.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use parking_lot::{Mutex, RwLock};

/// Generalized interface for block-granular storage.
///
/// Addresses are plain block offsets from the start of the device.
/// Devices do not interpret block contents and perform no footer
/// verification of their own.
pub trait BlockDevice: Send + Sync {
    /// The fixed block size of this device, in bytes.
    fn block_size(&self) -> u32;

    /// The number of blocks currently backed by storage.
    fn block_count(&self) -> u32;

    /// Reads one block into `buf`, which must be exactly one block long.
    ///
    /// # Errors
    ///
    /// Fails with an I/O error if the block has never been written or the
    /// underlying read fails.
    fn read_block(&self, address: u32, buf: &mut [u8]) -> io::Result<()>;

    /// Writes one block from `buf`, which must be exactly one block long.
    ///
    /// Writing past the current end of the device extends it; the gap, if
    /// any, reads back as whatever the platform gives for sparse regions.
    fn write_block(&self, address: u32, buf: &[u8]) -> io::Result<()>;

    /// Forces written blocks down to durable storage.
    fn sync_data(&self) -> io::Result<()>;
}

/// File-backed block device.
///
/// All access goes through a single seek+read/write handle guarded by a
/// mutex; the engine above is single-writer and read concurrency is
/// bounded by the session pool, so handle contention is not a concern.
pub struct FileDevice {
    file: Mutex<File>,
    path: PathBuf,
    block_size: u32,
    read_only: bool,
}

impl FileDevice {
    /// Creates a new, empty device file. Fails if the path already exists.
    pub fn create(path: &Path, block_size: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            block_size,
            read_only: false,
        })
    }

    /// Opens an existing device file.
    pub fn open(path: &Path, block_size: u32, read_only: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            block_size,
            read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        let file = self.file.lock();
        match file.metadata() {
            Ok(metadata) => (metadata.len() / u64::from(self.block_size)) as u32,
            Err(_) => 0,
        }
    }

    fn read_block(&self, address: u32, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.block_size as usize);
        let offset = u64::from(address) * u64::from(self.block_size);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn write_block(&self, address: u32, buf: &[u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.block_size as usize);
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "device opened read-only",
            ));
        }
        let offset = u64::from(address) * u64::from(self.block_size);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    fn sync_data(&self) -> io::Result<()> {
        self.file.lock().sync_data()
    }
}

/// Memory-backed block device.
///
/// Used for first-stage tables and anywhere an archive should bypass the
/// filesystem entirely. Blocks materialize zero-filled on first write.
pub struct MemoryDevice {
    blocks: RwLock<Vec<Box<[u8]>>>,
    block_size: u32,
}

impl MemoryDevice {
    pub fn new(block_size: u32) -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
            block_size,
        }
    }

    /// Total bytes currently held, counting materialized blocks only.
    pub fn allocated_bytes(&self) -> u64 {
        self.blocks.read().len() as u64 * u64::from(self.block_size)
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.blocks.read().len() as u32
    }

    fn read_block(&self, address: u32, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.block_size as usize);
        let blocks = self.blocks.read();
        match blocks.get(address as usize) {
            Some(block) => {
                buf.copy_from_slice(block);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("memory block {address} has never been written"),
            )),
        }
    }

    fn write_block(&self, address: u32, buf: &[u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.block_size as usize);
        let mut blocks = self.blocks.write();
        let index = address as usize;
        while blocks.len() <= index {
            blocks.push(vec![0u8; self.block_size as usize].into_boxed_slice());
        }
        blocks[index].copy_from_slice(buf);
        Ok(())
    }

    fn sync_data(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_round_trips_blocks() {
        let device = MemoryDevice::new(64);
        let block = vec![7u8; 64];
        device.write_block(3, &block).unwrap();
        assert_eq!(device.block_count(), 4);

        let mut out = vec![0u8; 64];
        device.read_block(3, &mut out).unwrap();
        assert_eq!(out, block);

        // The gap materialized as zeros.
        device.read_block(1, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn memory_device_rejects_unwritten_reads() {
        let device = MemoryDevice::new(64);
        let mut out = vec![0u8; 64];
        assert!(device.read_block(0, &mut out).is_err());
    }

    #[test]
    fn file_device_round_trips_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        let device = FileDevice::create(&path, 128).unwrap();

        let mut block = vec![0u8; 128];
        block[0] = 0xfe;
        block[127] = 0xef;
        device.write_block(5, &block).unwrap();
        device.sync_data().unwrap();
        assert_eq!(device.block_count(), 6);

        let mut out = vec![0u8; 128];
        device.read_block(5, &mut out).unwrap();
        assert_eq!(out, block);
    }

    #[test]
    fn file_device_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        {
            let device = FileDevice::create(&path, 64).unwrap();
            device.write_block(0, &vec![1u8; 64]).unwrap();
        }
        let device = FileDevice::open(&path, 64, true).unwrap();
        assert!(device.write_block(0, &vec![2u8; 64]).is_err());
    }
}
