//! Archive tables: one sorted tree inside one archive file.
//!
//! A table owns its file structure and knows which subfile holds the
//! tree. Editing opens a transaction plus an edit stream and keeps the
//! tree header in memory until commit; snapshots pin a committed
//! generation and hand out scanners. Tables marked for deletion remove
//! their backing file when the last pinned reference drops, which is
//! what lets readers outlive a rollover that replaced them.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use uuid::Uuid;

use crate::encoding::{EncodingLibrary, PairEncoding, TreeKey, TreeValue};
use crate::file::{
    ArchiveCreateOptions, EditSession, SubFileEditStream, SubFileName,
    TransactionalFileStructure,
};

use super::{
    header::TreeHeader,
    scanner::TreeScanner,
    sequential::{SequentialTreeWriter, SortedPointStream},
    sorted_tree::SortedTree,
    TreeError,
};

/// The canonical subfile name for a point table of a key/value pair.
fn points_subfile_name<K: TreeKey, V: TreeValue>() -> SubFileName {
    SubFileName::from_table("points", K::TYPE_ID, V::TYPE_ID)
}

/// One sorted-tree table backed by an archive file.
pub struct ArchiveTable<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    structure: Arc<TransactionalFileStructure>,
    encoding: Arc<dyn PairEncoding<K, V>>,
    file_index: usize,
    path: Option<PathBuf>,
    delete_on_drop: AtomicBool,
}

impl<K, V> ArchiveTable<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    /// Creates an empty in-memory table.
    pub fn create_in_memory(
        block_size: u32,
        encoding: Arc<dyn PairEncoding<K, V>>,
    ) -> Result<Self, TreeError> {
        let structure = TransactionalFileStructure::create_in_memory(
            block_size,
            ArchiveCreateOptions {
                simplified: true,
                ..Default::default()
            },
        )?;
        Self::initialize(structure, encoding, None)
    }

    /// Creates an empty file-backed table.
    pub fn create_file(
        path: &Path,
        block_size: u32,
        encoding: Arc<dyn PairEncoding<K, V>>,
        options: ArchiveCreateOptions,
    ) -> Result<Self, TreeError> {
        let structure = TransactionalFileStructure::create_file(path, block_size, options)?;
        Self::initialize(structure, encoding, Some(path.to_path_buf()))
    }

    fn initialize(
        structure: Arc<TransactionalFileStructure>,
        encoding: Arc<dyn PairEncoding<K, V>>,
        path: Option<PathBuf>,
    ) -> Result<Self, TreeError> {
        let edit = structure.begin_edit()?;
        let file_index = edit.create_file(points_subfile_name::<K, V>())?;
        {
            let mut stream = edit.open_file(file_index)?;
            SortedTree::<K, V>::create(&mut stream, encoding.as_ref())?;
        }
        edit.commit_and_dispose()?;

        Ok(Self {
            structure,
            encoding,
            file_index,
            path,
            delete_on_drop: AtomicBool::new(false),
        })
    }

    /// Builds a table in one pass from a sorted, duplicate-free stream.
    ///
    /// This is the rollover path: the whole tree is produced by the
    /// sequential writer inside a single transaction and committed
    /// once.
    pub fn build_from_stream(
        structure: Arc<TransactionalFileStructure>,
        encoding: Arc<dyn PairEncoding<K, V>>,
        input: &mut dyn SortedPointStream<K, V>,
        path: Option<PathBuf>,
    ) -> Result<Self, TreeError> {
        let edit = structure.begin_edit()?;
        let file_index = edit.create_file(points_subfile_name::<K, V>())?;
        {
            let mut stream = edit.open_file(file_index)?;
            SequentialTreeWriter::build(&mut stream, encoding.as_ref(), input)?;
        }
        edit.commit_and_dispose()?;

        Ok(Self {
            structure,
            encoding,
            file_index,
            path,
            delete_on_drop: AtomicBool::new(false),
        })
    }

    /// Opens an existing archive file as a table, resolving its
    /// persisted encoding through `library`.
    pub fn open_file(
        path: &Path,
        library: &EncodingLibrary<K, V>,
        read_only: bool,
    ) -> Result<Self, TreeError> {
        let structure = TransactionalFileStructure::open_file(path, read_only)?;
        let snapshot = structure.snapshot();
        let file_index = snapshot
            .index_of_name(&points_subfile_name::<K, V>())
            .ok_or(TreeError::Storage {
                source: crate::file::FileError::SubFileNotFound,
            })?;

        let mut stream = snapshot.open_file(file_index)?;
        let header = SortedTree::<K, V>::open(&mut stream)?;
        let encoding = library.lookup(&header.encoding)?;

        Ok(Self {
            structure,
            encoding,
            file_index,
            path: Some(path.to_path_buf()),
            delete_on_drop: AtomicBool::new(false),
        })
    }

    pub fn archive_id(&self) -> Uuid {
        self.structure.archive_id()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn encoding(&self) -> &Arc<dyn PairEncoding<K, V>> {
        &self.encoding
    }

    /// Flag ids recorded in the archive's committed header.
    pub fn flags(&self) -> Vec<Uuid> {
        self.structure.snapshot().header().flags().to_vec()
    }

    /// Committed size of the backing file, in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.structure.committed_size_bytes()
    }

    /// Requests physical deletion once the last reference drops.
    pub fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }

    /// Records a rename of the backing file (pending extension to
    /// final extension); the open file handle survives the rename.
    pub(crate) fn set_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    /// Starts an editing transaction over this table.
    pub fn begin_edit(&self) -> Result<TableEditor<K, V>, TreeError> {
        let session = self.structure.begin_edit()?;
        let mut stream = session.open_file(self.file_index)?;
        let header = SortedTree::<K, V>::open(&mut stream)?;
        Ok(TableEditor {
            session,
            stream,
            header,
            encoding: Arc::clone(&self.encoding),
        })
    }

    /// Pins the committed generation for reading.
    pub fn snapshot(&self) -> Result<TableSnapshot<K, V>, TreeError> {
        let snapshot = self.structure.snapshot();
        let mut stream = snapshot.open_file(self.file_index)?;
        let header = SortedTree::<K, V>::open(&mut stream)?;
        drop(stream);
        Ok(TableSnapshot {
            snapshot,
            file_index: self.file_index,
            header,
            encoding: Arc::clone(&self.encoding),
        })
    }
}

impl<K, V> Drop for ArchiveTable<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            if let Some(path) = &self.path {
                if let Err(error) = std::fs::remove_file(path) {
                    warn!(%error, path = %path.display(), "Failed to delete retired archive file.");
                } else {
                    debug!(path = %path.display(), "Deleted retired archive file.");
                }
            }
        }
    }
}

/// An open editing transaction over one table.
pub struct TableEditor<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    session: EditSession,
    stream: SubFileEditStream,
    header: TreeHeader,
    encoding: Arc<dyn PairEncoding<K, V>>,
}

impl<K, V> TableEditor<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    fn tree(&mut self) -> SortedTree<'_, K, V> {
        SortedTree::attach(&mut self.stream, &mut self.header, self.encoding.as_ref())
    }

    pub fn insert(&mut self, key: &K, value: &V) -> Result<(), TreeError> {
        self.tree().insert(key, value)
    }

    pub fn get(&mut self, key: &K) -> Result<Option<V>, TreeError> {
        self.tree().get(key)
    }

    pub fn remove(&mut self, key: &K) -> Result<(), TreeError> {
        self.tree().remove(key)
    }

    pub fn update_value(&mut self, key: &K, value: &V) -> Result<(), TreeError> {
        self.tree().update_value(key, value)
    }

    /// Appends a conforming sorted stream whose keys all sort after
    /// the tree's current maximum.
    pub fn append_sequential_stream(
        &mut self,
        stream: &mut dyn SortedPointStream<K, V>,
    ) -> Result<u64, TreeError> {
        self.tree().append_sequential_stream(stream)
    }

    /// Commits the transaction, making every mutation visible to new
    /// snapshots.
    pub fn commit(mut self) -> Result<(), TreeError> {
        self.tree().flush()?;
        let TableEditor {
            session, stream, ..
        } = self;
        drop(stream);
        session.commit_and_dispose()?;
        Ok(())
    }

    /// Abandons the transaction.
    pub fn rollback(self) {
        let TableEditor {
            session, stream, ..
        } = self;
        drop(stream);
        session.rollback_and_dispose();
    }
}

/// A pinned read view over one table.
pub struct TableSnapshot<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    snapshot: crate::file::ReadSnapshot,
    file_index: usize,
    header: TreeHeader,
    encoding: Arc<dyn PairEncoding<K, V>>,
}

impl<K, V> TableSnapshot<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    pub fn tree_header(&self) -> &TreeHeader {
        &self.header
    }

    /// Opens a fresh scanner over this snapshot.
    pub fn scanner(&self) -> Result<TreeScanner<K, V>, TreeError> {
        let stream = self.snapshot.open_file(self.file_index)?;
        Ok(TreeScanner::new(
            Box::new(stream),
            self.header.clone(),
            Arc::clone(&self.encoding),
        ))
    }

    /// Point lookup within the snapshot.
    pub fn get(&self, key: &K) -> Result<Option<V>, TreeError> {
        self.scanner()?.read_single_value(key)
    }
}
