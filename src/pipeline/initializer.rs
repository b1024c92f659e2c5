//! Creation of on-disk archive files.
//!
//! New archives are written under a pending extension, synced, and
//! only then renamed to their final extension; a crash in between
//! leaves a pending file the recovery sweep deletes. The write path is
//! chosen across the configured directories by free/total ratio
//! (computed in floating point) after filtering out paths that could
//! not hold the estimated file plus their desired remaining space.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use uuid::Uuid;

use crate::encoding::{PairEncoding, TreeKey, TreeValue};
use crate::file::{ArchiveCreateOptions, TransactionalFileStructure};
use crate::tree::{ArchiveTable, SortedPointStream};

use super::{rollover_log::archive_path, PipelineError};

/// Default archive-file extensions.
pub const DEFAULT_FINAL_EXTENSION: &str = "d2i";
pub const DEFAULT_PENDING_EXTENSION: &str = "~d2i";

/// Free/total disk space for a directory.
///
/// Parameterized for tests; production uses [`StatvfsProbe`].
pub trait DiskSpaceProbe: Send + Sync {
    fn free_and_total(&self, path: &Path) -> io::Result<(u64, u64)>;
}

/// Platform probe backed by `statvfs`.
pub struct StatvfsProbe;

#[cfg(unix)]
impl DiskSpaceProbe for StatvfsProbe {
    fn free_and_total(&self, path: &Path) -> io::Result<(u64, u64)> {
        use std::{ffi::CString, os::unix::ffi::OsStrExt};

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let result = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        let fragment = stats.f_frsize as u64;
        Ok((stats.f_bavail as u64 * fragment, stats.f_blocks as u64 * fragment))
    }
}

#[cfg(not(unix))]
impl DiskSpaceProbe for StatvfsProbe {
    fn free_and_total(&self, _path: &Path) -> io::Result<(u64, u64)> {
        // No probe on this platform; report an unconstrained volume so
        // selection degrades to round-robin-by-ratio over equals.
        Ok((u64::MAX / 2, u64::MAX / 2))
    }
}

/// Configuration for the archive initializer.
pub struct ArchiveInitializerConfig {
    /// Candidate directories for new archive files.
    pub write_paths: Vec<PathBuf>,
    /// Bytes that must remain free on a path after writing there.
    pub desired_remaining_space: u64,
    pub pending_extension: String,
    pub final_extension: String,
    pub block_size: u32,
}

impl ArchiveInitializerConfig {
    pub fn new(write_paths: Vec<PathBuf>, block_size: u32) -> Self {
        Self {
            write_paths,
            desired_remaining_space: 0,
            pending_extension: DEFAULT_PENDING_EXTENSION.to_string(),
            final_extension: DEFAULT_FINAL_EXTENSION.to_string(),
            block_size,
        }
    }
}

/// Builds simplified (bulk-written, immediately sealed) archive files.
pub struct SimplifiedArchiveInitializer {
    config: ArchiveInitializerConfig,
    probe: Box<dyn DiskSpaceProbe>,
}

impl SimplifiedArchiveInitializer {
    pub fn new(config: ArchiveInitializerConfig) -> Self {
        Self {
            config,
            probe: Box::new(StatvfsProbe),
        }
    }

    pub fn with_probe(config: ArchiveInitializerConfig, probe: Box<dyn DiskSpaceProbe>) -> Self {
        Self { config, probe }
    }

    pub fn config(&self) -> &ArchiveInitializerConfig {
        &self.config
    }

    /// Creates a new archive file from a sorted stream.
    ///
    /// `before_rename` runs after the pending file is fully written
    /// and synced, but before it takes its final name; rollover logs
    /// are written there so the swap is recoverable from either side
    /// of the rename.
    ///
    /// # Errors
    ///
    /// Fails with `OutOfFreeSpace` when no write path can hold
    /// `estimated_size` while keeping its desired remaining space.
    pub fn create_archive_file<K, V>(
        &self,
        estimated_size: u64,
        flags: Vec<Uuid>,
        encoding: Arc<dyn PairEncoding<K, V>>,
        input: &mut dyn SortedPointStream<K, V>,
        before_rename: &mut dyn FnMut(Uuid, &Path) -> Result<(), PipelineError>,
    ) -> Result<ArchiveTable<K, V>, PipelineError>
    where
        K: TreeKey,
        V: TreeValue,
    {
        let dir = self.select_write_path(estimated_size)?;
        let archive_id = Uuid::new_v4();
        let pending = archive_path(&dir, archive_id, &self.config.pending_extension);
        let final_path = archive_path(&dir, archive_id, &self.config.final_extension);

        let structure = TransactionalFileStructure::create_file(
            &pending,
            self.config.block_size,
            ArchiveCreateOptions {
                simplified: true,
                flags,
                archive_id: Some(archive_id),
            },
        )?;

        // The builder commits (and therefore fsyncs) before returning.
        let mut table = match ArchiveTable::build_from_stream(
            structure,
            encoding,
            input,
            Some(pending.clone()),
        ) {
            Ok(table) => table,
            Err(error) => {
                // Withdraw the partial pending file; recovery would
                // sweep it anyway, but there is no reason to wait.
                if let Err(cleanup) = fs::remove_file(&pending) {
                    warn!(error = %cleanup, path = %pending.display(), "Failed to delete abandoned pending archive.");
                }
                return Err(error.into());
            }
        };

        before_rename(archive_id, &final_path)?;
        fs::rename(&pending, &final_path)?;
        table.set_path(final_path.clone());
        info!(
            archive_id = %archive_id,
            path = %final_path.display(),
            "Created archive file."
        );
        Ok(table)
    }

    /// Picks the write path with the best free/total ratio among those
    /// that can hold the file.
    fn select_write_path(&self, estimated_size: u64) -> Result<PathBuf, PipelineError> {
        let mut best: Option<(f64, &PathBuf)> = None;
        for path in &self.config.write_paths {
            let (free, total) = match self.probe.free_and_total(path) {
                Ok(space) => space,
                Err(error) => {
                    warn!(%error, path = %path.display(), "Skipping unprobeable write path.");
                    continue;
                }
            };
            let usable = free.saturating_sub(self.config.desired_remaining_space);
            if usable < estimated_size || total == 0 {
                continue;
            }
            let ratio = free as f64 / total as f64;
            let better = match best {
                None => true,
                Some((best_ratio, _)) => ratio > best_ratio,
            };
            if better {
                best = Some((ratio, path));
            }
        }

        best.map(|(_, path)| path.clone())
            .ok_or(PipelineError::OutOfFreeSpace {
                estimated_size,
                desired_remaining: self.config.desired_remaining_space,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;
    use crate::encoding::{
        historian_encodings, EncodingDefinition, HistorianKey, HistorianValue, TreeKey as _,
        TreeValue as _, HISTORIAN_DELTA_METHOD,
    };
    use crate::tree::VecStream;

    struct FakeProbe {
        space: Mutex<HashMap<PathBuf, (u64, u64)>>,
    }

    impl DiskSpaceProbe for FakeProbe {
        fn free_and_total(&self, path: &Path) -> io::Result<(u64, u64)> {
            self.space
                .lock()
                .get(path)
                .copied()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown path"))
        }
    }

    fn delta_encoding() -> Arc<dyn crate::encoding::PairEncoding<HistorianKey, HistorianValue>> {
        historian_encodings()
            .lookup(&EncodingDefinition::new(
                HistorianKey::TYPE_ID,
                HistorianValue::TYPE_ID,
                HISTORIAN_DELTA_METHOD,
            ))
            .unwrap()
    }

    #[test]
    fn selection_prefers_highest_free_ratio_and_honors_floor() {
        let a = PathBuf::from("/a");
        let b = PathBuf::from("/b");
        let probe = FakeProbe {
            space: Mutex::new(HashMap::from([
                // 50% free but small.
                (a.clone(), (500u64, 1000u64)),
                // 30% free but huge.
                (b.clone(), (3000, 10000)),
            ])),
        };
        let config = ArchiveInitializerConfig::new(vec![a.clone(), b.clone()], 4096);
        let initializer = SimplifiedArchiveInitializer::with_probe(config, Box::new(probe));

        // Both fit: the better ratio wins even though it has less
        // absolute free space.
        assert_eq!(initializer.select_write_path(100).unwrap(), a);
        // Only the big path fits this size.
        assert_eq!(initializer.select_write_path(2000).unwrap(), b);
        // Nothing fits.
        assert!(matches!(
            initializer.select_write_path(50_000),
            Err(PipelineError::OutOfFreeSpace { .. })
        ));
    }

    #[test]
    fn pending_then_final_rename_with_callback_between() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArchiveInitializerConfig::new(vec![dir.path().to_path_buf()], 4096);
        let initializer = SimplifiedArchiveInitializer::new(config);

        let records: Vec<(HistorianKey, HistorianValue)> = (0..1000)
            .map(|n| (HistorianKey::new(n, 1), HistorianValue::from_word(n)))
            .collect();
        let mut input = VecStream::from_sorted(records);

        let mut seen: Option<(Uuid, PathBuf)> = None;
        let table = initializer
            .create_archive_file(
                64 * 1024,
                vec![crate::pipeline::INTERMEDIATE_FILE],
                delta_encoding(),
                &mut input,
                &mut |id, path| {
                    // The pending file must exist at callback time, the
                    // final file must not.
                    assert!(archive_path(dir.path(), id, "~d2i").exists());
                    assert!(!path.exists());
                    seen = Some((id, path.to_path_buf()));
                    Ok(())
                },
            )
            .unwrap();

        let (id, final_path) = seen.expect("callback must run");
        assert_eq!(table.archive_id(), id);
        assert!(final_path.exists());
        assert!(!archive_path(dir.path(), id, "~d2i").exists());
        assert_eq!(table.path(), Some(final_path.as_path()));
        assert!(table.flags().contains(&crate::pipeline::INTERMEDIATE_FILE));

        // And the written file reads back.
        let snapshot = table.snapshot().unwrap();
        assert_eq!(
            snapshot.get(&HistorianKey::new(500, 1)).unwrap(),
            Some(HistorianValue::from_word(500))
        );
    }
}
