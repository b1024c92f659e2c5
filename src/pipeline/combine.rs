//! Stage-combine: periodic compaction of intermediate archives.
//!
//! Each combine stage watches the archive list for files carrying its
//! match flag plus the intermediate marker. Once enough of them exist
//! (by count or total size), they union-merge into one new archive;
//! the rollover log is written before any source is unlinked so a
//! crash at any point leaves a recoverable state.

use std::{path::PathBuf, sync::Arc, time::Duration};

use uuid::Uuid;

use crate::encoding::{PairEncoding, TreeKey, TreeValue};
use crate::tree::{ArchiveTable, SortedPointStream, UnionStream};

use super::{
    archive_list::{ArchiveList, ArchiveListEntry},
    initializer::SimplifiedArchiveInitializer,
    rollover_log::{archive_path, RolloverLogRecord, LOG_EXTENSION},
    scheduler::{RunReason, ScheduledTask},
    PipelineError, INTERMEDIATE_FILE,
};

/// Configuration of one combine stage.
#[derive(Debug, Clone)]
pub struct CombineFilesConfig {
    /// Flag the stage's input files must carry.
    pub match_flag: Uuid,
    /// Flags attached to the combined output file.
    pub output_flags: Vec<Uuid>,
    /// Combine once this many eligible files exist.
    pub combine_on_file_count: usize,
    /// Combine once eligible files total this many bytes.
    pub combine_on_file_size: u64,
    /// How often the stage re-examines the archive list.
    pub interval: Duration,
}

/// One combine stage over the archive list.
pub struct CombineFiles<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    config: CombineFilesConfig,
    archive_list: Arc<ArchiveList<K, V>>,
    initializer: Arc<SimplifiedArchiveInitializer>,
    encoding: Arc<dyn PairEncoding<K, V>>,
}

impl<K, V> CombineFiles<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    pub fn new(
        config: CombineFilesConfig,
        archive_list: Arc<ArchiveList<K, V>>,
        initializer: Arc<SimplifiedArchiveInitializer>,
        encoding: Arc<dyn PairEncoding<K, V>>,
    ) -> Self {
        Self {
            config,
            archive_list,
            initializer,
            encoding,
        }
    }

    /// Spawns the periodic task driving this stage.
    pub fn into_task(self) -> ScheduledTask {
        let interval = self.config.interval;
        ScheduledTask::spawn("stage-combine", Some(interval), move |reason| {
            if reason == RunReason::Disposing {
                return;
            }
            match self.execute() {
                Ok(true) => {}
                Ok(false) => trace!("Combine stage below thresholds; nothing to do."),
                Err(error) => error!(%error, "Combine stage failed; will retry."),
            }
        })
    }

    /// Runs one combine pass; returns whether a merge happened.
    pub fn execute(&self) -> Result<bool, PipelineError> {
        let snapshot = self.archive_list.snapshot();
        let eligible: Vec<ArchiveListEntry<K, V>> = snapshot
            .into_iter()
            .filter(|entry| {
                entry.has_flag(self.config.match_flag)
                    && entry.has_flag(INTERMEDIATE_FILE)
                    && entry.table.path().is_some()
            })
            .collect();

        let total_bytes: u64 = eligible.iter().map(|entry| entry.table.size_bytes()).sum();
        if eligible.len() < 2 {
            return Ok(false);
        }
        if eligible.len() < self.config.combine_on_file_count
            && total_bytes < self.config.combine_on_file_size
        {
            return Ok(false);
        }

        let sources: Vec<Uuid> = eligible
            .iter()
            .map(|entry| entry.table.archive_id())
            .collect();
        debug!(
            file_count = sources.len(),
            total_bytes, "Combining intermediate archives."
        );

        // Eligible entries are in list order, oldest first, which is
        // exactly the union's tie-break requirement.
        let mut streams: Vec<Box<dyn SortedPointStream<K, V> + Send>> =
            Vec::with_capacity(eligible.len());
        for entry in &eligible {
            let mut scanner = entry.table.snapshot()?.scanner()?;
            scanner.seek_first()?;
            streams.push(Box::new(scanner));
        }
        let mut union = UnionStream::new(streams)?;

        let mut log_path: Option<PathBuf> = None;
        let sources_for_log = sources.clone();
        let combined = self.initializer.create_archive_file(
            total_bytes,
            self.config.output_flags.clone(),
            Arc::clone(&self.encoding),
            &mut union,
            &mut |archive_id, final_path| {
                let dir = final_path
                    .parent()
                    .ok_or_else(|| PipelineError::Io {
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "archive path has no parent directory",
                        ),
                    })?;
                let path = archive_path(dir, archive_id, LOG_EXTENSION);
                RolloverLogRecord::new(sources_for_log.clone(), archive_id)
                    .write_to_file(&path)?;
                log_path = Some(path);
                Ok(())
            },
        )?;
        drop(union);

        // Swap the archive list in one critical section: the combined
        // file appears and the sources vanish atomically for readers
        // taking their next snapshot, and the replacement takes the
        // oldest source's position so newer tables keep shadowing it.
        let removed: Vec<Arc<ArchiveTable<K, V>>> = self.archive_list.edit().replace(
            &sources,
            Arc::new(combined),
            self.config.output_flags.clone(),
        );
        let source_paths: Vec<PathBuf> = removed
            .iter()
            .filter_map(|table| table.path().map(PathBuf::from))
            .collect();
        for table in &removed {
            table.mark_for_deletion();
        }
        drop(removed);
        drop(eligible);

        // The log may only disappear once every source file is
        // physically gone; with pinned readers still holding a source
        // open, the log stays and recovery finishes the job later.
        if let Some(log_path) = log_path {
            if source_paths.iter().all(|path| !path.exists()) {
                std::fs::remove_file(&log_path)?;
            } else {
                debug!(
                    path = %log_path.display(),
                    "Sources still pinned; leaving rollover log for recovery."
                );
            }
        }

        info!(
            file_count = sources.len(),
            total_bytes, "Combined intermediate archives."
        );
        Ok(true)
    }
}
