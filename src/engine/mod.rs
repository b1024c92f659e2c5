//! The write processor: the assembled write pipeline.
//!
//! Composes the pre-buffer, first-stage writer, archive list, combine
//! stages, and transaction tracker behind one handle. Construction
//! runs crash recovery over the archive directories and re-attaches
//! every surviving archive; shutdown stops intake, drains the
//! pre-buffer, forces a final rollover to disk, and lets the combine
//! stages finish in place.

use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use crate::encoding::{EncodingLibrary, PairEncoding, TreeKey, TreeValue};
use crate::pipeline::{
    recover_directory, ArchiveInitializerConfig, ArchiveList, CombineFiles, CombineFilesConfig,
    FirstStageConfig, FirstStageConfigBuilder, FirstStageWriter, PipelineError, PreBufferConfig,
    PreBufferConfigBuilder, PreBufferWriter, ScheduledTask, SimplifiedArchiveInitializer,
    TransactionTracker, INTERMEDIATE_FILE, STAGE_1, STAGE_2, STAGE_3,
};
use crate::tree::{ArchiveTable, SortedPointStream, UnionStream};

/// Full pipeline configuration.
pub struct WriteProcessorConfig {
    pub prebuffer: PreBufferConfig,
    pub first_stage: FirstStageConfig,
    pub initializer: ArchiveInitializerConfig,
    pub combine_stages: Vec<CombineFilesConfig>,
}

impl WriteProcessorConfig {
    /// A default single-directory configuration.
    ///
    /// The cascading-merge thresholds and the two combine stages
    /// mirror the historical defaults; all of them are plain fields
    /// for callers that need different shapes.
    pub fn with_archive_directory(directory: PathBuf) -> Result<Self, PipelineError> {
        let prebuffer = PreBufferConfigBuilder::default()
            .build()
            .map_err(invalid_config)?;
        let first_stage = FirstStageConfigBuilder::default()
            .build()
            .map_err(invalid_config)?;
        let initializer =
            ArchiveInitializerConfig::new(vec![directory], first_stage.block_size);
        let combine_stages = vec![
            CombineFilesConfig {
                match_flag: STAGE_1,
                output_flags: vec![INTERMEDIATE_FILE, STAGE_2],
                combine_on_file_count: 10,
                combine_on_file_size: 100 * 1024 * 1024,
                interval: Duration::from_secs(10),
            },
            CombineFilesConfig {
                match_flag: STAGE_2,
                output_flags: vec![STAGE_3],
                combine_on_file_count: 10,
                combine_on_file_size: 1024 * 1024 * 1024,
                interval: Duration::from_secs(60),
            },
        ];
        Ok(Self {
            prebuffer,
            first_stage,
            initializer,
            combine_stages,
        })
    }
}

fn invalid_config(source: crate::pipeline::BuildError) -> PipelineError {
    PipelineError::Io {
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, source.to_string()),
    }
}

/// The top-level write pipeline handle.
pub struct WriteProcessor<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    prebuffer: PreBufferWriter<K, V>,
    first_stage: Arc<FirstStageWriter<K, V>>,
    archive_list: Arc<ArchiveList<K, V>>,
    tracker: Arc<TransactionTracker>,
    combine_tasks: Vec<ScheduledTask>,
}

impl<K, V> WriteProcessor<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    /// Builds the pipeline: recovery scan, archive re-attachment,
    /// background tasks.
    ///
    /// `encoding` is used for every table the pipeline creates;
    /// `library` resolves the encodings of archives found on disk.
    pub fn new(
        config: WriteProcessorConfig,
        encoding: Arc<dyn PairEncoding<K, V>>,
        library: &EncodingLibrary<K, V>,
    ) -> Result<Self, PipelineError> {
        let archive_list = ArchiveList::new();

        for directory in &config.initializer.write_paths {
            fs::create_dir_all(directory)?;
            let report = recover_directory(
                directory,
                &config.initializer.final_extension,
                &config.initializer.pending_extension,
            )?;
            if report != Default::default() {
                info!(
                    directory = %directory.display(),
                    finished = report.finished_rollovers,
                    cancelled = report.cancelled_rollovers,
                    pending_deleted = report.pending_files_deleted,
                    "Recovered archive directory."
                );
            }

            // Attach oldest files first; list order is what breaks
            // ties when the same key exists in several archives.
            let mut found = Vec::new();
            for entry in fs::read_dir(directory)? {
                let entry = entry?;
                let path = entry.path();
                let is_archive = path
                    .extension()
                    .and_then(|extension| extension.to_str())
                    .is_some_and(|extension| extension == config.initializer.final_extension);
                if !is_archive {
                    continue;
                }
                let modified = entry
                    .metadata()
                    .and_then(|metadata| metadata.modified())
                    .unwrap_or(std::time::UNIX_EPOCH);
                found.push((modified, path));
            }
            found.sort();

            for (_, path) in found {
                match ArchiveTable::<K, V>::open_file(&path, library, true) {
                    Ok(table) => {
                        let flags = table.flags();
                        debug!(path = %path.display(), "Re-attached archive file.");
                        archive_list.edit().add(Arc::new(table), flags);
                    }
                    Err(error) => {
                        warn!(%error, path = %path.display(), "Skipping unreadable archive file.");
                    }
                }
            }
        }

        let tracker = Arc::new(TransactionTracker::new());
        let initializer = Arc::new(SimplifiedArchiveInitializer::new(config.initializer));
        let first_stage = FirstStageWriter::new(
            config.first_stage,
            Arc::clone(&encoding),
            Arc::clone(&archive_list),
            Arc::clone(&initializer),
            Arc::clone(&tracker),
        );

        let combine_tasks = config
            .combine_stages
            .into_iter()
            .map(|stage_config| {
                CombineFiles::new(
                    stage_config,
                    Arc::clone(&archive_list),
                    Arc::clone(&initializer),
                    Arc::clone(&encoding),
                )
                .into_task()
            })
            .collect();

        let prebuffer = PreBufferWriter::new(config.prebuffer, Arc::clone(&first_stage));

        Ok(Self {
            prebuffer,
            first_stage,
            archive_list,
            tracker,
            combine_tasks,
        })
    }

    /// Submits one point; returns its transaction id.
    pub fn write(&mut self, key: K, value: V) -> Result<i64, PipelineError> {
        self.prebuffer.write(key, value)
    }

    /// Forces an eager drain of the pre-buffer.
    pub fn request_drain(&self) {
        self.prebuffer.request_drain();
    }

    pub fn archive_list(&self) -> &Arc<ArchiveList<K, V>> {
        &self.archive_list
    }

    pub fn first_stage(&self) -> &Arc<FirstStageWriter<K, V>> {
        &self.first_stage
    }

    pub fn soft_commit_watermark(&self) -> i64 {
        self.tracker.soft_commit_watermark()
    }

    pub fn hard_commit_watermark(&self) -> i64 {
        self.tracker.hard_commit_watermark()
    }

    /// Blocks until `transaction_id` is visible to readers.
    pub fn wait_for_soft_commit(&self, transaction_id: i64) {
        self.tracker.wait_for_soft_commit(transaction_id);
    }

    /// Blocks until `transaction_id` is durable on disk.
    pub fn wait_for_hard_commit(&self, transaction_id: i64) {
        self.tracker.wait_for_hard_commit(transaction_id);
    }

    pub fn tracker(&self) -> &Arc<TransactionTracker> {
        &self.tracker
    }

    /// Reads the newest value stored under `key` across all attached
    /// tables.
    pub fn read_single_value(&self, key: &K) -> Result<Option<V>, PipelineError> {
        // Newest table wins; the list is ordered oldest first.
        for entry in self.archive_list.snapshot().into_iter().rev() {
            if let Some(value) = entry.table.snapshot()?.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Reads every pair in `[start, end)` across all attached tables,
    /// in ascending key order with newest-table-wins de-duplication.
    pub fn read_range(&self, start: &K, end: &K) -> Result<Vec<(K, V)>, PipelineError> {
        let snapshot = self.archive_list.snapshot();
        let mut streams: Vec<Box<dyn SortedPointStream<K, V> + Send>> =
            Vec::with_capacity(snapshot.len());
        for entry in &snapshot {
            let mut scanner = entry.table.snapshot()?.scanner()?;
            scanner.seek(start)?;
            streams.push(Box::new(scanner));
        }
        let mut union = UnionStream::new(streams)?;

        let mut out = Vec::new();
        let mut key = K::default();
        let mut value = V::default();
        while union.next_pair(&mut key, &mut value)? {
            if key >= *end {
                break;
            }
            out.push((key.clone(), value.clone()));
        }
        Ok(out)
    }

    /// Orderly shutdown: stop intake, drain the pre-buffer, force the
    /// final rollover, and let combine stages finish in place.
    ///
    /// Everything accepted before shutdown reaches hard commit;
    /// anything rejected afterwards is observable through the
    /// transaction id watermarks.
    pub fn shutdown(self) -> Result<(), PipelineError> {
        let WriteProcessor {
            prebuffer,
            first_stage,
            combine_tasks,
            tracker,
            ..
        } = self;

        prebuffer.shutdown();
        first_stage.shutdown();
        for task in combine_tasks {
            task.dispose();
        }
        info!(
            hard_commit = tracker.hard_commit_watermark(),
            "Write processor shut down."
        );
        Ok(())
    }
}
