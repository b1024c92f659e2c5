//! The first-stage writer: from drained points to durable archives.
//!
//! Every pre-buffer drain becomes one small in-memory table. Tables
//! cascade through a fixed number of pending lists: when a list
//! reaches its merge threshold, its tables union-merge into one larger
//! in-memory table that moves to the next list. Once the total pending
//! size crosses the rollover threshold, a dedicated task merges
//! everything pending into an on-disk archive; above the allowed
//! ceiling the producer blocks until that rollover frees space.

use std::{sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::encoding::{PairEncoding, TreeKey, TreeValue};
use crate::file::TransactionalFileStructure;
use crate::tree::{ArchiveTable, SortedPointStream, UnionStream, VecStream};

use super::{
    archive_list::ArchiveList,
    initializer::SimplifiedArchiveInitializer,
    scheduler::{RunReason, ScheduledTask},
    tracker::TransactionTracker,
    BuildError, PipelineError, INTERMEDIATE_FILE, STAGE_1,
};

/// How the pending lists cascade.
#[derive(Debug, Clone)]
pub struct StagingConfig {
    /// Tables accumulated in a list before they merge into one.
    pub tables_per_merge: usize,
    /// Number of cascading pending lists.
    pub stage_count: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            tables_per_merge: 10,
            stage_count: 3,
        }
    }
}

/// First-stage writer configuration.
#[derive(Debug, Clone)]
pub struct FirstStageConfig {
    /// Block size of the in-memory tables and rolled-over archives.
    pub block_size: u32,
    /// Pending bytes that trigger a rollover to disk.
    pub rollover_size_bytes: u64,
    /// Pending bytes above which the producer blocks.
    pub maximum_allowed_bytes: u64,
    pub staging: StagingConfig,
    /// How often the rollover task re-checks on its own.
    pub rollover_retry_interval: Duration,
}

/// Builder for [`FirstStageConfig`].
#[derive(Debug, Clone)]
pub struct FirstStageConfigBuilder {
    block_size: u32,
    rollover_size_mb: u64,
    maximum_allowed_mb: u64,
    staging: StagingConfig,
    rollover_retry_interval: Duration,
}

impl Default for FirstStageConfigBuilder {
    fn default() -> Self {
        Self {
            block_size: 4096,
            rollover_size_mb: 200,
            maximum_allowed_mb: 300,
            staging: StagingConfig::default(),
            rollover_retry_interval: Duration::from_secs(1),
        }
    }
}

impl FirstStageConfigBuilder {
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn rollover_size_mb(mut self, megabytes: u64) -> Self {
        self.rollover_size_mb = megabytes;
        self
    }

    pub fn maximum_allowed_mb(mut self, megabytes: u64) -> Self {
        self.maximum_allowed_mb = megabytes;
        self
    }

    pub fn staging(mut self, staging: StagingConfig) -> Self {
        self.staging = staging;
        self
    }

    pub fn rollover_retry_interval(mut self, interval: Duration) -> Self {
        self.rollover_retry_interval = interval;
        self
    }

    pub fn build(self) -> Result<FirstStageConfig, BuildError> {
        if self.rollover_size_mb == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "rollover_size_mb",
                reason: "cannot be zero".to_string(),
            });
        }
        if self.maximum_allowed_mb < self.rollover_size_mb {
            return Err(BuildError::InvalidParameter {
                param_name: "maximum_allowed_mb",
                reason: format!(
                    "must be at least rollover_size_mb ({})",
                    self.rollover_size_mb
                ),
            });
        }
        if self.staging.stage_count == 0 || self.staging.tables_per_merge < 2 {
            return Err(BuildError::InvalidParameter {
                param_name: "staging",
                reason: "need at least one stage and two tables per merge".to_string(),
            });
        }
        Ok(FirstStageConfig {
            block_size: self.block_size,
            rollover_size_bytes: self.rollover_size_mb * 1024 * 1024,
            maximum_allowed_bytes: self.maximum_allowed_mb * 1024 * 1024,
            staging: self.staging,
            rollover_retry_interval: self.rollover_retry_interval,
        })
    }
}

/// One drained pre-buffer batch.
pub struct PreBufferRolloverArgs<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    /// The drained points, sorted and de-duplicated.
    pub points: VecStream<K, V>,
    /// The highest transaction id contained in the batch.
    pub transaction_id: i64,
}

struct StagedTable<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    table: Arc<ArchiveTable<K, V>>,
    bytes: u64,
}

struct FirstStageState<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    stages: Vec<Vec<StagedTable<K, V>>>,
    pending_bytes: u64,
    last_transaction: i64,
}

type EventHook = Box<dyn Fn(i64) + Send + Sync>;

/// The first-stage writer.
pub struct FirstStageWriter<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    config: FirstStageConfig,
    encoding: Arc<dyn PairEncoding<K, V>>,
    archive_list: Arc<ArchiveList<K, V>>,
    initializer: Arc<SimplifiedArchiveInitializer>,
    tracker: Arc<TransactionTracker>,
    state: Mutex<FirstStageState<K, V>>,
    space_freed: Condvar,
    rollover_task: Mutex<Option<ScheduledTask>>,
    sequence_committed_hooks: Mutex<Vec<EventHook>>,
    rollover_complete_hooks: Mutex<Vec<EventHook>>,
}

impl<K, V> FirstStageWriter<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    pub fn new(
        config: FirstStageConfig,
        encoding: Arc<dyn PairEncoding<K, V>>,
        archive_list: Arc<ArchiveList<K, V>>,
        initializer: Arc<SimplifiedArchiveInitializer>,
        tracker: Arc<TransactionTracker>,
    ) -> Arc<Self> {
        let stage_count = config.staging.stage_count;
        let retry_interval = config.rollover_retry_interval;
        let writer = Arc::new(Self {
            config,
            encoding,
            archive_list,
            initializer,
            tracker,
            state: Mutex::new(FirstStageState {
                stages: (0..stage_count).map(|_| Vec::new()).collect(),
                pending_bytes: 0,
                last_transaction: 0,
            }),
            space_freed: Condvar::new(),
            rollover_task: Mutex::new(None),
            sequence_committed_hooks: Mutex::new(Vec::new()),
            rollover_complete_hooks: Mutex::new(Vec::new()),
        });

        // The task closure holds only a weak reference; otherwise the
        // writer and its own task would keep each other alive forever.
        let for_task = Arc::downgrade(&writer);
        let task = ScheduledTask::spawn(
            "first-stage-rollover",
            Some(retry_interval),
            move |reason| {
                if let Some(writer) = for_task.upgrade() {
                    writer.run_rollover(reason);
                }
            },
        );
        *writer.rollover_task.lock() = Some(task);
        writer
    }

    /// Registers an observer for the soft-commit milestone. Observers
    /// must not block; they run on pipeline threads.
    pub fn on_sequence_committed(&self, hook: EventHook) {
        self.sequence_committed_hooks.lock().push(hook);
    }

    /// Registers an observer for the hard-commit milestone.
    pub fn on_rollover_complete(&self, hook: EventHook) {
        self.rollover_complete_hooks.lock().push(hook);
    }

    /// Total bytes currently pending in memory.
    pub fn pending_bytes(&self) -> u64 {
        self.state.lock().pending_bytes
    }

    /// Accepts one drained batch from the pre-buffer.
    ///
    /// On return, every point in the batch is visible to readers (soft
    /// commit). May block on backpressure when the pending size is
    /// above the configured ceiling.
    pub fn append_rollover(
        &self,
        mut args: PreBufferRolloverArgs<K, V>,
    ) -> Result<(), PipelineError> {
        if !args.points.is_empty() {
            let structure = TransactionalFileStructure::create_in_memory(
                self.config.block_size,
                crate::file::ArchiveCreateOptions {
                    simplified: true,
                    ..Default::default()
                },
            )?;
            let table = Arc::new(ArchiveTable::build_from_stream(
                structure,
                Arc::clone(&self.encoding),
                &mut args.points,
                None,
            )?);
            let bytes = table.size_bytes();

            self.archive_list.edit().add(Arc::clone(&table), Vec::new());

            let mut state = self.state.lock();
            state.stages[0].push(StagedTable { table, bytes });
            state.pending_bytes += bytes;
            state.last_transaction = state.last_transaction.max(args.transaction_id);
            self.cascade(&mut state)?;

            if state.pending_bytes >= self.config.rollover_size_bytes {
                if let Some(task) = self.rollover_task.lock().as_ref() {
                    task.start();
                }
            }
            while state.pending_bytes >= self.config.maximum_allowed_bytes {
                trace!(
                    pending_bytes = state.pending_bytes,
                    "First stage over ceiling; blocking producer."
                );
                self.space_freed.wait(&mut state);
            }
        }

        self.tracker.advance_soft(args.transaction_id);
        for hook in self.sequence_committed_hooks.lock().iter() {
            hook(args.transaction_id);
        }
        Ok(())
    }

    /// Runs the cascading merges over the pending lists.
    fn cascade(&self, state: &mut FirstStageState<K, V>) -> Result<(), PipelineError> {
        let tables_per_merge = self.config.staging.tables_per_merge;
        for stage in 0..state.stages.len() - 1 {
            while state.stages[stage].len() >= tables_per_merge {
                let batch: Vec<StagedTable<K, V>> =
                    state.stages[stage].drain(..tables_per_merge).collect();
                let batch_bytes: u64 = batch.iter().map(|staged| staged.bytes).sum();

                let merged = self.merge_to_memory(&batch)?;
                let merged_bytes = merged.size_bytes();
                debug!(
                    stage,
                    merged_tables = batch.len(),
                    batch_bytes,
                    merged_bytes,
                    "Cascaded pending tables into next stage."
                );

                {
                    let source_ids: Vec<_> =
                        batch.iter().map(|staged| staged.table.archive_id()).collect();
                    self.archive_list.edit().replace(
                        &source_ids,
                        Arc::clone(&merged),
                        Vec::new(),
                    );
                }

                state.pending_bytes = state.pending_bytes - batch_bytes + merged_bytes;
                state.stages[stage + 1].push(StagedTable {
                    table: merged,
                    bytes: merged_bytes,
                });
            }
        }
        Ok(())
    }

    fn merge_to_memory(
        &self,
        batch: &[StagedTable<K, V>],
    ) -> Result<Arc<ArchiveTable<K, V>>, PipelineError> {
        let mut union = self.union_of(batch)?;
        let structure = TransactionalFileStructure::create_in_memory(
            self.config.block_size,
            crate::file::ArchiveCreateOptions {
                simplified: true,
                ..Default::default()
            },
        )?;
        Ok(Arc::new(ArchiveTable::build_from_stream(
            structure,
            Arc::clone(&self.encoding),
            &mut union,
            None,
        )?))
    }

    fn union_of(&self, batch: &[StagedTable<K, V>]) -> Result<UnionStream<K, V>, PipelineError> {
        let mut streams: Vec<Box<dyn SortedPointStream<K, V> + Send>> =
            Vec::with_capacity(batch.len());
        for staged in batch {
            let mut scanner = staged.table.snapshot()?.scanner()?;
            scanner.seek_first()?;
            streams.push(Box::new(scanner));
        }
        Ok(UnionStream::new(streams)?)
    }

    /// The rollover task body: merge everything pending into a disk
    /// archive.
    fn run_rollover(&self, reason: RunReason) {
        let force = reason == RunReason::Disposing;
        if let Err(error) = self.rollover_to_disk(force) {
            error!(%error, "First-stage rollover to disk failed; will retry.");
        }
    }

    /// Merges all pending tables into one on-disk archive file.
    ///
    /// With `force`, pending tables roll over regardless of size;
    /// shutdown uses this to reach hard commit for everything
    /// accepted.
    pub fn rollover_to_disk(&self, force: bool) -> Result<(), PipelineError> {
        let (batch, batch_bytes, transaction_id) = {
            let mut state = self.state.lock();
            if !force && state.pending_bytes < self.config.rollover_size_bytes {
                return Ok(());
            }
            // Oldest data sits in the highest stage; drain high to low
            // so the union sees sources oldest first.
            let mut batch: Vec<StagedTable<K, V>> = Vec::new();
            for stage in (0..state.stages.len()).rev() {
                batch.append(&mut state.stages[stage]);
            }
            if batch.is_empty() {
                return Ok(());
            }
            let batch_bytes: u64 = batch.iter().map(|staged| staged.bytes).sum();
            (batch, batch_bytes, state.last_transaction)
        };

        let result = (|| -> Result<Arc<ArchiveTable<K, V>>, PipelineError> {
            let mut union = self.union_of(&batch)?;
            let table = self.initializer.create_archive_file(
                batch_bytes,
                vec![INTERMEDIATE_FILE, STAGE_1],
                Arc::clone(&self.encoding),
                &mut union,
                // Memory-to-disk rollovers need no log: the sources
                // evaporate with the process either way.
                &mut |_archive_id, _path| Ok(()),
            )?;
            Ok(Arc::new(table))
        })();

        match result {
            Ok(disk_table) => {
                {
                    let source_ids: Vec<_> =
                        batch.iter().map(|staged| staged.table.archive_id()).collect();
                    self.archive_list.edit().replace(
                        &source_ids,
                        Arc::clone(&disk_table),
                        vec![INTERMEDIATE_FILE, STAGE_1],
                    );
                }
                {
                    let mut state = self.state.lock();
                    state.pending_bytes = state.pending_bytes.saturating_sub(batch_bytes);
                    self.space_freed.notify_all();
                }
                info!(
                    archive_id = %disk_table.archive_id(),
                    merged_tables = batch.len(),
                    transaction_id,
                    "Rolled first stage over to disk."
                );
                self.tracker.advance_hard(transaction_id);
                for hook in self.rollover_complete_hooks.lock().iter() {
                    hook(transaction_id);
                }
                Ok(())
            }
            Err(error) => {
                // Put the batch back where the next attempt will find
                // it; order within the restored list stays oldest
                // first.
                let mut state = self.state.lock();
                let last = state.stages.len() - 1;
                let mut restored = batch;
                restored.append(&mut state.stages[last]);
                state.stages[last] = restored;
                Err(error)
            }
        }
    }

    /// Finishes outstanding work and stops the rollover task.
    pub fn shutdown(&self) {
        let task = self.rollover_task.lock().take();
        if let Some(task) = task {
            // Dispose delivers a final forced rollover.
            task.dispose();
        }
    }
}
