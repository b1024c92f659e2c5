//! The write pipeline.
//!
//! Incoming points flow through three tiers before they are durable:
//! the pre-buffer (an in-memory inbox that assigns transaction ids),
//! the first-stage writer (in-memory sorted tables, cascaded and
//! merged ten at a time), and the on-disk archives produced by
//! rollovers and periodically compacted by stage-combine tasks. Two
//! milestones are observable per transaction id: soft commit (visible
//! to readers, in memory) and hard commit (durable on disk).
//!
//! Every background activity runs on a dedicated OS thread driven by a
//! [`ScheduledTask`]: an mpsc control channel accepts external `start`
//! nudges and doubles as the timed re-trigger. Nothing in the pipeline
//! requires an async runtime.

use std::io;

use snafu::Snafu;
use uuid::Uuid;

mod archive_list;
mod combine;
mod first_stage;
mod initializer;
mod prebuffer;
mod rollover_log;
mod scheduler;
mod tracker;

pub use self::archive_list::{ArchiveList, ArchiveListEditor, ArchiveListEntry};
pub use self::combine::{CombineFiles, CombineFilesConfig};
pub use self::first_stage::{
    FirstStageConfig, FirstStageConfigBuilder, FirstStageWriter, PreBufferRolloverArgs,
    StagingConfig,
};
pub use self::initializer::{
    ArchiveInitializerConfig, DiskSpaceProbe, SimplifiedArchiveInitializer, StatvfsProbe,
};
pub use self::prebuffer::{PreBufferConfig, PreBufferConfigBuilder, PreBufferWriter};
pub use self::rollover_log::{recover_directory, RecoveryReport, RolloverLogRecord};
pub use self::scheduler::{RunReason, ScheduledTask};
pub use self::tracker::TransactionTracker;

/// Marks an archive file as an intermediate product of the pipeline,
/// eligible for stage-combine compaction.
pub const INTERMEDIATE_FILE: Uuid = Uuid::from_u128(0x9f0c_33aa_5c9f_4f45_b1e9_3d1ff21a9d01);

/// Stage markers carried by files produced at each pipeline tier.
pub const STAGE_1: Uuid = Uuid::from_u128(0x9f0c_33aa_5c9f_4f45_b1e9_3d1ff21a9d11);
pub const STAGE_2: Uuid = Uuid::from_u128(0x9f0c_33aa_5c9f_4f45_b1e9_3d1ff21a9d12);
pub const STAGE_3: Uuid = Uuid::from_u128(0x9f0c_33aa_5c9f_4f45_b1e9_3d1ff21a9d13);

/// Error building a pipeline configuration.
#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{param_name}' was invalid: {reason}"))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Error produced by the write pipeline.
#[derive(Debug, Snafu)]
pub enum PipelineError {
    /// A tree-level failure inside a table.
    #[snafu(display("pipeline tree error: {source}"))]
    Tree { source: crate::tree::TreeError },

    /// An archive-file failure.
    #[snafu(display("pipeline file error: {source}"))]
    File { source: crate::file::FileError },

    /// A plain I/O failure (directory scans, renames, log files).
    #[snafu(display("pipeline I/O error: {source}"))]
    Io { source: io::Error },

    /// No configured write path can hold the estimated file size while
    /// keeping its desired remaining space.
    #[snafu(display(
        "out of free space: no write path can hold {estimated_size} bytes and keep {desired_remaining} free"
    ))]
    OutOfFreeSpace {
        estimated_size: u64,
        desired_remaining: u64,
    },

    /// A rollover log file failed structural or hash validation.
    #[snafu(display("corrupt rollover log {path}: {reason}"))]
    CorruptRolloverLog { path: String, reason: String },

    /// A write arrived after shutdown began.
    #[snafu(display("write pipeline is shutting down"))]
    ShuttingDown,
}

impl From<crate::tree::TreeError> for PipelineError {
    fn from(source: crate::tree::TreeError) -> Self {
        PipelineError::Tree { source }
    }
}

impl From<crate::file::FileError> for PipelineError {
    fn from(source: crate::file::FileError) -> Self {
        PipelineError::File { source }
    }
}

impl From<io::Error> for PipelineError {
    fn from(source: io::Error) -> Self {
        PipelineError::Io { source }
    }
}
