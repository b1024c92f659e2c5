//! Pipeline-component tests: pre-buffer, first stage, rollover.

use std::sync::Arc;
use std::time::Duration;

use crate::encoding::{HistorianKey, HistorianValue};
use crate::pipeline::{
    ArchiveInitializerConfig, ArchiveList, FirstStageConfig, FirstStageWriter,
    PreBufferConfigBuilder, PreBufferRolloverArgs, PreBufferWriter, SimplifiedArchiveInitializer,
    StagingConfig, TransactionTracker, INTERMEDIATE_FILE, STAGE_1,
};
use crate::tree::VecStream;

use super::{delta_encoding, key, value, wait_until};

fn quiet_first_stage_config(staging: StagingConfig) -> FirstStageConfig {
    FirstStageConfig {
        block_size: 4096,
        // Large enough that only forced rollovers happen in tests.
        rollover_size_bytes: 1 << 40,
        maximum_allowed_bytes: 1 << 41,
        staging,
        rollover_retry_interval: Duration::from_secs(3600),
    }
}

fn first_stage_over(
    dir: &std::path::Path,
    staging: StagingConfig,
) -> (
    Arc<FirstStageWriter<HistorianKey, HistorianValue>>,
    Arc<ArchiveList<HistorianKey, HistorianValue>>,
    Arc<TransactionTracker>,
) {
    let archive_list = ArchiveList::new();
    let tracker = Arc::new(TransactionTracker::new());
    let initializer = Arc::new(SimplifiedArchiveInitializer::new(
        ArchiveInitializerConfig::new(vec![dir.to_path_buf()], 4096),
    ));
    let first_stage = FirstStageWriter::new(
        quiet_first_stage_config(staging),
        delta_encoding(),
        Arc::clone(&archive_list),
        initializer,
        Arc::clone(&tracker),
    );
    (first_stage, archive_list, tracker)
}

fn batch(range: std::ops::Range<u64>, word: u64, transaction_id: i64) -> PreBufferRolloverArgs<HistorianKey, HistorianValue> {
    let points: Vec<_> = range.map(|n| (key(n, 0), value(word))).collect();
    PreBufferRolloverArgs {
        points: VecStream::from_unsorted(points),
        transaction_id,
    }
}

#[test]
fn append_soft_commits_and_exposes_tables_to_readers() {
    let dir = tempfile::tempdir().unwrap();
    let (first_stage, archive_list, tracker) =
        first_stage_over(dir.path(), StagingConfig::default());

    let mut committed_events = Vec::new();
    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let events_in_hook = Arc::clone(&events);
    first_stage.on_sequence_committed(Box::new(move |transaction_id| {
        events_in_hook.lock().push(transaction_id);
    }));

    first_stage.append_rollover(batch(0..100, 1, 5)).unwrap();
    first_stage.append_rollover(batch(100..200, 1, 9)).unwrap();
    committed_events.extend(events.lock().iter().copied());

    assert_eq!(tracker.soft_commit_watermark(), 9);
    assert_eq!(tracker.hard_commit_watermark(), 0);
    assert_eq!(committed_events, vec![5, 9]);
    assert_eq!(archive_list.len(), 2);

    // Every appended point is readable through the archive list.
    let entries = archive_list.snapshot();
    let mut found = false;
    for entry in &entries {
        if entry.table.snapshot().unwrap().get(&key(150, 0)).unwrap() == Some(value(1)) {
            found = true;
        }
    }
    assert!(found, "soft-committed point must be readable");
    first_stage.shutdown();
}

#[test]
fn cascading_merges_collapse_full_stages() {
    let dir = tempfile::tempdir().unwrap();
    let (first_stage, archive_list, _tracker) = first_stage_over(
        dir.path(),
        StagingConfig {
            tables_per_merge: 2,
            stage_count: 2,
        },
    );

    // Four appends with a merge threshold of two: each pair collapses
    // into one stage-1 table, leaving two attached tables.
    for (index, word) in [1u64, 2, 3, 4].into_iter().enumerate() {
        let start = index as u64 * 100;
        first_stage
            .append_rollover(batch(start..start + 100, word, index as i64 + 1))
            .unwrap();
    }

    assert_eq!(
        archive_list.len(),
        2,
        "four drains with pairwise merging leave two merged tables"
    );

    // Values survive the merges.
    let entries = archive_list.snapshot();
    for probe in [50u64, 150, 250, 350] {
        let expected = value(probe / 100 + 1);
        let found = entries.iter().any(|entry| {
            entry.table.snapshot().unwrap().get(&key(probe, 0)).unwrap() == Some(expected)
        });
        assert!(found, "key {probe} must survive cascading merges");
    }
    first_stage.shutdown();
}

#[test]
fn forced_rollover_reaches_hard_commit_and_disk() {
    let dir = tempfile::tempdir().unwrap();
    let (first_stage, archive_list, tracker) =
        first_stage_over(dir.path(), StagingConfig::default());

    let completions = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let completions_in_hook = Arc::clone(&completions);
    first_stage.on_rollover_complete(Box::new(move |transaction_id| {
        completions_in_hook.lock().push(transaction_id);
    }));

    first_stage.append_rollover(batch(0..500, 3, 11)).unwrap();
    first_stage.append_rollover(batch(500..900, 4, 23)).unwrap();
    first_stage.rollover_to_disk(true).unwrap();

    assert_eq!(tracker.hard_commit_watermark(), 23);
    assert_eq!(completions.lock().as_slice(), &[23]);
    assert_eq!(first_stage.pending_bytes(), 0);

    // Exactly one disk archive carrying the stage-1 flags remains.
    let entries = archive_list.snapshot();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert!(entry.has_flag(INTERMEDIATE_FILE));
    assert!(entry.has_flag(STAGE_1));
    let path = entry.table.path().expect("rolled-over table is file-backed");
    assert!(path.exists());

    assert_eq!(
        entry.table.snapshot().unwrap().get(&key(700, 0)).unwrap(),
        Some(value(4))
    );

    // A forced rollover with nothing pending is a no-op.
    first_stage.rollover_to_disk(true).unwrap();
    assert_eq!(archive_list.len(), 1);
    first_stage.shutdown();
}

#[test]
fn prebuffer_assigns_monotonic_ids_and_drains_on_interval() {
    let dir = tempfile::tempdir().unwrap();
    let (first_stage, archive_list, tracker) =
        first_stage_over(dir.path(), StagingConfig::default());

    let config = PreBufferConfigBuilder::default()
        .max_points(1_000)
        .rollover_point_count(500)
        .rollover_interval(Duration::from_millis(10))
        .build()
        .unwrap();
    let mut prebuffer = PreBufferWriter::new(config, Arc::clone(&first_stage));

    let mut previous = 0;
    for n in 0..300u64 {
        let transaction_id = prebuffer.write(key(n, 1), value(n)).unwrap();
        assert!(transaction_id > previous, "transaction ids must increase");
        previous = transaction_id;
    }

    // The interval drain makes the batch visible without a nudge.
    assert!(
        wait_until(|| tracker.soft_commit_watermark() >= previous, 2_000),
        "timed drain must soft-commit the batch"
    );
    assert!(archive_list.len() >= 1);

    prebuffer.shutdown();
    first_stage.shutdown();
}

#[test]
fn prebuffer_rejects_writes_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (first_stage, _archive_list, _tracker) =
        first_stage_over(dir.path(), StagingConfig::default());

    let config = PreBufferConfigBuilder::default().build().unwrap();
    let mut prebuffer = PreBufferWriter::new(config, Arc::clone(&first_stage));
    prebuffer.write(key(1, 1), value(1)).unwrap();
    prebuffer.stop();
    assert!(matches!(
        prebuffer.write(key(2, 2), value(2)),
        Err(crate::pipeline::PipelineError::ShuttingDown)
    ));
    prebuffer.shutdown();
    first_stage.shutdown();
}

#[test]
fn config_builders_validate_ranges() {
    assert!(PreBufferConfigBuilder::default()
        .max_points(10)
        .build()
        .is_err());
    assert!(PreBufferConfigBuilder::default()
        .rollover_interval(Duration::from_secs(10))
        .build()
        .is_err());
    assert!(PreBufferConfigBuilder::default()
        .rollover_point_count(0)
        .build()
        .is_err());
    assert!(PreBufferConfigBuilder::default().build().is_ok());

    use crate::pipeline::FirstStageConfigBuilder;
    assert!(FirstStageConfigBuilder::default()
        .rollover_size_mb(0)
        .build()
        .is_err());
    assert!(FirstStageConfigBuilder::default()
        .rollover_size_mb(100)
        .maximum_allowed_mb(50)
        .build()
        .is_err());
    let config = FirstStageConfigBuilder::default().build().unwrap();
    assert_eq!(config.staging.tables_per_merge, 10);
    assert_eq!(config.staging.stage_count, 3);
}
