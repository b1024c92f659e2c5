//! End-to-end scenarios over real files and the assembled pipeline.

use std::sync::Arc;
use std::time::Duration;

use crate::encoding::{HistorianKey, HistorianValue};
use crate::file::{ArchiveCreateOptions, FileError, TransactionalFileStructure};
use crate::pipeline::{
    recover_directory, ArchiveInitializerConfig, ArchiveList, CombineFiles, CombineFilesConfig,
    RolloverLogRecord, SimplifiedArchiveInitializer, INTERMEDIATE_FILE, STAGE_1, STAGE_2,
};
use crate::tree::{ArchiveTable, VecStream};
use crate::engine::{WriteProcessor, WriteProcessorConfig};
use crate::encoding::historian_encodings;

use super::{delta_encoding, key, value, wait_until};

fn processor_config(directory: &std::path::Path) -> WriteProcessorConfig {
    let mut config =
        WriteProcessorConfig::with_archive_directory(directory.to_path_buf()).unwrap();
    config.prebuffer.rollover_interval = Duration::from_millis(10);
    config
}

#[test]
fn three_points_flush_and_range_read() {
    let dir = tempfile::tempdir().unwrap();
    let mut processor = WriteProcessor::new(
        processor_config(dir.path()),
        delta_encoding(),
        historian_encodings(),
    )
    .unwrap();

    processor.write(key(1, 100), value(1)).unwrap();
    processor.write(key(1, 101), value(2)).unwrap();
    let last = processor.write(key(2, 100), value(3)).unwrap();

    processor.request_drain();
    processor.wait_for_soft_commit(last);

    let expected = vec![
        (key(1, 100), value(1)),
        (key(1, 101), value(2)),
        (key(2, 100), value(3)),
    ];
    let range = processor.read_range(&key(1, 0), &key(3, 0)).unwrap();
    assert_eq!(range, expected, "soft-committed points read in (t, p) order");

    // Shutdown forces the rollover to disk; a fresh processor over the
    // same directory must see the same three points.
    processor.shutdown().unwrap();
    let reopened = WriteProcessor::<HistorianKey, HistorianValue>::new(
        processor_config(dir.path()),
        delta_encoding(),
        historian_encodings(),
    )
    .unwrap();
    let range = reopened.read_range(&key(1, 0), &key(3, 0)).unwrap();
    assert_eq!(range, expected, "hard-committed points survive restart");

    assert_eq!(
        reopened.read_single_value(&key(1, 101)).unwrap(),
        Some(value(2))
    );
    reopened.shutdown().unwrap();
}

#[test]
fn abandoned_edit_leaves_no_trace_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("points.d2i");

    // Generation 1: the empty table.
    {
        let table = ArchiveTable::<HistorianKey, HistorianValue>::create_file(
            &path,
            4096,
            delta_encoding(),
            ArchiveCreateOptions::default(),
        )
        .unwrap();
        drop(table);
    }
    let committed_last = {
        let structure = TransactionalFileStructure::open_file(&path, true).unwrap();
        structure.snapshot().header().last_allocated_block()
    };

    // Append 500 points inside an edit that never commits; dropping
    // the editor mid-flight is the closest stand-in for a killed
    // process.
    {
        let table = ArchiveTable::<HistorianKey, HistorianValue>::open_file(
            &path,
            historian_encodings(),
            false,
        )
        .unwrap();
        let mut editor = table.begin_edit().unwrap();
        for n in 0..500u64 {
            editor.insert(&key(n, 0), &value(n)).unwrap();
        }
        drop(editor);
    }

    // Reopen read-only: nothing from the abandoned edit is visible.
    let table = ArchiveTable::<HistorianKey, HistorianValue>::open_file(
        &path,
        historian_encodings(),
        true,
    )
    .unwrap();
    let snapshot = table.snapshot().unwrap();
    let mut scanner = snapshot.scanner().unwrap();
    assert_eq!(scanner.read_next().unwrap(), None);

    let structure = TransactionalFileStructure::open_file(&path, true).unwrap();
    assert_eq!(
        structure.snapshot().header().last_allocated_block(),
        committed_last,
        "the high-water mark must equal its pre-edit value"
    );
}

#[test]
fn combine_merges_overlapping_archives_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let initializer = Arc::new(SimplifiedArchiveInitializer::new(
        ArchiveInitializerConfig::new(vec![dir.path().to_path_buf()], 4096),
    ));
    let archive_list = ArchiveList::<HistorianKey, HistorianValue>::new();

    // Two archives over the same key range; the newer one carries
    // different values for the shared keys.
    for word in [10u64, 20] {
        let records: Vec<_> = (0..500u64).map(|n| (key(n, 0), value(word + n))).collect();
        let mut input = VecStream::from_sorted(records);
        let table = initializer
            .create_archive_file(
                1 << 20,
                vec![INTERMEDIATE_FILE, STAGE_1],
                delta_encoding(),
                &mut input,
                &mut |_, _| Ok(()),
            )
            .unwrap();
        archive_list
            .edit()
            .add(Arc::new(table), vec![INTERMEDIATE_FILE, STAGE_1]);
    }
    let source_paths: Vec<_> = archive_list
        .snapshot()
        .iter()
        .filter_map(|entry| entry.table.path().map(std::path::PathBuf::from))
        .collect();
    assert_eq!(source_paths.len(), 2);

    let combine = CombineFiles::new(
        CombineFilesConfig {
            match_flag: STAGE_1,
            output_flags: vec![INTERMEDIATE_FILE, STAGE_2],
            combine_on_file_count: 2,
            combine_on_file_size: u64::MAX,
            interval: Duration::from_secs(3600),
        },
        Arc::clone(&archive_list),
        initializer,
        delta_encoding(),
    );
    assert!(combine.execute().unwrap());

    // One merged file; record count equals the union of the sources.
    let entries = archive_list.snapshot();
    assert_eq!(entries.len(), 1);
    let merged = &entries[0];
    assert!(merged.has_flag(STAGE_2));
    let mut scanner = merged.table.snapshot().unwrap().scanner().unwrap();
    let mut count = 0u64;
    let mut newest_wins = true;
    while let Some((found_key, found_value)) = scanner.read_next().unwrap() {
        newest_wins &= found_value == value(20 + found_key.timestamp);
        count += 1;
    }
    assert_eq!(count, 500, "union of identical key ranges keeps one copy");
    assert!(newest_wins, "later archives shadow earlier ones");

    // Sources are unlinked from the list and from the filesystem, and
    // the rollover log is gone.
    for path in source_paths {
        assert!(!path.exists(), "source {} must be deleted", path.display());
    }
    let leftover_logs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|extension| extension == "rlog")
        })
        .collect();
    assert!(leftover_logs.is_empty(), "no rollover log may remain");
}

#[test]
fn crash_between_pending_write_and_rename_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let destination = uuid::Uuid::new_v4();
    let survivor = uuid::Uuid::new_v4();

    // The crash left: a log, the destination still under its pending
    // extension, and an unrelated source archive.
    std::fs::write(
        dir.path().join(format!("{survivor}.d2i")),
        b"unrelated archive",
    )
    .unwrap();
    std::fs::write(
        dir.path().join(format!("{destination}.~d2i")),
        b"half-written destination",
    )
    .unwrap();
    RolloverLogRecord::new(vec![survivor], destination)
        .write_to_file(&dir.path().join(format!("{destination}.rlog")))
        .unwrap();

    let report = recover_directory(dir.path(), "d2i", "~d2i").unwrap();
    assert_eq!(report.cancelled_rollovers, 1);
    assert_eq!(report.pending_files_deleted, 1);

    // The pending file and the log are gone; the source survives
    // because its replacement never materialized.
    assert!(!dir.path().join(format!("{destination}.~d2i")).exists());
    assert!(!dir.path().join(format!("{destination}.rlog")).exists());
    assert!(dir.path().join(format!("{survivor}.d2i")).exists());
}

#[test]
fn concurrent_edits_serialize_on_the_edit_slot() {
    let structure =
        TransactionalFileStructure::create_in_memory(4096, ArchiveCreateOptions::default())
            .unwrap();

    let first = structure.begin_edit().unwrap();
    let name = crate::file::SubFileName::from_table(
        "serialized",
        uuid::Uuid::from_u128(1),
        uuid::Uuid::from_u128(2),
    );
    first.create_file(name).unwrap();

    // The second edit must fail while the first is active.
    assert!(matches!(
        structure.begin_edit(),
        Err(FileError::TransactionAlreadyActive)
    ));

    first.commit_and_dispose().unwrap();

    // Now the second edit succeeds and observes the first's changes.
    let second = structure.begin_edit().unwrap();
    assert_eq!(second.file_count(), 1);
    assert!(second.index_of_name(&name).is_some());
    second.rollback_and_dispose();
}

#[test]
fn pipeline_survives_restart_with_leftover_debris() {
    let dir = tempfile::tempdir().unwrap();

    // A first pipeline writes some points and shuts down cleanly.
    let mut processor = WriteProcessor::new(
        processor_config(dir.path()),
        delta_encoding(),
        historian_encodings(),
    )
    .unwrap();
    for n in 0..50u64 {
        processor.write(key(n, 7), value(n)).unwrap();
    }
    processor.shutdown().unwrap();

    // Sprinkle crash debris into the directory.
    std::fs::write(dir.path().join("deadbeef.~d2i"), b"partial").unwrap();

    let reopened = WriteProcessor::<HistorianKey, HistorianValue>::new(
        processor_config(dir.path()),
        delta_encoding(),
        historian_encodings(),
    )
    .unwrap();
    assert!(!dir.path().join("deadbeef.~d2i").exists());
    assert!(wait_until(|| reopened.archive_list().len() >= 1, 1_000));
    assert_eq!(
        reopened.read_single_value(&key(17, 7)).unwrap(),
        Some(value(17))
    );
    reopened.shutdown().unwrap();
}
