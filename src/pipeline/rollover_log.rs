//! Crash-recoverable rollover logs.
//!
//! A rollover replaces several source archives with one destination
//! archive. The log record is written before any source is deleted; on
//! restart, a surviving log tells recovery which half of the swap to
//! finish. If the destination exists the sources are deleted, if it
//! does not the orphaned pending file is swept separately, and the log
//! itself is always removed afterwards.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use byteorder::{ByteOrder, LittleEndian};
use sha1::{Digest, Sha1};
use uuid::Uuid;

use super::PipelineError;

const LOG_HEADER: &[u8] = b"Historian 2.0 Rollover Log";
const LOG_VERSION: u8 = 1;

/// File extension of rollover log files.
pub const LOG_EXTENSION: &str = "rlog";

/// One rollover: the archives being replaced and their replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloverLogRecord {
    pub sources: Vec<Uuid>,
    pub destination: Uuid,
}

impl RolloverLogRecord {
    pub fn new(sources: Vec<Uuid>, destination: Uuid) -> Self {
        Self {
            sources,
            destination,
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            LOG_HEADER.len() + 1 + 4 + 16 * (self.sources.len() + 1) + 20,
        );
        buf.extend_from_slice(LOG_HEADER);
        buf.push(LOG_VERSION);
        buf.extend_from_slice(&(self.sources.len() as i32).to_le_bytes());
        for source in &self.sources {
            buf.extend_from_slice(&source.as_u128().to_le_bytes());
        }
        buf.extend_from_slice(&self.destination.as_u128().to_le_bytes());

        let mut hasher = Sha1::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize());
        buf
    }

    /// Writes and syncs the log record.
    pub fn write_to_file(&self, path: &Path) -> Result<(), PipelineError> {
        let mut file = fs::File::create(path)?;
        file.write_all(&self.serialize())?;
        file.sync_all()?;
        debug!(
            path = %path.display(),
            sources = self.sources.len(),
            "Wrote rollover log."
        );
        Ok(())
    }

    /// Parses and validates a log record.
    pub fn read_from_file(path: &Path) -> Result<Self, PipelineError> {
        let bytes = fs::read(path)?;
        let corrupt = |reason: &str| PipelineError::CorruptRolloverLog {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };

        let fixed_prefix = LOG_HEADER.len() + 1 + 4;
        if bytes.len() < fixed_prefix + 16 + 20 {
            return Err(corrupt("file too short"));
        }
        if &bytes[..LOG_HEADER.len()] != LOG_HEADER {
            return Err(corrupt("bad header string"));
        }
        if bytes[LOG_HEADER.len()] != LOG_VERSION {
            return Err(corrupt("unknown version"));
        }

        let count = LittleEndian::read_i32(&bytes[LOG_HEADER.len() + 1..LOG_HEADER.len() + 5]);
        if count < 0 {
            return Err(corrupt("negative source count"));
        }
        let count = count as usize;
        let body_len = fixed_prefix + 16 * (count + 1);
        if bytes.len() != body_len + 20 {
            return Err(corrupt("length does not match source count"));
        }

        let mut hasher = Sha1::new();
        hasher.update(&bytes[..body_len]);
        if hasher.finalize().as_slice() != &bytes[body_len..] {
            return Err(corrupt("content hash mismatch"));
        }

        let mut at = fixed_prefix;
        let mut read_uuid = |bytes: &[u8]| {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&bytes[at..at + 16]);
            at += 16;
            Uuid::from_u128(u128::from_le_bytes(raw))
        };
        let sources = (0..count).map(|_| read_uuid(&bytes)).collect();
        let destination = read_uuid(&bytes);

        Ok(Self {
            sources,
            destination,
        })
    }
}

/// What a startup recovery pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Completed rollovers: the destination existed and the listed
    /// sources were deleted.
    pub finished_rollovers: usize,
    /// Cancelled rollovers: the destination never appeared.
    pub cancelled_rollovers: usize,
    /// Orphaned pending-extension files swept away.
    pub pending_files_deleted: usize,
}

/// Scans one archive directory, finishing or cancelling interrupted
/// rollovers and sweeping orphaned pending files.
pub fn recover_directory(
    dir: &Path,
    final_extension: &str,
    pending_extension: &str,
) -> Result<RecoveryReport, PipelineError> {
    let mut report = RecoveryReport::default();

    let mut log_paths = Vec::new();
    let mut pending_paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext == LOG_EXTENSION => log_paths.push(path),
            Some(ext) if ext == pending_extension => pending_paths.push(path),
            _ => {}
        }
    }

    for log_path in log_paths {
        let record = match RolloverLogRecord::read_from_file(&log_path) {
            Ok(record) => record,
            Err(error) => {
                warn!(%error, path = %log_path.display(), "Discarding unreadable rollover log.");
                fs::remove_file(&log_path)?;
                continue;
            }
        };

        let destination = archive_path(dir, record.destination, final_extension);
        if destination.exists() {
            // The rollover completed far enough to be authoritative;
            // finish it by deleting the replaced sources.
            for source in &record.sources {
                let source_path = archive_path(dir, *source, final_extension);
                if source_path.exists() {
                    fs::remove_file(&source_path)?;
                    debug!(path = %source_path.display(), "Recovery deleted rolled-over source.");
                }
            }
            report.finished_rollovers += 1;
        } else {
            report.cancelled_rollovers += 1;
        }
        fs::remove_file(&log_path)?;
    }

    // Pending files with no completed log are partial writes from a
    // crash mid-rollover.
    for pending in pending_paths {
        fs::remove_file(&pending)?;
        info!(path = %pending.display(), "Recovery deleted orphaned pending archive.");
        report.pending_files_deleted += 1;
    }

    Ok(report)
}

/// The canonical path of an archive file named by its id.
pub(crate) fn archive_path(dir: &Path, archive_id: Uuid, extension: &str) -> PathBuf {
    dir.join(format!("{archive_id}.{extension}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let record = RolloverLogRecord::new(
            vec![Uuid::from_u128(1), Uuid::from_u128(2)],
            Uuid::from_u128(3),
        );
        let path = dir.path().join("swap.rlog");
        record.write_to_file(&path).unwrap();
        assert_eq!(RolloverLogRecord::read_from_file(&path).unwrap(), record);
    }

    #[test]
    fn tampered_records_fail_the_hash() {
        let dir = tempfile::tempdir().unwrap();
        let record = RolloverLogRecord::new(vec![Uuid::from_u128(9)], Uuid::from_u128(10));
        let path = dir.path().join("swap.rlog");
        record.write_to_file(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let flip_at = LOG_HEADER.len() + 6;
        bytes[flip_at] ^= 1;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            RolloverLogRecord::read_from_file(&path),
            Err(PipelineError::CorruptRolloverLog { .. })
        ));
    }

    #[test]
    fn recovery_finishes_completed_rollovers() {
        let dir = tempfile::tempdir().unwrap();
        let source = Uuid::from_u128(1);
        let destination = Uuid::from_u128(2);

        fs::write(archive_path(dir.path(), source, "d2i"), b"src").unwrap();
        fs::write(archive_path(dir.path(), destination, "d2i"), b"dst").unwrap();
        RolloverLogRecord::new(vec![source], destination)
            .write_to_file(&archive_path(dir.path(), destination, LOG_EXTENSION))
            .unwrap();

        let report = recover_directory(dir.path(), "d2i", "~d2i").unwrap();
        assert_eq!(report.finished_rollovers, 1);
        assert!(!archive_path(dir.path(), source, "d2i").exists());
        assert!(archive_path(dir.path(), destination, "d2i").exists());
        assert!(!archive_path(dir.path(), destination, LOG_EXTENSION).exists());
    }

    #[test]
    fn recovery_cancels_incomplete_rollovers_and_sweeps_pending() {
        let dir = tempfile::tempdir().unwrap();
        let source = Uuid::from_u128(5);
        let destination = Uuid::from_u128(6);

        fs::write(archive_path(dir.path(), source, "d2i"), b"src").unwrap();
        // The destination only reached its pending extension.
        fs::write(archive_path(dir.path(), destination, "~d2i"), b"half").unwrap();
        RolloverLogRecord::new(vec![source], destination)
            .write_to_file(&archive_path(dir.path(), destination, LOG_EXTENSION))
            .unwrap();

        let report = recover_directory(dir.path(), "d2i", "~d2i").unwrap();
        assert_eq!(report.cancelled_rollovers, 1);
        assert_eq!(report.pending_files_deleted, 1);
        // The source survives; its replacement never materialized.
        assert!(archive_path(dir.path(), source, "d2i").exists());
        assert!(!archive_path(dir.path(), destination, "~d2i").exists());
        assert!(!archive_path(dir.path(), destination, LOG_EXTENSION).exists());
    }
}
