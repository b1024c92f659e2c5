//! # Historian Storage: a shadow-paged time-series archive engine.
//!
//! This crate implements the storage core of a time-series historian: a
//! single-writer, many-reader B+-tree keyed by `(timestamp, point-id)`
//! tuples, stored inside transactional, shadow-paged archive files with
//! crash-consistent commit.
//!
//! ## Design constraints
//!
//! These constraints, or more often, invariants, are the groundwork for
//! ensuring that the design can stay simple and understandable:
//! - every archive file has exactly one writer; readers pin committed
//!   snapshots and never block the writer
//! - committed blocks are immutable; all mutation happens above the
//!   "frontier" (the high-water mark at the start of an edit) via
//!   copy-on-write of the block and its index-path ancestors
//! - all committed blocks are checksummed, and every read of committed
//!   data verifies the block footer before handing bytes to a caller
//! - all on-disk layouts are little-endian; opening an archive on a
//!   big-endian layout fails instead of guessing
//! - block addresses never get reused within the lifetime of a file
//!
//! ## Layering
//!
//! At the bottom, [`io`] provides block-granular synchronous I/O over a
//! file or plain memory, with a 32-byte footer (type tag, index value,
//! subfile id, checksums) sealed onto every block. [`file`] builds the
//! transactional archive-file structure on top of it: a versioned header
//! block, a directory of subfiles, a four-level indirect block tree per
//! subfile, and the shadow-copy allocator that makes multi-block commits
//! atomic. [`tree`] is the sorted-tree engine that lives inside a
//! subfile: fixed-size and delta-encoded node variants, a sparse index
//! for the interior levels, lazy scanners, and a one-pass bulk writer
//! for pre-sorted streams. [`pipeline`] is the write path: a pre-buffer
//! assigning transaction ids, a first-stage writer cascading in-memory
//! tables, the archive list, stage-combine tasks, and the rollover log
//! that makes file replacement crash-recoverable. [`engine`] glues the
//! pipeline together behind a single `WriteProcessor`.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

pub mod encoding;
pub mod engine;
pub mod file;
pub mod io;
pub mod pipeline;
pub mod tree;

#[cfg(test)]
mod tests;

pub use encoding::{EncodingDefinition, HistorianKey, HistorianValue, PairEncoding, TreeKey, TreeValue};
pub use engine::WriteProcessor;
pub use file::TransactionalFileStructure;
pub use tree::ArchiveTable;

/// Reserved block address meaning "no sibling" / "no block".
///
/// Address `0` is distinct from this: `0` means "absent" in index slots,
/// which works because physical block 0 is always a header replica and can
/// never hold user data.
pub const NULL_BLOCK: u32 = u32::MAX;
