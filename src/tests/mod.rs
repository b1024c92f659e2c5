//! Cross-module scenario tests.
//!
//! Unit tests live next to the code they exercise; everything here
//! spans layers: full archive files, the assembled write pipeline, and
//! crash-recovery flows over real temporary directories.

use std::sync::Arc;

use crate::encoding::{
    historian_encodings, EncodingDefinition, HistorianKey, HistorianValue, PairEncoding,
    TreeKey, TreeValue, FIXED_ENCODING_METHOD, HISTORIAN_DELTA_METHOD,
};

mod pipeline;
mod scenarios;

pub(crate) type PointEncoding = Arc<dyn PairEncoding<HistorianKey, HistorianValue>>;

pub(crate) fn fixed_encoding() -> PointEncoding {
    historian_encodings()
        .lookup(&EncodingDefinition::new(
            HistorianKey::TYPE_ID,
            HistorianValue::TYPE_ID,
            FIXED_ENCODING_METHOD,
        ))
        .expect("built-in encoding")
}

pub(crate) fn delta_encoding() -> PointEncoding {
    historian_encodings()
        .lookup(&EncodingDefinition::new(
            HistorianKey::TYPE_ID,
            HistorianValue::TYPE_ID,
            HISTORIAN_DELTA_METHOD,
        ))
        .expect("built-in encoding")
}

pub(crate) fn key(timestamp: u64, point_id: u64) -> HistorianKey {
    HistorianKey::new(timestamp, point_id)
}

pub(crate) fn value(word: u64) -> HistorianValue {
    HistorianValue::from_word(word)
}

/// Polls a predicate with a bounded deadline; background threads make
/// exact waits impossible.
pub(crate) fn wait_until(mut predicate: impl FnMut() -> bool, timeout_ms: u64) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    loop {
        if predicate() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}
