//! Key/value codecs and pluggable pair encodings.
//!
//! Tree nodes store `(key, value)` pairs through a [`PairEncoding`]: an
//! object that knows how to write one pair relative to its predecessor
//! and read it back. The fixed encoding writes pairs verbatim, which
//! makes nodes binary-searchable; the delta encoding compresses against
//! the previous pair and restricts nodes to forward scans.
//!
//! Encodings are identified on disk by an [`EncodingDefinition`] (a
//! key-type/value-type/method GUID triple) and resolved at open time
//! through an [`EncodingLibrary`] populated at startup.

use snafu::Snafu;
use uuid::Uuid;

mod delta;
mod fixed;
mod registry;
mod types;
mod varint;

pub use self::delta::{HistorianDeltaEncoding, HISTORIAN_DELTA_METHOD};
pub use self::fixed::{FixedPairEncoding, FIXED_ENCODING_METHOD};
pub use self::registry::{historian_encodings, EncodingDefinition, EncodingLibrary, DEFINITION_LEN};
pub use self::types::{HistorianKey, HistorianValue, TreeKey, TreeValue};
pub use self::varint::{len_7bit_u64, push_7bit_u64, read_7bit_u64, write_7bit_u64};

/// Error resolving or validating an encoding definition.
#[derive(Debug, Snafu)]
pub enum EncodingError {
    /// No encoding with the requested method id has been registered.
    #[snafu(display("no registered encoding with method id {method}"))]
    UnknownEncoding { method: Uuid },

    /// The definition's key type does not match the table's key type.
    #[snafu(display("encoding key type {actual} does not match expected {expected}"))]
    KeyTypeMismatch { expected: Uuid, actual: Uuid },

    /// The definition's value type does not match the table's value type.
    #[snafu(display("encoding value type {actual} does not match expected {expected}"))]
    ValueTypeMismatch { expected: Uuid, actual: Uuid },
}

/// One `(key, value)` pair codec.
///
/// `encode` writes `(key, value)` into `dst` relative to the previous
/// pair and returns the bytes written; `decode` is its inverse and
/// returns the bytes read. The previous pair for the first record of a
/// node is the cleared (`Default`) pair. Implementations guarantee that
/// no pair ever encodes larger than [`max_compression_size`].
///
/// [`max_compression_size`]: PairEncoding::max_compression_size
pub trait PairEncoding<K, V>: Send + Sync
where
    K: TreeKey,
    V: TreeValue,
{
    /// The stable identity of this encoding.
    fn definition(&self) -> EncodingDefinition;

    /// Whether every pair encodes to exactly `K::SERIALIZED_SIZE +
    /// V::SERIALIZED_SIZE` bytes, independent of the previous pair.
    ///
    /// Fixed-size encodings select the binary-searchable node variant.
    fn is_fixed_size(&self) -> bool {
        false
    }

    /// Upper bound, in bytes, of a single encoded pair.
    fn max_compression_size(&self) -> usize;

    /// Encodes one pair into `dst`, returning the bytes written.
    ///
    /// `dst` is guaranteed to hold at least `max_compression_size` bytes.
    fn encode(&self, dst: &mut [u8], prev_key: &K, prev_value: &V, key: &K, value: &V) -> usize;

    /// Decodes one pair from `src`, returning the bytes read.
    fn decode(&self, src: &[u8], prev_key: &K, prev_value: &V, key: &mut K, value: &mut V)
        -> usize;
}
