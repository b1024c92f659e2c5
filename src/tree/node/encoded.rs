//! Delta-encoded node operations.
//!
//! Records are variable length and each one decodes relative to its
//! predecessor, so access is strictly forward: any random access is a
//! re-scan from the start of the node. Mutation works on the decoded
//! record vector and re-encodes the node wholesale; the first record of
//! a node always encodes against the cleared pair.

use crate::encoding::{PairEncoding, TreeKey, TreeValue};

use super::{header_size, record_count, set_record_count, set_valid_bytes, usable_size};

/// Decodes every record in the node.
pub(crate) fn read_all<K, V>(buf: &[u8], encoding: &dyn PairEncoding<K, V>) -> Vec<(K, V)>
where
    K: TreeKey,
    V: TreeValue,
{
    let count = record_count(buf) as usize;
    let mut records = Vec::with_capacity(count);
    let mut pos = header_size::<K>();
    let mut prev_key = K::default();
    let mut prev_value = V::default();

    for _ in 0..count {
        let mut key = K::default();
        let mut value = V::default();
        pos += encoding.decode(&buf[pos..], &prev_key, &prev_value, &mut key, &mut value);
        records.push((key.clone(), value.clone()));
        prev_key = key;
        prev_value = value;
    }
    records
}

/// Re-encodes `records` into the node's record area.
///
/// Returns `false` without touching the header fields when the records
/// do not fit; the node bytes past the header are scratch at that point
/// and the caller is expected to split instead.
pub(crate) fn write_all<K, V>(
    buf: &mut [u8],
    records: &[(K, V)],
    encoding: &dyn PairEncoding<K, V>,
) -> bool
where
    K: TreeKey,
    V: TreeValue,
{
    let usable = usable_size(buf.len());
    let mut scratch = vec![0u8; encoding.max_compression_size()];
    let mut pos = header_size::<K>();
    let mut prev_key = K::default();
    let mut prev_value = V::default();

    for (key, value) in records {
        let len = encoding.encode(&mut scratch, &prev_key, &prev_value, key, value);
        if pos + len > usable {
            return false;
        }
        buf[pos..pos + len].copy_from_slice(&scratch[..len]);
        pos += len;
        prev_key = key.clone();
        prev_value = value.clone();
    }

    set_record_count(buf, records.len() as u16);
    set_valid_bytes(buf, pos as u16);
    true
}

/// Total encoded length of `records`, including the node header.
pub(crate) fn encoded_len<K, V>(records: &[(K, V)], encoding: &dyn PairEncoding<K, V>) -> usize
where
    K: TreeKey,
    V: TreeValue,
{
    let mut scratch = vec![0u8; encoding.max_compression_size()];
    let mut pos = header_size::<K>();
    let mut prev_key = K::default();
    let mut prev_value = V::default();
    for (key, value) in records {
        pos += encoding.encode(&mut scratch, &prev_key, &prev_value, key, value);
        prev_key = key.clone();
        prev_value = value.clone();
    }
    pos
}

/// Picks the split index: the first record whose end crosses the byte
/// midpoint of the encoded form. Both halves re-encode their head
/// against the cleared pair, so the left half can only shrink.
pub(crate) fn split_index<K, V>(records: &[(K, V)], encoding: &dyn PairEncoding<K, V>) -> usize
where
    K: TreeKey,
    V: TreeValue,
{
    let total = encoded_len(records, encoding) - header_size::<K>();
    let midpoint = total / 2;

    let mut scratch = vec![0u8; encoding.max_compression_size()];
    let mut pos = 0usize;
    let mut prev_key = K::default();
    let mut prev_value = V::default();
    for (index, (key, value)) in records.iter().enumerate() {
        if pos >= midpoint && index > 0 && index < records.len() {
            return index;
        }
        pos += encoding.encode(&mut scratch, &prev_key, &prev_value, key, value);
        prev_key = key.clone();
        prev_value = value.clone();
    }
    // Degenerate distributions still split somewhere in the middle.
    (records.len() / 2).max(1)
}
