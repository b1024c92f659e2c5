//! Node block layout shared by both encodings.
//!
//! Every node block starts with the same header:
//!
//! ```text
//!    0  version        u8 (currently 0)
//!    1  level          u8 (0 = leaf)
//!    2  record_count   u16 LE
//!    4  valid_bytes    u16 LE (used length including this header)
//!    6  left_sibling   u32 LE (u32::MAX = none)
//!   10  right_sibling  u32 LE (u32::MAX = none)
//!   14  lower_key      K::SERIALIZED_SIZE bytes (inclusive bound)
//!   ..  upper_key      K::SERIALIZED_SIZE bytes (exclusive bound,
//!                      K::max on the rightmost node of a level)
//! ```
//!
//! The record area occupies `[header_size, valid_bytes)`. Because
//! `valid_bytes` is 16-bit, a node never uses more than 64KB of its
//! block even when blocks are larger.

use byteorder::{ByteOrder, LittleEndian};

use crate::encoding::TreeKey;
use crate::NULL_BLOCK;

pub(crate) mod encoded;
pub(crate) mod fixed;

pub(crate) const NODE_VERSION: u8 = 0;

/// Size of the fixed part of the node header, before the two keys.
const FIXED_HEADER_LEN: usize = 14;

/// Full node header size for a given key type.
pub(crate) fn header_size<K: TreeKey>() -> usize {
    FIXED_HEADER_LEN + 2 * K::SERIALIZED_SIZE
}

/// Largest node area usable within a block payload.
pub(crate) fn usable_size(payload_size: usize) -> usize {
    payload_size.min(u16::MAX as usize)
}

pub(crate) fn version(buf: &[u8]) -> u8 {
    buf[0]
}

pub(crate) fn level(buf: &[u8]) -> u8 {
    buf[1]
}

pub(crate) fn record_count(buf: &[u8]) -> u16 {
    LittleEndian::read_u16(&buf[2..4])
}

pub(crate) fn set_record_count(buf: &mut [u8], count: u16) {
    LittleEndian::write_u16(&mut buf[2..4], count);
}

pub(crate) fn valid_bytes(buf: &[u8]) -> u16 {
    LittleEndian::read_u16(&buf[4..6])
}

pub(crate) fn set_valid_bytes(buf: &mut [u8], valid: u16) {
    LittleEndian::write_u16(&mut buf[4..6], valid);
}

pub(crate) fn left_sibling(buf: &[u8]) -> u32 {
    LittleEndian::read_u32(&buf[6..10])
}

pub(crate) fn set_left_sibling(buf: &mut [u8], address: u32) {
    LittleEndian::write_u32(&mut buf[6..10], address);
}

pub(crate) fn right_sibling(buf: &[u8]) -> u32 {
    LittleEndian::read_u32(&buf[10..14])
}

pub(crate) fn set_right_sibling(buf: &mut [u8], address: u32) {
    LittleEndian::write_u32(&mut buf[10..14], address);
}

pub(crate) fn lower_key<K: TreeKey>(buf: &[u8]) -> K {
    let mut key = K::default();
    key.read_from(&buf[FIXED_HEADER_LEN..FIXED_HEADER_LEN + K::SERIALIZED_SIZE]);
    key
}

pub(crate) fn set_lower_key<K: TreeKey>(buf: &mut [u8], key: &K) {
    key.write_to(&mut buf[FIXED_HEADER_LEN..FIXED_HEADER_LEN + K::SERIALIZED_SIZE]);
}

pub(crate) fn upper_key<K: TreeKey>(buf: &[u8]) -> K {
    let mut key = K::default();
    let at = FIXED_HEADER_LEN + K::SERIALIZED_SIZE;
    key.read_from(&buf[at..at + K::SERIALIZED_SIZE]);
    key
}

pub(crate) fn set_upper_key<K: TreeKey>(buf: &mut [u8], key: &K) {
    let at = FIXED_HEADER_LEN + K::SERIALIZED_SIZE;
    key.write_to(&mut buf[at..at + K::SERIALIZED_SIZE]);
}

/// Initializes an empty node over a zeroed buffer.
pub(crate) fn init_node<K: TreeKey>(buf: &mut [u8], node_level: u8, lower: &K, upper: &K) {
    buf.fill(0);
    buf[0] = NODE_VERSION;
    buf[1] = node_level;
    set_record_count(buf, 0);
    set_valid_bytes(buf, header_size::<K>() as u16);
    set_left_sibling(buf, NULL_BLOCK);
    set_right_sibling(buf, NULL_BLOCK);
    set_lower_key(buf, lower);
    set_upper_key(buf, upper);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::HistorianKey;

    #[test]
    fn header_round_trips() {
        let mut buf = vec![0u8; 512];
        let lower = HistorianKey::new(10, 0);
        let upper = HistorianKey::new(20, 0);
        init_node(&mut buf, 3, &lower, &upper);

        assert_eq!(version(&buf), NODE_VERSION);
        assert_eq!(level(&buf), 3);
        assert_eq!(record_count(&buf), 0);
        assert_eq!(valid_bytes(&buf) as usize, header_size::<HistorianKey>());
        assert_eq!(left_sibling(&buf), NULL_BLOCK);
        assert_eq!(right_sibling(&buf), NULL_BLOCK);
        assert_eq!(lower_key::<HistorianKey>(&buf), lower);
        assert_eq!(upper_key::<HistorianKey>(&buf), upper);

        set_record_count(&mut buf, 7);
        set_valid_bytes(&mut buf, 99);
        set_left_sibling(&mut buf, 5);
        set_right_sibling(&mut buf, 6);
        assert_eq!(record_count(&buf), 7);
        assert_eq!(valid_bytes(&buf), 99);
        assert_eq!(left_sibling(&buf), 5);
        assert_eq!(right_sibling(&buf), 6);
    }
}
