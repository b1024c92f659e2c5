//! Delta pair encoding for historian points.
//!
//! Consecutive points usually share a timestamp (a scan of many points
//! at one instant) or advance it by a small step, carry small point-id
//! movements, and leave `entry_number` and `value3` at zero. The
//! encoding exploits all of that with a leading condition byte and
//! xor-folded 7-bit varints. Xor deltas are order-independent, so the
//! encoding stays valid for mid-node inserts, not just appends.

use uuid::Uuid;

use super::{
    registry::EncodingDefinition,
    types::{HistorianKey, HistorianValue},
    varint::{read_7bit_u64, write_7bit_u64},
    PairEncoding, TreeKey, TreeValue,
};

/// Method id of the historian delta encoding.
pub const HISTORIAN_DELTA_METHOD: Uuid = Uuid::from_u128(0xd4626375_3e2f_4a62_bb23_2cc9545a0f87);

const FLAG_TIMESTAMP_UNCHANGED: u8 = 0x01;
const FLAG_ENTRY_ZERO: u8 = 0x02;
const FLAG_VALUE3_ZERO: u8 = 0x04;

// Condition byte plus up to six 10-byte varints.
const MAX_PAIR_SIZE: usize = 1 + 6 * 10;

/// Delta codec for `(HistorianKey, HistorianValue)` pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistorianDeltaEncoding;

impl HistorianDeltaEncoding {
    pub fn new() -> Self {
        Self
    }
}

impl PairEncoding<HistorianKey, HistorianValue> for HistorianDeltaEncoding {
    fn definition(&self) -> EncodingDefinition {
        EncodingDefinition::new(
            HistorianKey::TYPE_ID,
            HistorianValue::TYPE_ID,
            HISTORIAN_DELTA_METHOD,
        )
    }

    fn max_compression_size(&self) -> usize {
        MAX_PAIR_SIZE
    }

    fn encode(
        &self,
        dst: &mut [u8],
        prev_key: &HistorianKey,
        prev_value: &HistorianValue,
        key: &HistorianKey,
        value: &HistorianValue,
    ) -> usize {
        let mut flags = 0u8;
        if key.timestamp == prev_key.timestamp {
            flags |= FLAG_TIMESTAMP_UNCHANGED;
        }
        if key.entry_number == 0 {
            flags |= FLAG_ENTRY_ZERO;
        }
        if value.value3 == 0 {
            flags |= FLAG_VALUE3_ZERO;
        }

        dst[0] = flags;
        let mut pos = 1;
        if flags & FLAG_TIMESTAMP_UNCHANGED == 0 {
            write_7bit_u64(dst, &mut pos, key.timestamp ^ prev_key.timestamp);
        }
        write_7bit_u64(dst, &mut pos, key.point_id ^ prev_key.point_id);
        if flags & FLAG_ENTRY_ZERO == 0 {
            write_7bit_u64(dst, &mut pos, key.entry_number);
        }
        write_7bit_u64(dst, &mut pos, value.value1 ^ prev_value.value1);
        write_7bit_u64(dst, &mut pos, value.value2 ^ prev_value.value2);
        if flags & FLAG_VALUE3_ZERO == 0 {
            write_7bit_u64(dst, &mut pos, value.value3);
        }
        pos
    }

    fn decode(
        &self,
        src: &[u8],
        prev_key: &HistorianKey,
        prev_value: &HistorianValue,
        key: &mut HistorianKey,
        value: &mut HistorianValue,
    ) -> usize {
        let flags = src[0];
        let mut pos = 1;

        key.timestamp = if flags & FLAG_TIMESTAMP_UNCHANGED == 0 {
            // Record regions are length-validated by the node header, so a
            // short read here is a logic error rather than a data error.
            read_7bit_u64(src, &mut pos).expect("record region truncated") ^ prev_key.timestamp
        } else {
            prev_key.timestamp
        };
        key.point_id = read_7bit_u64(src, &mut pos).expect("record region truncated")
            ^ prev_key.point_id;
        key.entry_number = if flags & FLAG_ENTRY_ZERO == 0 {
            read_7bit_u64(src, &mut pos).expect("record region truncated")
        } else {
            0
        };

        value.value1 = read_7bit_u64(src, &mut pos).expect("record region truncated")
            ^ prev_value.value1;
        value.value2 = read_7bit_u64(src, &mut pos).expect("record region truncated")
            ^ prev_value.value2;
        value.value3 = if flags & FLAG_VALUE3_ZERO == 0 {
            read_7bit_u64(src, &mut pos).expect("record region truncated")
        } else {
            0
        };
        pos
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn round_trip(
        prev_key: HistorianKey,
        prev_value: HistorianValue,
        key: HistorianKey,
        value: HistorianValue,
    ) {
        let encoding = HistorianDeltaEncoding::new();
        let mut buf = vec![0u8; encoding.max_compression_size()];
        let written = encoding.encode(&mut buf, &prev_key, &prev_value, &key, &value);
        assert!(written <= encoding.max_compression_size());

        let mut out_key = HistorianKey::default();
        let mut out_value = HistorianValue::default();
        let read = encoding.decode(&buf, &prev_key, &prev_value, &mut out_key, &mut out_value);
        assert_eq!(read, written);
        assert_eq!(out_key, key);
        assert_eq!(out_value, value);
    }

    #[test]
    fn shared_timestamp_compresses_small() {
        let encoding = HistorianDeltaEncoding::new();
        let prev_key = HistorianKey::new(1000, 17);
        let key = HistorianKey::new(1000, 18);
        let prev_value = HistorianValue::from_word(500);
        let value = HistorianValue::from_word(501);

        let mut buf = vec![0u8; encoding.max_compression_size()];
        let written = encoding.encode(&mut buf, &prev_key, &prev_value, &key, &value);
        // flags + point xor + v1 xor + v2 xor: four bytes.
        assert_eq!(written, 4);

        round_trip(prev_key, prev_value, key, value);
    }

    #[test]
    fn first_record_encodes_against_cleared_predecessor() {
        round_trip(
            HistorianKey::default(),
            HistorianValue::default(),
            HistorianKey {
                timestamp: u64::MAX,
                point_id: u64::MAX,
                entry_number: u64::MAX,
            },
            HistorianValue {
                value1: u64::MAX,
                value2: u64::MAX,
                value3: u64::MAX,
            },
        );
    }

    proptest! {
        #[test]
        fn round_trips_arbitrary_pairs(
            pts in any::<u64>(), ppt in any::<u64>(), pen in any::<u64>(),
            ts in any::<u64>(), pt in any::<u64>(), en in any::<u64>(),
            pv1 in any::<u64>(), pv2 in any::<u64>(), pv3 in any::<u64>(),
            v1 in any::<u64>(), v2 in any::<u64>(), v3 in any::<u64>(),
        ) {
            round_trip(
                HistorianKey { timestamp: pts, point_id: ppt, entry_number: pen },
                HistorianValue { value1: pv1, value2: pv2, value3: pv3 },
                HistorianKey { timestamp: ts, point_id: pt, entry_number: en },
                HistorianValue { value1: v1, value2: v2, value3: v3 },
            );
        }
    }
}
