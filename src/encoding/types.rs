//! Key and value type contracts, plus the historian point types.

use std::fmt::Debug;

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

/// A tree key: fixed serialized size, total order, min/max sentinels.
///
/// Keys carry no domain semantics beyond their ordering; the engine
/// only ever compares, copies, and serializes them.
pub trait TreeKey:
    Clone + Ord + PartialEq + Default + Debug + Send + Sync + 'static
{
    /// Exact little-endian serialized size, in bytes.
    const SERIALIZED_SIZE: usize;

    /// Stable identity of the key type, stored in encoding definitions.
    const TYPE_ID: Uuid;

    /// Writes exactly `SERIALIZED_SIZE` bytes into `buf`.
    fn write_to(&self, buf: &mut [u8]);

    /// Reads exactly `SERIALIZED_SIZE` bytes from `buf`.
    fn read_from(&mut self, buf: &[u8]);

    /// Sets this key to the smallest representable key.
    fn set_min(&mut self);

    /// Sets this key to the largest representable key.
    fn set_max(&mut self);

    fn min_value() -> Self {
        let mut key = Self::default();
        key.set_min();
        key
    }

    fn max_value() -> Self {
        let mut key = Self::default();
        key.set_max();
        key
    }
}

/// A tree value: fixed serialized size, no ordering requirement.
pub trait TreeValue: Clone + PartialEq + Default + Debug + Send + Sync + 'static {
    /// Exact little-endian serialized size, in bytes.
    const SERIALIZED_SIZE: usize;

    /// Stable identity of the value type, stored in encoding definitions.
    const TYPE_ID: Uuid;

    fn write_to(&self, buf: &mut [u8]);

    fn read_from(&mut self, buf: &[u8]);
}

/// A historian point key: `(timestamp, point_id, entry_number)`.
///
/// Ordering is lexicographic over the three fields, which gives the
/// ascending `(time, point)` iteration order the readers depend on. The
/// entry number disambiguates multiple records for the same point at
/// the same instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HistorianKey {
    pub timestamp: u64,
    pub point_id: u64,
    pub entry_number: u64,
}

impl HistorianKey {
    pub fn new(timestamp: u64, point_id: u64) -> Self {
        Self {
            timestamp,
            point_id,
            entry_number: 0,
        }
    }
}

impl TreeKey for HistorianKey {
    const SERIALIZED_SIZE: usize = 24;
    const TYPE_ID: Uuid = Uuid::from_u128(0x6befe0ab_9258_4a9b_a38c_c8ec42aa5f01);

    fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.timestamp);
        LittleEndian::write_u64(&mut buf[8..16], self.point_id);
        LittleEndian::write_u64(&mut buf[16..24], self.entry_number);
    }

    fn read_from(&mut self, buf: &[u8]) {
        self.timestamp = LittleEndian::read_u64(&buf[0..8]);
        self.point_id = LittleEndian::read_u64(&buf[8..16]);
        self.entry_number = LittleEndian::read_u64(&buf[16..24]);
    }

    fn set_min(&mut self) {
        self.timestamp = 0;
        self.point_id = 0;
        self.entry_number = 0;
    }

    fn set_max(&mut self) {
        self.timestamp = u64::MAX;
        self.point_id = u64::MAX;
        self.entry_number = u64::MAX;
    }
}

/// A historian point value: three opaque 64-bit words.
///
/// `value1` typically holds the measurement, `value2` quality flags and
/// `value3` auxiliary payload, but the engine treats all three as
/// opaque.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistorianValue {
    pub value1: u64,
    pub value2: u64,
    pub value3: u64,
}

impl HistorianValue {
    pub fn from_word(value1: u64) -> Self {
        Self {
            value1,
            value2: 0,
            value3: 0,
        }
    }
}

impl TreeValue for HistorianValue {
    const SERIALIZED_SIZE: usize = 24;
    const TYPE_ID: Uuid = Uuid::from_u128(0x24dde7dc_67f9_42b6_a11b_e27c3c00c2b3);

    fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.value1);
        LittleEndian::write_u64(&mut buf[8..16], self.value2);
        LittleEndian::write_u64(&mut buf[16..24], self.value3);
    }

    fn read_from(&mut self, buf: &[u8]) {
        self.value1 = LittleEndian::read_u64(&buf[0..8]);
        self.value2 = LittleEndian::read_u64(&buf[8..16]);
        self.value3 = LittleEndian::read_u64(&buf[16..24]);
    }
}

/// Block addresses are the values of interior tree levels.
impl TreeValue for u32 {
    const SERIALIZED_SIZE: usize = 4;
    const TYPE_ID: Uuid = Uuid::from_u128(0x8b3f1a06_1e20_4b9e_9f3a_67a31c68f4d2);

    fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], *self);
    }

    fn read_from(&mut self, buf: &[u8]) {
        *self = LittleEndian::read_u32(&buf[0..4]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn historian_key_orders_by_time_then_point_then_entry() {
        let a = HistorianKey {
            timestamp: 1,
            point_id: 100,
            entry_number: 0,
        };
        let b = HistorianKey {
            timestamp: 1,
            point_id: 101,
            entry_number: 0,
        };
        let c = HistorianKey {
            timestamp: 2,
            point_id: 0,
            entry_number: 0,
        };
        assert!(a < b);
        assert!(b < c);
        assert!(HistorianKey::min_value() < a);
        assert!(c < HistorianKey::max_value());
    }

    #[test]
    fn key_and_value_round_trip() {
        let key = HistorianKey {
            timestamp: 0x0102_0304_0506_0708,
            point_id: 42,
            entry_number: 7,
        };
        let mut buf = [0u8; HistorianKey::SERIALIZED_SIZE];
        key.write_to(&mut buf);
        let mut out = HistorianKey::default();
        out.read_from(&buf);
        assert_eq!(key, out);

        let value = HistorianValue {
            value1: u64::MAX,
            value2: 1,
            value3: 0,
        };
        let mut buf = [0u8; HistorianValue::SERIALIZED_SIZE];
        value.write_to(&mut buf);
        let mut out = HistorianValue::default();
        out.read_from(&buf);
        assert_eq!(value, out);
    }
}
