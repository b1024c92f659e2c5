//! Verbatim fixed-size pair encoding.

use std::marker::PhantomData;

use uuid::Uuid;

use super::{registry::EncodingDefinition, PairEncoding, TreeKey, TreeValue};

/// Method id of the fixed encoding, shared across all key/value types.
pub const FIXED_ENCODING_METHOD: Uuid = Uuid::from_u128(0x1dea326d_a63a_4f73_b51c_7b3125c6da55);

/// Writes each pair verbatim: key bytes followed by value bytes.
///
/// Because every record is the same size, nodes using this encoding are
/// binary-searchable and support in-place tail shifting on insert and
/// remove.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPairEncoding<K, V> {
    _types: PhantomData<(K, V)>,
}

impl<K, V> FixedPairEncoding<K, V> {
    pub fn new() -> Self {
        Self {
            _types: PhantomData,
        }
    }
}

impl<K, V> PairEncoding<K, V> for FixedPairEncoding<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    fn definition(&self) -> EncodingDefinition {
        EncodingDefinition::new(K::TYPE_ID, V::TYPE_ID, FIXED_ENCODING_METHOD)
    }

    fn is_fixed_size(&self) -> bool {
        true
    }

    fn max_compression_size(&self) -> usize {
        K::SERIALIZED_SIZE + V::SERIALIZED_SIZE
    }

    fn encode(&self, dst: &mut [u8], _prev_key: &K, _prev_value: &V, key: &K, value: &V) -> usize {
        key.write_to(&mut dst[..K::SERIALIZED_SIZE]);
        value.write_to(&mut dst[K::SERIALIZED_SIZE..K::SERIALIZED_SIZE + V::SERIALIZED_SIZE]);
        K::SERIALIZED_SIZE + V::SERIALIZED_SIZE
    }

    fn decode(
        &self,
        src: &[u8],
        _prev_key: &K,
        _prev_value: &V,
        key: &mut K,
        value: &mut V,
    ) -> usize {
        key.read_from(&src[..K::SERIALIZED_SIZE]);
        value.read_from(&src[K::SERIALIZED_SIZE..K::SERIALIZED_SIZE + V::SERIALIZED_SIZE]);
        K::SERIALIZED_SIZE + V::SERIALIZED_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{HistorianKey, HistorianValue};

    #[test]
    fn round_trips_independent_of_previous_pair() {
        let encoding = FixedPairEncoding::<HistorianKey, HistorianValue>::new();
        let key = HistorianKey::new(55, 9);
        let value = HistorianValue::from_word(1234);
        let prev_key = HistorianKey::new(1, 1);
        let prev_value = HistorianValue::from_word(9999);

        let mut buf = vec![0u8; encoding.max_compression_size()];
        let written = encoding.encode(&mut buf, &prev_key, &prev_value, &key, &value);
        assert_eq!(written, 48);

        let mut out_key = HistorianKey::default();
        let mut out_value = HistorianValue::default();
        let read = encoding.decode(
            &buf,
            &HistorianKey::default(),
            &HistorianValue::default(),
            &mut out_key,
            &mut out_value,
        );
        assert_eq!(read, written);
        assert_eq!(out_key, key);
        assert_eq!(out_value, value);
    }
}
