//! Encoding definitions and the startup registry.

use std::{collections::HashMap, sync::Arc};

use byteorder::{ByteOrder, LittleEndian};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{
    delta::HistorianDeltaEncoding, fixed::FixedPairEncoding, types::{HistorianKey, HistorianValue},
    EncodingError, PairEncoding, TreeKey, TreeValue,
};

/// Serialized size of an [`EncodingDefinition`].
pub const DEFINITION_LEN: usize = 48;

/// Stable identity of a pair encoding: key type, value type, method.
///
/// The triple is persisted in every tree header; opening a table
/// resolves it back to an implementation through an
/// [`EncodingLibrary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodingDefinition {
    pub key_type: Uuid,
    pub value_type: Uuid,
    pub method: Uuid,
}

impl EncodingDefinition {
    pub fn new(key_type: Uuid, value_type: Uuid, method: Uuid) -> Self {
        Self {
            key_type,
            value_type,
            method,
        }
    }

    /// Writes the 48-byte serialized form.
    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u128(&mut buf[0..16], self.key_type.as_u128());
        LittleEndian::write_u128(&mut buf[16..32], self.value_type.as_u128());
        LittleEndian::write_u128(&mut buf[32..48], self.method.as_u128());
    }

    /// Reads the 48-byte serialized form.
    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            key_type: Uuid::from_u128(LittleEndian::read_u128(&buf[0..16])),
            value_type: Uuid::from_u128(LittleEndian::read_u128(&buf[16..32])),
            method: Uuid::from_u128(LittleEndian::read_u128(&buf[32..48])),
        }
    }
}

/// Registry of pair encodings for one key/value type pair.
///
/// Registration happens once at startup; lookups are read-locked only.
/// Re-registering the same method id replaces the implementation, which
/// keeps repeated test initialization idempotent.
pub struct EncodingLibrary<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    by_method: RwLock<HashMap<Uuid, Arc<dyn PairEncoding<K, V>>>>,
}

impl<K, V> EncodingLibrary<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    pub fn new() -> Self {
        Self {
            by_method: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, encoding: Arc<dyn PairEncoding<K, V>>) {
        let method = encoding.definition().method;
        self.by_method.write().insert(method, encoding);
    }

    /// Resolves a persisted definition back to an implementation.
    ///
    /// # Errors
    ///
    /// Fails if the definition's key or value type does not match this
    /// library's types, or no encoding with the method id is registered.
    pub fn lookup(
        &self,
        definition: &EncodingDefinition,
    ) -> Result<Arc<dyn PairEncoding<K, V>>, EncodingError> {
        if definition.key_type != K::TYPE_ID {
            return Err(EncodingError::KeyTypeMismatch {
                expected: K::TYPE_ID,
                actual: definition.key_type,
            });
        }
        if definition.value_type != V::TYPE_ID {
            return Err(EncodingError::ValueTypeMismatch {
                expected: V::TYPE_ID,
                actual: definition.value_type,
            });
        }
        self.by_method
            .read()
            .get(&definition.method)
            .cloned()
            .ok_or(EncodingError::UnknownEncoding {
                method: definition.method,
            })
    }
}

impl<K, V> Default for EncodingLibrary<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    fn default() -> Self {
        Self::new()
    }
}

static HISTORIAN_ENCODINGS: Lazy<EncodingLibrary<HistorianKey, HistorianValue>> =
    Lazy::new(|| {
        let library = EncodingLibrary::new();
        library.register(Arc::new(
            FixedPairEncoding::<HistorianKey, HistorianValue>::new(),
        ));
        library.register(Arc::new(HistorianDeltaEncoding::new()));
        library
    });

/// The process-wide library for historian point tables.
pub fn historian_encodings() -> &'static EncodingLibrary<HistorianKey, HistorianValue> {
    &HISTORIAN_ENCODINGS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{FIXED_ENCODING_METHOD, HISTORIAN_DELTA_METHOD};

    #[test]
    fn definition_round_trips() {
        let definition = EncodingDefinition::new(
            HistorianKey::TYPE_ID,
            HistorianValue::TYPE_ID,
            HISTORIAN_DELTA_METHOD,
        );
        let mut buf = [0u8; DEFINITION_LEN];
        definition.write_to(&mut buf);
        assert_eq!(EncodingDefinition::read_from(&buf), definition);
    }

    #[test]
    fn default_library_resolves_built_in_encodings() {
        let library = historian_encodings();
        for method in [FIXED_ENCODING_METHOD, HISTORIAN_DELTA_METHOD] {
            let definition =
                EncodingDefinition::new(HistorianKey::TYPE_ID, HistorianValue::TYPE_ID, method);
            let encoding = library.lookup(&definition).expect("built-in must resolve");
            assert_eq!(encoding.definition(), definition);
        }
    }

    #[test]
    fn mismatched_types_are_rejected() {
        let library = historian_encodings();
        let bad_key = EncodingDefinition::new(
            Uuid::from_u128(1),
            HistorianValue::TYPE_ID,
            FIXED_ENCODING_METHOD,
        );
        assert!(matches!(
            library.lookup(&bad_key),
            Err(EncodingError::KeyTypeMismatch { .. })
        ));

        let unknown = EncodingDefinition::new(
            HistorianKey::TYPE_ID,
            HistorianValue::TYPE_ID,
            Uuid::from_u128(2),
        );
        assert!(matches!(
            library.lookup(&unknown),
            Err(EncodingError::UnknownEncoding { .. })
        ));
    }
}
