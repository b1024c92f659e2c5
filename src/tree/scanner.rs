//! Lazy forward/backward scanning over leaf chains.

use std::sync::Arc;

use crate::encoding::{PairEncoding, TreeKey, TreeValue};
use crate::NULL_BLOCK;

use super::{
    header::TreeHeader,
    node::{self, encoded},
    sequential::SortedPointStream,
    sorted_tree::read_fixed_records,
    sparse::descend_in,
    TreeError, TreeStore,
};

/// A cursor over a tree's records in key order.
///
/// The scanner decodes one leaf at a time and walks the sibling chain
/// lazily in either direction. Backward movement on delta-encoded
/// leaves is a per-node re-scan, which the decode-whole-leaf strategy
/// already pays for.
pub struct TreeScanner<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    store: Box<dyn TreeStore + Send>,
    header: TreeHeader,
    encoding: Arc<dyn PairEncoding<K, V>>,
    fixed: bool,
    buf: Vec<u8>,
    records: Vec<(K, V)>,
    /// Index of the next record `next` will return.
    position: usize,
    positioned: bool,
}

impl<K, V> TreeScanner<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    pub fn new(
        store: Box<dyn TreeStore + Send>,
        header: TreeHeader,
        encoding: Arc<dyn PairEncoding<K, V>>,
    ) -> Self {
        let payload = store.payload_size();
        let fixed = encoding.is_fixed_size();
        Self {
            store,
            header,
            encoding,
            fixed,
            buf: vec![0u8; payload],
            records: Vec::new(),
            position: 0,
            positioned: false,
        }
    }

    /// Positions the cursor at the first record of the tree.
    pub fn seek_first(&mut self) -> Result<(), TreeError> {
        self.seek(&K::min_value())
    }

    /// Positions the cursor at the first record with key `>= key`.
    pub fn seek(&mut self, key: &K) -> Result<(), TreeError> {
        let leaf = descend_in::<K>(self.store.as_mut(), &self.header, key, 0, &mut self.buf)?;
        self.load_leaf(leaf)?;
        self.position = self.records.partition_point(|record| record.0 < *key);
        self.positioned = true;
        Ok(())
    }

    fn load_leaf(&mut self, leaf: u32) -> Result<(), TreeError> {
        self.store.read_block(leaf, &mut self.buf)?;
        self.records = if self.fixed {
            read_fixed_records::<K, V>(&self.buf)
        } else {
            encoded::read_all::<K, V>(&self.buf, self.encoding.as_ref())
        };
        self.position = 0;
        Ok(())
    }

    /// Returns the record under the cursor without advancing.
    pub fn peek(&mut self) -> Result<Option<(K, V)>, TreeError> {
        if !self.positioned {
            self.seek_first()?;
        }
        loop {
            if self.position < self.records.len() {
                return Ok(Some(self.records[self.position].clone()));
            }
            let right = node::right_sibling(&self.buf);
            if right == NULL_BLOCK {
                return Ok(None);
            }
            self.load_leaf(right)?;
        }
    }

    /// Returns the record under the cursor and advances past it.
    pub fn read_next(&mut self) -> Result<Option<(K, V)>, TreeError> {
        let record = self.peek()?;
        if record.is_some() {
            self.position += 1;
        }
        Ok(record)
    }

    /// Moves the cursor one record back and returns that record.
    pub fn read_previous(&mut self) -> Result<Option<(K, V)>, TreeError> {
        if !self.positioned {
            self.seek_first()?;
        }
        loop {
            if self.position > 0 {
                self.position -= 1;
                return Ok(Some(self.records[self.position].clone()));
            }
            let left = node::left_sibling(&self.buf);
            if left == NULL_BLOCK {
                return Ok(None);
            }
            self.load_leaf(left)?;
            self.position = self.records.len();
        }
    }

    /// Collects every record in `[start, end)`.
    pub fn read_range(&mut self, start: &K, end: &K) -> Result<Vec<(K, V)>, TreeError> {
        self.seek(start)?;
        let mut out = Vec::new();
        while let Some((key, value)) = self.read_next()? {
            if key >= *end {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    /// Reads the value stored under exactly `key`.
    pub fn read_single_value(&mut self, key: &K) -> Result<Option<V>, TreeError> {
        self.seek(key)?;
        match self.peek()? {
            Some((found, value)) if found == *key => Ok(Some(value)),
            _ => Ok(None),
        }
    }
}

/// A scanner is a conforming bulk-load input: one tree is sequential
/// and duplicate-free by construction.
impl<K, V> SortedPointStream<K, V> for TreeScanner<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    fn is_always_sequential(&self) -> bool {
        true
    }

    fn never_contains_duplicates(&self) -> bool {
        true
    }

    fn next_pair(&mut self, key: &mut K, value: &mut V) -> Result<bool, TreeError> {
        match self.read_next()? {
            Some((next_key, next_value)) => {
                *key = next_key;
                *value = next_value;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
