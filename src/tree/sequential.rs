//! One-pass bulk construction from sorted streams.
//!
//! Given an input stream that is both always-sequential and
//! duplicate-free, the writer builds a complete tree without ever
//! revisiting a block: leaves fill and seal left to right, each sealed
//! leaf emits its dividing key upward, and the interior levels are
//! built the same way once leaf production ends. Both input guarantees
//! are asserted up front; streams that cannot promise them are
//! rejected before any block is written.

use crate::encoding::{PairEncoding, TreeKey, TreeValue};
use crate::NULL_BLOCK;

use super::{
    header::TreeHeader,
    node::{self, fixed},
    sorted_tree::{check_capacity, write_fixed_records, MAX_TREE_DEPTH},
    TreeError, TreeStore,
};

/// A stream of `(key, value)` pairs with declared ordering guarantees.
pub trait SortedPointStream<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    /// Whether keys are guaranteed strictly ascending.
    fn is_always_sequential(&self) -> bool;

    /// Whether the stream is guaranteed free of duplicate keys.
    fn never_contains_duplicates(&self) -> bool;

    /// Reads the next pair into `key`/`value`; returns `false` at the
    /// end of the stream.
    fn next_pair(&mut self, key: &mut K, value: &mut V) -> Result<bool, TreeError>;
}

/// An owned, pre-sorted vector of pairs.
pub struct VecStream<K, V> {
    records: Vec<(K, V)>,
    position: usize,
}

impl<K, V> VecStream<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    /// Wraps records that are already sorted and duplicate-free.
    pub fn from_sorted(records: Vec<(K, V)>) -> Self {
        debug_assert!(records.windows(2).all(|pair| pair[0].0 < pair[1].0));
        Self {
            records,
            position: 0,
        }
    }

    /// Sorts arbitrary points, keeping the last value written for any
    /// duplicated key.
    pub fn from_unsorted(mut points: Vec<(K, V)>) -> Self {
        points.sort_by(|a, b| a.0.cmp(&b.0));
        let mut records: Vec<(K, V)> = Vec::with_capacity(points.len());
        for point in points {
            match records.last_mut() {
                Some(last) if last.0 == point.0 => *last = point,
                _ => records.push(point),
            }
        }
        Self {
            records,
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<K, V> SortedPointStream<K, V> for VecStream<K, V>
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
        match self.records.get(self.position) {
            Some((next_key, next_value)) => {
                *key = next_key.clone();
                *value = next_value.clone();
                self.position += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

struct UnionSource<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    stream: Box<dyn SortedPointStream<K, V> + Send>,
    head: Option<(K, V)>,
}

impl<K, V> UnionSource<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    fn advance(&mut self) -> Result<(), TreeError> {
        let mut key = K::default();
        let mut value = V::default();
        self.head = if self.stream.next_pair(&mut key, &mut value)? {
            Some((key, value))
        } else {
            None
        };
        Ok(())
    }
}

/// Duplicate-safe k-way merge over conforming streams.
///
/// When multiple sources carry the same key, the source added last
/// wins; sources are therefore passed oldest first, newest last. The
/// union itself is a conforming stream, so merges compose.
pub struct UnionStream<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    sources: Vec<UnionSource<K, V>>,
}

impl<K, V> UnionStream<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    /// Builds a union, verifying each source's ordering claims.
    pub fn new(
        streams: Vec<Box<dyn SortedPointStream<K, V> + Send>>,
    ) -> Result<Self, TreeError> {
        let mut sources = Vec::with_capacity(streams.len());
        for stream in streams {
            if !stream.is_always_sequential() {
                return Err(TreeError::NotSequential);
            }
            if !stream.never_contains_duplicates() {
                return Err(TreeError::ContainsDuplicates);
            }
            let mut source = UnionSource { stream, head: None };
            source.advance()?;
            sources.push(source);
        }
        Ok(Self { sources })
    }
}

impl<K, V> SortedPointStream<K, V> for UnionStream<K, V>
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
        // Find the smallest head; on ties the newest (highest index)
        // source supplies the value.
        let mut winner: Option<usize> = None;
        for (index, source) in self.sources.iter().enumerate() {
            let Some((head_key, _)) = &source.head else {
                continue;
            };
            winner = match winner {
                None => Some(index),
                Some(best) => {
                    let (best_key, _) = self.sources[best]
                        .head
                        .as_ref()
                        .expect("winner always has a head");
                    if head_key <= best_key {
                        Some(index)
                    } else {
                        Some(best)
                    }
                }
            };
        }

        let Some(winner) = winner else {
            return Ok(false);
        };
        let (winning_key, winning_value) = self.sources[winner]
            .head
            .clone()
            .expect("winner always has a head");

        // Advance every source sitting on the winning key so shadowed
        // duplicates are consumed exactly once.
        for source in &mut self.sources {
            let matches = matches!(&source.head, Some((head_key, _)) if *head_key == winning_key);
            if matches {
                source.advance()?;
            }
        }

        *key = winning_key;
        *value = winning_value;
        Ok(true)
    }
}

/// The one-pass bulk tree builder.
pub struct SequentialTreeWriter;

impl SequentialTreeWriter {
    /// Builds a complete tree in `store` from `input`, returning the
    /// persisted tree header.
    ///
    /// # Errors
    ///
    /// Fails with `NotSequential`/`ContainsDuplicates` when the stream
    /// does not declare the required guarantees or violates them while
    /// streaming.
    pub fn build<K, V>(
        store: &mut dyn TreeStore,
        encoding: &dyn PairEncoding<K, V>,
        input: &mut dyn SortedPointStream<K, V>,
    ) -> Result<TreeHeader, TreeError>
    where
        K: TreeKey,
        V: TreeValue,
    {
        if !input.is_always_sequential() {
            return Err(TreeError::NotSequential);
        }
        if !input.never_contains_duplicates() {
            return Err(TreeError::ContainsDuplicates);
        }

        let payload = store.payload_size();
        check_capacity::<K>(payload, encoding.max_compression_size())?;
        let usable = node::usable_size(payload);

        let mut next_block = 2u32;
        fn alloc(next_block: &mut u32) -> Result<u32, TreeError> {
            let block = *next_block;
            *next_block = next_block
                .checked_add(1)
                .filter(|&next| next < u32::MAX)
                .ok_or(TreeError::OutOfNodeAddresses)?;
            Ok(block)
        }

        // Leaf pass.
        let mut scratch = vec![0u8; encoding.max_compression_size()];
        let mut leaf_buf = vec![0u8; payload];
        node::init_node::<K>(&mut leaf_buf, 0, &K::min_value(), &K::max_value());
        let mut leaf_addr = 1u32;
        let mut leaf_lower = K::min_value();
        let mut left_sibling = NULL_BLOCK;
        let mut pos = node::header_size::<K>();
        let mut count = 0u16;
        let mut prev_key = K::default();
        let mut prev_value = V::default();
        let mut last_key: Option<K> = None;
        let mut entries: Vec<(K, u32)> = Vec::new();

        let mut key = K::default();
        let mut value = V::default();
        while input.next_pair(&mut key, &mut value)? {
            if let Some(last) = &last_key {
                if *last == key {
                    return Err(TreeError::ContainsDuplicates);
                }
                if *last > key {
                    return Err(TreeError::NotSequential);
                }
            }

            let mut len = encoding.encode(&mut scratch, &prev_key, &prev_value, &key, &value);
            if pos + len > usable {
                // Seal this leaf: bound it by the incoming key, link it
                // to the next leaf, and emit its dividing key upward.
                let new_addr = alloc(&mut next_block)?;
                node::set_record_count(&mut leaf_buf, count);
                node::set_valid_bytes(&mut leaf_buf, pos as u16);
                node::set_upper_key(&mut leaf_buf, &key);
                node::set_left_sibling(&mut leaf_buf, left_sibling);
                node::set_right_sibling(&mut leaf_buf, new_addr);
                store.write_block(leaf_addr, &leaf_buf)?;
                entries.push((leaf_lower.clone(), leaf_addr));

                left_sibling = leaf_addr;
                leaf_addr = new_addr;
                leaf_lower = key.clone();
                node::init_node::<K>(&mut leaf_buf, 0, &leaf_lower, &K::max_value());
                pos = node::header_size::<K>();
                count = 0;
                prev_key = K::default();
                prev_value = V::default();
                // The head of a fresh leaf encodes against the cleared
                // pair.
                len = encoding.encode(&mut scratch, &prev_key, &prev_value, &key, &value);
            }

            leaf_buf[pos..pos + len].copy_from_slice(&scratch[..len]);
            pos += len;
            count += 1;
            prev_key = key.clone();
            prev_value = value.clone();
            last_key = Some(key.clone());
        }

        // Close the final leaf.
        node::set_record_count(&mut leaf_buf, count);
        node::set_valid_bytes(&mut leaf_buf, pos as u16);
        node::set_left_sibling(&mut leaf_buf, left_sibling);
        node::set_right_sibling(&mut leaf_buf, NULL_BLOCK);
        store.write_block(leaf_addr, &leaf_buf)?;
        entries.push((leaf_lower.clone(), leaf_addr));

        // Interior passes: while a level still has multiple nodes,
        // build the level above it from their dividing keys.
        let interior_capacity = fixed::capacity::<K, u32>(payload)?;
        let mut level = 1u8;
        while entries.len() > 1 {
            if level > MAX_TREE_DEPTH {
                return Err(TreeError::TreeDepthExceeded);
            }

            let mut next_entries: Vec<(K, u32)> = Vec::new();
            let mut start = 0usize;
            let mut level_left_sibling = NULL_BLOCK;
            let mut node_buf = vec![0u8; payload];
            while start < entries.len() {
                let end = (start + interior_capacity).min(entries.len());
                let chunk = &entries[start..end];
                let address = alloc(&mut next_block)?;

                let lower = chunk[0].0.clone();
                let upper = if end < entries.len() {
                    entries[end].0.clone()
                } else {
                    K::max_value()
                };
                node::init_node::<K>(&mut node_buf, level, &lower, &upper);
                node::set_left_sibling(&mut node_buf, level_left_sibling);
                let right = if end < entries.len() {
                    // Nodes of one level are allocated back to back.
                    next_block
                } else {
                    NULL_BLOCK
                };
                node::set_right_sibling(&mut node_buf, right);
                write_fixed_records::<K, u32>(&mut node_buf, chunk);
                store.write_block(address, &node_buf)?;

                next_entries.push((lower, address));
                level_left_sibling = address;
                start = end;
            }

            entries = next_entries;
            level += 1;
        }

        let header = TreeHeader {
            root_address: entries[0].1,
            root_level: level - 1,
            last_allocated_block: next_block - 1,
            block_size: (payload + crate::io::FOOTER_LEN) as u32,
            encoding: encoding.definition(),
            dirty: false,
        };
        let mut header_buf = vec![0u8; payload];
        header.save_to(&mut header_buf);
        store.write_block(0, &header_buf)?;
        Ok(header)
    }
}
