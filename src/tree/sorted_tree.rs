//! The sorted tree: lookups, inserts, removals, splits.
//!
//! A tree instance borrows its backing store and header for the
//! duration of a batch of operations; nothing is cached across
//! attachments, so attaching is free and the borrow checker keeps tree
//! access exclusive within an edit.

use crate::encoding::{PairEncoding, TreeKey, TreeValue};
use crate::NULL_BLOCK;

use super::{
    header::TreeHeader,
    node::{self, encoded, fixed},
    sequential::SortedPointStream,
    sparse::descend_in,
    TreeError, TreeStore,
};

/// Depth cap for the sparse index.
pub(crate) const MAX_TREE_DEPTH: u8 = 250;

/// A sorted tree attached to a store and header.
pub struct SortedTree<'a, K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    pub(crate) store: &'a mut dyn TreeStore,
    pub(crate) header: &'a mut TreeHeader,
    pub(crate) encoding: &'a dyn PairEncoding<K, V>,
    pub(crate) fixed: bool,
    pub(crate) payload: usize,
}

impl<'a, K, V> SortedTree<'a, K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    /// Initializes a brand-new tree: header at block 0, an empty root
    /// leaf at block 1.
    pub fn create(
        store: &mut dyn TreeStore,
        encoding: &dyn PairEncoding<K, V>,
    ) -> Result<TreeHeader, TreeError> {
        let payload = store.payload_size();
        check_capacity::<K>(payload, encoding.max_compression_size())?;

        let mut header = TreeHeader {
            root_address: 1,
            root_level: 0,
            last_allocated_block: 1,
            block_size: (payload + crate::io::FOOTER_LEN) as u32,
            encoding: encoding.definition(),
            dirty: false,
        };

        let mut buf = vec![0u8; payload];
        node::init_node::<K>(&mut buf, 0, &K::min_value(), &K::max_value());
        store.write_block(1, &buf)?;

        header.save_to(&mut buf);
        store.write_block(0, &buf)?;
        header.dirty = false;
        Ok(header)
    }

    /// Loads the tree header from block 0 of the store.
    pub fn open(store: &mut dyn TreeStore) -> Result<TreeHeader, TreeError> {
        let mut buf = vec![0u8; store.payload_size()];
        store.read_block(0, &mut buf)?;
        TreeHeader::load_from(&buf)
    }

    /// Attaches to an existing tree.
    pub fn attach(
        store: &'a mut dyn TreeStore,
        header: &'a mut TreeHeader,
        encoding: &'a dyn PairEncoding<K, V>,
    ) -> Self {
        let payload = store.payload_size();
        Self {
            store,
            header,
            encoding,
            fixed: encoding.is_fixed_size(),
            payload,
        }
    }

    pub(crate) fn alloc(&mut self) -> Result<u32, TreeError> {
        let next = self
            .header
            .last_allocated_block
            .checked_add(1)
            .filter(|&next| next < u32::MAX)
            .ok_or(TreeError::OutOfNodeAddresses)?;
        self.header.last_allocated_block = next;
        self.header.dirty = true;
        Ok(next)
    }

    pub(crate) fn descend(
        &mut self,
        key: &K,
        target_level: u8,
        buf: &mut [u8],
    ) -> Result<u32, TreeError> {
        descend_in::<K>(self.store, self.header, key, target_level, buf)
    }

    /// Inserts a pair; fails with `DuplicateKey` if the key exists.
    pub fn insert(&mut self, key: &K, value: &V) -> Result<(), TreeError> {
        let mut buf = vec![0u8; self.payload];
        let leaf = self.descend(key, 0, &mut buf)?;
        self.store.read_block(leaf, &mut buf)?;

        if self.fixed {
            match fixed::find::<K, V>(&buf, key) {
                Ok(_) => Err(TreeError::DuplicateKey),
                Err(index) => {
                    let capacity = fixed::capacity::<K, V>(self.payload)?;
                    if (node::record_count(&buf) as usize) < capacity {
                        fixed::insert_at::<K, V>(&mut buf, index, key, value);
                        self.store.write_block(leaf, &buf)
                    } else {
                        let mut records = read_fixed_records::<K, V>(&buf);
                        records.insert(index, (key.clone(), value.clone()));
                        self.split_leaf(leaf, &buf, records)
                    }
                }
            }
        } else {
            let mut records = encoded::read_all::<K, V>(&buf, self.encoding);
            match records.binary_search_by(|record| record.0.cmp(key)) {
                Ok(_) => Err(TreeError::DuplicateKey),
                Err(index) => {
                    records.insert(index, (key.clone(), value.clone()));
                    if encoded::write_all(&mut buf, &records, self.encoding) {
                        self.store.write_block(leaf, &buf)
                    } else {
                        self.split_leaf(leaf, &buf, records)
                    }
                }
            }
        }
    }

    /// Reads the value stored under `key`.
    pub fn get(&mut self, key: &K) -> Result<Option<V>, TreeError> {
        let mut buf = vec![0u8; self.payload];
        let leaf = self.descend(key, 0, &mut buf)?;
        self.store.read_block(leaf, &mut buf)?;

        if self.fixed {
            Ok(fixed::find::<K, V>(&buf, key)
                .ok()
                .map(|index| fixed::value_at::<K, V>(&buf, index)))
        } else {
            let records = encoded::read_all::<K, V>(&buf, self.encoding);
            Ok(records
                .binary_search_by(|record| record.0.cmp(key))
                .ok()
                .map(|index| records[index].1.clone()))
        }
    }

    /// Returns the first pair with key greater than or equal to `key`.
    pub fn get_or_next(&mut self, key: &K) -> Result<Option<(K, V)>, TreeError> {
        let mut buf = vec![0u8; self.payload];
        let mut leaf = self.descend(key, 0, &mut buf)?;
        loop {
            self.store.read_block(leaf, &mut buf)?;
            let count = node::record_count(&buf) as usize;
            let index = if self.fixed {
                match fixed::find::<K, V>(&buf, key) {
                    Ok(index) | Err(index) => index,
                }
            } else {
                let records = encoded::read_all::<K, V>(&buf, self.encoding);
                match records.binary_search_by(|record| record.0.cmp(key)) {
                    Ok(index) | Err(index) => index,
                }
            };
            if index < count {
                return Ok(Some(self.record_at(&buf, index)));
            }
            let right = node::right_sibling(&buf);
            if right == NULL_BLOCK {
                return Ok(None);
            }
            leaf = right;
        }
    }

    /// The smallest pair in the tree.
    pub fn first(&mut self) -> Result<Option<(K, V)>, TreeError> {
        self.get_or_next(&K::min_value())
    }

    /// The largest pair in the tree.
    pub fn last(&mut self) -> Result<Option<(K, V)>, TreeError> {
        let mut buf = vec![0u8; self.payload];
        let mut leaf = self.descend(&K::max_value(), 0, &mut buf)?;
        loop {
            self.store.read_block(leaf, &mut buf)?;
            let count = node::record_count(&buf) as usize;
            if count > 0 {
                return Ok(Some(self.record_at(&buf, count - 1)));
            }
            let left = node::left_sibling(&buf);
            if left == NULL_BLOCK {
                return Ok(None);
            }
            leaf = left;
        }
    }

    /// Replaces the value stored under `key`.
    pub fn update_value(&mut self, key: &K, value: &V) -> Result<(), TreeError> {
        let mut buf = vec![0u8; self.payload];
        let leaf = self.descend(key, 0, &mut buf)?;
        self.store.read_block(leaf, &mut buf)?;

        if self.fixed {
            match fixed::find::<K, V>(&buf, key) {
                Ok(index) => {
                    fixed::set_value_at::<K, V>(&mut buf, index, value);
                    self.store.write_block(leaf, &buf)
                }
                Err(_) => Err(TreeError::KeyNotFound),
            }
        } else {
            let mut records = encoded::read_all::<K, V>(&buf, self.encoding);
            match records.binary_search_by(|record| record.0.cmp(key)) {
                Ok(index) => {
                    records[index].1 = value.clone();
                    if encoded::write_all(&mut buf, &records, self.encoding) {
                        self.store.write_block(leaf, &buf)
                    } else {
                        // A larger encoded value can overflow the node.
                        self.split_leaf(leaf, &buf, records)
                    }
                }
                Err(_) => Err(TreeError::KeyNotFound),
            }
        }
    }

    /// Removes `key`; fails with `KeyNotFound` if absent.
    pub fn remove(&mut self, key: &K) -> Result<(), TreeError> {
        let mut buf = vec![0u8; self.payload];
        let leaf = self.descend(key, 0, &mut buf)?;
        self.store.read_block(leaf, &mut buf)?;

        if self.fixed {
            match fixed::find::<K, V>(&buf, key) {
                Ok(index) => fixed::remove_at::<K, V>(&mut buf, index),
                Err(_) => return Err(TreeError::KeyNotFound),
            }
        } else {
            let mut records = encoded::read_all::<K, V>(&buf, self.encoding);
            match records.binary_search_by(|record| record.0.cmp(key)) {
                Ok(index) => {
                    records.remove(index);
                    if !encoded::write_all(&mut buf, &records, self.encoding) {
                        // The successor now encodes against a different
                        // predecessor, which can grow a near-full node.
                        self.split_leaf(leaf, &buf, records)?;
                        self.collapse_root()?;
                        return Ok(());
                    }
                }
                Err(_) => return Err(TreeError::KeyNotFound),
            }
        }
        self.store.write_block(leaf, &buf)?;

        if node::record_count(&buf) == 0 && self.header.root_level > 0 {
            self.remove_empty_node(key, 0, &buf)?;
        } else if self.fixed && self.header.root_level > 0 {
            self.try_combine_leaf(leaf, &mut buf)?;
        }
        self.collapse_root()?;
        Ok(())
    }

    /// Underflow processing: a leaf that dropped below a quarter of its
    /// capacity absorbs its right sibling when the combined records
    /// fit, and the emptied sibling is unlinked.
    ///
    /// Only fixed-size trees rebalance this way; delta-encoded nodes
    /// cannot move records without re-encoding them, so they shrink by
    /// natural attrition instead.
    fn try_combine_leaf(&mut self, leaf: u32, buf: &mut [u8]) -> Result<(), TreeError> {
        let capacity = fixed::capacity::<K, V>(self.payload)?;
        let count = node::record_count(buf) as usize;
        if count * 4 >= capacity {
            return Ok(());
        }
        let right = node::right_sibling(buf);
        if right == NULL_BLOCK {
            return Ok(());
        }

        let mut right_buf = vec![0u8; self.payload];
        self.store.read_block(right, &mut right_buf)?;
        let right_count = node::record_count(&right_buf) as usize;
        if count + right_count > capacity {
            return Ok(());
        }

        let right_lower: K = node::lower_key(&right_buf);
        fixed::transfer_records::<K, V>(buf, &mut right_buf, -(right_count as isize));
        self.store.write_block(leaf, buf)?;
        self.store.write_block(right, &right_buf)?;

        // The drained sibling leaves the chain and loses its routing
        // entry; its key range folds into this leaf.
        self.remove_empty_node(&right_lower, 0, &right_buf)
    }

    /// Appends a pre-sorted, duplicate-free stream whose first key is
    /// strictly greater than the tree's current maximum.
    ///
    /// This is the append-optimized path: the tail leaf is kept
    /// decoded in memory and sealed only when it fills, instead of one
    /// descend-and-rewrite per pair.
    pub fn append_sequential_stream(
        &mut self,
        stream: &mut dyn SortedPointStream<K, V>,
    ) -> Result<u64, TreeError> {
        if !stream.is_always_sequential() {
            return Err(TreeError::NotSequential);
        }
        if !stream.never_contains_duplicates() {
            return Err(TreeError::ContainsDuplicates);
        }

        let mut buf = vec![0u8; self.payload];
        let mut tail_addr = self.descend(&K::max_value(), 0, &mut buf)?;
        self.store.read_block(tail_addr, &mut buf)?;
        let mut tail_lower: K = node::lower_key(&buf);
        let mut tail_left = node::left_sibling(&buf);
        let mut records = self.read_records(&buf);
        let tree_last = self.last()?.map(|(last_key, _)| last_key);

        let mut appended = 0u64;
        let mut key = K::default();
        let mut value = V::default();
        while stream.next_pair(&mut key, &mut value)? {
            let prior = records.last().map(|record| &record.0).or(tree_last.as_ref());
            if let Some(prior) = prior {
                if *prior >= key {
                    return Err(TreeError::NotSequential);
                }
            }
            records.push((key.clone(), value.clone()));
            if !self.records_fit(&records) {
                let overflow = records.pop().expect("just pushed");
                if records.is_empty() {
                    return Err(TreeError::CorruptNode {
                        address: tail_addr,
                        reason: "single record exceeds node capacity".to_string(),
                    });
                }

                // Seal the full tail and grow a fresh leaf to its right.
                let new_addr = self.alloc()?;
                let mut sealed = vec![0u8; self.payload];
                node::init_node::<K>(&mut sealed, 0, &tail_lower, &overflow.0);
                node::set_left_sibling(&mut sealed, tail_left);
                node::set_right_sibling(&mut sealed, new_addr);
                self.write_records(&mut sealed, &records, tail_addr)?;
                self.store.write_block(tail_addr, &sealed)?;
                self.index_add(overflow.0.clone(), new_addr, 1)?;

                tail_left = tail_addr;
                tail_lower = overflow.0.clone();
                tail_addr = new_addr;
                records = vec![overflow];
            }
            appended += 1;
        }

        let mut sealed = vec![0u8; self.payload];
        node::init_node::<K>(&mut sealed, 0, &tail_lower, &K::max_value());
        node::set_left_sibling(&mut sealed, tail_left);
        node::set_right_sibling(&mut sealed, NULL_BLOCK);
        self.write_records(&mut sealed, &records, tail_addr)?;
        self.store.write_block(tail_addr, &sealed)?;
        Ok(appended)
    }

    /// Persists the tree header if it changed.
    pub fn flush(&mut self) -> Result<(), TreeError> {
        if self.header.dirty {
            let mut buf = vec![0u8; self.payload];
            self.header.save_to(&mut buf);
            self.store.write_block(0, &buf)?;
            self.header.dirty = false;
        }
        Ok(())
    }

    fn record_at(&self, buf: &[u8], index: usize) -> (K, V) {
        if self.fixed {
            (
                fixed::key_at::<K, V>(buf, index),
                fixed::value_at::<K, V>(buf, index),
            )
        } else {
            let records = encoded::read_all::<K, V>(buf, self.encoding);
            records[index].clone()
        }
    }

    pub(crate) fn read_records(&self, buf: &[u8]) -> Vec<(K, V)> {
        if self.fixed {
            read_fixed_records::<K, V>(buf)
        } else {
            encoded::read_all::<K, V>(buf, self.encoding)
        }
    }

    fn records_fit(&self, records: &[(K, V)]) -> bool {
        if self.fixed {
            // Capacity was validated at create time.
            let capacity = (node::usable_size(self.payload) - node::header_size::<K>())
                / fixed::record_size::<K, V>();
            records.len() <= capacity
        } else {
            encoded::encoded_len(records, self.encoding) <= node::usable_size(self.payload)
        }
    }

    pub(crate) fn write_records(
        &self,
        buf: &mut [u8],
        records: &[(K, V)],
        address: u32,
    ) -> Result<(), TreeError> {
        if self.fixed {
            write_fixed_records::<K, V>(buf, records);
            Ok(())
        } else if encoded::write_all(buf, records, self.encoding) {
            Ok(())
        } else {
            Err(TreeError::CorruptNode {
                address,
                reason: "records do not fit in node".to_string(),
            })
        }
    }

    /// Splits a leaf around `records` (which already include the
    /// incoming pair) and pushes the dividing key into the sparse
    /// index.
    fn split_leaf(
        &mut self,
        leaf: u32,
        old: &[u8],
        records: Vec<(K, V)>,
    ) -> Result<(), TreeError> {
        let split_at = if self.fixed {
            records.len() / 2
        } else {
            encoded::split_index(&records, self.encoding)
        };
        let dividing = records[split_at].0.clone();
        let right_addr = self.alloc()?;

        let old_lower: K = node::lower_key(old);
        let old_upper: K = node::upper_key(old);
        let old_left = node::left_sibling(old);
        let old_right = node::right_sibling(old);

        let mut left_buf = vec![0u8; self.payload];
        node::init_node::<K>(&mut left_buf, 0, &old_lower, &dividing);
        node::set_left_sibling(&mut left_buf, old_left);
        node::set_right_sibling(&mut left_buf, right_addr);
        self.write_records(&mut left_buf, &records[..split_at], leaf)?;

        let mut right_buf = vec![0u8; self.payload];
        node::init_node::<K>(&mut right_buf, 0, &dividing, &old_upper);
        node::set_left_sibling(&mut right_buf, leaf);
        node::set_right_sibling(&mut right_buf, old_right);
        self.write_records(&mut right_buf, &records[split_at..], right_addr)?;

        self.store.write_block(leaf, &left_buf)?;
        self.store.write_block(right_addr, &right_buf)?;

        if old_right != NULL_BLOCK {
            let mut sibling = vec![0u8; self.payload];
            self.store.read_block(old_right, &mut sibling)?;
            node::set_left_sibling(&mut sibling, right_addr);
            self.store.write_block(old_right, &sibling)?;
        }

        self.index_add(dividing, right_addr, 1)
    }
}

pub(crate) fn check_capacity<K: TreeKey>(
    payload: usize,
    max_compression_size: usize,
) -> Result<(), TreeError> {
    let room = node::usable_size(payload).saturating_sub(node::header_size::<K>());
    let capacity = room / max_compression_size;
    if capacity < 4 {
        return Err(TreeError::NodeCapacityTooSmall { capacity });
    }
    Ok(())
}

pub(crate) fn read_fixed_records<K: TreeKey, V: TreeValue>(buf: &[u8]) -> Vec<(K, V)> {
    let count = node::record_count(buf) as usize;
    (0..count)
        .map(|index| {
            (
                fixed::key_at::<K, V>(buf, index),
                fixed::value_at::<K, V>(buf, index),
            )
        })
        .collect()
}

pub(crate) fn write_fixed_records<K: TreeKey, V: TreeValue>(buf: &mut [u8], records: &[(K, V)]) {
    for (index, (key, value)) in records.iter().enumerate() {
        fixed::write_record::<K, V>(buf, index, key, value);
    }
    node::set_record_count(buf, records.len() as u16);
    node::set_valid_bytes(
        buf,
        (node::header_size::<K>() + records.len() * fixed::record_size::<K, V>()) as u16,
    );
}
