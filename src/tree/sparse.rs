//! The sparse index: interior levels of the tree.
//!
//! Interior nodes are always fixed-encoded `(dividing key, child
//! address)` records. A dividing key is the inclusive lower bound of
//! its child's subtree; the leftmost entry of a level carries the
//! minimum key so every search key routes somewhere. Adding an entry
//! above the current root grows a new root that captures the old root
//! as its minimum-key entry; removals collapse single-entry roots back
//! down.

use crate::encoding::{TreeKey, TreeValue};
use crate::NULL_BLOCK;

use super::{
    header::TreeHeader,
    node::{self, fixed},
    sorted_tree::{read_fixed_records, write_fixed_records, SortedTree, MAX_TREE_DEPTH},
    TreeError, TreeStore,
};

/// Routes `key` through one interior node to a child address.
pub(crate) fn route<K: TreeKey>(buf: &[u8], key: &K, address: u32) -> Result<u32, TreeError> {
    let count = node::record_count(buf) as usize;
    if count == 0 {
        return Err(TreeError::CorruptNode {
            address,
            reason: "interior node has no entries".to_string(),
        });
    }
    match fixed::find::<K, u32>(buf, key) {
        Ok(index) => Ok(fixed::value_at::<K, u32>(buf, index)),
        // Keys below the first entry can occur after subtree removals;
        // they clamp to the leftmost child.
        Err(0) => Ok(fixed::value_at::<K, u32>(buf, 0)),
        Err(index) => Ok(fixed::value_at::<K, u32>(buf, index - 1)),
    }
}

/// Walks from the root down to `target_level`, returning the node
/// address at that level responsible for `key`.
pub(crate) fn descend_in<K: TreeKey>(
    store: &mut dyn TreeStore,
    header: &TreeHeader,
    key: &K,
    target_level: u8,
    buf: &mut [u8],
) -> Result<u32, TreeError> {
    let mut address = header.root_address;
    let mut level = header.root_level;
    while level > target_level {
        store.read_block(address, buf)?;
        if node::level(buf) != level {
            return Err(TreeError::CorruptNode {
                address,
                reason: format!("expected level {level}, found {}", node::level(buf)),
            });
        }
        address = route::<K>(buf, key, address)?;
        level -= 1;
    }
    Ok(address)
}

impl<K, V> SortedTree<'_, K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    /// Inserts `(key, child)` at interior `level`, growing a new root
    /// when `level` exceeds the current root level.
    pub(crate) fn index_add(&mut self, key: K, child: u32, level: u8) -> Result<(), TreeError> {
        if level > MAX_TREE_DEPTH {
            return Err(TreeError::TreeDepthExceeded);
        }

        if level > self.header.root_level {
            let root_addr = self.alloc()?;
            let mut buf = vec![0u8; self.payload];
            node::init_node::<K>(&mut buf, level, &K::min_value(), &K::max_value());
            fixed::insert_at::<K, u32>(&mut buf, 0, &K::min_value(), &self.header.root_address);
            fixed::insert_at::<K, u32>(&mut buf, 1, &key, &child);
            self.store.write_block(root_addr, &buf)?;

            self.header.root_address = root_addr;
            self.header.root_level = level;
            self.header.dirty = true;
            debug!(level, address = root_addr, "Tree root has changed.");
            return Ok(());
        }

        let mut buf = vec![0u8; self.payload];
        let node_addr = self.descend(&key, level, &mut buf)?;
        self.store.read_block(node_addr, &mut buf)?;
        match fixed::find::<K, u32>(&buf, &key) {
            Ok(_) => Err(TreeError::CorruptNode {
                address: node_addr,
                reason: "dividing key already present".to_string(),
            }),
            Err(index) => {
                let capacity = fixed::capacity::<K, u32>(self.payload)?;
                if (node::record_count(&buf) as usize) < capacity {
                    fixed::insert_at::<K, u32>(&mut buf, index, &key, &child);
                    self.store.write_block(node_addr, &buf)
                } else {
                    let mut records = read_fixed_records::<K, u32>(&buf);
                    records.insert(index, (key, child));
                    self.split_interior(node_addr, &buf, records, level)
                }
            }
        }
    }

    /// Splits an interior node and pushes its dividing key one level
    /// up.
    fn split_interior(
        &mut self,
        address: u32,
        old: &[u8],
        records: Vec<(K, u32)>,
        level: u8,
    ) -> Result<(), TreeError> {
        let split_at = records.len() / 2;
        let dividing = records[split_at].0.clone();
        let right_addr = self.alloc()?;

        let old_lower: K = node::lower_key(old);
        let old_upper: K = node::upper_key(old);
        let old_left = node::left_sibling(old);
        let old_right = node::right_sibling(old);

        let mut left_buf = vec![0u8; self.payload];
        node::init_node::<K>(&mut left_buf, level, &old_lower, &dividing);
        node::set_left_sibling(&mut left_buf, old_left);
        node::set_right_sibling(&mut left_buf, right_addr);
        write_fixed_records::<K, u32>(&mut left_buf, &records[..split_at]);

        let mut right_buf = vec![0u8; self.payload];
        node::init_node::<K>(&mut right_buf, level, &dividing, &old_upper);
        node::set_left_sibling(&mut right_buf, address);
        node::set_right_sibling(&mut right_buf, old_right);
        write_fixed_records::<K, u32>(&mut right_buf, &records[split_at..]);

        self.store.write_block(address, &left_buf)?;
        self.store.write_block(right_addr, &right_buf)?;

        if old_right != NULL_BLOCK {
            let mut sibling = vec![0u8; self.payload];
            self.store.read_block(old_right, &mut sibling)?;
            node::set_left_sibling(&mut sibling, right_addr);
            self.store.write_block(old_right, &sibling)?;
        }

        self.index_add(dividing, right_addr, level + 1)
    }

    /// Removes the entry routing `key` at interior `level`.
    pub(crate) fn index_remove(&mut self, key: &K, level: u8) -> Result<(), TreeError> {
        let mut buf = vec![0u8; self.payload];
        let node_addr = self.descend(key, level, &mut buf)?;
        self.store.read_block(node_addr, &mut buf)?;

        let index = match fixed::find::<K, u32>(&buf, key) {
            Ok(index) => index,
            Err(0) => {
                return Err(TreeError::CorruptNode {
                    address: node_addr,
                    reason: "no routing entry to remove".to_string(),
                })
            }
            Err(index) => index - 1,
        };
        fixed::remove_at::<K, u32>(&mut buf, index);
        self.store.write_block(node_addr, &buf)?;

        if node::record_count(&buf) == 0 && level < self.header.root_level {
            self.remove_empty_node(key, level, &buf)?;
        }
        Ok(())
    }

    /// Unlinks a drained node from its sibling chain and drops its
    /// routing entry from the parent level.
    pub(crate) fn remove_empty_node(
        &mut self,
        key: &K,
        level: u8,
        buf: &[u8],
    ) -> Result<(), TreeError> {
        let left = node::left_sibling(buf);
        let right = node::right_sibling(buf);
        let lower: K = node::lower_key(buf);
        let upper: K = node::upper_key(buf);

        let mut scratch = vec![0u8; self.payload];
        if left != NULL_BLOCK {
            self.store.read_block(left, &mut scratch)?;
            node::set_right_sibling(&mut scratch, right);
            // The left neighbor absorbs the vacated key range so every
            // search key still lands inside some node's bounds.
            node::set_upper_key(&mut scratch, &upper);
            self.store.write_block(left, &scratch)?;
        }
        if right != NULL_BLOCK {
            self.store.read_block(right, &mut scratch)?;
            node::set_left_sibling(&mut scratch, left);
            if left == NULL_BLOCK {
                node::set_lower_key(&mut scratch, &lower);
            }
            self.store.write_block(right, &scratch)?;
        }

        self.index_remove(key, level + 1)
    }

    /// Collapses single-entry roots until the root is meaningful
    /// again.
    pub(crate) fn collapse_root(&mut self) -> Result<(), TreeError> {
        let mut buf = vec![0u8; self.payload];
        while self.header.root_level > 0 {
            self.store.read_block(self.header.root_address, &mut buf)?;
            if node::record_count(&buf) != 1 {
                break;
            }
            let child = fixed::value_at::<K, u32>(&buf, 0);
            self.header.root_address = child;
            self.header.root_level -= 1;
            self.header.dirty = true;
            debug!(
                level = self.header.root_level,
                address = child,
                "Tree root has changed."
            );
        }
        Ok(())
    }

    /// Reports whether the parent entry routing `key` at `level` has a
    /// left and/or right neighbor within the same parent node.
    pub fn can_combine_with_siblings(
        &mut self,
        key: &K,
        level: u8,
    ) -> Result<(bool, bool), TreeError> {
        if level >= self.header.root_level {
            return Ok((false, false));
        }
        let mut buf = vec![0u8; self.payload];
        let parent = self.descend(key, level + 1, &mut buf)?;
        self.store.read_block(parent, &mut buf)?;
        let count = node::record_count(&buf) as usize;
        let index = match fixed::find::<K, u32>(&buf, key) {
            Ok(index) => index,
            Err(0) => 0,
            Err(index) => index - 1,
        };
        Ok((index > 0, index + 1 < count))
    }

    /// Repoints the child address stored under a dividing key.
    pub fn update_index_value(
        &mut self,
        key: &K,
        child: u32,
        level: u8,
    ) -> Result<(), TreeError> {
        if level == 0 || level > self.header.root_level {
            return Err(TreeError::KeyNotFound);
        }
        let mut buf = vec![0u8; self.payload];
        let node_addr = self.descend(key, level, &mut buf)?;
        self.store.read_block(node_addr, &mut buf)?;
        match fixed::find::<K, u32>(&buf, key) {
            Ok(index) => {
                fixed::set_value_at::<K, u32>(&mut buf, index, &child);
                self.store.write_block(node_addr, &buf)
            }
            Err(_) => Err(TreeError::KeyNotFound),
        }
    }

    /// Replaces a dividing key at an interior level.
    ///
    /// Only interior levels support key updates, and the new key must
    /// preserve its node's sort order.
    pub fn update_index_key(&mut self, old: &K, new: &K, level: u8) -> Result<(), TreeError> {
        if level == 0 || level > self.header.root_level {
            return Err(TreeError::KeyNotFound);
        }
        let mut buf = vec![0u8; self.payload];
        let node_addr = self.descend(old, level, &mut buf)?;
        self.store.read_block(node_addr, &mut buf)?;
        match fixed::find::<K, u32>(&buf, old) {
            Ok(index) => {
                fixed::update_key_at::<K, u32>(&mut buf, index, new)?;
                self.store.write_block(node_addr, &buf)
            }
            Err(_) => Err(TreeError::KeyNotFound),
        }
    }
}
