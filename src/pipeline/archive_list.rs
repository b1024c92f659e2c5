//! The archive list: every table currently attached to the engine.
//!
//! A coarse read-writer lock guards the list. Writers (the first-stage
//! writer and combine tasks) hold the write side only for the duration
//! of an add/remove batch; readers clone the entry vector, which pins
//! each table through its `Arc` and thereby defers physical deletion
//! of replaced files until the last reader lets go.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use uuid::Uuid;

use crate::encoding::{TreeKey, TreeValue};
use crate::tree::ArchiveTable;

/// One attached table plus its pipeline flags.
pub struct ArchiveListEntry<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    pub table: Arc<ArchiveTable<K, V>>,
    pub flags: Vec<Uuid>,
}

impl<K, V> Clone for ArchiveListEntry<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            flags: self.flags.clone(),
        }
    }
}

impl<K, V> ArchiveListEntry<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    pub fn has_flag(&self, flag: Uuid) -> bool {
        self.flags.contains(&flag)
    }
}

/// The shared list of attached tables, oldest first.
pub struct ArchiveList<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    entries: RwLock<Vec<ArchiveListEntry<K, V>>>,
}

impl<K, V> ArchiveList<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(Vec::new()),
        })
    }

    /// Takes a point-in-time copy of the list, pinning every table.
    pub fn snapshot(&self) -> Vec<ArchiveListEntry<K, V>> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Opens a write batch; add/remove calls inside it are observed
    /// atomically by the next snapshot.
    pub fn edit(&self) -> ArchiveListEditor<'_, K, V> {
        ArchiveListEditor {
            guard: self.entries.write(),
        }
    }
}

/// A held write batch over the archive list.
pub struct ArchiveListEditor<'a, K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    guard: RwLockWriteGuard<'a, Vec<ArchiveListEntry<K, V>>>,
}

impl<K, V> ArchiveListEditor<'_, K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    pub fn add(&mut self, table: Arc<ArchiveTable<K, V>>, flags: Vec<Uuid>) {
        self.guard.push(ArchiveListEntry { table, flags });
    }

    /// Detaches the table with the given archive id, returning it so
    /// the caller can decide its fate (deletion, hand-off).
    pub fn remove(&mut self, archive_id: Uuid) -> Option<Arc<ArchiveTable<K, V>>> {
        let index = self
            .guard
            .iter()
            .position(|entry| entry.table.archive_id() == archive_id)?;
        Some(self.guard.remove(index).table)
    }

    /// Swaps a set of source tables for their merged replacement.
    ///
    /// The replacement takes the list position of the oldest source so
    /// tables that arrived while the merge ran keep sorting as newer;
    /// the union's newest-wins tie-break depends on that order.
    pub fn replace(
        &mut self,
        sources: &[Uuid],
        table: Arc<ArchiveTable<K, V>>,
        flags: Vec<Uuid>,
    ) -> Vec<Arc<ArchiveTable<K, V>>> {
        let mut removed = Vec::new();
        let mut insert_at = self.guard.len();
        let mut index = 0;
        while index < self.guard.len() {
            if sources.contains(&self.guard[index].table.archive_id()) {
                insert_at = insert_at.min(index);
                removed.push(self.guard.remove(index).table);
            } else {
                index += 1;
            }
        }
        let insert_at = insert_at.min(self.guard.len());
        self.guard.insert(insert_at, ArchiveListEntry { table, flags });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{
        historian_encodings, EncodingDefinition, HistorianKey, HistorianValue,
        FIXED_ENCODING_METHOD,
    };

    fn memory_table() -> Arc<ArchiveTable<HistorianKey, HistorianValue>> {
        let definition = EncodingDefinition::new(
            HistorianKey::TYPE_ID,
            HistorianValue::TYPE_ID,
            FIXED_ENCODING_METHOD,
        );
        let encoding = historian_encodings().lookup(&definition).unwrap();
        Arc::new(ArchiveTable::create_in_memory(4096, encoding).unwrap())
    }

    use crate::encoding::{TreeKey as _, TreeValue as _};

    #[test]
    fn add_remove_batches_are_atomic_to_snapshots() {
        let list = ArchiveList::<HistorianKey, HistorianValue>::new();
        let first = memory_table();
        let second = memory_table();

        {
            let mut edit = list.edit();
            edit.add(Arc::clone(&first), vec![crate::pipeline::INTERMEDIATE_FILE]);
            edit.add(Arc::clone(&second), Vec::new());
        }
        assert_eq!(list.len(), 2);

        let snapshot = list.snapshot();
        {
            let mut edit = list.edit();
            assert!(edit.remove(first.archive_id()).is_some());
            assert!(edit.remove(Uuid::from_u128(0xdead)).is_none());
        }
        // The earlier snapshot still pins both tables.
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].has_flag(crate::pipeline::INTERMEDIATE_FILE));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn replace_takes_the_oldest_source_position() {
        let list = ArchiveList::<HistorianKey, HistorianValue>::new();
        let old_a = memory_table();
        let old_b = memory_table();
        let newer = memory_table();
        let merged = memory_table();

        {
            let mut edit = list.edit();
            edit.add(Arc::clone(&old_a), Vec::new());
            edit.add(Arc::clone(&old_b), Vec::new());
            edit.add(Arc::clone(&newer), Vec::new());
        }

        let removed = list.edit().replace(
            &[old_a.archive_id(), old_b.archive_id()],
            Arc::clone(&merged),
            Vec::new(),
        );
        assert_eq!(removed.len(), 2);

        // The merged table must sort as older than the table that
        // arrived after its sources.
        let snapshot = list.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].table.archive_id(), merged.archive_id());
        assert_eq!(snapshot[1].table.archive_id(), newer.archive_id());
    }
}
