//! Fixed-capacity table of foreign transaction entries.
//!
//! Entries live in a slot arena addressed by generational handles, so a
//! handle to a freed (and possibly reused) slot can never reach the new
//! occupant. Free slots are kept on a stack for O(1) allocation.

mod entry;

pub use entry::{FdwXactEntry, FdwXactStatus};

use ahash::AHashMap as HashMap;
use log::debug;

use crate::errors::{FdwXactError, Result};
use crate::types::{FdwXactKey, Oid, TransactionId};

/// Stable reference to a table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    entry: Option<FdwXactEntry>,
}

pub struct FdwXactTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_key: HashMap<FdwXactKey, EntryHandle>,
    /// Head of each local transaction's chain of prepared entries.
    chain_heads: HashMap<(Oid, TransactionId), EntryHandle>,
}

impl FdwXactTable {
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                entry: None,
            })
            .collect();
        // Popping from the back hands out low indexes first.
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free,
            by_key: HashMap::new(),
            chain_heads: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Stores `entry` in a free slot. Fails on a duplicate key or a full table.
    pub fn insert(&mut self, entry: FdwXactEntry) -> Result<EntryHandle> {
        if self.by_key.contains_key(&entry.key) {
            return Err(FdwXactError::DuplicateEntry(entry.key));
        }
        let Some(index) = self.free.pop() else {
            return Err(FdwXactError::TableFull {
                max: self.capacity(),
            });
        };
        let slot = &mut self.slots[index as usize];
        let handle = EntryHandle {
            index,
            generation: slot.generation,
        };
        debug!("Inserted foreign transaction {} into slot {}", entry.key, index);
        self.by_key.insert(entry.key, handle);
        slot.entry = Some(entry);
        Ok(handle)
    }

    pub fn get(&self, handle: EntryHandle) -> Option<&FdwXactEntry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, handle: EntryHandle) -> Option<&mut FdwXactEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn find(&self, key: &FdwXactKey) -> Option<EntryHandle> {
        self.by_key.get(key).copied()
    }

    /// Frees the slot of `handle` and returns the entry it held, reset to
    /// `Initial`.
    pub fn remove(&mut self, handle: EntryHandle) -> Option<FdwXactEntry> {
        let key = self.get(handle)?.key;
        self.unlink(handle, key);

        let slot = &mut self.slots[handle.index as usize];
        let mut entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.by_key.remove(&key);

        entry.status = FdwXactStatus::Initial;
        entry.next_in_chain = None;
        debug!("Removed foreign transaction {} from slot {}", key, handle.index);
        Some(entry)
    }

    /// Links `handle` into the chain of its local transaction.
    pub fn link(&mut self, handle: EntryHandle) {
        let Some(entry) = self.get(handle) else {
            return;
        };
        let chain_key = (entry.key.database_id, entry.key.xid);
        let previous = self.chain_heads.insert(chain_key, handle);
        if previous == Some(handle) {
            return;
        }
        if let Some(entry) = self.get_mut(handle) {
            entry.next_in_chain = previous;
        }
    }

    fn unlink(&mut self, handle: EntryHandle, key: FdwXactKey) {
        let chain_key = (key.database_id, key.xid);
        let Some(head) = self.chain_heads.get(&chain_key).copied() else {
            return;
        };
        let next = self.get(handle).and_then(|e| e.next_in_chain);
        if head == handle {
            match next {
                Some(next) => {
                    self.chain_heads.insert(chain_key, next);
                }
                None => {
                    self.chain_heads.remove(&chain_key);
                }
            }
            return;
        }
        let mut cursor = head;
        while let Some(current_next) = self.get(cursor).map(|e| e.next_in_chain) {
            match current_next {
                Some(n) if n == handle => {
                    if let Some(current) = self.get_mut(cursor) {
                        current.next_in_chain = next;
                    }
                    return;
                }
                Some(n) => cursor = n,
                None => return,
            }
        }
    }

    /// Entries chained under one local transaction, most recently linked first.
    pub fn chain(&self, database_id: Oid, xid: TransactionId) -> Vec<EntryHandle> {
        let mut handles = Vec::new();
        let mut cursor = self.chain_heads.get(&(database_id, xid)).copied();
        while let Some(handle) = cursor {
            let Some(entry) = self.get(handle) else {
                break;
            };
            handles.push(handle);
            cursor = entry.next_in_chain;
        }
        handles
    }

    /// All entries of one local transaction, chained or not.
    pub fn handles_for_xid(&self, database_id: Oid, xid: TransactionId) -> Vec<EntryHandle> {
        self.iter()
            .filter(|(_, e)| e.key.database_id == database_id && e.key.xid == xid)
            .map(|(h, _)| h)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryHandle, &FdwXactEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    EntryHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntryHandle, &mut FdwXactEntry)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.entry.as_mut().map(|entry| {
                (
                    EntryHandle {
                        index: index as u32,
                        generation,
                    },
                    entry,
                )
            })
        })
    }
}
