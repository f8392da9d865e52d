//! Key → slot indices for the persistent table.
//!
//! Both variants expose the same shape: point lookups, slot-of-record
//! updates, and a stable key snapshot for streaming readers. The pointer
//! they store is a tagged enum distinguishing DRAM cache items from
//! persistent items.

use std::collections::HashMap;

/// Where a key's current slot lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemPointer {
    /// Slot index in the DRAM cache arena.
    Cache(u32),
    /// Slot index in the persistent pool.
    Pmem(u64),
}

/// Dense index for bounded vocabularies.
#[derive(Debug, Default)]
pub struct ArrayIndex {
    slots: Vec<Option<ItemPointer>>,
}

/// Open-addressed index for unbounded vocabularies. One key value is
/// reserved as the empty sentinel and never stored.
#[derive(Debug)]
pub struct HashIndex {
    map: HashMap<u64, ItemPointer>,
    empty_key: u64,
}

#[derive(Debug)]
pub enum EmbeddingIndex {
    Array(ArrayIndex),
    Hash(HashIndex),
}

impl EmbeddingIndex {
    pub fn new_array() -> Self {
        EmbeddingIndex::Array(ArrayIndex::default())
    }

    pub fn new_hash(empty_key: u64) -> Self {
        EmbeddingIndex::Hash(HashIndex {
            map: HashMap::new(),
            empty_key,
        })
    }

    pub fn category(&self) -> &'static str {
        match self {
            EmbeddingIndex::Array(_) => "array",
            EmbeddingIndex::Hash(_) => "hash",
        }
    }

    pub fn reserve_items(&mut self, n: u64) {
        match self {
            EmbeddingIndex::Array(index) => {
                if n as usize > index.slots.len() {
                    index.slots.reserve(n as usize - index.slots.len());
                }
            }
            EmbeddingIndex::Hash(index) => index.map.reserve(n as usize),
        }
    }

    pub fn get_pointer(&self, key: u64) -> Option<ItemPointer> {
        match self {
            EmbeddingIndex::Array(index) => index.slots.get(key as usize).copied().flatten(),
            EmbeddingIndex::Hash(index) => index.map.get(&key).copied(),
        }
    }

    pub fn set_pointer(&mut self, key: u64, pointer: ItemPointer) {
        match self {
            EmbeddingIndex::Array(index) => {
                if key as usize >= index.slots.len() {
                    index.slots.resize(key as usize + 1, None);
                }
                index.slots[key as usize] = Some(pointer);
            }
            EmbeddingIndex::Hash(index) => {
                debug_assert_ne!(key, index.empty_key, "empty key is reserved");
                index.map.insert(key, pointer);
            }
        }
    }

    /// Stable snapshot of the present keys, in arbitrary order.
    pub fn keys(&self) -> Vec<u64> {
        match self {
            EmbeddingIndex::Array(index) => index
                .slots
                .iter()
                .enumerate()
                .filter_map(|(key, slot)| slot.map(|_| key as u64))
                .collect(),
            EmbeddingIndex::Hash(index) => index.map.keys().copied().collect(),
        }
    }
}
