//! Volatile embedding tables.
//!
//! Both variants hand out `value_dim`-sized rows by key. `set_value` returns
//! a write buffer whose contents are undefined on first allocation; callers
//! must overwrite it. Reads are safe for concurrent readers as long as no
//! writer runs on the same table, which the shard locks guarantee.

use std::collections::HashMap;

use crate::scalar::Scalar;

/// Dense table addressed directly by key; suitable when the vocabulary is
/// bounded.
#[derive(Debug)]
pub struct EmbeddingArrayTable<T> {
    value_dim: usize,
    reserve: u64,
    num_items: u64,
    upper_bound: u64,
    table: Vec<T>,
    valid: Vec<bool>,
}

impl<T: Scalar> EmbeddingArrayTable<T> {
    pub fn new(value_dim: usize) -> Self {
        Self {
            value_dim,
            reserve: 0,
            num_items: 0,
            upper_bound: 0,
            table: Vec::new(),
            valid: Vec::new(),
        }
    }

    pub fn category(&self) -> &'static str {
        "array"
    }

    pub fn num_items(&self) -> u64 {
        self.num_items
    }

    pub fn set_reserve(&mut self, reserve: u64) {
        self.reserve = reserve;
        self.table.reserve(reserve as usize * self.value_dim);
        self.valid.reserve(reserve as usize);
    }

    /// The reserve hint worth dumping back out: only once the table outgrew
    /// the configured one.
    pub fn dump_reserve(&self) -> Option<u64> {
        (self.valid.len() as u64 > self.reserve).then_some(self.upper_bound)
    }

    pub fn get_value(&self, key: u64) -> Option<&[T]> {
        if key < self.upper_bound && (self.num_items == self.upper_bound || self.valid[key as usize])
        {
            let base = key as usize * self.value_dim;
            Some(&self.table[base..base + self.value_dim])
        } else {
            None
        }
    }

    pub fn set_value(&mut self, key: u64) -> &mut [T] {
        if key >= self.upper_bound {
            self.upper_bound = key + 1;
            self.valid.resize(self.upper_bound as usize, false);
            self.table
                .resize(self.upper_bound as usize * self.value_dim, T::zero());
        }
        if self.num_items < self.upper_bound && !self.valid[key as usize] {
            self.valid[key as usize] = true;
            self.num_items += 1;
        }
        let base = key as usize * self.value_dim;
        &mut self.table[base..base + self.value_dim]
    }

    pub fn update_value(&mut self, key: u64) -> Option<&mut [T]> {
        if key < self.upper_bound && (self.num_items == self.upper_bound || self.valid[key as usize])
        {
            let base = key as usize * self.value_dim;
            Some(&mut self.table[base..base + self.value_dim])
        } else {
            None
        }
    }

    pub fn keys(&self) -> Vec<u64> {
        (0..self.upper_bound)
            .filter(|&k| self.num_items == self.upper_bound || self.valid[k as usize])
            .collect()
    }
}

/// Slab-backed hash table for unbounded vocabularies.
#[derive(Debug)]
pub struct EmbeddingHashTable<T> {
    value_dim: usize,
    block_dim: usize,
    empty_key: u64,
    map: HashMap<u64, (u32, u32)>,
    blocks: Vec<Vec<T>>,
    cursor: usize,
}

impl<T: Scalar> EmbeddingHashTable<T> {
    pub fn new(value_dim: usize, empty_key: u64) -> Self {
        Self {
            value_dim,
            block_dim: value_dim * (63 * 1024 / T::SIZE / value_dim + 1),
            empty_key,
            map: HashMap::new(),
            blocks: Vec::new(),
            cursor: 0,
        }
    }

    pub fn category(&self) -> &'static str {
        "hash"
    }

    pub fn num_items(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn get_value(&self, key: u64) -> Option<&[T]> {
        self.map.get(&key).map(|&(block, offset)| {
            &self.blocks[block as usize][offset as usize..offset as usize + self.value_dim]
        })
    }

    pub fn set_value(&mut self, key: u64) -> &mut [T] {
        debug_assert_ne!(key, self.empty_key, "empty key is reserved");
        let (block, offset) = match self.map.get(&key) {
            Some(&loc) => loc,
            None => {
                if self.cursor == 0 {
                    self.blocks.push(vec![T::zero(); self.block_dim]);
                }
                let loc = ((self.blocks.len() - 1) as u32, self.cursor as u32);
                self.cursor += self.value_dim;
                if self.cursor == self.block_dim {
                    self.cursor = 0;
                }
                self.map.insert(key, loc);
                loc
            }
        };
        &mut self.blocks[block as usize][offset as usize..offset as usize + self.value_dim]
    }

    pub fn update_value(&mut self, key: u64) -> Option<&mut [T]> {
        let (block, offset) = *self.map.get(&key)?;
        Some(&mut self.blocks[block as usize][offset as usize..offset as usize + self.value_dim])
    }

    /// Cheap reset: drops the map and keeps one slab block around.
    pub fn clear(&mut self) {
        self.map.clear();
        if !self.blocks.is_empty() {
            self.blocks.truncate(1);
            self.cursor = self.value_dim;
            if self.cursor == self.block_dim {
                self.cursor = 0;
            }
        }
    }

    pub fn keys(&self) -> Vec<u64> {
        self.map.keys().copied().collect()
    }

    pub fn iter_items(&self) -> impl Iterator<Item = (u64, &[T])> {
        self.map.iter().map(move |(&key, &(block, offset))| {
            (
                key,
                &self.blocks[block as usize][offset as usize..offset as usize + self.value_dim],
            )
        })
    }
}

/// The two volatile table shapes behind one front.
#[derive(Debug)]
pub enum VolatileTable<T> {
    Array(EmbeddingArrayTable<T>),
    Hash(EmbeddingHashTable<T>),
}

impl<T: Scalar> VolatileTable<T> {
    pub fn category(&self) -> &'static str {
        match self {
            VolatileTable::Array(t) => t.category(),
            VolatileTable::Hash(t) => t.category(),
        }
    }

    pub fn num_items(&self) -> u64 {
        match self {
            VolatileTable::Array(t) => t.num_items(),
            VolatileTable::Hash(t) => t.num_items(),
        }
    }

    pub fn get_value(&self, key: u64) -> Option<&[T]> {
        match self {
            VolatileTable::Array(t) => t.get_value(key),
            VolatileTable::Hash(t) => t.get_value(key),
        }
    }

    pub fn set_value(&mut self, key: u64) -> &mut [T] {
        match self {
            VolatileTable::Array(t) => t.set_value(key),
            VolatileTable::Hash(t) => t.set_value(key),
        }
    }

    pub fn update_value(&mut self, key: u64) -> Option<&mut [T]> {
        match self {
            VolatileTable::Array(t) => t.update_value(key),
            VolatileTable::Hash(t) => t.update_value(key),
        }
    }

    pub fn keys(&self) -> Vec<u64> {
        match self {
            VolatileTable::Array(t) => t.keys(),
            VolatileTable::Hash(t) => t.keys(),
        }
    }
}
