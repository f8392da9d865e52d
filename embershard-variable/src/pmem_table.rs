//! The persistent embedding table: DRAM cache tier in front of the
//! persistent pool, stitched together by an index of tagged pointers and an
//! LRU list ordered by work id.
//!
//! Work ids tie eviction and checkpointing to training batch boundaries:
//! every committed `update_weights` advances the work id once, a checkpoint
//! is a work id whose older rows are all durable, and the "committing"
//! watermark forces copy-on-write of rows the in-flight checkpoint still
//! needs.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use embershard_core::{PsError, PsResult};

use crate::index::{EmbeddingIndex, ItemPointer};
use crate::item_pool::CacheItemPool;
use crate::persist::PersistManager;
use crate::pmem_pool::PmemItemPool;
use crate::scalar::Scalar;

/// Skip-a-probe hint recorded by `get_value` and consumed by a matching
/// `set_value` on the same key within the same work.
#[derive(Debug, Clone, Copy)]
pub struct ItemHint {
    key: u64,
    work_id: i64,
    prev_work_id: i64,
}

impl Default for ItemHint {
    fn default() -> Self {
        Self {
            key: 0,
            work_id: -1,
            prev_work_id: -1,
        }
    }
}

#[derive(Debug)]
pub struct PersistentTable<T> {
    value_dim: usize,
    empty_key: u64,
    num_items: u64,
    index: EmbeddingIndex,
    cache_head: u32,
    cache_pool: CacheItemPool<T>,
    pmem_pool: PmemItemPool<T>,
    manager: Arc<PersistManager>,

    pendings: VecDeque<i64>,
    work_id: i64,
    committing: i64,

    hit_count: u64,
    set_count: u64,
    flush_count: u64,
}

impl<T: Scalar> PersistentTable<T> {
    pub fn new(
        value_dim: usize,
        empty_key: u64,
        use_hash_index: bool,
        manager: Arc<PersistManager>,
    ) -> Self {
        let index = if use_hash_index {
            EmbeddingIndex::new_hash(empty_key)
        } else {
            EmbeddingIndex::new_array()
        };
        let mut cache_pool = CacheItemPool::new(value_dim, Arc::clone(&manager));
        let cache_head = cache_pool.new_item();
        cache_pool.slots_mut().init_sentinel(cache_head);
        Self {
            value_dim,
            empty_key,
            num_items: 0,
            index,
            cache_head,
            cache_pool,
            pmem_pool: PmemItemPool::new(value_dim, Arc::clone(&manager)),
            manager,
            pendings: VecDeque::new(),
            work_id: 0,
            committing: 0,
            hit_count: 0,
            set_count: 0,
            flush_count: 0,
        }
    }

    pub fn category(&self) -> String {
        format!("pmem.{}", self.index.category())
    }

    pub fn value_dim(&self) -> usize {
        self.value_dim
    }

    pub fn num_items(&self) -> u64 {
        self.num_items
    }

    pub fn reserve_items(&mut self, n: u64) {
        self.index.reserve_items(n);
    }

    pub fn prefetch_reserve_cache(&mut self, n: usize) -> bool {
        self.cache_pool.prefetch_reserve(n)
    }

    pub fn pmem_pool_path(&self) -> Option<PathBuf> {
        self.pmem_pool.pmem_pool_path().map(Path::to_path_buf)
    }

    /// Create the persistent pool now instead of at the first work.
    pub fn create_pool(&mut self) -> PsResult<PathBuf> {
        self.pmem_pool.create_pool()
    }

    pub fn get_value(&self, key: u64) -> Option<&[T]> {
        match self.index.get_pointer(key)? {
            ItemPointer::Cache(slot) => Some(self.cache_pool.slots().value(slot)),
            ItemPointer::Pmem(slot) => Some(self.pmem_pool.value(slot)),
        }
    }

    /// `get_value` that additionally records what a subsequent `set_value`
    /// of the same key would have to probe again.
    pub fn get_value_hint(&self, key: u64, hint: &mut ItemHint) -> Option<&[T]> {
        hint.key = key;
        hint.work_id = self.work_id;
        match self.index.get_pointer(key)? {
            ItemPointer::Cache(slot) => {
                hint.prev_work_id = self.cache_pool.slots().head(slot).work_id;
                Some(self.cache_pool.slots().value(slot))
            }
            ItemPointer::Pmem(slot) => {
                hint.prev_work_id = self.pmem_pool.item_work_id(slot);
                Some(self.pmem_pool.value(slot))
            }
        }
    }

    /// Obtain a write buffer for `key` in the cache tier.
    ///
    /// Write only: the returned contents are undefined on a fresh
    /// allocation and must be overwritten. The previous version of the row
    /// is flushed or freed according to the committing watermark.
    pub fn set_value(&mut self, key: u64, hint: Option<&ItemHint>) -> PsResult<&mut [T]> {
        self.set_count += 1;
        let slot = match self.index.get_pointer(key) {
            Some(ItemPointer::Cache(item)) => {
                self.hit_count += 1;
                if self.cache_pool.slots().head(item).work_id < self.committing {
                    // first write within a new checkpoint generation: the
                    // committing checkpoint still needs the pre-update copy
                    let pmem_slot = self.flush_to_pmem(item)?;
                    self.pmem_pool.push_item(pmem_slot);
                }
                let head = self.cache_head;
                let slots = self.cache_pool.slots_mut();
                slots.unlink(item);
                slots.insert_before(head, item);
                item
            }
            Some(ItemPointer::Pmem(pmem_slot)) => {
                let prev_work_id = match hint {
                    Some(h) if h.work_id == self.work_id && h.key == key => h.prev_work_id,
                    _ => self.pmem_pool.item_work_id(pmem_slot),
                };
                if prev_work_id < self.committing {
                    self.pmem_pool.push_item(pmem_slot);
                } else {
                    self.pmem_pool.free_item(pmem_slot);
                }
                self.cache_miss_new_item()?
            }
            None => {
                self.num_items += 1;
                self.cache_miss_new_item()?
            }
        };
        self.index.set_pointer(key, ItemPointer::Cache(slot));
        let work_id = self.work_id;
        let head = self.cache_pool.slots_mut().head_mut(slot);
        head.key = key;
        head.work_id = work_id;
        Ok(self.cache_pool.slots_mut().value_mut(slot))
    }

    /// Read-modify-write helper: pulls the current value (from either tier)
    /// into a fresh cache slot for this work.
    pub fn update_value(&mut self, key: u64) -> PsResult<Option<&mut [T]>> {
        let copy = match self.get_value(key) {
            Some(value) => value.to_vec(),
            None => return Ok(None),
        };
        let out = self.set_value(key, None)?;
        out.copy_from_slice(&copy);
        Ok(Some(out))
    }

    pub fn work_id(&self) -> i64 {
        self.work_id
    }

    /// Advance the work id; graduate the oldest pending checkpoint once the
    /// LRU head has moved past it.
    pub fn next_work(&mut self) -> PsResult<()> {
        self.work_id += 1;
        if let Some(&front) = self.pendings.front() {
            let oldest = self.cache_pool.slots().head(self.cache_head).next;
            if self.cache_pool.slots().head(oldest).work_id >= front {
                self.pmem_pool.push_checkpoint(front)?;
                self.pendings.pop_front();
            }
        }
        // It is more efficient to create all pools at the same time.
        if self.pmem_pool.pmem_pool_path().is_none() {
            self.pmem_pool.create_pool()?;
        }
        Ok(())
    }

    pub fn should_commit_checkpoint(&self) -> bool {
        !self.cache_pool.expanding() && self.pendings.is_empty()
    }

    /// Open a new checkpoint at the current work id and return the
    /// committing watermark.
    pub fn start_commit_checkpoint(&mut self) -> i64 {
        if self.work_id > self.committing {
            self.committing = self.work_id;
            self.pendings.push_back(self.committing);
        }
        self.cache_pool.rebalance();
        self.committing
    }

    /// Flush every cache item older than the oldest pending checkpoint into
    /// the persistent tier and graduate that checkpoint.
    pub fn flush_committing_checkpoint(&mut self) -> PsResult<()> {
        let front = *self
            .pendings
            .front()
            .ok_or_else(|| PsError::Error("no pending checkpoint to flush".into()))?;
        loop {
            let item = self.cache_pool.slots().head(self.cache_head).next;
            if item == self.cache_head || self.cache_pool.slots().head(item).work_id >= front {
                break;
            }
            self.cache_pool.slots_mut().unlink(item);
            let key = self.cache_pool.slots().head(item).key;
            let pmem_slot = self.flush_to_pmem(item)?;
            self.index.set_pointer(key, ItemPointer::Pmem(pmem_slot));
            self.cache_pool.delete_item(item);
        }
        self.pmem_pool.push_checkpoint(front)?;
        self.pendings.pop_front();
        self.cache_pool.rebalance();
        Ok(())
    }

    /// Drop the oldest durable checkpoint, reclaiming its pushed slots.
    pub fn pop_checkpoint(&mut self) -> PsResult<()> {
        self.pmem_pool.pop_checkpoint().map(|_| ())
    }

    /// Reopen a persistent pool and rebuild the index at `checkpoint`. The
    /// in-memory state is rebuilt from scratch.
    pub fn load_pmem_pool(&mut self, path: &Path, checkpoint: i64) -> PsResult<()> {
        let use_hash = matches!(self.index, EmbeddingIndex::Hash(_));
        *self = PersistentTable::new(
            self.value_dim,
            self.empty_key,
            use_hash,
            Arc::clone(&self.manager),
        );
        let candidates = self.pmem_pool.load(path, checkpoint)?;
        for item in candidates {
            match self.index.get_pointer(item.key) {
                Some(ItemPointer::Pmem(old)) => {
                    // two generations of the same key: newer work id wins
                    if item.work_id > self.pmem_pool.item_work_id(old) {
                        self.pmem_pool.free_item(old);
                        self.index.set_pointer(item.key, ItemPointer::Pmem(item.slot));
                    } else {
                        self.pmem_pool.free_item(item.slot);
                    }
                }
                _ => {
                    self.index.set_pointer(item.key, ItemPointer::Pmem(item.slot));
                    self.num_items += 1;
                }
            }
        }
        self.work_id = checkpoint;
        self.committing = checkpoint;
        Ok(())
    }

    pub fn checkpoints(&self) -> &VecDeque<i64> {
        self.pmem_pool.checkpoints()
    }

    pub fn pending_checkpoints(&self) -> &VecDeque<i64> {
        &self.pendings
    }

    pub fn cache_item_memory_cost(&self) -> u64 {
        self.cache_pool.item_memory_cost()
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    pub fn set_count(&self) -> u64 {
        self.set_count
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    pub fn num_cache_items(&self) -> usize {
        self.cache_pool.num_items()
    }

    pub fn num_pmem_items(&self) -> u64 {
        self.pmem_pool.num_slots()
    }

    pub fn available_freespace_slots(&self) -> u64 {
        self.pmem_pool.available_freespace_slots()
    }

    pub fn all_freespace_slots(&self) -> u64 {
        self.pmem_pool.all_freespace_slots()
    }

    pub fn keys(&self) -> Vec<u64> {
        self.index.keys()
    }

    fn flush_to_pmem(&mut self, item: u32) -> PsResult<u64> {
        self.flush_count += 1;
        let pmem_slot = self.pmem_pool.new_item()?;
        let (key, work_id) = {
            let head = self.cache_pool.slots().head(item);
            (head.key, head.work_id)
        };
        self.pmem_pool.write_header(pmem_slot, work_id, key);
        self.pmem_pool
            .value_mut(pmem_slot)
            .copy_from_slice(self.cache_pool.slots().value(item));
        self.pmem_pool.flush_item(pmem_slot)?;
        Ok(pmem_slot)
    }

    fn cache_miss_new_item(&mut self) -> PsResult<u32> {
        let item = match self.cache_pool.try_new_item() {
            Some(item) => item,
            None => {
                let oldest = self.cache_pool.slots().head(self.cache_head).next;
                if oldest != self.cache_head
                    && self.cache_pool.slots().head(oldest).work_id < self.work_id
                {
                    // evict the stalest item, recycling its slot
                    self.cache_pool.slots_mut().unlink(oldest);
                    let key = self.cache_pool.slots().head(oldest).key;
                    let pmem_slot = self.flush_to_pmem(oldest)?;
                    self.index.set_pointer(key, ItemPointer::Pmem(pmem_slot));
                    oldest
                } else {
                    // the whole cache belongs to the current work: exceed the
                    // soft budget rather than fail the writer
                    self.cache_pool.new_item()
                }
            }
        };
        let head = self.cache_head;
        self.cache_pool.slots_mut().insert_before(head, item);
        Ok(item)
    }
}
