//! Fixed-size DRAM item slots for cache tiers.
//!
//! Items live in a slab arena addressed by `u32` slot index; the persistent
//! table threads its LRU through the `prev`/`next` fields of each slot head,
//! with a sentinel slot as the list head. No owning pointers anywhere, so
//! the cache item / index pointer / LRU neighbour cycle is just indices.

use std::sync::Arc;

use tracing::info;

use crate::persist::PersistManager;
use crate::scalar::Scalar;

/// Items the pool prefetches from the global budget at a time.
const PREFETCH: usize = 64;

/// Round `base_size` up to a cache-line-friendly alignment. With `align == 0`
/// the alignment is picked from the size the way vector hardware likes it.
pub fn aligned_size(base_size: usize, align: usize) -> usize {
    let align = if align != 0 {
        align
    } else if base_size >= 64 {
        64
    } else if base_size >= 32 {
        32
    } else if base_size >= 16 {
        16
    } else {
        8
    };
    (base_size + align - 1) / align * align
}

/// Header of one cache slot. `prev`/`next` are LRU links (slot indices).
#[derive(Debug, Clone, Copy)]
pub struct CacheHead {
    pub work_id: i64,
    pub key: u64,
    pub prev: u32,
    pub next: u32,
}

impl Default for CacheHead {
    fn default() -> Self {
        Self {
            work_id: -1,
            key: 0,
            prev: 0,
            next: 0,
        }
    }
}

/// Slab arena of `(head, value[value_dim])` slots.
#[derive(Debug)]
pub struct CacheSlots<T> {
    value_dim: usize,
    heads: Vec<CacheHead>,
    data: Vec<T>,
    free: Vec<u32>,
}

impl<T: Scalar> CacheSlots<T> {
    pub fn new(value_dim: usize) -> Self {
        Self {
            value_dim,
            heads: Vec::new(),
            data: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn value_dim(&self) -> usize {
        self.value_dim
    }

    pub fn alloc(&mut self) -> u32 {
        if let Some(slot) = self.free.pop() {
            self.heads[slot as usize] = CacheHead::default();
            let base = slot as usize * self.value_dim;
            self.data[base..base + self.value_dim].fill(T::zero());
            return slot;
        }
        let slot = self.heads.len() as u32;
        self.heads.push(CacheHead::default());
        self.data.resize(self.data.len() + self.value_dim, T::zero());
        slot
    }

    pub fn free(&mut self, slot: u32) {
        self.free.push(slot);
    }

    pub fn head(&self, slot: u32) -> &CacheHead {
        &self.heads[slot as usize]
    }

    pub fn head_mut(&mut self, slot: u32) -> &mut CacheHead {
        &mut self.heads[slot as usize]
    }

    pub fn value(&self, slot: u32) -> &[T] {
        let base = slot as usize * self.value_dim;
        &self.data[base..base + self.value_dim]
    }

    pub fn value_mut(&mut self, slot: u32) -> &mut [T] {
        let base = slot as usize * self.value_dim;
        &mut self.data[base..base + self.value_dim]
    }

    /// Detach `slot` from the LRU list.
    pub fn unlink(&mut self, slot: u32) {
        let CacheHead { prev, next, .. } = self.heads[slot as usize];
        self.heads[next as usize].prev = prev;
        self.heads[prev as usize].next = next;
    }

    /// Insert `item` immediately before `pos`. Inserting before the sentinel
    /// appends at the LRU tail.
    pub fn insert_before(&mut self, pos: u32, item: u32) {
        let prev = self.heads[pos as usize].prev;
        self.heads[item as usize].prev = prev;
        self.heads[prev as usize].next = item;
        self.heads[item as usize].next = pos;
        self.heads[pos as usize].prev = item;
    }

    /// Make `slot` a self-linked list head.
    pub fn init_sentinel(&mut self, slot: u32) {
        self.heads[slot as usize].prev = slot;
        self.heads[slot as usize].next = slot;
    }
}

/// DRAM cache pool: a slot arena plus the budget discipline.
///
/// Draws from the process-wide dynamic budget in [`PREFETCH`]-sized chunks.
/// Once a prefetch is refused the pool leaves "expanding" mode and
/// `try_new_item` keeps returning `None` until `rebalance` returns surplus
/// and re-arms it. `new_item` always succeeds (the force-allocate path the
/// table uses when a single batch outgrows the cache).
#[derive(Debug)]
pub struct CacheItemPool<T> {
    slots: CacheSlots<T>,
    manager: Arc<PersistManager>,
    item_memory_cost: u64,
    prefetched: usize,
    acquired: usize,
    released: usize,
    num_items: usize,
    reserved: usize,
    reserved_acquired: usize,
    expanding: bool,
}

impl<T: Scalar> CacheItemPool<T> {
    /// Byte size of one slot, head included.
    pub fn item_size(value_dim: usize) -> usize {
        aligned_size(std::mem::size_of::<CacheHead>() + value_dim * T::SIZE, 0)
    }

    pub fn new(value_dim: usize, manager: Arc<PersistManager>) -> Self {
        // 16 bytes accounts for the persistent pool's free-space overhead per
        // evicted item.
        let item_memory_cost = (Self::item_size(value_dim) + 16) as u64;
        Self {
            slots: CacheSlots::new(value_dim),
            manager,
            item_memory_cost,
            prefetched: 0,
            acquired: 0,
            released: 0,
            num_items: 0,
            reserved: 0,
            reserved_acquired: 0,
            expanding: true,
        }
    }

    pub fn item_memory_cost(&self) -> u64 {
        self.item_memory_cost
    }

    pub fn slots(&self) -> &CacheSlots<T> {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut CacheSlots<T> {
        &mut self.slots
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn expanding(&self) -> bool {
        self.expanding
    }

    /// Allocate within the budget, or refuse.
    pub fn try_new_item(&mut self) -> Option<u32> {
        if self.reserved_acquired < self.reserved {
            self.reserved_acquired += 1;
        }
        if self.expanding {
            if self.prefetched == 0 {
                self.prefetch(PREFETCH);
            }
            if self.prefetched > 0 {
                self.acquired += 1;
                self.prefetched -= 1;
                return Some(self.new_item());
            }
            self.expanding = false;
            info!(
                cache_bytes = (self.acquired + self.reserved) as u64 * self.item_memory_cost,
                acquired_items = self.acquired,
                reserved_items = self.reserved,
                "dram cache is full"
            );
        }
        None
    }

    /// Allocate unconditionally.
    pub fn new_item(&mut self) -> u32 {
        self.num_items += 1;
        self.slots.alloc()
    }

    pub fn delete_item(&mut self, slot: u32) {
        self.num_items -= 1;
        self.released += 1;
        self.slots.free(slot);
    }

    /// Return surplus to the global budget and re-enter expanding mode.
    pub fn rebalance(&mut self) {
        self.released = self.released.min(self.acquired);
        self.manager
            .dynamic_cache
            .release(self.released as u64 * self.item_memory_cost);
        self.acquired -= self.released;
        self.released = 0;
        self.expanding = true;
    }

    /// Reserve `n` items against the reserved budget, if expanding.
    pub fn prefetch_reserve(&mut self, n: usize) -> bool {
        if self.expanding
            && self
                .manager
                .reserved_cache
                .acquire(n as u64 * self.item_memory_cost)
        {
            self.reserved += n;
            return true;
        }
        false
    }

    fn prefetch(&mut self, n: usize) -> bool {
        if self
            .manager
            .dynamic_cache
            .acquire(n as u64 * self.item_memory_cost)
        {
            self.prefetched += n;
            return true;
        }
        false
    }
}

impl<T> Drop for CacheItemPool<T> {
    fn drop(&mut self) {
        self.manager
            .dynamic_cache
            .release((self.acquired + self.prefetched) as u64 * self.item_memory_cost);
        self.manager
            .reserved_cache
            .release(self.reserved as u64 * self.item_memory_cost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(bytes: u64) -> Arc<PersistManager> {
        let manager = Arc::new(PersistManager::new());
        manager.dynamic_cache.set_capacity(bytes);
        manager
    }

    #[test]
    fn aligned_size_matches_vector_widths() {
        assert_eq!(aligned_size(1, 0), 8);
        assert_eq!(aligned_size(17, 0), 32);
        assert_eq!(aligned_size(33, 0), 64);
        assert_eq!(aligned_size(65, 0), 128);
        assert_eq!(aligned_size(100, 128), 128);
    }

    #[test]
    fn lru_links_behave() {
        let mut slots: CacheSlots<f32> = CacheSlots::new(4);
        let head = slots.alloc();
        slots.init_sentinel(head);
        let a = slots.alloc();
        let b = slots.alloc();
        slots.insert_before(head, a); // tail
        slots.insert_before(head, b); // tail after a
        assert_eq!(slots.head(head).next, a);
        assert_eq!(slots.head(head).prev, b);

        slots.unlink(a);
        slots.insert_before(head, a);
        assert_eq!(slots.head(head).next, b);
        assert_eq!(slots.head(head).prev, a);
    }

    #[test]
    fn budget_exhaustion_stops_expanding() {
        let manager = manager_with(0);
        let mut pool: CacheItemPool<f32> = CacheItemPool::new(8, Arc::clone(&manager));
        assert!(pool.try_new_item().is_none());
        assert!(!pool.expanding());

        // force-allocate path still works
        let slot = pool.new_item();
        assert_eq!(pool.num_items(), 1);
        pool.delete_item(slot);

        pool.rebalance();
        assert!(pool.expanding());
    }

    #[test]
    fn acquired_bytes_stay_within_budget() {
        let manager = manager_with(1 << 20);
        {
            let mut pool: CacheItemPool<f32> = CacheItemPool::new(8, Arc::clone(&manager));
            let mut slots = Vec::new();
            while let Some(slot) = pool.try_new_item() {
                slots.push(slot);
                assert!(manager.dynamic_cache.acquired() <= manager.dynamic_cache.capacity());
            }
            assert!(!slots.is_empty());
        }
        // dropping the pool returns everything
        assert_eq!(manager.dynamic_cache.acquired(), 0);
    }
}
