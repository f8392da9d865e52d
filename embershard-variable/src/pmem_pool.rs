//! The persistent item pool.
//!
//! Items of `(work_id, key, value[value_dim])` live in fixed-size slots
//! inside a memory-mapped pool file that grows by whole 64KiB-aligned
//! blocks. Three operations compose durability:
//!
//! - `flush_item` persists one item's bytes (the persist barrier),
//! - `free_item` returns a slot that may be reused immediately,
//! - `push_item` returns a slot still owned by the open checkpoint
//!   generation; it becomes reusable only after enough `pop_checkpoint`
//!   calls advance past its generation.
//!
//! The durable checkpoint list lives in a `checkpoints` sidecar file,
//! rewritten atomically (tmp + sync + rename) on every change.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use embershard_core::{PsError, PsResult};
use memmap2::MmapMut;
use tracing::{info, warn};

use crate::item_pool::aligned_size;
use crate::persist::PersistManager;
use crate::scalar::Scalar;

const POOL_FILE: &str = "pool.data";
const CHECKPOINT_FILE: &str = "checkpoints";
/// Bytes of the per-item header: `work_id: i64` then `key: u64`.
const HEADER_BYTES: usize = 16;

#[derive(Debug, Clone, Copy)]
struct SpaceItem {
    space_id: i32,
    slot: u64,
}

/// One live item found while scanning a reopened pool.
#[derive(Debug, Clone, Copy)]
pub struct ScanItem {
    pub slot: u64,
    pub work_id: i64,
    pub key: u64,
}

#[derive(Debug)]
pub struct PmemItemPool<T> {
    value_dim: usize,
    item_size: usize,
    block_size: usize,
    path: Option<PathBuf>,
    file: Option<File>,
    map: Option<MmapMut>,
    num_slots: u64,
    space_items: VecDeque<SpaceItem>,
    checkpoints: VecDeque<i64>,
    durable_checkpoints: Vec<i64>,
    current_space_id: i32,
    first_space_id: i32,
    manager: Arc<PersistManager>,
    _marker: PhantomData<T>,
}

impl<T: Scalar> PmemItemPool<T> {
    pub fn new(value_dim: usize, manager: Arc<PersistManager>) -> Self {
        let mut item_size = aligned_size(HEADER_BYTES + value_dim * T::SIZE, 0);
        if item_size > 64 {
            item_size = aligned_size(item_size, 128);
        }
        let block_size = aligned_size(64 * 1024, item_size);
        Self {
            value_dim,
            item_size,
            block_size,
            path: None,
            file: None,
            map: None,
            num_slots: 0,
            space_items: VecDeque::new(),
            checkpoints: VecDeque::new(),
            durable_checkpoints: Vec::new(),
            current_space_id: 0,
            first_space_id: 0,
            manager,
            _marker: PhantomData,
        }
    }

    pub fn pmem_pool_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Total slots in the pool file.
    pub fn num_slots(&self) -> u64 {
        self.num_slots
    }

    pub fn checkpoints(&self) -> &VecDeque<i64> {
        &self.checkpoints
    }

    pub fn all_freespace_slots(&self) -> u64 {
        self.space_items.len() as u64
    }

    /// Slots whose generation already passed and are reusable right now.
    pub fn available_freespace_slots(&self) -> u64 {
        let mut count = 0;
        for item in &self.space_items {
            if item.space_id < self.first_space_id {
                count += 1;
            } else {
                break;
            }
        }
        count
    }

    /// Create the pool lazily. It is more efficient to create all pools at
    /// the same time, so tables call this from their first `next_work`.
    pub fn create_pool(&mut self) -> PsResult<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let path = self.manager.new_pmem_pool_path()?;
        std::fs::create_dir_all(&path)
            .map_err(|e| PsError::Error(format!("cannot create pool dir {path:?}: {e}")))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.join(POOL_FILE))
            .map_err(|e| PsError::Error(format!("cannot create pool file: {e}")))?;
        self.durable_checkpoints = vec![0];
        write_checkpoint_file(&path, &self.durable_checkpoints)?;
        info!(path = %path.display(), "create pmem pool");
        self.file = Some(file);
        self.path = Some(path.clone());
        Ok(path)
    }

    /// Allocate a slot, reusing expired free space before growing the file.
    pub fn new_item(&mut self) -> PsResult<u64> {
        loop {
            if let Some(front) = self.space_items.front() {
                if front.space_id < self.first_space_id {
                    let slot = front.slot;
                    self.space_items.pop_front();
                    return Ok(slot);
                }
            }
            self.create_pool()?;
            self.grow_block()?;
        }
    }

    pub fn write_header(&mut self, slot: u64, work_id: i64, key: u64) {
        let off = slot as usize * self.item_size;
        let map = self.map_mut();
        map[off..off + 8].copy_from_slice(&work_id.to_le_bytes());
        map[off + 8..off + 16].copy_from_slice(&key.to_le_bytes());
    }

    pub fn item_work_id(&self, slot: u64) -> i64 {
        let off = slot as usize * self.item_size;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map_ref()[off..off + 8]);
        i64::from_le_bytes(buf)
    }

    pub fn item_key(&self, slot: u64) -> u64 {
        let off = slot as usize * self.item_size;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map_ref()[off + 8..off + 16]);
        u64::from_le_bytes(buf)
    }

    pub fn value(&self, slot: u64) -> &[T] {
        let off = slot as usize * self.item_size + HEADER_BYTES;
        bytemuck::cast_slice(&self.map_ref()[off..off + self.value_dim * T::SIZE])
    }

    pub fn value_mut(&mut self, slot: u64) -> &mut [T] {
        let off = slot as usize * self.item_size + HEADER_BYTES;
        let dim = self.value_dim;
        bytemuck::cast_slice_mut(&mut self.map_mut()[off..off + dim * T::SIZE])
    }

    /// Persist one item's bytes.
    pub fn flush_item(&self, slot: u64) -> PsResult<()> {
        let off = slot as usize * self.item_size;
        self.map_ref()
            .flush_range(off, self.item_size)
            .map_err(|e| PsError::Error(format!("pmem flush failed: {e}")))
    }

    /// Return a slot usable immediately by the next allocation.
    pub fn free_item(&mut self, slot: u64) {
        self.space_items.push_front(SpaceItem { space_id: -1, slot });
    }

    /// Return a slot still needed by the open checkpoint generation.
    pub fn push_item(&mut self, slot: u64) {
        self.space_items.push_back(SpaceItem {
            space_id: self.current_space_id,
            slot,
        });
    }

    /// Seal the open generation under `work_id` and append it to the durable
    /// checkpoint list.
    pub fn push_checkpoint(&mut self, work_id: i64) -> PsResult<()> {
        self.current_space_id += 1;
        self.checkpoints.push_back(work_id);
        if let Some(map) = &self.map {
            map.flush()
                .map_err(|e| PsError::Error(format!("pmem drain failed: {e}")))?;
        }
        let path = self
            .path
            .clone()
            .ok_or_else(|| PsError::Error("checkpoint on uncreated pool".into()))?;
        self.durable_checkpoints.push(work_id);
        write_checkpoint_file(&path, &self.durable_checkpoints)
    }

    /// Drop the oldest durable checkpoint; its pushed slots become reusable.
    pub fn pop_checkpoint(&mut self) -> PsResult<i64> {
        let popped = self
            .checkpoints
            .pop_front()
            .ok_or_else(|| PsError::Error("pop on empty checkpoint list".into()))?;
        self.first_space_id += 1;
        if !self.durable_checkpoints.is_empty() {
            self.durable_checkpoints.remove(0);
        }
        let path = self
            .path
            .clone()
            .ok_or_else(|| PsError::Error("pop checkpoint on uncreated pool".into()))?;
        write_checkpoint_file(&path, &self.durable_checkpoints)?;
        Ok(popped)
    }

    /// Reopen a pool at `path` and scan it for the items visible at
    /// `checkpoint`. Items with `work_id >= checkpoint` (or never written)
    /// are freed; live candidates are returned for the caller's index to
    /// tie-break per key.
    pub fn load(&mut self, path: &Path, checkpoint: i64) -> PsResult<Vec<ScanItem>> {
        if self.path.is_some() {
            return Err(PsError::Error("pool already open".into()));
        }
        let durable = read_checkpoint_file(path)?;
        if !durable.contains(&checkpoint) {
            warn!(
                checkpoint,
                path = %path.display(),
                available = ?durable,
                "checkpoint not found in pmem pool"
            );
            return Err(PsError::InvalidConfig(format!(
                "checkpoint {checkpoint} not found in {}",
                path.display()
            )));
        }
        info!(checkpoint, path = %path.display(), "load pmem pool");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.join(POOL_FILE))
            .map_err(|e| PsError::Error(format!("cannot open pool file: {e}")))?;
        let len = file
            .metadata()
            .map_err(|e| PsError::Error(format!("cannot stat pool file: {e}")))?
            .len() as usize;
        if len % self.block_size != 0 {
            return Err(PsError::Error(format!(
                "corrupted pool file, size {len} not a whole number of blocks"
            )));
        }
        if len > 0 {
            let map = unsafe { MmapMut::map_mut(&file) }
                .map_err(|e| PsError::Error(format!("cannot map pool file: {e}")))?;
            self.map = Some(map);
        }
        self.file = Some(file);
        self.path = Some(path.to_path_buf());
        self.durable_checkpoints = durable;

        let slots_per_block = self.block_size / self.item_size;
        self.num_slots = (len / self.block_size * slots_per_block) as u64;

        let mut candidates = Vec::new();
        for slot in 0..self.num_slots {
            let work_id = self.item_work_id(slot);
            if work_id != -1 && work_id < checkpoint {
                candidates.push(ScanItem {
                    slot,
                    work_id,
                    key: self.item_key(slot),
                });
            } else {
                self.free_item(slot);
            }
        }
        Ok(candidates)
    }

    fn grow_block(&mut self) -> PsResult<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| PsError::Error("pool file missing".into()))?;
        let slots_per_block = (self.block_size / self.item_size) as u64;
        let new_len = (self.num_slots / slots_per_block + 1) * self.block_size as u64;
        file.set_len(new_len)
            .map_err(|e| PsError::Error(format!("cannot grow pool file: {e}")))?;
        let map = unsafe { MmapMut::map_mut(file) }
            .map_err(|e| PsError::Error(format!("cannot map pool file: {e}")))?;
        self.map = Some(map);

        let first_new = self.num_slots;
        self.num_slots += slots_per_block;
        for slot in first_new..self.num_slots {
            self.write_header(slot, -1, 0);
            self.free_item(slot);
        }
        Ok(())
    }

    fn map_ref(&self) -> &MmapMut {
        self.map.as_ref().expect("pmem pool not mapped")
    }

    fn map_mut(&mut self) -> &mut MmapMut {
        self.map.as_mut().expect("pmem pool not mapped")
    }
}

impl<T> Drop for PmemItemPool<T> {
    fn drop(&mut self) {
        if let Some(map) = &self.map {
            let _ = map.flush();
        }
        if let Some(path) = &self.path {
            info!(path = %path.display(), "close pmem pool");
        }
    }
}

fn write_checkpoint_file(pool_path: &Path, checkpoints: &[i64]) -> PsResult<()> {
    let tmp = pool_path.join(format!("{CHECKPOINT_FILE}.tmp"));
    let target = pool_path.join(CHECKPOINT_FILE);
    let body = serde_yaml::to_string(checkpoints)
        .map_err(|e| PsError::Error(format!("cannot encode checkpoint list: {e}")))?;
    let mut file = File::create(&tmp)
        .map_err(|e| PsError::Error(format!("cannot write checkpoint list: {e}")))?;
    file.write_all(body.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| PsError::Error(format!("cannot write checkpoint list: {e}")))?;
    std::fs::rename(&tmp, &target)
        .map_err(|e| PsError::Error(format!("cannot commit checkpoint list: {e}")))
}

fn read_checkpoint_file(pool_path: &Path) -> PsResult<Vec<i64>> {
    let text = std::fs::read_to_string(pool_path.join(CHECKPOINT_FILE))
        .map_err(|e| PsError::Error(format!("pmem pool not found at {pool_path:?}: {e}")))?;
    serde_yaml::from_str(&text)
        .map_err(|e| PsError::Error(format!("corrupted checkpoint list: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_manager(dir: &Path) -> Arc<PersistManager> {
        let manager = Arc::new(PersistManager::new());
        manager.initialize(dir).unwrap();
        manager
    }

    #[test]
    fn items_round_trip_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool: PmemItemPool<f32> = PmemItemPool::new(4, pool_manager(dir.path()));

        let slot = pool.new_item().unwrap();
        pool.write_header(slot, 3, 42);
        pool.value_mut(slot).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        pool.flush_item(slot).unwrap();

        assert_eq!(pool.item_work_id(slot), 3);
        assert_eq!(pool.item_key(slot), 42);
        assert_eq!(pool.value(slot), &[1.0, 2.0, 3.0, 4.0]);
        assert!(pool.num_slots() > 0);
    }

    #[test]
    fn pushed_slots_wait_for_their_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool: PmemItemPool<f32> = PmemItemPool::new(4, pool_manager(dir.path()));

        let slot = pool.new_item().unwrap();
        let free_before = pool.available_freespace_slots();
        pool.push_item(slot);
        // pushed under the open generation: not yet reusable
        assert_eq!(pool.available_freespace_slots(), free_before);

        pool.push_checkpoint(5).unwrap();
        assert_eq!(pool.checkpoints().len(), 1);
        // still owned by checkpoint 5 until it is popped
        pool.pop_checkpoint().unwrap();
        // free slots (space_id -1) sit in front of the pushed one
        assert_eq!(pool.available_freespace_slots(), free_before + 1);
    }

    #[test]
    fn load_recovers_items_below_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let manager = pool_manager(dir.path());
        let path;
        {
            let mut pool: PmemItemPool<f64> = PmemItemPool::new(2, Arc::clone(&manager));
            let a = pool.new_item().unwrap();
            pool.write_header(a, 0, 7);
            pool.value_mut(a).copy_from_slice(&[7.0, 7.5]);
            pool.flush_item(a).unwrap();

            let b = pool.new_item().unwrap();
            pool.write_header(b, 4, 8);
            pool.value_mut(b).copy_from_slice(&[8.0, 8.5]);
            pool.flush_item(b).unwrap();

            pool.push_checkpoint(3).unwrap();
            path = pool.pmem_pool_path().unwrap().to_path_buf();
        }

        let mut reopened: PmemItemPool<f64> = PmemItemPool::new(2, manager);
        let items = reopened.load(&path, 3).unwrap();
        // only the work_id 0 item is visible at checkpoint 3
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, 7);
        assert_eq!(reopened.value(items[0].slot), &[7.0, 7.5]);
    }

    #[test]
    fn load_rejects_unknown_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let manager = pool_manager(dir.path());
        let path;
        {
            let mut pool: PmemItemPool<f32> = PmemItemPool::new(2, Arc::clone(&manager));
            pool.new_item().unwrap();
            pool.push_checkpoint(2).unwrap();
            path = pool.pmem_pool_path().unwrap().to_path_buf();
        }
        let mut reopened: PmemItemPool<f32> = PmemItemPool::new(2, manager);
        assert!(matches!(
            reopened.load(&path, 99),
            Err(PsError::InvalidConfig(_))
        ));
    }
}
