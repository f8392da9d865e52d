//! # EmberShard Storage
//!
//! Shard-level containers for embedding variables, the per-storage batch
//! scheduler state, and the shard checkpoint file codec.
//!
//! A [`EmbeddingStorage`] owns the ordered set of shards this process
//! serves. Each shard maps `variable_id -> variable` and sits behind its
//! own read-write lock: pulls and pushes take it shared, `update_weights`
//! and bulk loads take it exclusive. The storage additionally carries the
//! batch counter with its pending-pull buffer, the in-flight async task
//! counter, and the held push payload buffers cleared by the next update.

pub mod shard_file;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use bytes::Bytes;
use embershard_core::protocol::{PullRequest, PullResponse};
use embershard_core::{EmbeddingVariableMeta, PsError, PsResult};
use embershard_variable::{EmbeddingVariable, PersistManager, VariableContext};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::debug;

/// Maximum distance a pull may run ahead of the shard's batch before it is
/// rejected instead of parked.
pub const MAX_PENDING_BATCHES: usize = 1024;

/// One shard's variables, keyed densely by variable id.
#[derive(Default)]
pub struct EmbeddingShard {
    variable_ids: Vec<u32>,
    metas: Vec<Option<EmbeddingVariableMeta>>,
    variables: Vec<Option<EmbeddingVariable>>,
}

impl EmbeddingShard {
    pub fn contains(&self, variable_id: u32) -> bool {
        (variable_id as usize) < self.variables.len()
            && self.variables[variable_id as usize].is_some()
    }

    pub fn variable_ids(&self) -> &[u32] {
        &self.variable_ids
    }

    pub fn meta(&self, variable_id: u32) -> PsResult<EmbeddingVariableMeta> {
        self.metas
            .get(variable_id as usize)
            .copied()
            .flatten()
            .ok_or_else(|| PsError::InvalidId(format!("unknown variable {variable_id}")))
    }

    pub fn variable(&self, variable_id: u32) -> PsResult<&EmbeddingVariable> {
        self.variables
            .get(variable_id as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| PsError::InvalidId(format!("unknown variable {variable_id}")))
    }

    pub fn variable_mut(&mut self, variable_id: u32) -> PsResult<&mut EmbeddingVariable> {
        self.variables
            .get_mut(variable_id as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| PsError::InvalidId(format!("unknown variable {variable_id}")))
    }

    /// Validate that the caller's meta matches the stored one.
    pub fn check_meta(&self, variable_id: u32, meta: &EmbeddingVariableMeta) -> PsResult<()> {
        let stored = self.meta(variable_id)?;
        if stored != *meta {
            return Err(PsError::InvalidConfig(format!(
                "client server variable meta not match: {stored:?} vs {meta:?}"
            )));
        }
        Ok(())
    }

    /// Look up a variable, creating it lazily on first reference. The meta
    /// of an existing variable must equal the caller's.
    pub fn get_or_create(
        &mut self,
        variable_id: u32,
        meta: &EmbeddingVariableMeta,
        manager: &Arc<PersistManager>,
    ) -> PsResult<&mut EmbeddingVariable> {
        if self.contains(variable_id) {
            self.check_meta(variable_id, meta)?;
            return self.variable_mut(variable_id);
        }
        let mut variable = EmbeddingVariable::create(
            meta.datatype,
            meta.embedding_dim as usize,
            Arc::clone(manager),
        )?;
        variable.set_context(VariableContext { variable_id });
        debug!(variable_id, ?meta, "create variable");

        if variable_id as usize >= self.variables.len() {
            self.variables.resize_with(variable_id as usize + 1, || None);
            self.metas.resize(variable_id as usize + 1, None);
        }
        self.metas[variable_id as usize] = Some(*meta);
        self.variables[variable_id as usize] = Some(variable);
        self.variable_ids.push(variable_id);
        self.variable_mut(variable_id)
    }
}

/// A pull waiting for the shard to reach its batch.
pub struct PendingPull {
    pub request: PullRequest,
    pub responder: oneshot::Sender<PsResult<PullResponse>>,
}

/// Batch counter plus the deferred-pull buffer, guarded together.
#[derive(Default)]
pub struct SchedulerState {
    pub batch_id: i64,
    pub pending: VecDeque<Vec<PendingPull>>,
}

/// Every shard owned by this process plus the cross-shard request state.
pub struct EmbeddingStorage {
    shards: RwLock<BTreeMap<i32, Arc<RwLock<EmbeddingShard>>>>,
    pub scheduler: Mutex<SchedulerState>,
    /// In-flight async admission tasks; `store` drains this before locking.
    pub async_tasks: Arc<AtomicUsize>,
    /// Zero-copy push payloads kept alive until the next update.
    pub holders: Mutex<Vec<Bytes>>,
    manager: Arc<PersistManager>,
}

impl EmbeddingStorage {
    pub fn new(shard_ids: impl IntoIterator<Item = i32>, manager: Arc<PersistManager>) -> Self {
        let storage = Self {
            shards: RwLock::new(BTreeMap::new()),
            scheduler: Mutex::new(SchedulerState::default()),
            async_tasks: Arc::new(AtomicUsize::new(0)),
            holders: Mutex::new(Vec::new()),
            manager,
        };
        for shard_id in shard_ids {
            storage.create_shard(shard_id);
        }
        storage
    }

    pub fn manager(&self) -> &Arc<PersistManager> {
        &self.manager
    }

    /// Structural change: register a shard. Returns false if it existed.
    pub fn create_shard(&self, shard_id: i32) -> bool {
        let mut shards = self.shards.write();
        if shards.contains_key(&shard_id) {
            return false;
        }
        shards.insert(shard_id, Arc::new(RwLock::new(EmbeddingShard::default())));
        true
    }

    pub fn shard(&self, shard_id: i32) -> PsResult<Arc<RwLock<EmbeddingShard>>> {
        self.shards
            .read()
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| PsError::InvalidId(format!("invalid shard id {shard_id}")))
    }

    /// Shard ids in ascending order.
    pub fn shard_ids(&self) -> Vec<i32> {
        self.shards.read().keys().copied().collect()
    }

    pub fn local_shards(&self) -> Vec<(i32, Arc<RwLock<EmbeddingShard>>)> {
        self.shards
            .read()
            .iter()
            .map(|(&id, shard)| (id, Arc::clone(shard)))
            .collect()
    }

    pub fn batch_id(&self) -> i64 {
        self.scheduler.lock().batch_id
    }

    /// Reset every shard to empty, keeping the shard set itself.
    pub fn clear(&self) {
        for (_, shard) in self.local_shards() {
            *shard.write() = EmbeddingShard::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embershard_core::DataType;

    fn meta(dim: u64) -> EmbeddingVariableMeta {
        EmbeddingVariableMeta {
            datatype: DataType::Float32,
            embedding_dim: dim,
            vocabulary_size: 100,
        }
    }

    #[test]
    fn variables_are_created_lazily_and_meta_checked() {
        let manager = Arc::new(PersistManager::new());
        let storage = EmbeddingStorage::new([0, 1], manager);
        let shard = storage.shard(0).unwrap();
        let mut shard = shard.write();

        shard.get_or_create(3, &meta(4), storage.manager()).unwrap();
        assert!(shard.contains(3));
        assert!(!shard.contains(2));
        assert_eq!(shard.variable_ids(), &[3]);

        // same meta: fine; different meta: InvalidConfig
        shard.get_or_create(3, &meta(4), storage.manager()).unwrap();
        assert!(matches!(
            shard.get_or_create(3, &meta(8), storage.manager()),
            Err(PsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn unknown_shards_and_variables_are_invalid_ids() {
        let manager = Arc::new(PersistManager::new());
        let storage = EmbeddingStorage::new([0], manager);
        assert!(matches!(storage.shard(7), Err(PsError::InvalidId(_))));

        let shard = storage.shard(0).unwrap();
        assert!(matches!(
            shard.read().variable(9),
            Err(PsError::InvalidId(_))
        ));
    }

    #[test]
    fn clear_resets_shards_but_keeps_them() {
        let manager = Arc::new(PersistManager::new());
        let storage = EmbeddingStorage::new([0], manager);
        {
            let shard = storage.shard(0).unwrap();
            let mut shard = shard.write();
            shard.get_or_create(0, &meta(2), storage.manager()).unwrap();
        }
        storage.clear();
        let shard = storage.shard(0).unwrap();
        assert!(!shard.read().contains(0));
    }
}
