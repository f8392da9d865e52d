//! The optimizer-variable: one embedding table bound to one optimizer and
//! one initializer, orchestrating pull / push / update on a shard.
//!
//! Reads (`pull_weights`, `push_gradients`, `get_weights`) may run
//! concurrently on the same variable; `update_weights` is the single writer
//! and never runs concurrently with itself. Pull misses are parked in a
//! `new_weights` side table behind a short lock until the next update
//! drains them into the real table.
//!
//! [`EmbeddingVariable`] erases the element type behind a byte-level API,
//! the same way requests carry rows on the wire.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use embershard_core::config::{config_i64, config_set, config_str, config_u64};
use embershard_core::{DataType, PsError, PsResult};
use parking_lot::Mutex;
use serde_yaml::Mapping;
use tracing::{info, warn};

use crate::initializer::{create_initializer, Initializer};
use crate::optimizer::{create_optimizer, Optimizer};
use crate::persist::PersistManager;
use crate::pmem_table::{ItemHint, PersistentTable};
use crate::reducer::{MpscGradientReducer, PushBlock};
use crate::scalar::{decode_le, encode_le, Scalar};
use crate::table::{EmbeddingArrayTable, EmbeddingHashTable, VolatileTable};

/// Keys above this value cannot be real indices; the hash index reserves it
/// as its empty sentinel.
pub const EMPTY_KEY: u64 = u64::MAX;

/// Identity a variable carries for logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableContext {
    pub variable_id: u32,
}

/// Rows observed by a pull of a persistent variable, replayed into the
/// cache tier by an async admission task under the shard's write lock.
pub struct AdmissionPayload<T: Scalar> {
    keys: Vec<u64>,
    /// `keys.len()` rows of `embedding_dim + state_dim` elements.
    values: Vec<T>,
    hints: Vec<ItemHint>,
}

/// Type-erased admission payload as handed to the async pool.
pub enum Admission {
    F32(AdmissionPayload<f32>),
    F64(AdmissionPayload<f64>),
}

/// Side state that survives a table/optimizer category switch: the pending
/// pull-miss table, unreduced push blocks, and the initializer.
pub struct SideState<T: Scalar> {
    new_weights: EmbeddingHashTable<T>,
    blocks: Vec<PushBlock>,
    initializer: Box<dyn Initializer<T>>,
}

/// One table + one optimizer + one initializer, generic over the element.
pub trait OptimizerVariable<T: Scalar>: Send + Sync {
    fn embedding_dim(&self) -> usize;
    fn state_dim(&self) -> usize;
    fn table_category(&self) -> String;
    fn optimizer_category(&self) -> &'static str;
    fn num_items(&self) -> u64;
    fn keys(&self) -> Vec<u64>;

    fn get_weights(&self, keys: &[u64], weights: &mut [T], states: Option<&mut [T]>);
    fn set_weights(&mut self, keys: &[u64], weights: &[T], states: Option<&[T]>) -> PsResult<()>;

    fn pull_weights(&self, keys: &[u64], out: &mut [T]) -> Option<AdmissionPayload<T>>;
    fn push_gradients(&self, block: PushBlock);
    fn update_weights(&mut self) -> PsResult<()>;
    fn admit(&mut self, payload: AdmissionPayload<T>) -> PsResult<()>;

    fn load_config(&mut self, config: &Mapping) -> PsResult<()>;
    fn dump_config(&self, config: &mut Mapping);
    fn persist_config(
        &mut self,
        persist_pending_window: usize,
        config: &mut Mapping,
        context: VariableContext,
        batch_id: i64,
    ) -> PsResult<bool>;
    fn should_persist(&self) -> bool;

    fn take_side_state(&mut self) -> SideState<T>;
    fn install_side_state(&mut self, side: SideState<T>) -> PsResult<()>;
}

fn reload_initializer<T: Scalar>(
    initializer: &mut Box<dyn Initializer<T>>,
    config: &Mapping,
) -> PsResult<()> {
    if let Some(category) = config_str(config, "initializer") {
        if category != initializer.category() {
            *initializer = create_initializer(&category)?;
        }
    }
    initializer.load_config(config)
}

// ---------------------------------------------------------------------------
// volatile flavor

pub struct VolatileVariable<T: Scalar> {
    embedding_dim: usize,
    empty_key: u64,
    table: VolatileTable<T>,
    optimizer: Box<dyn Optimizer<T>>,
    initializer: Box<dyn Initializer<T>>,
    new_weights: Mutex<EmbeddingHashTable<T>>,
    gradients: MpscGradientReducer<T>,
}

impl<T: Scalar> VolatileVariable<T> {
    pub fn new(
        embedding_dim: usize,
        empty_key: u64,
        use_hash: bool,
        optimizer: Box<dyn Optimizer<T>>,
        initializer: Box<dyn Initializer<T>>,
    ) -> Self {
        let value_dim = embedding_dim + optimizer.state_dim(embedding_dim);
        let table = if use_hash {
            VolatileTable::Hash(EmbeddingHashTable::new(value_dim, empty_key))
        } else {
            VolatileTable::Array(EmbeddingArrayTable::new(value_dim))
        };
        Self {
            embedding_dim,
            empty_key,
            table,
            optimizer,
            initializer,
            new_weights: Mutex::new(EmbeddingHashTable::new(embedding_dim, empty_key)),
            gradients: MpscGradientReducer::new(embedding_dim),
        }
    }
}

impl<T: Scalar> OptimizerVariable<T> for VolatileVariable<T> {
    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn state_dim(&self) -> usize {
        self.optimizer.state_dim(self.embedding_dim)
    }

    fn table_category(&self) -> String {
        self.table.category().to_string()
    }

    fn optimizer_category(&self) -> &'static str {
        self.optimizer.category()
    }

    fn num_items(&self) -> u64 {
        self.table.num_items()
    }

    fn keys(&self) -> Vec<u64> {
        self.table.keys()
    }

    fn get_weights(&self, keys: &[u64], weights: &mut [T], mut states: Option<&mut [T]>) {
        let dim = self.embedding_dim;
        let state_dim = self.state_dim();
        for (i, &key) in keys.iter().enumerate() {
            match self.table.get_value(key) {
                Some(value) => {
                    weights[i * dim..(i + 1) * dim].copy_from_slice(&value[..dim]);
                    if let Some(states) = states.as_deref_mut() {
                        states[i * state_dim..(i + 1) * state_dim]
                            .copy_from_slice(&value[dim..dim + state_dim]);
                    }
                }
                None => {
                    self.initializer
                        .train_init(&mut weights[i * dim..(i + 1) * dim]);
                    if let Some(states) = states.as_deref_mut() {
                        self.optimizer
                            .train_init(&mut states[i * state_dim..(i + 1) * state_dim], dim);
                    }
                }
            }
        }
    }

    fn set_weights(&mut self, keys: &[u64], weights: &[T], states: Option<&[T]>) -> PsResult<()> {
        let dim = self.embedding_dim;
        let state_dim = self.state_dim();
        for (i, &key) in keys.iter().enumerate() {
            let value = self.table.set_value(key);
            value[..dim].copy_from_slice(&weights[i * dim..(i + 1) * dim]);
            match states {
                Some(states) => value[dim..dim + state_dim]
                    .copy_from_slice(&states[i * state_dim..(i + 1) * state_dim]),
                None => self.optimizer.train_init(&mut value[dim..], dim),
            }
        }
        Ok(())
    }

    fn pull_weights(&self, keys: &[u64], out: &mut [T]) -> Option<AdmissionPayload<T>> {
        let dim = self.embedding_dim;
        let mut misses = Vec::new();
        for (i, &key) in keys.iter().enumerate() {
            match self.table.get_value(key) {
                Some(value) => out[i * dim..(i + 1) * dim].copy_from_slice(&value[..dim]),
                None => misses.push(i),
            }
        }
        if !misses.is_empty() {
            let mut new_weights = self.new_weights.lock();
            for i in misses {
                if new_weights.get_value(keys[i]).is_none() {
                    let value = new_weights.set_value(keys[i]);
                    self.initializer.train_init(value);
                }
                if let Some(value) = new_weights.get_value(keys[i]) {
                    out[i * dim..(i + 1) * dim].copy_from_slice(value);
                }
            }
        }
        None
    }

    fn push_gradients(&self, block: PushBlock) {
        self.gradients.push_gradients(block);
    }

    fn update_weights(&mut self) -> PsResult<()> {
        let dim = self.embedding_dim;

        // admit the keys initialized by pulls since the last update
        let new_weights = self.new_weights.get_mut();
        for (key, row) in new_weights.iter_items() {
            let value = self.table.set_value(key);
            value[..dim].copy_from_slice(row);
            self.optimizer.train_init(&mut value[dim..], dim);
        }

        self.gradients.reduce_gradients();
        let (keys, grads, counts) = self.gradients.reduced();
        for (i, &key) in keys.iter().enumerate() {
            if self.table.get_value(key).is_none() {
                let value = self.table.set_value(key);
                let (weights, state) = value.split_at_mut(dim);
                self.initializer.train_init(weights);
                self.optimizer.train_init(state, dim);
            }
            if let Some(value) = self.table.update_value(key) {
                let (weights, state) = value.split_at_mut(dim);
                self.optimizer
                    .update(weights, state, counts[i], &grads[i * dim..(i + 1) * dim]);
            }
        }

        self.new_weights.get_mut().clear();
        self.gradients.clear();
        Ok(())
    }

    fn admit(&mut self, _payload: AdmissionPayload<T>) -> PsResult<()> {
        // volatile tables serve pulls straight from DRAM; nothing to admit
        Ok(())
    }

    fn load_config(&mut self, config: &Mapping) -> PsResult<()> {
        self.optimizer.load_config(config);
        reload_initializer(&mut self.initializer, config)?;
        if let Some(reserve) = config_u64(config, "reserve") {
            if let VolatileTable::Array(table) = &mut self.table {
                table.set_reserve(reserve);
            }
        }
        Ok(())
    }

    fn dump_config(&self, config: &mut Mapping) {
        config_set(config, "table", self.table.category());
        config_set(config, "optimizer", self.optimizer.category());
        self.optimizer.dump_config(config);
        config_set(config, "initializer", self.initializer.category());
        self.initializer.dump_config(config);
        if let VolatileTable::Array(table) = &self.table {
            if let Some(reserve) = table.dump_reserve() {
                config_set(config, "reserve", reserve);
            }
        }
    }

    fn persist_config(
        &mut self,
        _persist_pending_window: usize,
        _config: &mut Mapping,
        _context: VariableContext,
        _batch_id: i64,
    ) -> PsResult<bool> {
        Ok(false)
    }

    fn should_persist(&self) -> bool {
        false
    }

    fn take_side_state(&mut self) -> SideState<T> {
        SideState {
            new_weights: std::mem::replace(
                self.new_weights.get_mut(),
                EmbeddingHashTable::new(self.embedding_dim, self.empty_key),
            ),
            blocks: self.gradients.take_blocks(),
            initializer: std::mem::replace(
                &mut self.initializer,
                Box::new(crate::initializer::ConstantInitializer::default()),
            ),
        }
    }

    fn install_side_state(&mut self, side: SideState<T>) -> PsResult<()> {
        *self.new_weights.get_mut() = side.new_weights;
        self.initializer = side.initializer;
        for block in side.blocks {
            self.gradients.push_gradients(block);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// persistent flavor

pub struct PersistentVariable<T: Scalar> {
    embedding_dim: usize,
    empty_key: u64,
    table: PersistentTable<T>,
    optimizer: Box<dyn Optimizer<T>>,
    initializer: Box<dyn Initializer<T>>,
    new_weights: Mutex<EmbeddingHashTable<T>>,
    gradients: MpscGradientReducer<T>,
    /// Keys admitted into the table since the last update.
    admitted: HashSet<u64>,
    pmem_pool_path: Option<PathBuf>,
}

impl<T: Scalar> PersistentVariable<T> {
    pub fn new(
        embedding_dim: usize,
        empty_key: u64,
        use_hash: bool,
        optimizer: Box<dyn Optimizer<T>>,
        initializer: Box<dyn Initializer<T>>,
        manager: Arc<PersistManager>,
    ) -> Self {
        let value_dim = embedding_dim + optimizer.state_dim(embedding_dim);
        Self {
            embedding_dim,
            empty_key,
            table: PersistentTable::new(value_dim, empty_key, use_hash, manager),
            optimizer,
            initializer,
            new_weights: Mutex::new(EmbeddingHashTable::new(embedding_dim, empty_key)),
            gradients: MpscGradientReducer::new(embedding_dim),
            admitted: HashSet::new(),
            pmem_pool_path: None,
        }
    }

    fn value_dim(&self) -> usize {
        self.embedding_dim + self.optimizer.state_dim(self.embedding_dim)
    }
}

impl<T: Scalar> OptimizerVariable<T> for PersistentVariable<T> {
    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn state_dim(&self) -> usize {
        self.optimizer.state_dim(self.embedding_dim)
    }

    fn table_category(&self) -> String {
        self.table.category()
    }

    fn optimizer_category(&self) -> &'static str {
        self.optimizer.category()
    }

    fn num_items(&self) -> u64 {
        self.table.num_items()
    }

    fn keys(&self) -> Vec<u64> {
        self.table.keys()
    }

    fn get_weights(&self, keys: &[u64], weights: &mut [T], mut states: Option<&mut [T]>) {
        let dim = self.embedding_dim;
        let state_dim = self.state_dim();
        for (i, &key) in keys.iter().enumerate() {
            match self.table.get_value(key) {
                Some(value) => {
                    weights[i * dim..(i + 1) * dim].copy_from_slice(&value[..dim]);
                    if let Some(states) = states.as_deref_mut() {
                        states[i * state_dim..(i + 1) * state_dim]
                            .copy_from_slice(&value[dim..dim + state_dim]);
                    }
                }
                None => {
                    self.initializer
                        .train_init(&mut weights[i * dim..(i + 1) * dim]);
                    if let Some(states) = states.as_deref_mut() {
                        self.optimizer
                            .train_init(&mut states[i * state_dim..(i + 1) * state_dim], dim);
                    }
                }
            }
        }
    }

    fn set_weights(&mut self, keys: &[u64], weights: &[T], states: Option<&[T]>) -> PsResult<()> {
        let dim = self.embedding_dim;
        let state_dim = self.state_dim();
        for (i, &key) in keys.iter().enumerate() {
            let value = self.table.set_value(key, None)?;
            value[..dim].copy_from_slice(&weights[i * dim..(i + 1) * dim]);
            match states {
                Some(states) => value[dim..dim + state_dim]
                    .copy_from_slice(&states[i * state_dim..(i + 1) * state_dim]),
                None => self.optimizer.train_init(&mut value[dim..], dim),
            }
        }
        self.table.next_work()
    }

    fn pull_weights(&self, keys: &[u64], out: &mut [T]) -> Option<AdmissionPayload<T>> {
        let dim = self.embedding_dim;
        let value_dim = self.value_dim();
        let mut payload = AdmissionPayload {
            keys: keys.to_vec(),
            values: vec![T::zero(); keys.len() * value_dim],
            hints: vec![ItemHint::default(); keys.len()],
        };
        let mut misses = Vec::new();
        for (i, &key) in keys.iter().enumerate() {
            match self.table.get_value_hint(key, &mut payload.hints[i]) {
                Some(value) => {
                    out[i * dim..(i + 1) * dim].copy_from_slice(&value[..dim]);
                    payload.values[i * value_dim..(i + 1) * value_dim].copy_from_slice(value);
                }
                None => misses.push(i),
            }
        }
        if !misses.is_empty() {
            let mut new_weights = self.new_weights.lock();
            for i in misses {
                if new_weights.get_value(keys[i]).is_none() {
                    let value = new_weights.set_value(keys[i]);
                    self.initializer.train_init(value);
                }
                if let Some(value) = new_weights.get_value(keys[i]) {
                    out[i * dim..(i + 1) * dim].copy_from_slice(value);
                    payload.values[i * value_dim..i * value_dim + dim].copy_from_slice(value);
                }
            }
        }
        Some(payload)
    }

    fn push_gradients(&self, block: PushBlock) {
        self.gradients.push_gradients(block);
    }

    fn update_weights(&mut self) -> PsResult<()> {
        let dim = self.embedding_dim;

        let new_weights = self.new_weights.get_mut();
        for (key, row) in new_weights.iter_items() {
            let value = self.table.set_value(key, None)?;
            value[..dim].copy_from_slice(row);
            self.optimizer.train_init(&mut value[dim..], dim);
        }

        self.gradients.reduce_gradients();
        let (keys, grads, counts) = self.gradients.reduced();
        for (i, &key) in keys.iter().enumerate() {
            if self.table.get_value(key).is_none() {
                // change of table type, or pull and push that do not match
                let value = self.table.set_value(key, None)?;
                let (weights, state) = value.split_at_mut(dim);
                self.initializer.train_init(weights);
                self.optimizer.train_init(state, dim);
            }
            if let Some(value) = self.table.update_value(key)? {
                let (weights, state) = value.split_at_mut(dim);
                self.optimizer
                    .update(weights, state, counts[i], &grads[i * dim..(i + 1) * dim]);
            }
        }

        self.new_weights.get_mut().clear();
        self.gradients.clear();
        self.admitted.clear();
        self.table.next_work()
    }

    fn admit(&mut self, payload: AdmissionPayload<T>) -> PsResult<()> {
        let value_dim = self.value_dim();
        for (i, &key) in payload.keys.iter().enumerate() {
            if !self.admitted.insert(key) {
                continue;
            }
            let value = self.table.set_value(key, Some(&payload.hints[i]))?;
            value.copy_from_slice(&payload.values[i * value_dim..(i + 1) * value_dim]);
        }
        Ok(())
    }

    fn load_config(&mut self, config: &Mapping) -> PsResult<()> {
        match config_str(config, "pmem_pool_path").filter(|p| !p.is_empty()) {
            None => {
                if self.pmem_pool_path.is_none() {
                    self.pmem_pool_path = Some(self.table.create_pool()?);
                }
            }
            Some(path) => {
                let path = PathBuf::from(path);
                if self.pmem_pool_path.as_deref() != Some(path.as_path()) {
                    let checkpoint = config_i64(config, "checkpoint").ok_or_else(|| {
                        PsError::InvalidConfig(
                            "pmem_pool_path given without a checkpoint".into(),
                        )
                    })?;
                    self.table.load_pmem_pool(&path, checkpoint)?;
                    self.pmem_pool_path = Some(path);
                }
            }
        }
        self.optimizer.load_config(config);
        reload_initializer(&mut self.initializer, config)?;
        if let Some(reserve) = config_u64(config, "reserve") {
            self.table.reserve_items(reserve);
        }
        Ok(())
    }

    fn dump_config(&self, config: &mut Mapping) {
        config_set(config, "table", self.table.category());
        config_set(config, "optimizer", self.optimizer.category());
        self.optimizer.dump_config(config);
        config_set(config, "initializer", self.initializer.category());
        self.initializer.dump_config(config);
    }

    fn persist_config(
        &mut self,
        persist_pending_window: usize,
        config: &mut Mapping,
        context: VariableContext,
        batch_id: i64,
    ) -> PsResult<bool> {
        let checkpoint = self.table.start_commit_checkpoint();
        let hit_rate = if self.table.set_count() > 0 {
            let rate1000 = 1000 * self.table.hit_count() / self.table.set_count();
            format!("{}.{}", rate1000 / 10, rate1000 % 10)
        } else {
            "0.0".to_string()
        };
        while self.table.pending_checkpoints().len() > persist_pending_window {
            let flushed_before = self.table.flush_count();
            self.table.flush_committing_checkpoint()?;
            info!(
                flushed = self.table.flush_count() - flushed_before,
                "flush committing checkpoint"
            );
        }
        while self.table.checkpoints().len() > persist_pending_window {
            self.table.pop_checkpoint()?;
        }

        info!(
            batch_id,
            variable_id = context.variable_id,
            hit_rate = %hit_rate,
            flushed = self.table.flush_count(),
            all = self.table.set_count(),
            checkpoints = ?self.table.checkpoints(),
            pending_checkpoints = ?self.table.pending_checkpoints(),
            pmem_items = self.table.num_pmem_items(),
            cache_items = self.table.num_cache_items(),
            "persist checkpoint"
        );

        self.dump_config(config);
        let path = match &self.pmem_pool_path {
            Some(path) => path.clone(),
            None => {
                let path = self.table.create_pool()?;
                self.pmem_pool_path = Some(path.clone());
                path
            }
        };
        config_set(config, "pmem_pool_path", path.to_string_lossy().as_ref());
        config_set(config, "checkpoint", checkpoint);
        Ok(true)
    }

    fn should_persist(&self) -> bool {
        self.table.should_commit_checkpoint()
    }

    fn take_side_state(&mut self) -> SideState<T> {
        SideState {
            new_weights: std::mem::replace(
                self.new_weights.get_mut(),
                EmbeddingHashTable::new(self.embedding_dim, self.empty_key),
            ),
            blocks: self.gradients.take_blocks(),
            initializer: std::mem::replace(
                &mut self.initializer,
                Box::new(crate::initializer::ConstantInitializer::default()),
            ),
        }
    }

    fn install_side_state(&mut self, side: SideState<T>) -> PsResult<()> {
        *self.new_weights.get_mut() = side.new_weights;
        self.initializer = side.initializer;
        for block in side.blocks {
            self.gradients.push_gradients(block);
        }
        // pre-admit the pending pull-initialized keys so the next update
        // finds them in the cache tier
        let dim = self.embedding_dim;
        let items: Vec<(u64, Vec<T>)> = self
            .new_weights
            .get_mut()
            .iter_items()
            .map(|(key, row)| (key, row.to_vec()))
            .collect();
        for (key, row) in items {
            let value = self.table.set_value(key, None)?;
            value[..dim].copy_from_slice(&row);
            self.optimizer.train_init(&mut value[dim..], dim);
            self.admitted.insert(key);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// dtype-erased front

enum Entity {
    F32(Box<dyn OptimizerVariable<f32>>),
    F64(Box<dyn OptimizerVariable<f64>>),
}

macro_rules! with_entity {
    ($entity:expr, $var:ident => $body:expr) => {
        match &$entity {
            Entity::F32($var) => $body,
            Entity::F64($var) => $body,
        }
    };
}

macro_rules! with_entity_mut {
    ($entity:expr, $var:ident => $body:expr) => {
        match &mut $entity {
            Entity::F32($var) => $body,
            Entity::F64($var) => $body,
        }
    };
}

fn create_entity<T: Scalar>(
    table_category: &str,
    optimizer_category: &str,
    embedding_dim: usize,
    manager: &Arc<PersistManager>,
) -> PsResult<Box<dyn OptimizerVariable<T>>> {
    let optimizer = create_optimizer::<T>(optimizer_category)?;
    let initializer = create_initializer::<T>("constant")?;
    Ok(match table_category {
        "array" => Box::new(VolatileVariable::new(
            embedding_dim,
            EMPTY_KEY,
            false,
            optimizer,
            initializer,
        )),
        "hash" => Box::new(VolatileVariable::new(
            embedding_dim,
            EMPTY_KEY,
            true,
            optimizer,
            initializer,
        )),
        "pmem.array" | "pmem.hash" => {
            if !manager.use_pmem() {
                return Err(PsError::InvalidConfig(
                    "persistent tables require pmem_pool_root_path".into(),
                ));
            }
            Box::new(PersistentVariable::new(
                embedding_dim,
                EMPTY_KEY,
                table_category == "pmem.hash",
                optimizer,
                initializer,
                Arc::clone(manager),
            ))
        }
        other => {
            return Err(PsError::InvalidConfig(format!(
                "unknown table category \"{other}\""
            )))
        }
    })
}

fn copy_entity<T: Scalar>(
    dst: &mut dyn OptimizerVariable<T>,
    src: &mut dyn OptimizerVariable<T>,
    block_num_items: usize,
) -> PsResult<()> {
    let dim = src.embedding_dim();
    let same_optimizer = dst.optimizer_category() == src.optimizer_category();
    let state_dim = src.state_dim();
    let keys = src.keys();
    for chunk in keys.chunks(block_num_items.max(1)) {
        let mut weights = vec![T::zero(); chunk.len() * dim];
        if same_optimizer {
            let mut states = vec![T::zero(); chunk.len() * state_dim];
            src.get_weights(chunk, &mut weights, Some(&mut states));
            dst.set_weights(chunk, &weights, Some(&states))?;
        } else {
            src.get_weights(chunk, &mut weights, None);
            dst.set_weights(chunk, &weights, None)?;
        }
    }
    dst.install_side_state(src.take_side_state())
}

struct ReaderState {
    keys: Vec<u64>,
    cursor: usize,
}

/// One embedding variable on one shard, erased over the element type.
pub struct EmbeddingVariable {
    datatype: DataType,
    embedding_dim: usize,
    context: VariableContext,
    batch_id: i64,
    manager: Arc<PersistManager>,
    entity: Entity,
    readers: HashMap<i32, ReaderState>,
    next_reader_id: i32,
}

impl EmbeddingVariable {
    /// Every variable starts as an array table with the default optimizer;
    /// `load_config` morphs it from there.
    pub fn create(
        datatype: DataType,
        embedding_dim: usize,
        manager: Arc<PersistManager>,
    ) -> PsResult<Self> {
        let entity = match datatype {
            DataType::Float32 => Entity::F32(create_entity("array", "default", embedding_dim, &manager)?),
            DataType::Float64 => Entity::F64(create_entity("array", "default", embedding_dim, &manager)?),
            other => {
                return Err(PsError::InvalidConfig(format!(
                    "unsupported variable datatype {other}"
                )))
            }
        };
        Ok(Self {
            datatype,
            embedding_dim,
            context: VariableContext::default(),
            batch_id: 0,
            manager,
            entity,
            readers: HashMap::new(),
            next_reader_id: 0,
        })
    }

    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn set_context(&mut self, context: VariableContext) {
        self.context = context;
    }

    pub fn batch_id(&self) -> i64 {
        self.batch_id
    }

    pub fn table_category(&self) -> String {
        with_entity!(self.entity, var => var.table_category())
    }

    pub fn optimizer_category(&self) -> &'static str {
        with_entity!(self.entity, var => var.optimizer_category())
    }

    pub fn num_indices(&self) -> u64 {
        with_entity!(self.entity, var => var.num_items())
    }

    /// Bytes of one row's weights on the wire.
    pub fn line_size(&self) -> u64 {
        self.embedding_dim as u64 * self.datatype.size() as u64
    }

    /// Bytes of one row's optimizer state on the wire.
    pub fn state_line_size(&self) -> u64 {
        with_entity!(self.entity, var => var.state_dim() as u64) * self.datatype.size() as u64
    }

    /// Row count per streaming block so one block stays around 1MiB.
    pub fn server_block_num_items(&self) -> usize {
        let item_line_size = (self.line_size() + self.state_line_size()) as usize;
        1023 * 1024 / item_line_size.max(1) + 1
    }

    /// Read rows (and optionally states) as wire bytes; absent keys come out
    /// initialized but are not admitted anywhere.
    pub fn get_weights(
        &self,
        indices: &[u64],
        weights_out: &mut Vec<u8>,
        states_out: Option<&mut Vec<u8>>,
    ) {
        with_entity!(self.entity, var => {
            let dim = var.embedding_dim();
            let state_dim = var.state_dim();
            let mut weights = vec![Default::default(); indices.len() * dim];
            match states_out {
                Some(states_out) => {
                    let mut states = vec![Default::default(); indices.len() * state_dim];
                    var.get_weights(indices, &mut weights, Some(&mut states));
                    encode_le(&weights, weights_out);
                    encode_le(&states, states_out);
                }
                None => {
                    var.get_weights(indices, &mut weights, None);
                    encode_le(&weights, weights_out);
                }
            }
        })
    }

    /// Bulk upload rows from wire bytes.
    pub fn set_weights(
        &mut self,
        indices: &[u64],
        weights: &[u8],
        states: Option<&[u8]>,
    ) -> PsResult<()> {
        if weights.len() as u64 != indices.len() as u64 * self.line_size() {
            return Err(PsError::InvalidConfig(
                "weights payload does not match index count".into(),
            ));
        }
        if let Some(states) = states {
            if states.len() as u64 != indices.len() as u64 * self.state_line_size() {
                return Err(PsError::InvalidConfig(
                    "states payload does not match index count".into(),
                ));
            }
        }
        with_entity_mut!(self.entity, var => {
            let mut typed_weights = Vec::new();
            decode_le(weights, &mut typed_weights);
            match states {
                Some(states) => {
                    let mut typed_states = Vec::new();
                    decode_le(states, &mut typed_states);
                    var.set_weights(indices, &typed_weights, Some(&typed_states))
                }
                None => var.set_weights(indices, &typed_weights, None),
            }
        })
    }

    /// Reader path: copy rows into `out`, admitting misses into the side
    /// table. Persistent variables return an admission payload for the
    /// async pool.
    pub fn pull_weights(&self, indices: &[u64], out: &mut Vec<u8>) -> Option<Admission> {
        match &self.entity {
            Entity::F32(var) => {
                let dim = var.embedding_dim();
                let mut weights = vec![0f32; indices.len() * dim];
                let payload = var.pull_weights(indices, &mut weights);
                encode_le(&weights, out);
                payload.map(Admission::F32)
            }
            Entity::F64(var) => {
                let dim = var.embedding_dim();
                let mut weights = vec![0f64; indices.len() * dim];
                let payload = var.pull_weights(indices, &mut weights);
                encode_le(&weights, out);
                payload.map(Admission::F64)
            }
        }
    }

    /// Enqueue a gradient block; zero-copy over the wire payload.
    pub fn push_gradients(
        &self,
        indices: &[u64],
        gradients: Bytes,
        counts: &[u64],
    ) -> PsResult<()> {
        if gradients.len() as u64 != indices.len() as u64 * self.line_size()
            || counts.len() != indices.len()
        {
            return Err(PsError::InvalidConfig(
                "gradient payload does not match index count".into(),
            ));
        }
        with_entity!(self.entity, var => var.push_gradients(PushBlock {
            keys: indices.to_vec(),
            gradients,
            counts: counts.to_vec(),
        }));
        Ok(())
    }

    /// Writer path: drain pull-misses and reduced gradients into the table.
    pub fn update_weights(&mut self) -> PsResult<()> {
        if !self.readers.is_empty() {
            return Err(PsError::Error(
                "should not update weights while reading".into(),
            ));
        }
        self.batch_id += 1;
        with_entity_mut!(self.entity, var => var.update_weights())
    }

    /// Replay a pull's admission payload; runs under the shard write lock.
    pub fn admit(&mut self, admission: Admission) -> PsResult<()> {
        match (&mut self.entity, admission) {
            (Entity::F32(var), Admission::F32(payload)) => var.admit(payload),
            (Entity::F64(var), Admission::F64(payload)) => var.admit(payload),
            // the variable was rebuilt with another dtype meanwhile
            _ => Ok(()),
        }
    }

    /// Rebuild the table from scratch, preserving the optimizer and
    /// initializer configuration.
    pub fn clear_weights(&mut self) -> PsResult<()> {
        let mut config = Mapping::new();
        self.dump_config(&mut config);
        self.entity = match self.datatype {
            DataType::Float32 => {
                Entity::F32(create_entity("array", "default", self.embedding_dim, &self.manager)?)
            }
            DataType::Float64 => {
                Entity::F64(create_entity("array", "default", self.embedding_dim, &self.manager)?)
            }
            other => {
                return Err(PsError::InvalidConfig(format!(
                    "unsupported variable datatype {other}"
                )))
            }
        };
        self.load_config(&config)
    }

    /// Apply a variable config. A change of `table` or `optimizer` category
    /// rebuilds the entity and copies rows across; anything else applies in
    /// place.
    pub fn load_config(&mut self, config: &Mapping) -> PsResult<()> {
        let current_table = self.table_category();
        let current_optimizer = self.optimizer_category().to_string();
        let table = config_str(config, "table").unwrap_or_else(|| current_table.clone());
        let optimizer =
            config_str(config, "optimizer").unwrap_or_else(|| current_optimizer.clone());

        if table == current_table && optimizer == current_optimizer {
            return with_entity_mut!(self.entity, var => var.load_config(config));
        }

        if self.num_indices() > 0 {
            warn!(
                variable_id = self.context.variable_id,
                from_table = %current_table,
                to_table = %table,
                from_optimizer = %current_optimizer,
                to_optimizer = %optimizer,
                "changing table or optimizer category; this operation may be expensive"
            );
            if optimizer != current_optimizer {
                warn!("optimizer category modified, the optimizer states will be reset");
            }
        }

        let block_num_items = self.server_block_num_items();
        let mut old_config = Mapping::new();
        with_entity!(self.entity, var => var.dump_config(&mut old_config));

        match &mut self.entity {
            Entity::F32(old) => {
                let mut fresh =
                    create_entity::<f32>(&table, &optimizer, self.embedding_dim, &self.manager)?;
                fresh.load_config(&old_config)?;
                fresh.load_config(config)?;
                copy_entity(fresh.as_mut(), old.as_mut(), block_num_items)?;
                *old = fresh;
            }
            Entity::F64(old) => {
                let mut fresh =
                    create_entity::<f64>(&table, &optimizer, self.embedding_dim, &self.manager)?;
                fresh.load_config(&old_config)?;
                fresh.load_config(config)?;
                copy_entity(fresh.as_mut(), old.as_mut(), block_num_items)?;
                *old = fresh;
            }
        }
        Ok(())
    }

    pub fn dump_config(&self, config: &mut Mapping) {
        with_entity!(self.entity, var => var.dump_config(config));
    }

    /// Start (and bound) a persistent checkpoint and record the pool path +
    /// checkpoint id in the dumped config. `false` for volatile variables.
    pub fn persist_config(
        &mut self,
        persist_pending_window: usize,
        config: &mut Mapping,
    ) -> PsResult<bool> {
        let context = self.context;
        let batch_id = self.batch_id;
        with_entity_mut!(self.entity, var => {
            var.persist_config(persist_pending_window, config, context, batch_id)
        })
    }

    pub fn should_persist(&self) -> bool {
        with_entity!(self.entity, var => var.should_persist())
    }

    /// Open a streaming key reader; dump and restore iterate through these.
    pub fn create_reader(&mut self) -> i32 {
        let keys = with_entity!(self.entity, var => var.keys());
        let reader_id = self.next_reader_id;
        self.next_reader_id += 1;
        self.readers.insert(reader_id, ReaderState { keys, cursor: 0 });
        reader_id
    }

    pub fn read_indices(&mut self, reader_id: i32, out: &mut [u64]) -> PsResult<usize> {
        let reader = self
            .readers
            .get_mut(&reader_id)
            .ok_or_else(|| PsError::InvalidId(format!("unknown reader {reader_id}")))?;
        let n = out.len().min(reader.keys.len() - reader.cursor);
        out[..n].copy_from_slice(&reader.keys[reader.cursor..reader.cursor + n]);
        reader.cursor += n;
        Ok(n)
    }

    pub fn reader_cursor(&self, reader_id: i32) -> PsResult<u64> {
        self.readers
            .get(&reader_id)
            .map(|r| r.cursor as u64)
            .ok_or_else(|| PsError::InvalidId(format!("unknown reader {reader_id}")))
    }

    pub fn delete_reader(&mut self, reader_id: i32) {
        self.readers.remove(&reader_id);
        if self.readers.is_empty() {
            self.next_reader_id = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embershard_core::config::parse_variable_config;

    fn manager() -> Arc<PersistManager> {
        Arc::new(PersistManager::new())
    }

    fn pull_f32(variable: &EmbeddingVariable, indices: &[u64]) -> Vec<f32> {
        let mut out = Vec::new();
        let _ = variable.pull_weights(indices, &mut out);
        let mut typed = Vec::new();
        decode_le::<f32>(&out, &mut typed);
        typed
    }

    fn push_f32(variable: &EmbeddingVariable, indices: &[u64], grads: &[f32], counts: &[u64]) {
        let mut bytes = Vec::new();
        encode_le(grads, &mut bytes);
        variable
            .push_gradients(indices, Bytes::from(bytes), counts)
            .unwrap();
    }

    #[test]
    fn constant_init_sgd_scenario() {
        // constant(100) initializer, lr=1 plain sgd: push 1 on key 3, pull [3, 4]
        let mut variable =
            EmbeddingVariable::create(DataType::Float32, 1, manager()).unwrap();
        let config =
            parse_variable_config("optimizer: default\nlearning_rate: 1.0\ninitializer: constant\nvalue: 100.0\n")
                .unwrap();
        variable.load_config(&config).unwrap();

        // pull first so key 3 exists with its initialized value
        assert_eq!(pull_f32(&variable, &[3]), vec![100.0]);
        push_f32(&variable, &[3], &[1.0], &[1]);
        variable.update_weights().unwrap();
        assert_eq!(pull_f32(&variable, &[3, 4]), vec![99.0, 100.0]);
    }

    #[test]
    fn pull_is_reproducible_within_a_batch() {
        let mut variable =
            EmbeddingVariable::create(DataType::Float32, 4, manager()).unwrap();
        let config = parse_variable_config(
            "optimizer: adagrad\nlearning_rate: 0.1\ninitial_accumulator_value: 0.1\ninitializer: normal\nstddev: 1.0\n",
        )
        .unwrap();
        variable.load_config(&config).unwrap();

        let first = pull_f32(&variable, &[1, 2, 3]);
        let second = pull_f32(&variable, &[1, 2, 3]);
        assert_eq!(first, second);
    }

    #[test]
    fn update_applies_summed_gradients_once() {
        let mut variable =
            EmbeddingVariable::create(DataType::Float32, 1, manager()).unwrap();
        let config = parse_variable_config(
            "optimizer: default\nlearning_rate: 1.0\ninitializer: constant\nvalue: 0.0\n",
        )
        .unwrap();
        variable.load_config(&config).unwrap();

        // duplicate key summed client-side arrives as one entry, count 3
        push_f32(&variable, &[7], &[3.0], &[3]);
        variable.update_weights().unwrap();
        assert_eq!(pull_f32(&variable, &[7]), vec![-3.0]);
    }

    #[test]
    fn disjoint_pushes_from_two_threads_are_deterministic() {
        let run = || -> Vec<f32> {
            let mut variable =
                EmbeddingVariable::create(DataType::Float32, 1, manager()).unwrap();
            let config = parse_variable_config(
                "optimizer: default\nlearning_rate: 1.0\ninitializer: constant\nvalue: 0.0\n",
            )
            .unwrap();
            variable.load_config(&config).unwrap();

            std::thread::scope(|scope| {
                let a = &variable;
                scope.spawn(move || push_f32(a, &[1, 2], &[1.0, 2.0], &[1, 1]));
                let b = &variable;
                scope.spawn(move || push_f32(b, &[3, 4], &[3.0, 4.0], &[1, 1]));
            });
            variable.update_weights().unwrap();
            pull_f32(&variable, &[1, 2, 3, 4])
        };
        assert_eq!(run(), vec![-1.0, -2.0, -3.0, -4.0]);
        assert_eq!(run(), run());
    }

    #[test]
    fn switching_optimizer_resets_state_but_keeps_weights() {
        let mut variable =
            EmbeddingVariable::create(DataType::Float32, 2, manager()).unwrap();
        let config = parse_variable_config(
            "optimizer: default\nlearning_rate: 1.0\ninitializer: constant\nvalue: 5.0\n",
        )
        .unwrap();
        variable.load_config(&config).unwrap();

        pull_f32(&variable, &[0]);
        variable.update_weights().unwrap();
        assert_eq!(variable.num_indices(), 1);

        let switched = parse_variable_config("optimizer: adam\nlearning_rate: 0.001\n").unwrap();
        variable.load_config(&switched).unwrap();
        assert_eq!(variable.optimizer_category(), "adam");
        assert_eq!(variable.num_indices(), 1);
        assert_eq!(pull_f32(&variable, &[0]), vec![5.0, 5.0]);
        // adam state dim is 2d+2
        assert_eq!(variable.state_line_size(), (2 * 2 + 2) * 4);
    }

    #[test]
    fn switching_table_keeps_rows() {
        let mut variable =
            EmbeddingVariable::create(DataType::Float32, 1, manager()).unwrap();
        let config = parse_variable_config(
            "optimizer: adagrad\ninitializer: constant\nvalue: 2.0\n",
        )
        .unwrap();
        variable.load_config(&config).unwrap();
        pull_f32(&variable, &[11, 13]);
        variable.update_weights().unwrap();

        let switched = parse_variable_config("table: hash\n").unwrap();
        variable.load_config(&switched).unwrap();
        assert_eq!(variable.table_category(), "hash");
        assert_eq!(variable.num_indices(), 2);
        assert_eq!(pull_f32(&variable, &[11]), vec![2.0]);
    }

    #[test]
    fn clear_weights_keeps_configuration() {
        let mut variable =
            EmbeddingVariable::create(DataType::Float32, 1, manager()).unwrap();
        let config = parse_variable_config(
            "optimizer: adagrad\nlearning_rate: 0.5\ninitializer: constant\nvalue: 9.0\n",
        )
        .unwrap();
        variable.load_config(&config).unwrap();
        pull_f32(&variable, &[1]);
        variable.update_weights().unwrap();
        assert_eq!(variable.num_indices(), 1);

        variable.clear_weights().unwrap();
        assert_eq!(variable.num_indices(), 0);
        assert_eq!(variable.optimizer_category(), "adagrad");
        assert_eq!(pull_f32(&variable, &[1]), vec![9.0]);
    }

    #[test]
    fn readers_stream_every_key_and_block_updates() {
        let mut variable =
            EmbeddingVariable::create(DataType::Float32, 1, manager()).unwrap();
        pull_f32(&variable, &[4, 5, 6]);
        variable.update_weights().unwrap();

        let reader = variable.create_reader();
        assert!(variable.update_weights().is_err());

        let mut keys = Vec::new();
        let mut buffer = [0u64; 2];
        loop {
            let n = variable.read_indices(reader, &mut buffer).unwrap();
            if n == 0 {
                break;
            }
            keys.extend_from_slice(&buffer[..n]);
        }
        assert_eq!(variable.reader_cursor(reader).unwrap(), 3);
        variable.delete_reader(reader);
        keys.sort_unstable();
        assert_eq!(keys, vec![4, 5, 6]);
        assert!(variable.update_weights().is_ok());
    }

    #[test]
    fn integer_datatypes_are_rejected() {
        assert!(matches!(
            EmbeddingVariable::create(DataType::Int32, 4, manager()),
            Err(PsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn get_and_set_round_trip_bytes() {
        let mut variable =
            EmbeddingVariable::create(DataType::Float32, 2, manager()).unwrap();
        let config = parse_variable_config("optimizer: adagrad\n").unwrap();
        variable.load_config(&config).unwrap();

        let mut weights = Vec::new();
        encode_le(&[1.5f32, 2.5, 3.5, 4.5], &mut weights);
        variable.set_weights(&[10, 20], &weights, None).unwrap();

        let mut out = Vec::new();
        let mut states = Vec::new();
        variable.get_weights(&[10, 20], &mut out, Some(&mut states));
        assert_eq!(out, weights);
        // adagrad state initialized to initial_accumulator_value
        let mut typed_states = Vec::new();
        decode_le::<f32>(&states, &mut typed_states);
        assert_eq!(typed_states, vec![0.1; 4]);

        assert!(variable
            .set_weights(&[1], &weights, None)
            .is_err());
    }
}
