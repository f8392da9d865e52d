//! # EmberShard Server
//!
//! The transport-agnostic request handlers of a parameter server node:
//! `read_only_pull`, `pull`, `push`, `store`, `init`, `dump`, `load` and the
//! internal `restore`. The RPC substrate (routing, replicas, timeouts,
//! compression) lives outside; these handlers consume already-decoded
//! protocol messages against the local [`EmbeddingStorage`].
//!
//! Ordering contract per shard: `update_weights(b-1)` happens before any
//! pull tagged `b` is answered, and pushes must arrive before the update
//! that should include them. Pulls running ahead of the shard's batch are
//! parked in the scheduler's pending buffer and answered by the `store`
//! that catches them up.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use embershard_core::config::{config_set, config_str, dump_variable_config, parse_variable_config};
use embershard_core::protocol::{
    DumpRequest, InitRequest, LoadRequest, PullRequest, PullResponse, PushRequest, RestoreRequest,
    ShardPullReply, VariableBlock,
};
use embershard_core::types::{ModelOfflineMeta, ModelVariableMeta};
use embershard_core::{PsError, PsResult, ServerConfig};
use embershard_storage::shard_file::{
    list_shard_files, shard_file_name, EmbeddingShardDataMeta, ShardFileReader, ShardFileWriter,
};
use embershard_storage::{EmbeddingShard, EmbeddingStorage, PendingPull, MAX_PENDING_BATCHES};
use embershard_variable::{wait_tasks, VariableAsyncTask, VariableAsyncTaskPool};
use parking_lot::RwLock;
use serde_yaml::Mapping;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Outcome of a pull: answered now, or parked until the shard catches up.
pub enum PullReply {
    Ready(PsResult<PullResponse>),
    Deferred(oneshot::Receiver<PsResult<PullResponse>>),
}

impl PullReply {
    /// Resolve the reply, waiting for a deferred one.
    pub async fn resolve(self) -> PsResult<PullResponse> {
        match self {
            PullReply::Ready(result) => result,
            PullReply::Deferred(receiver) => receiver
                .await
                .unwrap_or_else(|_| Err(PsError::Error("server dropped a pending pull".into()))),
        }
    }
}

/// One node's request handlers over its local shards.
pub struct EmbeddingService {
    storage: Arc<EmbeddingStorage>,
    async_pool: Arc<VariableAsyncTaskPool>,
    config: ServerConfig,
    node_id: i32,
}

impl EmbeddingService {
    pub fn new(
        storage: Arc<EmbeddingStorage>,
        async_pool: Arc<VariableAsyncTaskPool>,
        config: ServerConfig,
        node_id: i32,
    ) -> Self {
        Self {
            storage,
            async_pool,
            config,
            node_id,
        }
    }

    pub fn storage(&self) -> &Arc<EmbeddingStorage> {
        &self.storage
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve a pull without admitting anything into cache tiers.
    pub fn read_only_pull(&self, request: PullRequest) -> PullReply {
        self.schedule_pull(request, true)
    }

    /// Serve a pull, spawning async cache admission for persistent
    /// variables.
    pub fn pull(&self, request: PullRequest) -> PullReply {
        self.schedule_pull(request, false)
    }

    fn schedule_pull(&self, request: PullRequest, read_only: bool) -> PullReply {
        {
            let mut scheduler = self.storage.scheduler.lock();
            if scheduler.batch_id < request.batch_id {
                let delta = (request.batch_id - scheduler.batch_id - 1) as usize;
                if delta >= MAX_PENDING_BATCHES {
                    warn!(
                        batch_id = request.batch_id,
                        shard_batch_id = scheduler.batch_id,
                        "pull rejected: request too large version"
                    );
                    return PullReply::Ready(Err(PsError::InvalidConfig(
                        "request too large version".into(),
                    )));
                }
                while scheduler.pending.len() <= delta {
                    scheduler.pending.push_back(Vec::new());
                }
                let (responder, receiver) = oneshot::channel();
                scheduler.pending[delta].push(PendingPull { request, responder });
                return PullReply::Deferred(receiver);
            }
        }
        // late readers (batch_id below the shard's) see the current values
        PullReply::Ready(self.apply_pull(&request, read_only))
    }

    fn apply_pull(&self, request: &PullRequest, read_only: bool) -> PsResult<PullResponse> {
        let mut shards = Vec::with_capacity(request.shards.len());
        for shard_pull in &request.shards {
            let shard = self.storage.shard(shard_pull.shard_id)?;
            self.ensure_variables(&shard, &shard_pull.blocks)?;

            let guard = shard.read();
            let mut weights = Vec::new();
            let mut offset = 0usize;
            for block in &shard_pull.blocks {
                let n = block.num_indices as usize;
                if offset + n > shard_pull.indices.len() {
                    return Err(PsError::Error("pull indices shorter than blocks".into()));
                }
                let indices = &shard_pull.indices[offset..offset + n];
                offset += n;

                guard.check_meta(block.variable_id, &block.meta)?;
                let variable = guard.variable(block.variable_id)?;
                if read_only {
                    variable.get_weights(indices, &mut weights, None);
                } else if let Some(admission) = variable.pull_weights(indices, &mut weights) {
                    let mut task = VariableAsyncTask::new(
                        block.variable_id as usize,
                        Arc::clone(&self.storage.async_tasks),
                    );
                    let shard = Arc::clone(&shard);
                    let variable_id = block.variable_id;
                    task.set_done(Box::new(move || {
                        let mut guard = shard.write();
                        if let Ok(variable) = guard.variable_mut(variable_id) {
                            if let Err(error) = variable.admit(admission) {
                                warn!(variable_id, %error, "cache admission failed");
                            }
                        }
                    }));
                    self.async_pool.submit(task);
                }
            }
            shards.push(ShardPullReply {
                shard_id: shard_pull.shard_id,
                weights,
            });
        }
        Ok(PullResponse { shards })
    }

    /// Enqueue gradients. Payload buffers stay alive in the storage's
    /// holder list until the next `update_weights` clears them.
    pub fn push(&self, request: PushRequest) -> PsResult<()> {
        for shard_push in request.shards {
            let shard = self.storage.shard(shard_push.shard_id)?;
            self.ensure_variables(&shard, &shard_push.blocks)?;

            let guard = shard.read();
            // validate every block before the first enqueue so a stale meta
            // leaves the shard untouched
            let mut offset = 0usize;
            for block in &shard_push.blocks {
                guard.check_meta(block.variable_id, &block.meta)?;
                offset += block.num_indices as usize;
            }
            if offset != shard_push.indices.len() || offset != shard_push.counts.len() {
                return Err(PsError::Error("push blocks do not cover the payload".into()));
            }

            let gradients = Bytes::from(shard_push.gradients);
            let mut index_offset = 0usize;
            let mut byte_offset = 0usize;
            for block in &shard_push.blocks {
                let n = block.num_indices as usize;
                let line = block.meta.line_size() as usize;
                let indices = &shard_push.indices[index_offset..index_offset + n];
                let counts = &shard_push.counts[index_offset..index_offset + n];
                let grads = gradients.slice(byte_offset..byte_offset + n * line);
                guard
                    .variable(block.variable_id)?
                    .push_gradients(indices, grads, counts)?;
                index_offset += n;
                byte_offset += n * line;
            }
            self.storage.holders.lock().push(gradients);
        }
        Ok(())
    }

    /// The update ("store") procedure: drain async admissions, take every
    /// local shard exclusively, apply `update_weights` on every variable,
    /// then advance the batch and serve the pulls that were waiting on it.
    pub fn store(&self) -> PsResult<()> {
        wait_tasks(&self.storage.async_tasks);
        self.async_pool.initialize_batch_task();

        let shards = self.storage.local_shards();
        let mut guards: Vec<_> = shards.iter().map(|(_, shard)| shard.write()).collect();
        for guard in guards.iter_mut() {
            for variable_id in guard.variable_ids().to_vec() {
                guard.variable_mut(variable_id)?.update_weights()?;
            }
        }
        drop(guards);

        let released = {
            // store and push must not overlap; holders released here
            self.storage.holders.lock().clear();
            let mut scheduler = self.storage.scheduler.lock();
            scheduler.batch_id += 1;
            debug!(batch_id = scheduler.batch_id, "advance batch");
            scheduler.pending.pop_front().unwrap_or_default()
        };
        // start processing the pull requests of the new batch immediately
        for pending in released {
            let result = self.apply_pull(&pending.request, false);
            let _ = pending.responder.send(result);
        }
        Ok(())
    }

    /// RPC-facing store. With `update_early_return` the caller is
    /// acknowledged before the update runs; the update itself is never
    /// cancelled either way.
    pub async fn store_rpc(self: &Arc<Self>) -> PsResult<()> {
        let service = Arc::clone(self);
        if self.config.update_early_return {
            tokio::task::spawn_blocking(move || {
                if let Err(error) = service.store() {
                    warn!(%error, "store failed after early return");
                }
            });
            Ok(())
        } else {
            tokio::task::spawn_blocking(move || service.store())
                .await
                .map_err(|e| PsError::Error(format!("store task failed: {e}")))?
        }
    }

    /// Bulk initialization: lazy variable creation, optional reset, config
    /// application, optional weight upload.
    pub fn init(&self, request: InitRequest) -> PsResult<()> {
        for shard_init in &request.shards {
            let shard = self.storage.shard(shard_init.shard_id)?;
            let mut guard = shard.write();
            for items in &shard_init.items {
                let variable =
                    guard.get_or_create(items.variable_id, &items.meta, self.storage.manager())?;
                if items.clear_weights {
                    variable.clear_weights()?;
                }
                if !items.variable_config.is_empty() {
                    let mut config = parse_variable_config(&items.variable_config)?;
                    if items.meta.use_hash_table() {
                        let table = config_str(&config, "table").unwrap_or_default();
                        if !table.starts_with("pmem") {
                            config_set(&mut config, "table", "hash");
                        }
                    }
                    variable.load_config(&config)?;
                }
                if !items.indices.is_empty() {
                    if items.state_line_size != 0
                        && items.state_line_size != variable.state_line_size()
                    {
                        return Err(PsError::InvalidConfig(format!(
                            "state line size {} does not match variable ({})",
                            items.state_line_size,
                            variable.state_line_size()
                        )));
                    }
                    let states = (items.state_line_size != 0).then_some(&items.states[..]);
                    variable.set_weights(&items.indices, &items.weights, states)?;
                }
            }
        }
        Ok(())
    }

    /// Write the requested shards into `model_<node_id>_<file_id>` under the
    /// dump uri.
    pub fn dump(&self, request: &DumpRequest) -> PsResult<()> {
        let dir = Path::new(&request.uri);
        let mut options = request.options.clone();
        if options.persist_model && !options.include_optimizer {
            warn!("persist model not supported without optimizer");
            options.include_optimizer = true;
        }
        let window = if options.persist_pending_window == 0 {
            2
        } else {
            options.persist_pending_window
        };
        let global_shard_num = self.storage.shard_ids().len() as i32;

        let mut writer = ShardFileWriter::create(&dir.join(shard_file_name(
            self.node_id,
            request.file_id,
        )))?;
        for &shard_id in &request.shard_ids {
            let shard = self.storage.shard(shard_id)?;
            let mut guard = shard.write();
            for variable_id in guard.variable_ids().to_vec() {
                let meta = guard.meta(variable_id)?;
                let variable = guard.variable_mut(variable_id)?;

                let mut config = Mapping::new();
                let persisted = if options.persist_model {
                    variable.persist_config(window, &mut config)?
                } else {
                    false
                };
                if !persisted {
                    config = Mapping::new();
                    variable.dump_config(&mut config);
                }
                if !options.include_optimizer {
                    config.remove(serde_yaml::Value::from("optimizer"));
                }

                let shard_meta = EmbeddingShardDataMeta {
                    variable_id,
                    meta,
                    config: dump_variable_config(&config),
                    shard_id,
                    shard_num: global_shard_num,
                    state_line_size: if options.include_optimizer {
                        variable.state_line_size()
                    } else {
                        0
                    },
                    num_items: if persisted { 0 } else { variable.num_indices() },
                };
                writer.write_meta(&shard_meta)?;

                if shard_meta.num_items > 0 {
                    let reader = variable.create_reader();
                    let mut indices = vec![0u64; variable.server_block_num_items()];
                    loop {
                        let n = variable.read_indices(reader, &mut indices)?;
                        if n == 0 {
                            break;
                        }
                        let mut weights = Vec::new();
                        let mut states = Vec::new();
                        if shard_meta.state_line_size > 0 {
                            variable.get_weights(&indices[..n], &mut weights, Some(&mut states));
                        } else {
                            variable.get_weights(&indices[..n], &mut weights, None);
                        }
                        writer.write_block(&indices[..n], &weights, &states)?;
                    }
                    variable.delete_reader(reader);
                }
            }
        }
        writer.finish()?;
        info!(uri = %request.uri, file_id = request.file_id, "dump complete");
        Ok(())
    }

    /// Stream a dump back in, re-partitioning rows onto the current shard
    /// layout. Records carrying a persistent pool path reopen the pool
    /// instead of replaying rows.
    pub fn load(&self, request: &LoadRequest) -> PsResult<()> {
        let dir = Path::new(&request.uri);
        for file in list_shard_files(dir)? {
            let mut reader = ShardFileReader::open(&file)?;
            while let Some(shard_meta) = reader.read_meta()? {
                self.apply_record(&mut reader, &shard_meta)?;
            }
        }
        info!(uri = %request.uri, "load complete");
        Ok(())
    }

    /// Persistent-memory restore: ShardMeta-only records whose configs
    /// carry `pmem_pool_path` + `checkpoint`.
    pub fn restore(&self, request: &RestoreRequest) -> PsResult<()> {
        let dir = Path::new(&request.uri);
        for file in list_shard_files(dir)? {
            let mut reader = ShardFileReader::open(&file)?;
            while let Some(shard_meta) = reader.read_meta()? {
                if shard_meta.num_items != 0 {
                    return Err(PsError::InvalidConfig(
                        "restore expects persisted records with no inline items".into(),
                    ));
                }
                self.apply_record(&mut reader, &shard_meta)?;
            }
        }
        info!(uri = %request.uri, "restore complete");
        Ok(())
    }

    fn apply_record(
        &self,
        reader: &mut ShardFileReader,
        shard_meta: &EmbeddingShardDataMeta,
    ) -> PsResult<()> {
        let config = parse_variable_config(&shard_meta.config)?;
        let is_persist_record = config_str(&config, "pmem_pool_path")
            .map(|p| !p.is_empty())
            .unwrap_or(false);

        if is_persist_record {
            // the pool belongs to exactly this shard
            let shard = self.storage.shard(shard_meta.shard_id)?;
            let mut guard = shard.write();
            let variable =
                guard.get_or_create(shard_meta.variable_id, &shard_meta.meta, self.storage.manager())?;
            variable.load_config(&config)?;
        } else {
            for (_, shard) in self.storage.local_shards() {
                let mut guard = shard.write();
                let variable = guard.get_or_create(
                    shard_meta.variable_id,
                    &shard_meta.meta,
                    self.storage.manager(),
                )?;
                variable.load_config(&config)?;
            }
        }

        if shard_meta.num_items == 0 {
            return Ok(());
        }

        let global_shard_num = self.storage.shard_ids().len() as u64;
        let line = shard_meta.meta.line_size() as usize;
        let state_line = shard_meta.state_line_size as usize;
        let mut consumed = 0u64;
        while consumed < shard_meta.num_items {
            let (keys, weights, states) =
                reader.read_block(line as u64, shard_meta.state_line_size)?;
            consumed += keys.len() as u64;

            // regroup rows by their owning shard under the current layout
            let mut routed: std::collections::BTreeMap<i32, (Vec<u64>, Vec<u8>, Vec<u8>)> =
                std::collections::BTreeMap::new();
            for (i, &local_key) in keys.iter().enumerate() {
                let global = shard_meta.global_index(local_key);
                let target = (global % global_shard_num) as i32;
                let entry = routed.entry(target).or_default();
                entry.0.push(global / global_shard_num);
                entry.1.extend_from_slice(&weights[i * line..(i + 1) * line]);
                entry
                    .2
                    .extend_from_slice(&states[i * state_line..(i + 1) * state_line]);
            }
            for (shard_id, (indices, weights, states)) in routed {
                let shard = self.storage.shard(shard_id)?;
                let mut guard = shard.write();
                let variable = guard.get_or_create(
                    shard_meta.variable_id,
                    &shard_meta.meta,
                    self.storage.manager(),
                )?;
                let states = (shard_meta.state_line_size != 0
                    && shard_meta.state_line_size == variable.state_line_size())
                .then_some(&states[..]);
                variable.set_weights(&indices, &weights, states)?;
            }
        }
        Ok(())
    }

    /// The offline meta describing every variable this node serves.
    pub fn model_offline_meta(&self, model_sign: &str, storage_name: &str) -> ModelOfflineMeta {
        let mut variables = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (_, shard) in self.storage.local_shards() {
            let guard = shard.read();
            for &variable_id in guard.variable_ids() {
                if seen.insert(variable_id) {
                    if let Ok(meta) = guard.meta(variable_id) {
                        variables.push(ModelVariableMeta {
                            meta,
                            storage_name: storage_name.to_string(),
                        });
                    }
                }
            }
        }
        variables.sort_by_key(|v| v.meta.embedding_dim);
        ModelOfflineMeta::new(model_sign.to_string(), variables)
    }

    /// Create missing variables referenced by pull/push blocks. Unbounded
    /// vocabularies start out as hash tables.
    fn ensure_variables(
        &self,
        shard: &Arc<RwLock<EmbeddingShard>>,
        blocks: &[VariableBlock],
    ) -> PsResult<()> {
        let missing: Vec<&VariableBlock> = {
            let guard = shard.read();
            blocks
                .iter()
                .filter(|b| !guard.contains(b.variable_id))
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }
        let mut guard = shard.write();
        for block in missing {
            if guard.contains(block.variable_id) {
                continue;
            }
            let variable =
                guard.get_or_create(block.variable_id, &block.meta, self.storage.manager())?;
            if block.meta.use_hash_table() {
                let mut config = Mapping::new();
                config_set(&mut config, "table", "hash");
                variable.load_config(&config)?;
            }
        }
        Ok(())
    }
}
