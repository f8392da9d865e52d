//! Transport-agnostic wire messages.
//!
//! The RPC substrate itself (routing, replicas, compression) is outside this
//! system; these are the payloads it carries. Weight and gradient sections
//! are raw little-endian element arrays so large rows move as single byte
//! spans.

use serde::{Deserialize, Serialize};

use crate::types::EmbeddingVariableMeta;

/// One variable's slice of a per-shard request: which variable, the caller's
/// meta (validated server-side), and how many of the shard's unique indices
/// belong to this block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableBlock {
    pub variable_id: u32,
    pub meta: EmbeddingVariableMeta,
    pub num_indices: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardPull {
    pub shard_id: i32,
    /// Unique, shard-local indices (already divided by the global shard
    /// count), concatenated per block.
    pub indices: Vec<u64>,
    pub blocks: Vec<VariableBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    /// The batch the client believes it is reading. Requests ahead of the
    /// shard's batch are deferred; far-ahead requests fail.
    pub batch_id: i64,
    pub shards: Vec<ShardPull>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardPullReply {
    pub shard_id: i32,
    /// Rows for every block of the shard, concatenated, `line_size` bytes
    /// each.
    pub weights: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub shards: Vec<ShardPullReply>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardPush {
    pub shard_id: i32,
    pub indices: Vec<u64>,
    /// Raw little-endian gradient rows, `line_size` bytes per index.
    pub gradients: Vec<u8>,
    /// Client-side duplicate multiplicity per unique index.
    pub counts: Vec<u64>,
    pub blocks: Vec<VariableBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub shards: Vec<ShardPush>,
}

/// Bulk initialization / weight upload for one variable on one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitItems {
    pub variable_id: u32,
    pub meta: EmbeddingVariableMeta,
    pub clear_weights: bool,
    /// Opaque YAML variable config; empty means "leave as is".
    pub variable_config: String,
    pub state_line_size: u64,
    pub indices: Vec<u64>,
    pub weights: Vec<u8>,
    pub states: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardInit {
    pub shard_id: i32,
    pub items: Vec<InitItems>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub shards: Vec<ShardInit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DumpOptions {
    pub include_optimizer: bool,
    pub persist_model: bool,
    pub persist_pending_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpRequest {
    /// Directory the shard files and `model_meta` land in.
    pub uri: String,
    pub file_id: i32,
    pub shard_ids: Vec<i32>,
    pub options: DumpOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRequest {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub uri: String,
}

impl InitItems {
    /// A pure-config init block (no rows).
    pub fn config_only(
        variable_id: u32,
        meta: EmbeddingVariableMeta,
        variable_config: String,
    ) -> Self {
        Self {
            variable_id,
            meta,
            clear_weights: false,
            variable_config,
            state_line_size: 0,
            indices: Vec::new(),
            weights: Vec::new(),
            states: Vec::new(),
        }
    }
}
