//! # EmberShard Client
//!
//! Request shaping for workers talking to a sharded cluster: partition
//! indices by `key % global_shard_num`, deduplicate per shard, pick one
//! replica per shard, and scatter the per-shard replies back into the
//! caller's buffers.
//!
//! The transport itself is not here; this crate turns user arrays into
//! [`PullRequest`]/[`PushRequest`] values addressed to node ids and back.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use embershard_core::protocol::{
    PullRequest, PullResponse, PushRequest, ShardPull, ShardPush, VariableBlock,
};
use embershard_core::{EmbeddingVariableMeta, PsError, PsResult};

/// Which nodes serve which shards.
#[derive(Debug, Clone, Default)]
pub struct ClusterRoute {
    pub global_shard_num: i32,
    /// node id -> shard ids served by that node (replicas repeat shards).
    pub nodes: BTreeMap<i32, Vec<i32>>,
}

impl ClusterRoute {
    pub fn single_node(node_id: i32, shard_num: i32) -> Self {
        Self {
            global_shard_num: shard_num,
            nodes: BTreeMap::from([(node_id, (0..shard_num).collect())]),
        }
    }

    /// Nodes holding a replica of `shard_id`.
    pub fn replicas_of(&self, shard_id: i32) -> Vec<i32> {
        self.nodes
            .iter()
            .filter(|(_, shards)| shards.contains(&shard_id))
            .map(|(&node, _)| node)
            .collect()
    }
}

/// Pluggable replica selection.
pub trait ReplicaPicker: Send + Sync {
    fn pick(&self, shard_id: i32, replicas: &[i32]) -> Option<i32>;
}

/// Cycles through replicas; the default algorithm.
#[derive(Debug, Default)]
pub struct RoundRobinPicker {
    counter: AtomicUsize,
}

impl ReplicaPicker for RoundRobinPicker {
    fn pick(&self, _shard_id: i32, replicas: &[i32]) -> Option<i32> {
        if replicas.is_empty() {
            return None;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(replicas[n % replicas.len()])
    }
}

/// Uniformly random replica.
#[derive(Debug, Default)]
pub struct RandomPicker;

impl ReplicaPicker for RandomPicker {
    fn pick(&self, _shard_id: i32, replicas: &[i32]) -> Option<i32> {
        use rand::seq::SliceRandom;
        replicas.choose(&mut rand::thread_rng()).copied()
    }
}

/// One variable's slice of a pull, as the framework hands it over.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingPullItems<'a> {
    pub variable_id: u32,
    pub meta: EmbeddingVariableMeta,
    pub indices: &'a [u64],
}

/// One variable's slice of a push.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingPushItems<'a> {
    pub variable_id: u32,
    pub meta: EmbeddingVariableMeta,
    pub indices: &'a [u64],
    /// `indices.len() * line_size` little-endian gradient bytes.
    pub gradients: &'a [u8],
}

/// An in-flight pull: the per-node requests plus everything needed to
/// scatter the replies back into user buffers.
pub struct PullSession {
    shard_num: u64,
    /// Per block: original index -> byte offset into its shard's reply.
    block_offsets: Vec<HashMap<u64, usize>>,
    block_lines: Vec<usize>,
    shard_weights: HashMap<i32, Vec<u8>>,
    waiting: usize,
}

impl PullSession {
    /// Build one request per node that owns data for this pull.
    pub fn generate(
        blocks: &[EmbeddingPullItems<'_>],
        batch_id: i64,
        route: &ClusterRoute,
        picker: &dyn ReplicaPicker,
    ) -> PsResult<(Self, Vec<(i32, PullRequest)>)> {
        let shard_num = route.global_shard_num.max(1) as u64;

        // shard -> node assignment through the replica picker
        let mut selected = HashMap::new();
        for shard_id in 0..route.global_shard_num {
            let replicas = route.replicas_of(shard_id);
            let node = picker
                .pick(shard_id, &replicas)
                .ok_or_else(|| PsError::NoReplica(format!("shard {shard_id}")))?;
            selected.insert(shard_id, node);
        }

        // per-shard dedup with running byte cursors
        struct ShardPlan {
            cursor: usize,
            indices: Vec<u64>,
            num_indices: Vec<u64>,
        }
        let mut shards: Vec<ShardPlan> = (0..route.global_shard_num)
            .map(|_| ShardPlan {
                cursor: 0,
                indices: Vec::new(),
                num_indices: Vec::new(),
            })
            .collect();

        let mut block_offsets = Vec::with_capacity(blocks.len());
        let mut block_lines = Vec::with_capacity(blocks.len());
        for items in blocks {
            let line = items.meta.line_size() as usize;
            let mut offsets = HashMap::new();
            for &index in items.indices {
                if index >= items.meta.vocabulary_size {
                    return Err(PsError::Error("embedding index out of range".into()));
                }
                if let std::collections::hash_map::Entry::Vacant(entry) = offsets.entry(index) {
                    let shard = &mut shards[(index % shard_num) as usize];
                    shard.indices.push(index / shard_num);
                    entry.insert(shard.cursor);
                    shard.cursor += line;
                }
            }
            for shard in shards.iter_mut() {
                shard.num_indices.push(shard.indices.len() as u64);
            }
            block_offsets.push(offsets);
            block_lines.push(line);
        }

        // assemble one request per node, skipping nodes nothing hit
        let mut per_node: BTreeMap<i32, PullRequest> = BTreeMap::new();
        for (shard_id, plan) in shards.into_iter().enumerate() {
            let shard_id = shard_id as i32;
            if plan.indices.is_empty() {
                continue;
            }
            let node = selected[&shard_id];
            let mut variable_blocks = Vec::with_capacity(blocks.len());
            let mut previous = 0u64;
            for (k, items) in blocks.iter().enumerate() {
                variable_blocks.push(VariableBlock {
                    variable_id: items.variable_id,
                    meta: items.meta,
                    num_indices: plan.num_indices[k] - previous,
                });
                previous = plan.num_indices[k];
            }
            per_node
                .entry(node)
                .or_insert_with(|| PullRequest {
                    batch_id,
                    shards: Vec::new(),
                })
                .shards
                .push(ShardPull {
                    shard_id,
                    indices: plan.indices,
                    blocks: variable_blocks,
                });
        }

        let requests: Vec<(i32, PullRequest)> = per_node.into_iter().collect();
        let session = Self {
            shard_num,
            block_offsets,
            block_lines,
            shard_weights: HashMap::new(),
            waiting: requests.len(),
        };
        Ok((session, requests))
    }

    /// Feed one node's reply in. Returns true once every reply arrived.
    pub fn absorb(&mut self, response: PullResponse) -> bool {
        for shard in response.shards {
            self.shard_weights.insert(shard.shard_id, shard.weights);
        }
        self.waiting = self.waiting.saturating_sub(1);
        self.waiting == 0
    }

    /// Copy block `k`'s rows into `out` in the caller's original index
    /// order. Duplicate indices share a single fetched row.
    pub fn fill(&self, k: usize, indices: &[u64], out: &mut [u8]) -> PsResult<()> {
        let line = self.block_lines[k];
        let offsets = &self.block_offsets[k];
        for (i, index) in indices.iter().enumerate() {
            let shard_id = (index % self.shard_num) as i32;
            let offset = *offsets
                .get(index)
                .ok_or_else(|| PsError::Error(format!("index {index} missing from pull plan")))?;
            let weights = self
                .shard_weights
                .get(&shard_id)
                .ok_or_else(|| PsError::NoReplica(format!("shard {shard_id} never replied")))?;
            out[i * line..(i + 1) * line].copy_from_slice(&weights[offset..offset + line]);
        }
        Ok(())
    }
}

/// Build one push request per node, pre-reducing duplicate indices
/// client-side (summed gradients, counted multiplicity).
pub fn generate_push_requests(
    blocks: &[EmbeddingPushItems<'_>],
    route: &ClusterRoute,
) -> PsResult<Vec<(i32, PushRequest)>> {
    if route.global_shard_num <= 0 {
        return Err(PsError::NoReplica("no shard".into()));
    }
    let shard_num = route.global_shard_num as u64;

    struct ShardPlan {
        indices: Vec<u64>,
        gradients: Vec<u8>,
        counts: Vec<u64>,
        num_indices: Vec<u64>,
        indices_base: usize,
        bytes_base: usize,
    }
    let mut shards: Vec<ShardPlan> = (0..route.global_shard_num)
        .map(|_| ShardPlan {
            indices: Vec::new(),
            gradients: Vec::new(),
            counts: Vec::new(),
            num_indices: Vec::new(),
            indices_base: 0,
            bytes_base: 0,
        })
        .collect();

    for items in blocks {
        let line = items.meta.line_size() as usize;
        if items.gradients.len() != items.indices.len() * line {
            return Err(PsError::InvalidConfig(
                "gradient payload does not match index count".into(),
            ));
        }
        for shard in shards.iter_mut() {
            shard.indices_base = shard.indices.len();
            shard.bytes_base = shard.gradients.len();
        }
        let mut offsets: HashMap<u64, usize> = HashMap::new();
        for (i, &index) in items.indices.iter().enumerate() {
            if index >= items.meta.vocabulary_size {
                return Err(PsError::Error("embedding index out of range".into()));
            }
            let row = &items.gradients[i * line..(i + 1) * line];
            let shard = &mut shards[(index % shard_num) as usize];
            match offsets.get(&index) {
                Some(&offset) => {
                    let dst = shard.bytes_base + offset * line;
                    sum_row(items.meta, &mut shard.gradients[dst..dst + line], row);
                    shard.counts[shard.indices_base + offset] += 1;
                }
                None => {
                    offsets.insert(index, shard.indices.len() - shard.indices_base);
                    shard.indices.push(index / shard_num);
                    shard.gradients.extend_from_slice(row);
                    shard.counts.push(1);
                }
            }
        }
        for shard in shards.iter_mut() {
            shard.num_indices.push(shard.indices.len() as u64);
        }
    }

    let mut requests = Vec::new();
    for (&node, node_shards) in &route.nodes {
        let mut request = PushRequest { shards: Vec::new() };
        for &shard_id in node_shards {
            let plan = &shards[shard_id as usize];
            let mut variable_blocks = Vec::with_capacity(blocks.len());
            let mut previous = 0u64;
            for (k, items) in blocks.iter().enumerate() {
                variable_blocks.push(VariableBlock {
                    variable_id: items.variable_id,
                    meta: items.meta,
                    num_indices: plan.num_indices[k] - previous,
                });
                previous = plan.num_indices[k];
            }
            request.shards.push(ShardPush {
                shard_id,
                indices: plan.indices.clone(),
                gradients: plan.gradients.clone(),
                counts: plan.counts.clone(),
                blocks: variable_blocks,
            });
        }
        if !request.shards.is_empty() {
            requests.push((node, request));
        }
    }
    Ok(requests)
}

/// Accumulate one little-endian gradient row into another.
fn sum_row(meta: EmbeddingVariableMeta, dst: &mut [u8], src: &[u8]) {
    match meta.datatype.size() {
        4 => {
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                let mut a = [0u8; 4];
                a.copy_from_slice(d);
                let mut b = [0u8; 4];
                b.copy_from_slice(s);
                let sum = f32::from_le_bytes(a) + f32::from_le_bytes(b);
                d.copy_from_slice(&sum.to_le_bytes());
            }
        }
        _ => {
            for (d, s) in dst.chunks_exact_mut(8).zip(src.chunks_exact(8)) {
                let mut a = [0u8; 8];
                a.copy_from_slice(d);
                let mut b = [0u8; 8];
                b.copy_from_slice(s);
                let sum = f64::from_le_bytes(a) + f64::from_le_bytes(b);
                d.copy_from_slice(&sum.to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embershard_core::DataType;

    fn meta(dim: u64, vocab: u64) -> EmbeddingVariableMeta {
        EmbeddingVariableMeta {
            datatype: DataType::Float32,
            embedding_dim: dim,
            vocabulary_size: vocab,
        }
    }

    fn grads_f32(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn pull_partitions_and_deduplicates() {
        let route = ClusterRoute::single_node(0, 4);
        let picker = RoundRobinPicker::default();
        let indices = [7u64, 7, 2, 6, 7];
        let blocks = [EmbeddingPullItems {
            variable_id: 0,
            meta: meta(1, 100),
            indices: &indices,
        }];
        let (_, requests) = PullSession::generate(&blocks, 0, &route, &picker).unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0].1;
        // shard 3 gets 7 once (deduplicated), shard 2 gets 2 and 6
        let total: usize = request.shards.iter().map(|s| s.indices.len()).sum();
        assert_eq!(total, 3);
        let shard3 = request.shards.iter().find(|s| s.shard_id == 3).unwrap();
        assert_eq!(shard3.indices, vec![1]); // 7 / 4
    }

    #[test]
    fn pull_scatter_restores_caller_order() {
        let route = ClusterRoute::single_node(0, 2);
        let picker = RoundRobinPicker::default();
        let indices = [3u64, 0, 3];
        let blocks = [EmbeddingPullItems {
            variable_id: 0,
            meta: meta(1, 10),
            indices: &indices,
        }];
        let (mut session, requests) = PullSession::generate(&blocks, 0, &route, &picker).unwrap();

        // fabricate a reply: shard 1 owns key 3 (value 30.0), shard 0 owns 0
        let mut response = PullResponse { shards: vec![] };
        for shard in &requests[0].1.shards {
            let value: f32 = if shard.shard_id == 1 { 30.0 } else { 0.5 };
            response.shards.push(embershard_core::protocol::ShardPullReply {
                shard_id: shard.shard_id,
                weights: grads_f32(&vec![value; shard.indices.len()]),
            });
        }
        assert!(session.absorb(response));

        let mut out = vec![0u8; indices.len() * 4];
        session.fill(0, &indices, &mut out).unwrap();
        let values: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, vec![30.0, 0.5, 30.0]);
    }

    #[test]
    fn push_sums_duplicates_and_counts() {
        let route = ClusterRoute::single_node(0, 4);
        let indices = [7u64, 7, 7];
        let gradients = grads_f32(&[1.0, 1.0, 1.0]);
        let blocks = [EmbeddingPushItems {
            variable_id: 0,
            meta: meta(1, 100),
            indices: &indices,
            gradients: &gradients,
        }];
        let requests = generate_push_requests(&blocks, &route).unwrap();
        assert_eq!(requests.len(), 1);
        let shard = requests[0]
            .1
            .shards
            .iter()
            .find(|s| !s.indices.is_empty())
            .unwrap();
        assert_eq!(shard.shard_id, 3);
        assert_eq!(shard.indices, vec![1]);
        assert_eq!(shard.counts, vec![3]);
        let summed = f32::from_le_bytes([
            shard.gradients[0],
            shard.gradients[1],
            shard.gradients[2],
            shard.gradients[3],
        ]);
        assert_eq!(summed, 3.0);
    }

    #[test]
    fn out_of_range_indices_fail_the_whole_request() {
        let route = ClusterRoute::single_node(0, 2);
        let picker = RoundRobinPicker::default();
        let indices = [11u64];
        let blocks = [EmbeddingPullItems {
            variable_id: 0,
            meta: meta(1, 10),
            indices: &indices,
        }];
        assert!(matches!(
            PullSession::generate(&blocks, 0, &route, &picker),
            Err(PsError::Error(_))
        ));

        let gradients = grads_f32(&[1.0]);
        let push = [EmbeddingPushItems {
            variable_id: 0,
            meta: meta(1, 10),
            indices: &indices,
            gradients: &gradients,
        }];
        assert!(matches!(
            generate_push_requests(&push, &route),
            Err(PsError::Error(_))
        ));
    }

    #[test]
    fn empty_pulls_are_valid_noops() {
        let route = ClusterRoute::single_node(0, 2);
        let picker = RoundRobinPicker::default();
        let blocks = [EmbeddingPullItems {
            variable_id: 0,
            meta: meta(1, 10),
            indices: &[],
        }];
        let (_, requests) = PullSession::generate(&blocks, 0, &route, &picker).unwrap();
        assert!(requests.is_empty());
    }

    #[test]
    fn no_replica_for_uncovered_shard() {
        let route = ClusterRoute {
            global_shard_num: 2,
            nodes: BTreeMap::from([(0, vec![0])]), // shard 1 uncovered
        };
        let picker = RoundRobinPicker::default();
        let indices = [0u64];
        let blocks = [EmbeddingPullItems {
            variable_id: 0,
            meta: meta(1, 10),
            indices: &indices,
        }];
        assert!(matches!(
            PullSession::generate(&blocks, 0, &route, &picker),
            Err(PsError::NoReplica(_))
        ));
    }
}
