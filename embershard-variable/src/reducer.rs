//! Lock-free multi-producer, single-consumer gradient reducer.
//!
//! `push_gradients` only enqueues; the shard's update path drains the queue
//! and folds every block into per-key sums, preserving first-occurrence
//! order. Gradient payloads stay as the raw little-endian byte views the
//! wire delivered (the shard holds the backing buffers alive until the next
//! update clears them).

use std::collections::HashMap;

use bytes::Bytes;
use crossbeam::queue::SegQueue;

use crate::scalar::Scalar;

/// One pushed block: unique keys, their raw gradient rows, and the
/// client-side duplicate counts.
#[derive(Debug, Clone)]
pub struct PushBlock {
    pub keys: Vec<u64>,
    /// `keys.len() * dim * element_size` little-endian bytes.
    pub gradients: Bytes,
    pub counts: Vec<u64>,
}

#[derive(Debug)]
pub struct MpscGradientReducer<T> {
    embedding_dim: usize,
    queue: SegQueue<PushBlock>,
    offsets: HashMap<u64, usize>,
    keys: Vec<u64>,
    gradients: Vec<T>,
    counts: Vec<u64>,
}

impl<T: Scalar> MpscGradientReducer<T> {
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            embedding_dim,
            queue: SegQueue::new(),
            offsets: HashMap::new(),
            keys: Vec::new(),
            gradients: Vec::new(),
            counts: Vec::new(),
        }
    }

    /// Enqueue a block. Safe from any number of producer threads.
    pub fn push_gradients(&self, block: PushBlock) {
        self.queue.push(block);
    }

    /// Drain every queued block into the per-key sums. Only the shard's
    /// update path may call this.
    pub fn reduce_gradients(&mut self) {
        let dim = self.embedding_dim;
        let line = dim * T::SIZE;
        while let Some(block) = self.queue.pop() {
            for (i, &key) in block.keys.iter().enumerate() {
                let row = &block.gradients[i * line..(i + 1) * line];
                match self.offsets.get(&key) {
                    Some(&offset) => {
                        let sum = &mut self.gradients[offset * dim..(offset + 1) * dim];
                        for (s, chunk) in sum.iter_mut().zip(row.chunks_exact(T::SIZE)) {
                            *s = *s + T::from_le_slice(chunk);
                        }
                        self.counts[offset] += block.counts[i];
                    }
                    None => {
                        self.offsets.insert(key, self.keys.len());
                        self.keys.push(key);
                        self.gradients
                            .extend(row.chunks_exact(T::SIZE).map(T::from_le_slice));
                        self.counts.push(block.counts[i]);
                    }
                }
            }
        }
    }

    /// The reduced view: unique keys in first-occurrence order, summed
    /// gradients (`dim` elements per key), summed counts.
    pub fn reduced(&self) -> (&[u64], &[T], &[u64]) {
        (&self.keys, &self.gradients, &self.counts)
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
        self.keys.clear();
        self.gradients.clear();
        self.counts.clear();
    }

    /// Drain still-unreduced blocks, e.g. when a variable changes shape and
    /// pending pushes must carry over to the replacement.
    pub fn take_blocks(&mut self) -> Vec<PushBlock> {
        let mut blocks = Vec::new();
        while let Some(block) = self.queue.pop() {
            blocks.push(block);
        }
        blocks
    }
}
