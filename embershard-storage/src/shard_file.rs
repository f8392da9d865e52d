//! The on-disk shard checkpoint format.
//!
//! Each shard file is a sequence of [`EmbeddingShardDataMeta`] records; a
//! record with `num_items > 0` is followed by blocks of
//! `{ n, keys, weights, states }` until the item count is consumed. Keys,
//! weights and states are raw little-endian arrays so a block round-trips
//! byte-identically. A `model_meta` JSON sidecar describes the whole model
//! and pins the format version.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use embershard_core::types::{ModelOfflineMeta, MODEL_FORMAT_VERSION};
use embershard_core::{EmbeddingVariableMeta, PsError, PsResult};
use serde::{Deserialize, Serialize};

pub const MODEL_META_FILE: &str = "model_meta";

/// Per-variable header record inside a shard file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingShardDataMeta {
    pub variable_id: u32,
    pub meta: EmbeddingVariableMeta,
    /// Opaque YAML variable config at dump time.
    pub config: String,
    pub shard_id: i32,
    pub shard_num: i32,
    /// 0 means the dump carries no optimizer state.
    pub state_line_size: u64,
    pub num_items: u64,
}

impl EmbeddingShardDataMeta {
    /// Map a shard-local row index back to the global key space.
    pub fn global_index(&self, index: u64) -> u64 {
        index * self.shard_num as u64 + self.shard_id as u64
    }
}

/// Name of one shard file within a dump directory.
pub fn shard_file_name(node_id: i32, file_id: i32) -> String {
    format!("model_{node_id}_{file_id}")
}

pub struct ShardFileWriter {
    inner: BufWriter<File>,
}

impl ShardFileWriter {
    pub fn create(path: &Path) -> PsResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PsError::Error(format!("cannot create dump dir {parent:?}: {e}")))?;
        }
        let file = File::create(path)
            .map_err(|e| PsError::Error(format!("cannot create shard file {path:?}: {e}")))?;
        Ok(Self {
            inner: BufWriter::new(file),
        })
    }

    pub fn write_meta(&mut self, meta: &EmbeddingShardDataMeta) -> PsResult<()> {
        bincode::serialize_into(&mut self.inner, meta)
            .map_err(|e| PsError::Error(format!("cannot write shard meta: {e}")))
    }

    /// One `{ n, keys, weights, states }` block.
    pub fn write_block(&mut self, keys: &[u64], weights: &[u8], states: &[u8]) -> PsResult<()> {
        let write = |inner: &mut BufWriter<File>| -> std::io::Result<()> {
            inner.write_all(&(keys.len() as u64).to_le_bytes())?;
            for &key in keys {
                inner.write_all(&key.to_le_bytes())?;
            }
            inner.write_all(weights)?;
            inner.write_all(states)
        };
        write(&mut self.inner).map_err(|e| PsError::Error(format!("cannot write shard block: {e}")))
    }

    pub fn finish(mut self) -> PsResult<()> {
        self.inner
            .flush()
            .map_err(|e| PsError::Error(format!("cannot flush shard file: {e}")))
    }
}

pub struct ShardFileReader {
    inner: BufReader<File>,
}

impl ShardFileReader {
    pub fn open(path: &Path) -> PsResult<Self> {
        let file = File::open(path)
            .map_err(|e| PsError::Error(format!("cannot open shard file {path:?}: {e}")))?;
        Ok(Self {
            inner: BufReader::new(file),
        })
    }

    /// Next variable record, or `None` at a clean end of file.
    pub fn read_meta(&mut self) -> PsResult<Option<EmbeddingShardDataMeta>> {
        // probe one byte to distinguish EOF from a truncated record
        let mut probe = [0u8; 1];
        match self.inner.read_exact(&mut probe) {
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(PsError::Error(format!("cannot read shard file: {e}"))),
            Ok(()) => {}
        }
        let mut reader = std::io::Cursor::new(probe).chain(&mut self.inner);
        bincode::deserialize_from(&mut reader)
            .map(Some)
            .map_err(|e| PsError::Error(format!("corrupted shard file: {e}")))
    }

    pub fn read_block(
        &mut self,
        line_size: u64,
        state_line_size: u64,
    ) -> PsResult<(Vec<u64>, Vec<u8>, Vec<u8>)> {
        let mut n_bytes = [0u8; 8];
        self.inner
            .read_exact(&mut n_bytes)
            .map_err(|e| PsError::Error(format!("corrupted shard file: {e}")))?;
        let n = u64::from_le_bytes(n_bytes) as usize;

        let mut keys = vec![0u64; n];
        let mut key_bytes = vec![0u8; n * 8];
        self.inner
            .read_exact(&mut key_bytes)
            .map_err(|e| PsError::Error(format!("corrupted shard file: {e}")))?;
        for (i, chunk) in key_bytes.chunks_exact(8).enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            keys[i] = u64::from_le_bytes(buf);
        }

        let mut weights = vec![0u8; n * line_size as usize];
        self.inner
            .read_exact(&mut weights)
            .map_err(|e| PsError::Error(format!("corrupted shard file: {e}")))?;
        let mut states = vec![0u8; n * state_line_size as usize];
        self.inner
            .read_exact(&mut states)
            .map_err(|e| PsError::Error(format!("corrupted shard file: {e}")))?;
        Ok((keys, weights, states))
    }
}

/// List every shard file in a dump directory.
pub fn list_shard_files(dir: &Path) -> PsResult<Vec<std::path::PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| PsError::Error(format!("cannot list dump dir {dir:?}: {e}")))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PsError::Error(format!("cannot list dump dir: {e}")))?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("model_")
            && name.to_string_lossy() != MODEL_META_FILE
        {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

pub fn write_model_meta(dir: &Path, meta: &ModelOfflineMeta) -> PsResult<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| PsError::Error(format!("cannot create dump dir {dir:?}: {e}")))?;
    let body = serde_json::to_vec_pretty(meta)
        .map_err(|e| PsError::Error(format!("cannot encode model meta: {e}")))?;
    std::fs::write(dir.join(MODEL_META_FILE), body)
        .map_err(|e| PsError::Error(format!("cannot write model meta: {e}")))
}

pub fn read_model_meta(dir: &Path) -> PsResult<ModelOfflineMeta> {
    let body = std::fs::read(dir.join(MODEL_META_FILE))
        .map_err(|e| PsError::Error(format!("model meta file is not openable: {e}")))?;
    let meta: ModelOfflineMeta = serde_json::from_slice(&body)
        .map_err(|e| PsError::Error(format!("invalid model meta file: {e}")))?;
    if meta.version != MODEL_FORMAT_VERSION {
        return Err(PsError::InvalidConfig(format!(
            "model format version is {}, current version is {}",
            meta.version, MODEL_FORMAT_VERSION
        )));
    }
    Ok(meta)
}
