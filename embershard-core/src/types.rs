//! Variable and model metadata shared by every layer of the system.

use serde::{Deserialize, Serialize};

/// On-disk model format version. Loaders reject anything else.
pub const MODEL_FORMAT_VERSION: &str = "0.2";

/// Element type of an embedding variable.
///
/// Only the float types are constructible as variables; the integer types
/// exist so metadata from foreign tools still parses and round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    pub fn parse(s: &str) -> Option<DataType> {
        match s {
            "int8" => Some(DataType::Int8),
            "int16" => Some(DataType::Int16),
            "int32" => Some(DataType::Int32),
            "int64" => Some(DataType::Int64),
            "float32" => Some(DataType::Float32),
            "float64" => Some(DataType::Float64),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The information a client needs to pull or push against a variable.
///
/// A variable's meta is immutable once the variable exists; every request
/// carries the caller's copy and the server rejects mismatches with
/// `InvalidConfig` before touching the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingVariableMeta {
    pub datatype: DataType,
    pub embedding_dim: u64,
    pub vocabulary_size: u64,
}

impl EmbeddingVariableMeta {
    /// Bytes of one embedding row on the wire (weights only, no state).
    pub fn line_size(&self) -> u64 {
        self.datatype.size() as u64 * self.embedding_dim
    }

    /// Unbounded vocabularies select the hash index instead of the dense
    /// array index.
    pub fn use_hash_table(&self) -> bool {
        self.vocabulary_size >= (1u64 << 63)
    }
}

/// One variable entry in the offline model meta file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVariableMeta {
    #[serde(flatten)]
    pub meta: EmbeddingVariableMeta,
    pub storage_name: String,
}

/// The `model_meta` sidecar written next to the shard files of a dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOfflineMeta {
    pub model_sign: String,
    pub variables: Vec<ModelVariableMeta>,
    pub version: String,
}

impl ModelOfflineMeta {
    pub fn new(model_sign: String, variables: Vec<ModelVariableMeta>) -> Self {
        Self {
            model_sign,
            variables,
            version: MODEL_FORMAT_VERSION.to_string(),
        }
    }
}

/// Lifecycle of a served model as tracked by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Creating,
    Loading,
    Normal,
    Deleting,
    Failed,
}

/// Control-plane view of a model: the offline meta plus where it came from
/// and how it is doing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMeta {
    pub model_sign: String,
    pub model_uri: String,
    pub model_status: ModelStatus,
    pub model_error: String,
    pub variables: Vec<ModelVariableMeta>,
}
