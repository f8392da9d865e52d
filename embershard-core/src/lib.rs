//! # EmberShard Core
//!
//! Shared foundation for the EmberShard parameter server: variable and model
//! metadata, the error model, configuration structures, and the
//! transport-agnostic wire protocol used between the request-shaping client
//! and the server shards.
//!
//! Everything in this crate is plain data. The embedding engine itself lives
//! in `embershard-variable`; shard orchestration in `embershard-storage`.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use config::{ApiConfig, EnvConfig, ServerConfig};
pub use error::{PsError, PsResult};
pub use types::{
    DataType, EmbeddingVariableMeta, ModelMeta, ModelOfflineMeta, ModelStatus, ModelVariableMeta,
    MODEL_FORMAT_VERSION,
};
