//! The error model of the parameter server.
//!
//! Four kinds, mapped 1:1 to wire codes. Per-request errors from one shard
//! downgrade the whole request to the first non-OK status; partial successes
//! on other shards are not rolled back.

use serde::{Deserialize, Serialize};

pub type PsResult<T> = Result<T, PsError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum PsError {
    /// Unknown model, variable, handler, or node.
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// Meta mismatch, malformed YAML, unsupported checkpoint version, or a
    /// request running too far ahead of the shard's batch.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// No live server can serve a shard.
    #[error("no replica: {0}")]
    NoReplica(String),

    /// Generic failure.
    #[error("{0}")]
    Error(String),
}

impl PsError {
    pub fn code(&self) -> u32 {
        match self {
            PsError::InvalidId(_) => 1,
            PsError::InvalidConfig(_) => 2,
            PsError::NoReplica(_) => 3,
            PsError::Error(_) => 4,
        }
    }

    pub fn from_code(code: u32, message: String) -> PsError {
        match code {
            1 => PsError::InvalidId(message),
            2 => PsError::InvalidConfig(message),
            3 => PsError::NoReplica(message),
            _ => PsError::Error(message),
        }
    }
}
