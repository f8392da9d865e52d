//! Server configuration and the opaque per-variable config map.
//!
//! The per-variable config travels as a YAML string inside requests and shard
//! files. The core only reads the keys it knows (`table`, `optimizer`,
//! `initializer` and their parameters, `reserve`, `pmem_pool_path`,
//! `checkpoint`); everything else is carried untouched.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{PsError, PsResult};

/// Server-process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root directory for persistent pool files. Empty disables the
    /// persistent tier entirely.
    pub pmem_pool_root_path: Option<PathBuf>,

    /// Global DRAM cache budget in MiB, shared by every persistent variable
    /// on this process.
    pub cache_size: u64,

    /// Transport payload compression: "", "snappy", "lz4" or "zlib". The
    /// core treats payloads as opaque byte spans either way.
    pub message_compress: String,

    /// Number of request handler threads; also the default shard count per
    /// server.
    pub server_concurrency: usize,

    /// Per-request receive timeout in milliseconds, inherited by every RPC.
    pub recv_timeout: u64,

    /// Reply to `store` before applying updates instead of after.
    pub update_early_return: bool,

    /// Seconds between statistics report lines; 0 disables.
    pub report_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pmem_pool_root_path: None,
            cache_size: 1024,
            message_compress: String::new(),
            server_concurrency: 4,
            recv_timeout: 60_000,
            update_early_return: true,
            report_interval: 0,
        }
    }
}

impl ServerConfig {
    pub fn cache_size_bytes(&self) -> u64 {
        self.cache_size * 1024 * 1024
    }

    pub fn validate(&self) -> PsResult<()> {
        const COMPRESSORS: [&str; 4] = ["", "snappy", "lz4", "zlib"];
        if !COMPRESSORS.contains(&self.message_compress.as_str()) {
            return Err(PsError::InvalidConfig(format!(
                "unknown message_compress \"{}\"",
                self.message_compress
            )));
        }
        if self.server_concurrency == 0 {
            return Err(PsError::InvalidConfig(
                "server_concurrency must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// REST control plane listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 8010,
            cors_enabled: true,
        }
    }
}

/// Top level of the YAML config file the server binary loads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub server: ServerConfig,
    pub api: ApiConfig,
}

impl EnvConfig {
    pub fn load_yaml(text: &str) -> PsResult<EnvConfig> {
        let env: EnvConfig = serde_yaml::from_str(text)
            .map_err(|e| PsError::InvalidConfig(format!("bad config file: {e}")))?;
        env.server.validate()?;
        Ok(env)
    }
}

/// Parse a variable config string into the flat key/value map.
pub fn parse_variable_config(text: &str) -> PsResult<Mapping> {
    if text.trim().is_empty() {
        return Ok(Mapping::new());
    }
    let value: Value = serde_yaml::from_str(text)
        .map_err(|e| PsError::InvalidConfig(format!("bad variable config: {e}")))?;
    match value {
        Value::Mapping(map) => Ok(map),
        Value::Null => Ok(Mapping::new()),
        _ => Err(PsError::InvalidConfig(
            "variable config must be a mapping".into(),
        )),
    }
}

pub fn dump_variable_config(map: &Mapping) -> String {
    serde_yaml::to_string(map).unwrap_or_default()
}

pub fn config_str(map: &Mapping, key: &str) -> Option<String> {
    map.get(Value::from(key)).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

pub fn config_f64(map: &Mapping, key: &str) -> Option<f64> {
    map.get(Value::from(key)).and_then(Value::as_f64)
}

pub fn config_u64(map: &Mapping, key: &str) -> Option<u64> {
    map.get(Value::from(key)).and_then(Value::as_u64)
}

pub fn config_i64(map: &Mapping, key: &str) -> Option<i64> {
    map.get(Value::from(key)).and_then(Value::as_i64)
}

pub fn config_bool(map: &Mapping, key: &str) -> Option<bool> {
    map.get(Value::from(key)).and_then(Value::as_bool)
}

pub fn config_set<V: Into<Value>>(map: &mut Mapping, key: &str, value: V) {
    map.insert(Value::from(key), value.into());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_server_config_is_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_unknown_compressor() {
        let config = ServerConfig {
            message_compress: "brotli".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn variable_config_round_trips() {
        let map = parse_variable_config("optimizer: adam\nlearning_rate: 0.01\n").unwrap();
        assert_eq!(config_str(&map, "optimizer").as_deref(), Some("adam"));
        assert_eq!(config_f64(&map, "learning_rate"), Some(0.01));

        let dumped = dump_variable_config(&map);
        let reparsed = parse_variable_config(&dumped).unwrap();
        assert_eq!(reparsed, map);
    }

    #[test]
    fn bad_yaml_is_invalid_config() {
        assert!(matches!(
            parse_variable_config(": ["),
            Err(PsError::InvalidConfig(_))
        ));
        assert!(matches!(
            parse_variable_config("- just\n- a list\n"),
            Err(PsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn empty_variable_config_is_empty_map() {
        assert!(parse_variable_config("").unwrap().is_empty());
    }
}
