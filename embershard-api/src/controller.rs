//! Model lifecycle management behind the REST surface.
//!
//! Creating a model registers it, then loads its checkpoint into the local
//! storage on a controller task; deletion is likewise asynchronous. The
//! registry is the source of truth the HTTP handlers render.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use embershard_core::protocol::LoadRequest;
use embershard_core::types::{ModelMeta, ModelStatus};
use embershard_core::{PsError, PsResult};
use embershard_server::EmbeddingService;
use embershard_storage::shard_file::read_model_meta;
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub node_id: i32,
    pub shard_ids: Vec<i32>,
    pub registered_at: chrono::DateTime<Utc>,
}

pub struct ModelController {
    service: Arc<EmbeddingService>,
    models: Arc<DashMap<String, ModelMeta>>,
    nodes: DashMap<i32, NodeInfo>,
}

impl ModelController {
    pub fn new(service: Arc<EmbeddingService>, node_id: i32) -> Self {
        let nodes = DashMap::new();
        nodes.insert(
            node_id,
            NodeInfo {
                node_id,
                shard_ids: service.storage().shard_ids(),
                registered_at: Utc::now(),
            },
        );
        Self {
            service,
            models: Arc::new(DashMap::new()),
            nodes,
        }
    }

    /// Register a model from a dump directory and start loading it. The
    /// returned sign comes from the dump's `model_meta`.
    pub async fn create_model(
        &self,
        model_uri: &str,
        _replica_num: i32,
        _shard_num: i32,
    ) -> PsResult<String> {
        let offline = read_model_meta(std::path::Path::new(model_uri))?;
        let sign = offline.model_sign.clone();
        if self.models.contains_key(&sign) {
            return Err(PsError::Error(format!("model {sign} already exists")));
        }
        self.models.insert(
            sign.clone(),
            ModelMeta {
                model_sign: sign.clone(),
                model_uri: model_uri.to_string(),
                model_status: ModelStatus::Loading,
                model_error: String::new(),
                variables: offline.variables,
            },
        );
        info!(model_sign = %sign, model_uri, "creating model");

        let service = Arc::clone(&self.service);
        let models = Arc::clone(&self.models);
        let uri = model_uri.to_string();
        let job_sign = sign.clone();
        tokio::task::spawn_blocking(move || {
            let result = service.load(&LoadRequest { uri });
            if let Some(mut entry) = models.get_mut(&job_sign) {
                match result {
                    Ok(()) => entry.model_status = ModelStatus::Normal,
                    Err(err) => {
                        error!(model_sign = %job_sign, %err, "model load failed");
                        entry.model_status = ModelStatus::Failed;
                        entry.model_error = err.to_string();
                    }
                }
            }
        });
        Ok(sign)
    }

    pub fn show_models(&self) -> Vec<ModelMeta> {
        let mut models: Vec<ModelMeta> =
            self.models.iter().map(|entry| entry.value().clone()).collect();
        models.sort_by(|a, b| a.model_sign.cmp(&b.model_sign));
        models
    }

    pub fn show_model(&self, model_sign: &str) -> PsResult<ModelMeta> {
        self.models
            .get(model_sign)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PsError::InvalidId(format!("unknown model {model_sign}")))
    }

    /// Asynchronous delete: flips the status, then drops the model and its
    /// rows on a controller task.
    pub fn delete_model(&self, model_sign: &str) -> PsResult<()> {
        let mut entry = self
            .models
            .get_mut(model_sign)
            .ok_or_else(|| PsError::InvalidId(format!("unknown model {model_sign}")))?;
        entry.model_status = ModelStatus::Deleting;
        drop(entry);

        let models = Arc::clone(&self.models);
        let service = Arc::clone(&self.service);
        let sign = model_sign.to_string();
        tokio::task::spawn_blocking(move || {
            service.storage().clear();
            models.remove(&sign);
            info!(model_sign = %sign, "model deleted");
        });
        Ok(())
    }

    pub fn show_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    pub fn show_node(&self, node_id: i32) -> PsResult<NodeInfo> {
        self.nodes
            .get(&node_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| PsError::InvalidId(format!("unknown node {node_id}")))
    }

    pub fn delete_node(&self, node_id: i32) -> PsResult<()> {
        self.nodes
            .remove(&node_id)
            .map(|_| ())
            .ok_or_else(|| PsError::InvalidId(format!("unknown node {node_id}")))
    }
}
