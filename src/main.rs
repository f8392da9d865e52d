// EmberShard - distributed, sharded embedding parameter server
//
// Main entry point of one server node. The binary wires the pieces
// together: the persistence context (pmem pool root + DRAM cache budget),
// the shard storage, the variable async task pool, the request service and
// the REST control plane, then waits for a shutdown signal.

use std::sync::Arc;

use anyhow::{Context, Result};
use embershard_api::{ControlPlane, ModelController};
use embershard_core::EnvConfig;
use embershard_server::EmbeddingService;
use embershard_storage::EmbeddingStorage;
use embershard_variable::{PersistManager, VariableAsyncTaskPool};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("embershard=info".parse()?),
        )
        .init();

    // one optional argument: the YAML config file
    let env = match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read config file {path}"))?;
            EnvConfig::load_yaml(&text)?
        }
        None => EnvConfig::default(),
    };
    info!(server = ?env.server, "starting embershard server");

    let manager = Arc::new(PersistManager::new());
    if let Some(root) = &env.server.pmem_pool_root_path {
        manager.initialize(root)?;
    }
    manager
        .dynamic_cache
        .set_capacity(env.server.cache_size_bytes());

    let node_id = 0;
    let shard_num = env.server.server_concurrency as i32;
    let storage = Arc::new(EmbeddingStorage::new(0..shard_num, Arc::clone(&manager)));
    let async_pool = Arc::new(VariableAsyncTaskPool::new(
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
    ));
    let service = Arc::new(EmbeddingService::new(
        storage,
        async_pool,
        env.server.clone(),
        node_id,
    ));

    let controller = Arc::new(ModelController::new(Arc::clone(&service), node_id));
    let control_plane = ControlPlane::new(env.api.clone(), controller);
    control_plane.start().await?;

    if env.server.report_interval > 0 {
        let storage = Arc::clone(service.storage());
        let interval = std::time::Duration::from_secs(env.server.report_interval);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                info!(batch_id = storage.batch_id(), "server report");
            }
        });
    }

    info!(shard_num, "embershard server running");
    signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
