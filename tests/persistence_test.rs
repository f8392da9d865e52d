//! Dump/load round-trips and the persistent-memory restart path.

use std::sync::Arc;

use embershard_client::{
    generate_push_requests, ClusterRoute, EmbeddingPullItems, EmbeddingPushItems, PullSession,
    RoundRobinPicker,
};
use embershard_core::protocol::{
    DumpOptions, DumpRequest, InitItems, InitRequest, LoadRequest, RestoreRequest, ShardInit,
};
use embershard_core::{DataType, EmbeddingVariableMeta, ServerConfig};
use embershard_server::{EmbeddingService, PullReply};
use embershard_storage::shard_file::write_model_meta;
use embershard_storage::EmbeddingStorage;
use embershard_variable::{PersistManager, VariableAsyncTaskPool};

fn service_with_manager(shard_num: i32, manager: Arc<PersistManager>) -> Arc<EmbeddingService> {
    let storage = Arc::new(EmbeddingStorage::new(0..shard_num, manager));
    let pool = Arc::new(VariableAsyncTaskPool::new(2));
    Arc::new(EmbeddingService::new(
        storage,
        pool,
        ServerConfig::default(),
        0,
    ))
}

fn service(shard_num: i32) -> Arc<EmbeddingService> {
    service_with_manager(shard_num, Arc::new(PersistManager::new()))
}

fn meta(dim: u64, vocab: u64) -> EmbeddingVariableMeta {
    EmbeddingVariableMeta {
        datatype: DataType::Float32,
        embedding_dim: dim,
        vocabulary_size: vocab,
    }
}

fn init_variable(
    service: &EmbeddingService,
    shard_num: i32,
    meta: EmbeddingVariableMeta,
    config: &str,
) {
    let shards = (0..shard_num)
        .map(|shard_id| ShardInit {
            shard_id,
            items: vec![InitItems::config_only(0, meta, config.to_string())],
        })
        .collect();
    service.init(InitRequest { shards }).unwrap();
}

fn push(
    service: &EmbeddingService,
    route: &ClusterRoute,
    m: EmbeddingVariableMeta,
    indices: &[u64],
    grads: &[f32],
) {
    let gradients: Vec<u8> = grads.iter().flat_map(|v| v.to_le_bytes()).collect();
    let blocks = [EmbeddingPushItems {
        variable_id: 0,
        meta: m,
        indices,
        gradients: &gradients,
    }];
    for (_, request) in generate_push_requests(&blocks, route).unwrap() {
        service.push(request).unwrap();
    }
}

fn pull(
    service: &EmbeddingService,
    route: &ClusterRoute,
    m: EmbeddingVariableMeta,
    batch_id: i64,
    indices: &[u64],
) -> Vec<f32> {
    let picker = RoundRobinPicker::default();
    let blocks = [EmbeddingPullItems {
        variable_id: 0,
        meta: m,
        indices,
    }];
    let (mut session, requests) = PullSession::generate(&blocks, batch_id, route, &picker).unwrap();
    for (_, request) in requests {
        match service.pull(request) {
            PullReply::Ready(result) => {
                session.absorb(result.unwrap());
            }
            PullReply::Deferred(_) => panic!("pull unexpectedly deferred"),
        }
    }
    let mut out = vec![0u8; indices.len() * m.line_size() as usize];
    session.fill(0, indices, &mut out).unwrap();
    out.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// One training batch touching every key with key-dependent gradients.
fn train_batch(
    service: &EmbeddingService,
    route: &ClusterRoute,
    m: EmbeddingVariableMeta,
    keys: &[u64],
    scale: f32,
) {
    let grads: Vec<f32> = keys.iter().map(|&k| (k as f32 + 1.0) * scale).collect();
    push(service, route, m, keys, &grads);
    service.store().unwrap();
}

#[test]
fn dump_then_load_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let shard_num = 2;
    let m = meta(2, 100);
    let route = ClusterRoute::single_node(0, shard_num);
    let config = "optimizer: adagrad\nlearning_rate: 0.1\ninitializer: constant\nvalue: 1.0\n";

    let source = service(shard_num);
    init_variable(&source, shard_num, m, config);
    let keys: Vec<u64> = (0..40).collect();
    for batch in 0..5 {
        train_batch(&source, &route, m, &keys, 0.1 * (batch as f32 + 1.0));
    }

    source
        .dump(&DumpRequest {
            uri: dir.path().to_string_lossy().into_owned(),
            file_id: 0,
            shard_ids: source.storage().shard_ids(),
            options: DumpOptions {
                include_optimizer: true,
                persist_model: false,
                persist_pending_window: 0,
            },
        })
        .unwrap();
    write_model_meta(dir.path(), &source.model_offline_meta("sign", "embeddings")).unwrap();

    let target = service(shard_num);
    target
        .load(&LoadRequest {
            uri: dir.path().to_string_lossy().into_owned(),
        })
        .unwrap();

    let expected = pull(&source, &route, m, 5, &keys);
    let loaded = pull(&target, &route, m, 0, &keys);
    assert_eq!(expected, loaded);

    // continued training stays in lockstep because optimizer state survived
    train_batch(&source, &route, m, &keys, 0.3);
    push(&target, &route, m, &keys, &keys.iter().map(|&k| (k as f32 + 1.0) * 0.3).collect::<Vec<_>>());
    target.store().unwrap();
    assert_eq!(
        pull(&source, &route, m, 6, &keys),
        pull(&target, &route, m, 1, &keys)
    );
}

#[test]
fn dump_without_optimizer_drops_state() {
    let dir = tempfile::tempdir().unwrap();
    let m = meta(1, 50);
    let route = ClusterRoute::single_node(0, 1);
    let config = "optimizer: adagrad\nlearning_rate: 0.1\ninitializer: constant\nvalue: 1.0\n";

    let source = service(1);
    init_variable(&source, 1, m, config);
    train_batch(&source, &route, m, &[1, 2, 3], 1.0);

    source
        .dump(&DumpRequest {
            uri: dir.path().to_string_lossy().into_owned(),
            file_id: 0,
            shard_ids: vec![0],
            options: DumpOptions {
                include_optimizer: false,
                persist_model: false,
                persist_pending_window: 0,
            },
        })
        .unwrap();

    let target = service(1);
    target
        .load(&LoadRequest {
            uri: dir.path().to_string_lossy().into_owned(),
        })
        .unwrap();
    // weights equal even though states were re-initialized
    assert_eq!(
        pull(&source, &route, m, 1, &[1, 2, 3]),
        pull(&target, &route, m, 0, &[1, 2, 3])
    );
}

#[test]
fn persistent_restart_resumes_from_the_checkpoint() {
    let pmem_root = tempfile::tempdir().unwrap();
    let dump_dir = tempfile::tempdir().unwrap();
    let m = meta(2, 64);
    let route = ClusterRoute::single_node(0, 1);
    let keys: Vec<u64> = (0..16).collect();
    let pmem_config =
        "table: pmem.hash\noptimizer: default\nlearning_rate: 1.0\ninitializer: constant\nvalue: 0.0\n";
    let volatile_config =
        "table: hash\noptimizer: default\nlearning_rate: 1.0\ninitializer: constant\nvalue: 0.0\n";

    // the in-memory twin run used as the reference
    let twin = service(1);
    init_variable(&twin, 1, m, volatile_config);

    // persistent run: cache too small for the working set, so the table
    // spills through the persistent tier from the start
    let manager = Arc::new(PersistManager::new());
    manager.initialize(pmem_root.path()).unwrap();
    let durable = service_with_manager(1, Arc::clone(&manager));
    init_variable(&durable, 1, m, pmem_config);

    let checkpoint_batch = 6;
    for batch in 0..checkpoint_batch {
        let scale = (batch % 3) as f32 + 1.0;
        train_batch(&twin, &route, m, &keys, scale);
        train_batch(&durable, &route, m, &keys, scale);
    }

    // persist: records pool path + checkpoint (= work id 6) in the config
    durable
        .dump(&DumpRequest {
            uri: dump_dir.path().to_string_lossy().into_owned(),
            file_id: 0,
            shard_ids: vec![0],
            options: DumpOptions {
                include_optimizer: true,
                persist_model: true,
                persist_pending_window: 2,
            },
        })
        .unwrap();

    // two more batches: every key is rewritten, which copy-flushes the
    // checkpoint's rows and lets it graduate to the durable list
    for batch in checkpoint_batch..checkpoint_batch + 2 {
        let scale = (batch % 3) as f32 + 1.0;
        train_batch(&durable, &route, m, &keys, scale);
    }

    // crash: drop the process state, keep the pool files
    drop(durable);

    // reopen from the recorded checkpoint and replay the batches after it
    let manager = Arc::new(PersistManager::new());
    manager.initialize(pmem_root.path()).unwrap();
    let reopened = service_with_manager(1, Arc::clone(&manager));
    reopened
        .restore(&RestoreRequest {
            uri: dump_dir.path().to_string_lossy().into_owned(),
        })
        .unwrap();

    // the restored state matches the twin after checkpoint_batch batches
    assert_eq!(
        pull(&twin, &route, m, checkpoint_batch, &keys),
        pull(&reopened, &route, m, 0, &keys)
    );

    // continue in lockstep for a few batches
    for batch in checkpoint_batch..checkpoint_batch + 3 {
        let scale = (batch % 3) as f32 + 1.0;
        train_batch(&twin, &route, m, &keys, scale);
        train_batch(&reopened, &route, m, &keys, scale);
    }
    assert_eq!(
        pull(&twin, &route, m, checkpoint_batch + 3, &keys),
        pull(&reopened, &route, m, 3, &keys)
    );
}
