//! End-to-end training-loop behavior on a single node: client request
//! shaping against the service handlers, batch ordering, and meta
//! validation.

use std::sync::Arc;

use embershard_client::{
    generate_push_requests, ClusterRoute, EmbeddingPullItems, EmbeddingPushItems, PullSession,
    RoundRobinPicker,
};
use embershard_core::protocol::{InitItems, InitRequest, ShardInit};
use embershard_core::{DataType, EmbeddingVariableMeta, PsError, ServerConfig};
use embershard_server::{EmbeddingService, PullReply};
use embershard_storage::EmbeddingStorage;
use embershard_variable::{PersistManager, VariableAsyncTaskPool};

fn service(shard_num: i32) -> Arc<EmbeddingService> {
    let manager = Arc::new(PersistManager::new());
    let storage = Arc::new(EmbeddingStorage::new(0..shard_num, manager));
    let pool = Arc::new(VariableAsyncTaskPool::new(2));
    Arc::new(EmbeddingService::new(
        storage,
        pool,
        ServerConfig::default(),
        0,
    ))
}

fn meta(dim: u64, vocab: u64) -> EmbeddingVariableMeta {
    EmbeddingVariableMeta {
        datatype: DataType::Float32,
        embedding_dim: dim,
        vocabulary_size: vocab,
    }
}

fn init_variable(service: &EmbeddingService, shard_num: i32, meta: EmbeddingVariableMeta, config: &str) {
    let shards = (0..shard_num)
        .map(|shard_id| ShardInit {
            shard_id,
            items: vec![InitItems::config_only(0, meta, config.to_string())],
        })
        .collect();
    service.init(InitRequest { shards }).unwrap();
}

fn grads_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn push(service: &EmbeddingService, route: &ClusterRoute, m: EmbeddingVariableMeta, indices: &[u64], grads: &[f32]) {
    let gradients = grads_f32(grads);
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

#[test]
fn single_shard_constant_init_sgd() {
    let service = service(1);
    let route = ClusterRoute::single_node(0, 1);
    let m = meta(1, 10);
    init_variable(
        &service,
        1,
        m,
        "optimizer: default\nlearning_rate: 1.0\ninitializer: constant\nvalue: 100.0\n",
    );

    push(&service, &route, m, &[3], &[1.0]);
    service.store().unwrap();
    assert_eq!(pull(&service, &route, m, 1, &[3, 4]), vec![99.0, 100.0]);
}

#[test]
fn adagrad_pull_is_idempotent_before_update() {
    let service = service(1);
    let route = ClusterRoute::single_node(0, 1);
    let m = meta(4, 10);
    init_variable(
        &service,
        1,
        m,
        "optimizer: adagrad\nlearning_rate: 0.1\ninitial_accumulator_value: 0.1\ninitializer: normal\nstddev: 1.0\n",
    );

    let first = pull(&service, &route, m, 0, &[1, 2, 3]);
    let second = pull(&service, &route, m, 0, &[1, 2, 3]);
    assert_eq!(first, second);
}

#[test]
fn multi_shard_duplicate_key_updates_once() {
    let service = service(4);
    let route = ClusterRoute::single_node(0, 4);
    let m = meta(1, 100);
    init_variable(
        &service,
        4,
        m,
        "optimizer: default\nlearning_rate: 1.0\ninitializer: constant\nvalue: 0.0\n",
    );

    // three pushes of key 7 pre-reduce client-side into one entry, count 3
    push(&service, &route, m, &[7, 7, 7], &[1.0, 1.0, 1.0]);
    service.store().unwrap();
    assert_eq!(pull(&service, &route, m, 1, &[7]), vec![-3.0]);
}

#[test]
fn reordered_disjoint_pushes_are_deterministic() {
    let run = || {
        let service = service(2);
        let route = ClusterRoute::single_node(0, 2);
        let m = meta(1, 100);
        init_variable(
            &service,
            2,
            m,
            "optimizer: default\nlearning_rate: 1.0\ninitializer: constant\nvalue: 0.0\n",
        );

        std::thread::scope(|scope| {
            let (s1, r1, s2, r2) = (&service, &route, &service, &route);
            scope.spawn(move || push(s1, r1, m, &[1, 2], &[1.0, 2.0]));
            scope.spawn(move || push(s2, r2, m, &[3, 4], &[3.0, 4.0]));
        });
        service.store().unwrap();
        pull(&service, &route, m, 1, &[1, 2, 3, 4])
    };
    assert_eq!(run(), vec![-1.0, -2.0, -3.0, -4.0]);
    assert_eq!(run(), run());
}

#[test]
fn stale_meta_is_rejected_and_table_untouched() {
    let service = service(1);
    let route = ClusterRoute::single_node(0, 1);
    let m = meta(1, 10);
    init_variable(
        &service,
        1,
        m,
        "optimizer: default\nlearning_rate: 1.0\ninitializer: constant\nvalue: 100.0\n",
    );
    push(&service, &route, m, &[3], &[1.0]);
    service.store().unwrap();

    // same variable id, wrong embedding_dim
    let stale = meta(2, 10);
    let gradients = grads_f32(&[1.0, 1.0]);
    let blocks = [EmbeddingPushItems {
        variable_id: 0,
        meta: stale,
        indices: &[3],
        gradients: &gradients,
    }];
    for (_, request) in generate_push_requests(&blocks, &route).unwrap() {
        assert!(matches!(
            service.push(request),
            Err(PsError::InvalidConfig(_))
        ));
    }

    // nothing changed server-side
    service.store().unwrap();
    assert_eq!(pull(&service, &route, m, 2, &[3]), vec![99.0]);
    let shard = service.storage().shard(0).unwrap();
    assert_eq!(shard.read().variable(0).unwrap().num_indices(), 1);
}

#[tokio::test]
async fn pulls_ahead_of_the_batch_wait_for_the_store() {
    let service = service(1);
    let route = ClusterRoute::single_node(0, 1);
    let m = meta(1, 10);
    init_variable(
        &service,
        1,
        m,
        "optimizer: default\nlearning_rate: 1.0\ninitializer: constant\nvalue: 100.0\n",
    );
    push(&service, &route, m, &[3], &[1.0]);

    // a pull tagged with the *next* batch must not see pre-update values
    let picker = RoundRobinPicker::default();
    let blocks = [EmbeddingPullItems {
        variable_id: 0,
        meta: m,
        indices: &[3],
    }];
    let (mut session, mut requests) = PullSession::generate(&blocks, 1, &route, &picker).unwrap();
    let reply = service.pull(requests.remove(0).1);
    let receiver = match reply {
        PullReply::Deferred(receiver) => receiver,
        PullReply::Ready(_) => panic!("pull ahead of the batch must defer"),
    };

    service.store().unwrap();
    let response = receiver.await.unwrap().unwrap();
    session.absorb(response);
    let mut out = vec![0u8; 4];
    session.fill(0, &[3], &mut out).unwrap();
    assert_eq!(f32::from_le_bytes([out[0], out[1], out[2], out[3]]), 99.0);
}

#[test]
fn far_ahead_pulls_are_rejected() {
    let service = service(1);
    let route = ClusterRoute::single_node(0, 1);
    let m = meta(1, 10);
    init_variable(&service, 1, m, "");

    let picker = RoundRobinPicker::default();
    let blocks = [EmbeddingPullItems {
        variable_id: 0,
        meta: m,
        indices: &[1],
    }];
    let (_, mut requests) = PullSession::generate(&blocks, 2000, &route, &picker).unwrap();
    match service.pull(requests.remove(0).1) {
        PullReply::Ready(Err(PsError::InvalidConfig(message))) => {
            assert!(message.contains("request too large version"));
        }
        _ => panic!("far-ahead pull must fail with InvalidConfig"),
    }
}

#[test]
fn empty_push_and_pull_are_noops() {
    let service = service(2);
    let route = ClusterRoute::single_node(0, 2);
    let m = meta(1, 10);
    init_variable(&service, 2, m, "");

    push(&service, &route, m, &[], &[]);
    service.store().unwrap();
    assert_eq!(pull(&service, &route, m, 1, &[]), Vec::<f32>::new());
}
