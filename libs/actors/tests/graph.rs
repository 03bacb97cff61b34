//! End-to-end graph runs on worker threads over the loopback transport

use bytes::BytesMut;
use config::{GraphPlan, RuntimeConfig};
use dataflow_actors::test_utils::TaskBuilder;
use dataflow_actors::{
    ActorError, ActorSystem, Collected, ControllerPolicy, GraphFailure, Kernel, KernelError,
    KernelRegistry, RegisterHandle,
};
use network::{LoopbackConfig, LoopbackTransport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use types::{ActorId, DescriptorError, PieceId};

const WAIT: Duration = Duration::from_secs(20);

fn runtime_config(workers: usize) -> RuntimeConfig {
    RuntimeConfig {
        worker_threads: workers,
        ..RuntimeConfig::default()
    }
}

/// counter on node 0 -> copy on node 1 -> collect on node 1
fn two_node_plan(pieces: u64, depth: usize) -> GraphPlan {
    GraphPlan::new(vec![
        TaskBuilder::source(1, pieces)
            .output(0, &[2], 8)
            .depth(depth)
            .build(),
        TaskBuilder::network_copy(2, 1)
            .input(0, 1, 0)
            .output(1, &[3], 8)
            .depth(depth)
            .build(),
        TaskBuilder::compute(3, "collect")
            .node(1)
            .input(0, 2, 1)
            .build(),
    ])
}

fn values(collected: &Collected) -> Vec<u64> {
    collected
        .snapshot()
        .into_iter()
        .map(|(_, payloads)| u64::from_le_bytes(payloads[0][..8].try_into().unwrap()))
        .collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("dataflow_actors=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cross_node_pipeline_delivers_in_order() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::new(
        tokio::runtime::Handle::current(),
        LoopbackConfig::jittery(7),
    ));
    let collected = Collected::default();

    let handle = ActorSystem::new(runtime_config(3), transport.clone())
        .with_kernels(KernelRegistry::with_builtins(collected.clone()))
        .launch(&two_node_plan(64, 4))
        .unwrap();
    let report = handle.wait_timeout(WAIT).await.unwrap();

    assert_eq!(values(&collected), (0..64).collect::<Vec<_>>());
    assert_eq!(
        collected.pieces(),
        (0..64).map(PieceId).collect::<Vec<_>>()
    );
    assert_eq!(report.transport.transfers_completed, 64);
    assert_eq!(report.transfer_failures, 0);
    assert!(report.cross_node_sends > 0);
    assert_eq!(transport.registered_regions(), 0);

    let copy = &report.actors[&ActorId(2)];
    assert_eq!(copy.transfers_completed, 64);
    assert_eq!(copy.registers_produced, 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resubmit_policy_recovers_from_faults() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::new(
        tokio::runtime::Handle::current(),
        LoopbackConfig {
            failure_rate: 0.3,
            seed: 11,
            ..LoopbackConfig::jittery(11)
        },
    ));
    let collected = Collected::default();

    let report = ActorSystem::new(runtime_config(2), transport.clone())
        .with_kernels(KernelRegistry::with_builtins(collected.clone()))
        .with_policy(ControllerPolicy::ResubmitTransfers { max_attempts: 32 })
        .launch(&two_node_plan(40, 3))
        .unwrap()
        .wait_timeout(WAIT)
        .await
        .unwrap();

    assert_eq!(values(&collected), (0..40).collect::<Vec<_>>());
    assert!(report.transfer_failures > 0);
    assert_eq!(report.resubmitted, report.transfer_failures);
    assert_eq!(transport.registered_regions(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abort_policy_fails_on_transfer_error() {
    let transport = Arc::new(LoopbackTransport::new(
        tokio::runtime::Handle::current(),
        LoopbackConfig {
            failure_rate: 1.0,
            ..LoopbackConfig::default()
        },
    ));

    let failure = ActorSystem::new(runtime_config(2), transport.clone())
        .with_kernels(KernelRegistry::with_builtins(Collected::default()))
        .launch(&two_node_plan(8, 2))
        .unwrap()
        .wait_timeout(WAIT)
        .await
        .unwrap_err();

    match failure {
        GraphFailure::Actor(ActorError::Transfer { actor, source, .. }) => {
            assert_eq!(actor, ActorId(2));
            assert!(matches!(source, TransportError::Injected { .. }));
        }
        other => panic!("unexpected failure: {other}"),
    }
    assert_eq!(transport.registered_regions(), 0);
}

/// Sink that rejects one piece
struct FailAt(PieceId);

impl Kernel for FailAt {
    fn execute(
        &mut self,
        piece: PieceId,
        _inputs: &[RegisterHandle],
        _outputs: &mut [BytesMut],
    ) -> Result<(), KernelError> {
        if piece == self.0 {
            return Err(KernelError::new(format!("cannot process {piece}")));
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_kernel_failure_aborts_graph() {
    let transport = Arc::new(LoopbackTransport::new(
        tokio::runtime::Handle::current(),
        LoopbackConfig::default(),
    ));
    let mut kernels = KernelRegistry::with_builtins(Collected::default());
    kernels.register("explode", |_| Ok(Box::new(FailAt(PieceId(3)))));

    let plan = GraphPlan::new(vec![
        TaskBuilder::source(1, 10).output(0, &[2], 8).build(),
        TaskBuilder::compute(2, "explode").input(0, 1, 0).build(),
    ]);
    let failure = ActorSystem::new(runtime_config(2), transport)
        .with_kernels(kernels)
        .launch(&plan)
        .unwrap()
        .wait_timeout(WAIT)
        .await
        .unwrap_err();

    assert!(matches!(
        failure,
        GraphFailure::Actor(ActorError::Kernel { actor, .. }) if actor == ActorId(2)
    ));
}

#[tokio::test]
async fn test_zero_depth_rejected_at_launch() {
    let transport = Arc::new(LoopbackTransport::new(
        tokio::runtime::Handle::current(),
        LoopbackConfig::default(),
    ));
    let err = ActorSystem::new(runtime_config(1), transport)
        .with_kernels(KernelRegistry::with_builtins(Collected::default()))
        .launch(&two_node_plan(4, 0))
        .err()
        .unwrap();

    assert!(matches!(
        err,
        ActorError::Descriptor(DescriptorError::ZeroPipelineDepth { .. })
    ));
}

#[tokio::test]
async fn test_cross_node_edge_without_copy_rejected_at_launch() {
    let transport = Arc::new(LoopbackTransport::new(
        tokio::runtime::Handle::current(),
        LoopbackConfig::default(),
    ));
    let plan = GraphPlan::new(vec![
        TaskBuilder::source(1, 4).output(0, &[2], 8).build(),
        TaskBuilder::compute(2, "collect").node(1).input(0, 1, 0).build(),
    ]);
    let err = ActorSystem::new(runtime_config(2), transport)
        .with_kernels(KernelRegistry::with_builtins(Collected::default()))
        .launch(&plan)
        .err()
        .unwrap();

    assert!(matches!(
        err,
        ActorError::Descriptor(DescriptorError::EdgeMismatch { actor, .. }) if actor == ActorId(2)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_sources_joined_by_concat() {
    let transport = Arc::new(LoopbackTransport::new(
        tokio::runtime::Handle::current(),
        LoopbackConfig::default(),
    ));
    let collected = Collected::default();
    let plan = GraphPlan::new(vec![
        TaskBuilder::source(1, 16).output(0, &[3], 8).build(),
        TaskBuilder::source(2, 16).output(0, &[3], 8).depth(1).build(),
        TaskBuilder::compute(3, "concat")
            .input(0, 1, 0)
            .input(1, 2, 0)
            .output(2, &[4], 16)
            .build(),
        TaskBuilder::compute(4, "collect").input(0, 3, 2).build(),
    ]);

    let report = ActorSystem::new(runtime_config(4), transport)
        .with_kernels(KernelRegistry::with_builtins(collected.clone()))
        .launch(&plan)
        .unwrap()
        .wait_timeout(WAIT)
        .await
        .unwrap();

    let snapshot = collected.snapshot();
    assert_eq!(snapshot.len(), 16);
    for (i, (piece, payloads)) in snapshot.iter().enumerate() {
        assert_eq!(*piece, PieceId(i as u64));
        let joined = &payloads[0];
        assert_eq!(joined.len(), 16);
        assert_eq!(&joined[..8], &(i as u64).to_le_bytes());
        assert_eq!(&joined[8..], &(i as u64).to_le_bytes());
    }
    assert_eq!(report.cross_node_sends, 0);
    assert_eq!(report.transport.transfers_started, 0);
}
