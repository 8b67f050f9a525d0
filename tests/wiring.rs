//! Link wiring rules and failure handling

use std::sync::Arc;
use topology_docker::link::{host_ifname, WireEnd};
use topology_docker::testing::{FakeNet, FakeRuntime, NetCall, NetOp};
use topology_docker::{
    Endpoint, LinkWiring, NamespaceExposer, Node, NodeHandle, NodeKind, NodeSpec, Orchestrator,
    PlatformConfig, PortSpec, PortStatus, TopologyError,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("topology_docker=debug")
        .with_test_writer()
        .try_init();
}

async fn two_hosts(
    net: Arc<FakeNet>,
    dir: &tempfile::TempDir,
) -> (Orchestrator, NodeHandle, NodeHandle) {
    init_logging();
    let config = PlatformConfig {
        netns_dir: dir.path().to_path_buf(),
        ..PlatformConfig::default()
    };
    let mut orch = Orchestrator::new(config, Arc::new(FakeRuntime::new()), net);
    let h1 = orch.add_node(&NodeSpec::new("h1").with_kind("host")).await.unwrap();
    let h2 = orch.add_node(&NodeSpec::new("h2").with_kind("host")).await.unwrap();
    for h in [&h1, &h2] {
        orch.add_biport(h, &PortSpec::new("eth0")).unwrap();
        orch.add_biport(h, &PortSpec::new("eth1")).unwrap();
    }
    (orch, h1, h2)
}

fn ep(node: &str, port: &str) -> Endpoint {
    Endpoint::new(node, port)
}

#[tokio::test]
async fn self_link_is_rejected_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    let (mut orch, h1, _) = two_hosts(net.clone(), &dir).await;

    let err = orch.add_bilink(&ep("h1", "eth0"), &ep("h1", "eth0")).await.unwrap_err();
    assert!(matches!(err, TopologyError::InvalidWireRequest(_)));
    assert!(net.calls().is_empty());
    assert_eq!(orch.port_status(&h1, "eth0"), Some(PortStatus::Unbound));
    orch.destroy().await.unwrap();
}

#[tokio::test]
async fn linked_port_cannot_be_wired_again() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    let (mut orch, _, h2) = two_hosts(net.clone(), &dir).await;

    orch.add_bilink(&ep("h1", "eth0"), &ep("h2", "eth0")).await.unwrap();
    let calls = net.calls().len();

    let err = orch.add_bilink(&ep("h1", "eth0"), &ep("h2", "eth1")).await.unwrap_err();
    assert!(matches!(err, TopologyError::InvalidWireRequest(ref m) if m.contains("linked")));
    assert_eq!(net.calls().len(), calls);
    assert_eq!(orch.port_status(&h2, "eth1"), Some(PortStatus::Unbound));
    orch.destroy().await.unwrap();
}

async fn running_node(name: &str, runtime: &Arc<FakeRuntime>, dir: &tempfile::TempDir) -> Node {
    let config = Arc::new(PlatformConfig::default());
    let mut node = Node::create(
        name,
        NodeKind::Host,
        "ubuntu",
        "bash",
        runtime.clone(),
        NamespaceExposer::new(dir.path()),
        config,
    )
    .await
    .unwrap();
    node.start().await.unwrap();
    node.register_port("eth0").unwrap();
    node
}

#[tokio::test]
async fn standalone_and_stopped_ends_are_rejected() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let net = FakeNet::new();
    let mut h1 = running_node("h1", &runtime, &dir).await;
    let mut h2 = running_node("h2", &runtime, &dir).await;

    h1.finalize_unbound(&net).await.unwrap();
    let err = LinkWiring::validate(WireEnd::new(&h1, "eth0"), WireEnd::new(&h2, "eth0"))
        .unwrap_err();
    assert!(matches!(err, TopologyError::InvalidWireRequest(ref m) if m.contains("standalone")));

    assert!(h2.stop().await.is_clean());
    let err = LinkWiring::validate(WireEnd::new(&h2, "eth0"), WireEnd::new(&h1, "eth0"))
        .unwrap_err();
    assert!(matches!(err, TopologyError::InvalidWireRequest(ref m) if m.contains("stopped")));

    // Stopping twice is harmless
    assert!(h2.stop().await.is_clean());
    assert!(h1.stop().await.is_clean());
    assert!(runtime.containers().is_empty());
}

#[tokio::test]
async fn undeclared_port_and_unknown_node() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    let (mut orch, _, _) = two_hosts(net.clone(), &dir).await;

    let err = orch.add_bilink(&ep("h1", "eth9"), &ep("h2", "eth0")).await.unwrap_err();
    assert!(matches!(err, TopologyError::InvalidWireRequest(ref m) if m.contains("never declared")));

    let err = orch.add_bilink(&ep("h1", "eth0"), &ep("h9", "eth0")).await.unwrap_err();
    assert!(matches!(err, TopologyError::UnknownNode(ref n) if n == "h9"));
    assert!(net.calls().is_empty());
    orch.destroy().await.unwrap();
}

#[tokio::test]
async fn two_ports_of_one_node_can_be_looped() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    let (mut orch, h1, _) = two_hosts(net.clone(), &dir).await;

    orch.add_bilink(&ep("h1", "eth0"), &ep("h1", "eth1")).await.unwrap();
    assert_eq!(net.peer_of("h1", "eth0"), Some(("h1".into(), "eth1".into())));
    assert_eq!(orch.port_status(&h1, "eth1"), Some(PortStatus::Linked));
    orch.destroy().await.unwrap();
}

#[tokio::test]
async fn failed_move_deletes_the_stray_pair() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    let (mut orch, h1, h2) = two_hosts(net.clone(), &dir).await;
    net.fail_on(NetOp::MoveToNetns, "h2");

    let err = orch.add_bilink(&ep("h1", "eth0"), &ep("h2", "eth0")).await.unwrap_err();
    match &err {
        TopologyError::Wire { a, b, .. } => {
            assert_eq!(a, &ep("h1", "eth0"));
            assert_eq!(b, &ep("h2", "eth0"));
        }
        other => panic!("expected a wire error, got {:?}", other),
    }

    // The host end was deleted, taking the moved peer in h1 with it
    let stray = host_ifname("h2", "eth0");
    assert!(net.calls().contains(&NetCall::DeleteLink(stray)));
    assert!(net.host_links().is_empty());
    assert!(net.interfaces_in("h1").is_empty());

    // Failed wiring never marks ports
    assert_eq!(orch.port_status(&h1, "eth0"), Some(PortStatus::Unbound));
    assert_eq!(orch.port_status(&h2, "eth0"), Some(PortStatus::Unbound));
    orch.destroy().await.unwrap();
}

#[tokio::test]
async fn failed_bring_up_is_a_wire_error() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNet::new());
    let (mut orch, h1, _) = two_hosts(net.clone(), &dir).await;
    net.fail_on(NetOp::SetUp, "h1");

    let err = orch.add_bilink(&ep("h1", "eth0"), &ep("h2", "eth0")).await.unwrap_err();
    assert!(matches!(err, TopologyError::Wire { .. }));
    assert_eq!(orch.port_status(&h1, "eth0"), Some(PortStatus::Unbound));
    assert!(net.host_links().is_empty());
    // B is never touched once A fails
    assert!(!net
        .calls()
        .iter()
        .any(|c| matches!(c, NetCall::MoveToNetns { netns, .. } if netns == "h2")));
    orch.destroy().await.unwrap();
}

#[tokio::test]
async fn same_port_names_across_topologies_do_not_collide() {
    // Two orchestrators sharing one host namespace
    init_logging();
    let net = Arc::new(FakeNet::new());
    let dir = tempfile::tempdir().unwrap();
    let mut orchestrators = Vec::new();
    for prefix in ["a", "b"] {
        let config = PlatformConfig {
            netns_dir: dir.path().to_path_buf(),
            ..PlatformConfig::default()
        };
        let mut orch = Orchestrator::new(config, Arc::new(FakeRuntime::new()), net.clone());
        let x = format!("{}-h1", prefix);
        let y = format!("{}-h2", prefix);
        for name in [&x, &y] {
            let h = orch
                .add_node(&NodeSpec::new(name.as_str()).with_kind("host"))
                .await
                .unwrap();
            orch.add_biport(&h, &PortSpec::new("eth0")).unwrap();
        }
        orch.add_bilink(&ep(&x, "eth0"), &ep(&y, "eth0")).await.unwrap();
        orchestrators.push(orch);
    }

    let veths: Vec<_> = net
        .calls()
        .into_iter()
        .filter(|c| matches!(c, NetCall::AddVeth { .. }))
        .collect();
    assert_eq!(veths.len(), 2);
    assert_ne!(veths[0], veths[1]);
    for mut orch in orchestrators {
        orch.destroy().await.unwrap();
    }
}
