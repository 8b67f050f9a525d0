//! Topology orchestrator
//!
//! Maps topology nodes, ports and links onto containers, veth pairs and tap
//! interfaces, enforcing the build order:
//!
//! `pre_build` → `add_node`* → `add_biport`* → `add_bilink`* → `post_build` → `destroy`
//!
//! Node, port and link calls may interleave freely during the build, but all
//! of them happen before the single `post_build` barrier.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PlatformConfig;
use crate::link::{LinkWiring, WireEnd};
use crate::namespace::NamespaceExposer;
use crate::nettool::{IpCommand, NetTooling};
use crate::node::{Node, TeardownReport};
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::types::{Endpoint, LinkSpec, NodeKind, NodeSpec, PortSpec, PortStatus, ShellKind};
use crate::TopologyError;

/// Build phase of an [`Orchestrator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Building,
    Built,
    Destroyed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Building => write!(f, "building"),
            Phase::Built => write!(f, "built"),
            Phase::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Opaque reference to a node added to an orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(String);

impl NodeHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeHandle {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Owns every node of one topology and drives its build and teardown
pub struct Orchestrator {
    config: Arc<PlatformConfig>,
    runtime: Arc<dyn ContainerRuntime>,
    net: Arc<dyn NetTooling>,
    wiring: LinkWiring,
    exposer: NamespaceExposer,
    nodes: BTreeMap<String, Node>,
    links: Vec<LinkSpec>,
    phase: Phase,
}

impl Orchestrator {
    pub fn new(
        config: PlatformConfig,
        runtime: Arc<dyn ContainerRuntime>,
        net: Arc<dyn NetTooling>,
    ) -> Self {
        let exposer = NamespaceExposer::new(&config.netns_dir);
        Self {
            config: Arc::new(config),
            runtime,
            wiring: LinkWiring::new(net.clone()),
            net,
            exposer,
            nodes: BTreeMap::new(),
            links: Vec::new(),
            phase: Phase::Idle,
        }
    }

    /// Orchestrator backed by the local Docker daemon and iproute2
    pub fn docker(config: PlatformConfig) -> Result<Self, TopologyError> {
        config.validate()?;
        let runtime = Arc::new(DockerCli::new(&config));
        let net = Arc::new(IpCommand::new(&config));
        Ok(Self::new(config, runtime, net))
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Enter the build phase. Build calls made without it enter it implicitly.
    pub fn pre_build(&mut self) -> Result<(), TopologyError> {
        match self.phase {
            Phase::Idle => {
                debug!("Entering build phase");
                self.phase = Phase::Building;
                Ok(())
            }
            phase => Err(TopologyError::PhaseViolation {
                operation: "pre_build",
                phase,
            }),
        }
    }

    fn require_building(&mut self, operation: &'static str) -> Result<(), TopologyError> {
        match self.phase {
            Phase::Idle => {
                self.phase = Phase::Building;
                Ok(())
            }
            Phase::Building => Ok(()),
            phase => Err(TopologyError::PhaseViolation { operation, phase }),
        }
    }

    /// Create and start the container for one topology node.
    ///
    /// Switch nodes get a routing-control shell besides the base shell. A
    /// shell that fails to open is retried on first use.
    pub async fn add_node(&mut self, spec: &NodeSpec) -> Result<NodeHandle, TopologyError> {
        self.require_building("add_node")?;

        let kind = NodeKind::resolve(spec.kind.as_deref())?;
        let name = spec.identifier.as_str();
        if !is_valid_node_name(name) {
            return Err(TopologyError::Provision {
                node: name.to_string(),
                reason: "identifier must be 1-64 characters of [A-Za-z0-9_.-]".to_string(),
            });
        }
        if self.nodes.contains_key(name) {
            return Err(TopologyError::DuplicateNode(name.to_string()));
        }

        let image = spec.image.as_deref().unwrap_or(&self.config.default_image);
        let command = spec
            .command
            .as_deref()
            .unwrap_or(&self.config.default_command);

        let mut node = Node::create(
            name,
            kind,
            image,
            command,
            self.runtime.clone(),
            self.exposer.clone(),
            self.config.clone(),
        )
        .await?;

        if let Err(e) = node.start().await {
            let report = node.stop().await;
            if !report.is_clean() {
                warn!("Cleanup after failed start of {} left debris: {}", name, report);
            }
            return Err(e);
        }

        for shell in kind.shells() {
            if let Err(e) = node.open_session(*shell).await {
                warn!("Could not open {} session on {}: {}", shell, name, e);
            }
        }

        self.nodes.insert(name.to_string(), node);
        Ok(NodeHandle::new(name))
    }

    /// Declare a port on a node; it stays unbound until linked or finalized
    pub fn add_biport(&mut self, node: &NodeHandle, port: &PortSpec) -> Result<(), TopologyError> {
        self.require_building("add_biport")?;
        self.node_mut(node)?.register_port(&port.identifier)
    }

    /// Wire two declared ports together with a veth pair
    pub async fn add_bilink(&mut self, a: &Endpoint, b: &Endpoint) -> Result<(), TopologyError> {
        self.require_building("add_bilink")?;

        let node_a = self
            .nodes
            .get(&a.node)
            .ok_or_else(|| TopologyError::UnknownNode(a.node.clone()))?;
        let node_b = self
            .nodes
            .get(&b.node)
            .ok_or_else(|| TopologyError::UnknownNode(b.node.clone()))?;
        self.wiring
            .wire(WireEnd::new(node_a, &a.port), WireEnd::new(node_b, &b.port))
            .await?;

        self.node_mut(&NodeHandle::new(a.node.as_str()))?
            .mark_linked(&a.port)?;
        self.node_mut(&NodeHandle::new(b.node.as_str()))?
            .mark_linked(&b.port)?;
        self.links.push(LinkSpec::new(a.clone(), b.clone()));
        Ok(())
    }

    /// Give every unlinked port a standalone interface. Returns how many were created.
    ///
    /// This is the barrier between wiring and use: once called, no further
    /// nodes, ports or links are accepted, even if finalization fails.
    /// Every node is finalized; a single failure is returned as is, several
    /// as [`TopologyError::PostBuild`].
    pub async fn post_build(&mut self) -> Result<usize, TopologyError> {
        match self.phase {
            Phase::Idle | Phase::Building => self.phase = Phase::Built,
            phase => {
                return Err(TopologyError::PhaseViolation {
                    operation: "post_build",
                    phase,
                })
            }
        }

        let mut created = 0;
        let mut failures = Vec::new();
        for node in self.nodes.values_mut() {
            match node.finalize_unbound(self.net.as_ref()).await {
                Ok(ports) => created += ports.len(),
                Err(e) => {
                    warn!("Finalizing {} failed: {}", node.name(), e);
                    failures.push(e);
                }
            }
        }
        match failures.len() {
            0 => {}
            1 => return Err(failures.remove(0)),
            _ => return Err(TopologyError::PostBuild(failures)),
        }
        info!(
            "Topology built: {} node(s), {} link(s), {} standalone port(s)",
            self.nodes.len(),
            self.links.len(),
            created
        );
        Ok(created)
    }

    /// Stop and remove every node.
    ///
    /// All nodes are attempted; failures are collected into one
    /// [`TopologyError::Teardown`]. Calling this again is a no-op.
    pub async fn destroy(&mut self) -> Result<(), TopologyError> {
        if self.phase == Phase::Destroyed {
            debug!("Topology already destroyed");
            return Ok(());
        }
        self.phase = Phase::Destroyed;

        let mut report = TeardownReport::default();
        let count = self.nodes.len();
        for (_, mut node) in std::mem::take(&mut self.nodes) {
            report.merge(node.stop().await);
        }
        self.links.clear();

        if report.is_clean() {
            info!("Destroyed topology of {} node(s)", count);
            Ok(())
        } else {
            Err(TopologyError::Teardown(report))
        }
    }

    pub fn node(&self, handle: &NodeHandle) -> Option<&Node> {
        self.nodes.get(handle.as_str())
    }

    fn node_mut(&mut self, handle: &NodeHandle) -> Result<&mut Node, TopologyError> {
        self.nodes
            .get_mut(handle.as_str())
            .ok_or_else(|| TopologyError::UnknownNode(handle.to_string()))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn port_status(&self, handle: &NodeHandle, port: &str) -> Option<PortStatus> {
        self.node(handle)?.port_status(port)
    }

    /// Links wired so far
    pub fn links(&self) -> &[LinkSpec] {
        &self.links
    }

    /// Run a command line in one of a node's shells
    pub async fn send_command(
        &mut self,
        handle: &NodeHandle,
        shell: ShellKind,
        line: &str,
    ) -> Result<String, TopologyError> {
        self.node_mut(handle)?.send_command(shell, line).await
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if !self.nodes.is_empty() {
            warn!(
                "Orchestrator dropped with {} live node(s); call destroy() to remove them",
                self.nodes.len()
            );
        }
    }
}

/// Container names double as namespace entry names
fn is_valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeNet, FakeRuntime};

    fn orchestrator(dir: &tempfile::TempDir) -> Orchestrator {
        let config = PlatformConfig {
            netns_dir: dir.path().to_path_buf(),
            ..PlatformConfig::default()
        };
        Orchestrator::new(config, Arc::new(FakeRuntime::new()), Arc::new(FakeNet::new()))
    }

    #[test]
    fn node_names() {
        assert!(is_valid_node_name("h1"));
        assert!(is_valid_node_name("sw-1.core_a"));
        assert!(!is_valid_node_name(""));
        assert!(!is_valid_node_name("-h1"));
        assert!(!is_valid_node_name("a/b"));
        assert!(!is_valid_node_name("has space"));
    }

    #[test]
    fn pre_build_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(&dir);
        orch.pre_build().unwrap();
        assert_eq!(orch.phase(), Phase::Building);
        assert!(matches!(
            orch.pre_build(),
            Err(TopologyError::PhaseViolation { operation: "pre_build", .. })
        ));
    }

    #[tokio::test]
    async fn nothing_is_added_after_post_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(&dir);
        orch.pre_build().unwrap();
        let h1 = orch.add_node(&NodeSpec::new("h1").with_kind("host")).await.unwrap();
        orch.add_biport(&h1, &PortSpec::new("eth0")).unwrap();
        assert_eq!(orch.post_build().await.unwrap(), 1);

        assert!(matches!(
            orch.add_node(&NodeSpec::new("h2")).await,
            Err(TopologyError::PhaseViolation { operation: "add_node", phase: Phase::Built })
        ));
        assert!(matches!(
            orch.add_biport(&h1, &PortSpec::new("eth1")),
            Err(TopologyError::PhaseViolation { operation: "add_biport", .. })
        ));
        assert!(matches!(
            orch.add_bilink(&Endpoint::new("h1", "eth0"), &Endpoint::new("h1", "eth1"))
                .await,
            Err(TopologyError::PhaseViolation { operation: "add_bilink", .. })
        ));
        assert!(matches!(
            orch.post_build().await,
            Err(TopologyError::PhaseViolation { operation: "post_build", .. })
        ));

        orch.destroy().await.unwrap();
        assert!(matches!(
            orch.add_node(&NodeSpec::new("h3")).await,
            Err(TopologyError::PhaseViolation { phase: Phase::Destroyed, .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_node_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(&dir);
        orch.add_node(&NodeSpec::new("h1").with_kind("host")).await.unwrap();
        assert!(matches!(
            orch.add_node(&NodeSpec::new("h1").with_kind("host")).await,
            Err(TopologyError::DuplicateNode(ref n)) if n == "h1"
        ));
        orch.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_handles_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(&dir);
        let ghost = NodeHandle::from("ghost");
        assert!(matches!(
            orch.add_biport(&ghost, &PortSpec::new("eth0")),
            Err(TopologyError::UnknownNode(_))
        ));
        assert!(orch.port_status(&ghost, "eth0").is_none());
        assert!(matches!(
            orch.send_command(&ghost, ShellKind::Bash, "true").await,
            Err(TopologyError::UnknownNode(_))
        ));
    }
}
