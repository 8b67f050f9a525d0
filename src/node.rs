//! Node lifecycle: one container, its namespace entry, ports and shells

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PlatformConfig;
use crate::link::is_valid_ifname;
use crate::namespace::NamespaceExposer;
use crate::nettool::NetTooling;
use crate::ports::PortTracker;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::session::{Session, SessionError};
use crate::types::{NodeKind, NodeState, PortStatus, ShellKind};
use crate::TopologyError;

/// Sub-step of node teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    StopContainer,
    WaitContainer,
    RemoveContainer,
    RemoveNamespace,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownStep::StopContainer => write!(f, "stop container"),
            TeardownStep::WaitContainer => write!(f, "wait for container"),
            TeardownStep::RemoveContainer => write!(f, "remove container"),
            TeardownStep::RemoveNamespace => write!(f, "remove namespace entry"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub resource: String,
    pub step: TeardownStep,
    pub error: String,
}

/// Outcome of best-effort teardown: every step was attempted, these failed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn record(&mut self, resource: &str, step: TeardownStep, error: impl fmt::Display) {
        warn!("Teardown of {} failed at '{}': {}", resource, step, error);
        self.failures.push(TeardownFailure {
            resource: resource.to_string(),
            step,
            error: error.to_string(),
        });
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.failures.extend(other.failures);
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} step(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(
                f,
                "{}{} {}: {}",
                sep, failure.resource, failure.step, failure.error
            )?;
        }
        Ok(())
    }
}

/// A topology node backed by one container
pub struct Node {
    name: String,
    kind: NodeKind,
    image: String,
    container_id: String,
    state: NodeState,
    ports: PortTracker,
    sessions: BTreeMap<ShellKind, Session>,
    netns_entry: Option<PathBuf>,
    runtime: Arc<dyn ContainerRuntime>,
    exposer: NamespaceExposer,
    config: Arc<PlatformConfig>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("image", &self.image)
            .field("container_id", &self.container_id)
            .field("state", &self.state)
            .field("ports", &self.ports)
            .finish()
    }
}

impl Node {
    /// Create the container. Nothing runs until [`Node::start`].
    pub async fn create(
        name: &str,
        kind: NodeKind,
        image: &str,
        command: &str,
        runtime: Arc<dyn ContainerRuntime>,
        exposer: NamespaceExposer,
        config: Arc<PlatformConfig>,
    ) -> Result<Self, TopologyError> {
        let spec = ContainerSpec::new(name, image, command, &config);
        let container_id =
            runtime
                .create_container(&spec)
                .await
                .map_err(|e| TopologyError::Provision {
                    node: name.to_string(),
                    reason: e.to_string(),
                })?;

        debug!("Created {} node {} from {}", kind, name, image);
        Ok(Self {
            name: name.to_string(),
            kind,
            image: image.to_string(),
            container_id,
            state: NodeState::Created,
            ports: PortTracker::new(name),
            sessions: BTreeMap::new(),
            netns_entry: None,
            runtime,
            exposer,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Name of the node's entry in the host namespace registry
    pub fn netns(&self) -> &str {
        &self.name
    }

    pub fn netns_entry(&self) -> Option<&PathBuf> {
        self.netns_entry.as_ref()
    }

    pub fn ports(&self) -> &PortTracker {
        &self.ports
    }

    pub fn port_status(&self, port: &str) -> Option<PortStatus> {
        self.ports.status(port)
    }

    /// Shells with an open session
    pub fn shells(&self) -> Vec<ShellKind> {
        self.sessions.keys().copied().collect()
    }

    fn require_running(&self) -> Result<(), TopologyError> {
        if self.state == NodeState::Running {
            Ok(())
        } else {
            Err(TopologyError::NotRunning {
                node: self.name.clone(),
                state: self.state,
            })
        }
    }

    /// Start the container and publish its namespace.
    ///
    /// On failure the container may still exist; call [`Node::stop`].
    pub async fn start(&mut self) -> Result<(), TopologyError> {
        let failed = |reason: String| TopologyError::Start {
            node: self.name.clone(),
            reason,
        };
        if self.state != NodeState::Created {
            return Err(failed(format!("node is {}", self.state)));
        }

        self.runtime
            .start(&self.container_id)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let entry = self
            .exposer
            .expose(self.runtime.as_ref(), &self.container_id, &self.name)
            .await
            .map_err(|e| failed(e.to_string()))?;

        self.netns_entry = Some(entry);
        self.state = NodeState::Running;
        info!("Started {} node {}", self.kind, self.name);
        Ok(())
    }

    pub fn register_port(&mut self, port: &str) -> Result<(), TopologyError> {
        self.require_running()?;
        if !is_valid_ifname(port) {
            return Err(TopologyError::InvalidPortName {
                node: self.name.clone(),
                port: port.to_string(),
            });
        }
        self.ports.register(port)
    }

    pub fn mark_linked(&mut self, port: &str) -> Result<(), TopologyError> {
        self.ports.mark_linked(port)
    }

    /// Give every still-unbound port a standalone interface
    pub async fn finalize_unbound(
        &mut self,
        net: &dyn NetTooling,
    ) -> Result<Vec<String>, TopologyError> {
        self.require_running()?;
        let netns = self.name.clone();
        self.ports.finalize_unbound(net, &netns).await
    }

    /// Session for `kind`, attaching on first use
    pub async fn open_session(&mut self, kind: ShellKind) -> Result<&mut Session, TopologyError> {
        self.require_running()?;
        if !self.sessions.contains_key(&kind) {
            let profile = self.config.shell(kind)?;
            let session = self
                .runtime
                .attach(&self.name, profile)
                .await
                .map_err(|e| TopologyError::Session {
                    node: self.name.clone(),
                    shell: kind,
                    reason: e.to_string(),
                })?;
            debug!("Opened {} session on {}", kind, self.name);
            self.sessions.insert(kind, session);
        }
        self.sessions
            .get_mut(&kind)
            .ok_or_else(|| TopologyError::Session {
                node: self.name.clone(),
                shell: kind,
                reason: "session vanished".to_string(),
            })
    }

    /// Run one command line in a shell and return its output
    pub async fn send_command(
        &mut self,
        kind: ShellKind,
        line: &str,
    ) -> Result<String, TopologyError> {
        let session = self.open_session(kind).await?;
        let result = session.send_command(line).await;
        if result.is_err() {
            // Late output would be read as the next command's; re-attach instead
            if let Some(session) = self.sessions.remove(&kind) {
                session.close().await;
            }
        }
        result.map_err(|e| match e {
            SessionError::Timeout { after, partial } => TopologyError::SessionTimeout {
                node: self.name.clone(),
                shell: kind,
                after,
                partial,
            },
            e => TopologyError::Session {
                node: self.name.clone(),
                shell: kind,
                reason: e.to_string(),
            },
        })
    }

    /// Tear the node down: stop, wait, remove container, remove namespace entry.
    ///
    /// Every step is attempted regardless of earlier failures. Resources that
    /// are already gone count as removed, so stopping twice is harmless.
    pub async fn stop(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.state == NodeState::Stopped {
            return report;
        }

        for (_, session) in std::mem::take(&mut self.sessions) {
            session.close().await;
        }

        let id = self.container_id.clone();
        if let Err(e) = ignore_missing(self.runtime.stop(&id).await) {
            report.record(&self.name, TeardownStep::StopContainer, e);
        }
        if let Err(e) = ignore_missing(self.runtime.wait(&id).await) {
            report.record(&self.name, TeardownStep::WaitContainer, e);
        }
        if let Err(e) = ignore_missing(self.runtime.remove(&id).await) {
            report.record(&self.name, TeardownStep::RemoveContainer, e);
        }
        if let Err(e) = self.exposer.unexpose(&self.name).await {
            report.record(&self.name, TeardownStep::RemoveNamespace, e);
        }

        self.netns_entry = None;
        self.state = NodeState::Stopped;
        if report.is_clean() {
            info!("Destroyed node {}", self.name);
        }
        report
    }
}

fn ignore_missing(result: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
    match result {
        Err(RuntimeError::NotFound(_)) => Ok(()),
        other => other,
    }
}
