//! Topology description files
//!
//! ```json
//! {
//!   "nodes": [
//!     { "id": "s1", "ports": ["1", "2", "3"] },
//!     { "id": "h1", "type": "host", "image": "alpine", "ports": ["eth0"] }
//!   ],
//!   "links": [
//!     { "a": { "node": "s1", "port": "1" }, "b": { "node": "h1", "port": "eth0" } }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tracing::{info, warn};

use crate::link::is_valid_ifname;
use crate::orchestrator::{NodeHandle, Orchestrator};
use crate::types::{Endpoint, LinkSpec, NodeKind, NodeSpec};
use crate::TopologyError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyDescription {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

impl TopologyDescription {
    pub fn from_json(raw: &str) -> Result<Self, TopologyError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TopologyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Static checks that need no containers
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut ports: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for node in &self.nodes {
            NodeKind::resolve(node.kind.as_deref())?;
            if ports.contains_key(node.identifier.as_str()) {
                return Err(TopologyError::DuplicateNode(node.identifier.clone()));
            }
            let declared = ports.entry(node.identifier.as_str()).or_default();
            for port in &node.ports {
                if !is_valid_ifname(&port.identifier) {
                    return Err(TopologyError::InvalidPortName {
                        node: node.identifier.clone(),
                        port: port.identifier.clone(),
                    });
                }
                if !declared.insert(port.identifier.as_str()) {
                    return Err(TopologyError::DuplicatePort {
                        node: node.identifier.clone(),
                        port: port.identifier.clone(),
                    });
                }
            }
        }

        let mut used: HashSet<&Endpoint> = HashSet::new();
        for link in &self.links {
            if link.a == link.b {
                return Err(TopologyError::InvalidWireRequest(format!(
                    "{} cannot be linked to itself",
                    link.a
                )));
            }
            for end in [&link.a, &link.b] {
                let declared = ports
                    .get(end.node.as_str())
                    .ok_or_else(|| TopologyError::UnknownNode(end.node.clone()))?;
                if !declared.contains(end.port.as_str()) {
                    return Err(TopologyError::UnknownPort {
                        node: end.node.clone(),
                        port: end.port.clone(),
                    });
                }
                if !used.insert(end) {
                    return Err(TopologyError::InvalidWireRequest(format!(
                        "{} is used by more than one link",
                        end
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Build a whole topology: nodes, then ports, then links, then finalization.
///
/// If any step fails, everything created so far is destroyed before the
/// error is returned.
pub async fn build_topology(
    orchestrator: &mut Orchestrator,
    description: &TopologyDescription,
) -> Result<Vec<NodeHandle>, TopologyError> {
    description.validate()?;
    orchestrator.pre_build()?;
    match build_phases(orchestrator, description).await {
        Ok(handles) => Ok(handles),
        Err(e) => {
            warn!("Topology build failed, tearing down: {}", e);
            if let Err(teardown) = orchestrator.destroy().await {
                warn!("Teardown after failed build was incomplete: {}", teardown);
            }
            Err(e)
        }
    }
}

async fn build_phases(
    orchestrator: &mut Orchestrator,
    description: &TopologyDescription,
) -> Result<Vec<NodeHandle>, TopologyError> {
    let mut handles = Vec::with_capacity(description.nodes.len());
    for node in &description.nodes {
        handles.push(orchestrator.add_node(node).await?);
    }
    for (handle, node) in handles.iter().zip(&description.nodes) {
        for port in &node.ports {
            orchestrator.add_biport(handle, port)?;
        }
    }
    for link in &description.links {
        orchestrator.add_bilink(&link.a, &link.b).await?;
    }
    let standalone = orchestrator.post_build().await?;

    info!(
        "Built topology: {} node(s), {} link(s), {} standalone port(s)",
        handles.len(),
        description.links.len(),
        standalone
    );
    Ok(handles)
}
