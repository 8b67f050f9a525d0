//! Per-node port bookkeeping
//!
//! Every declared port starts `Unbound` and ends in exactly one terminal
//! state: `Linked` once a veth end carries its name, or `Standalone` once
//! finalization gives it a tap interface.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::nettool::NetTooling;
use crate::types::PortStatus;
use crate::TopologyError;

#[derive(Debug, Clone, Default)]
pub struct PortTracker {
    node: String,
    ports: BTreeMap<String, PortStatus>,
}

impl PortTracker {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ports: BTreeMap::new(),
        }
    }

    /// Declare a port; it starts out `Unbound`
    pub fn register(&mut self, port: &str) -> Result<(), TopologyError> {
        if self.ports.contains_key(port) {
            return Err(TopologyError::DuplicatePort {
                node: self.node.clone(),
                port: port.to_string(),
            });
        }
        self.ports.insert(port.to_string(), PortStatus::Unbound);
        debug!("Registered port {}.{}", self.node, port);
        Ok(())
    }

    pub fn status(&self, port: &str) -> Option<PortStatus> {
        self.ports.get(port).copied()
    }

    pub fn mark_linked(&mut self, port: &str) -> Result<(), TopologyError> {
        self.transition(port, PortStatus::Linked)
    }

    pub fn mark_standalone(&mut self, port: &str) -> Result<(), TopologyError> {
        self.transition(port, PortStatus::Standalone)
    }

    fn transition(&mut self, port: &str, to: PortStatus) -> Result<(), TopologyError> {
        let status = self
            .ports
            .get_mut(port)
            .ok_or_else(|| TopologyError::UnknownPort {
                node: self.node.clone(),
                port: port.to_string(),
            })?;
        if *status != PortStatus::Unbound {
            return Err(TopologyError::InvalidTransition {
                node: self.node.clone(),
                port: port.to_string(),
                from: *status,
                to,
            });
        }
        *status = to;
        Ok(())
    }

    /// Ports still waiting for an interface
    pub fn unbound(&self) -> Vec<String> {
        self.ports
            .iter()
            .filter(|(_, status)| **status == PortStatus::Unbound)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, PortStatus)> {
        self.ports.iter().map(|(name, status)| (name.as_str(), *status))
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Give every still-unbound port a tap interface inside `netns`.
    ///
    /// Must only run after all links of the topology are wired. Returns the
    /// ports that were finalized. A failure leaves that port and any later
    /// ones `Unbound`.
    pub async fn finalize_unbound(
        &mut self,
        net: &dyn NetTooling,
        netns: &str,
    ) -> Result<Vec<String>, TopologyError> {
        let pending = self.unbound();
        for port in &pending {
            net.add_tap_in_netns(netns, port)
                .await
                .map_err(|e| TopologyError::Finalize {
                    node: self.node.clone(),
                    port: port.clone(),
                    reason: e.to_string(),
                })?;
            self.mark_standalone(port)?;
        }
        if !pending.is_empty() {
            info!(
                "Created {} standalone interface(s) on {}: {}",
                pending.len(),
                self.node,
                pending.join(", ")
            );
        }
        Ok(pending)
    }
}
