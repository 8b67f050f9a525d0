//! Point-to-point links between node namespaces
//!
//! A link is built in the host namespace as a veth pair under host-unique
//! temporary names. Each end is then moved into its node's namespace, renamed
//! to the port name and brought up.

use std::sync::Arc;
use tracing::{info, warn};

use crate::nettool::{NetError, NetTooling};
use crate::node::Node;
use crate::types::{Endpoint, NodeState, PortStatus};
use crate::TopologyError;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
pub const MAX_IFNAME_LEN: usize = 15;

/// Host-side name for the veth end destined for `node`'s `port`.
///
/// Derived from the node identifier, so two topologies with distinct node
/// names never collide in the host namespace even if their ports share names.
pub fn host_ifname(node: &str, port: &str) -> String {
    // FNV-1a: stable across runs and toolchains
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in node.bytes().chain([0u8]).chain(port.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("td{:012x}", hash & 0xffff_ffff_ffff)
}

/// Check a port name is usable as a Linux interface name
pub fn is_valid_ifname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_IFNAME_LEN
        && name != "."
        && name != ".."
        && !name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace())
}

/// One side of a wire request
#[derive(Clone, Copy)]
pub struct WireEnd<'a> {
    pub node: &'a Node,
    pub port: &'a str,
}

impl<'a> WireEnd<'a> {
    pub fn new(node: &'a Node, port: &'a str) -> Self {
        Self { node, port }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.node.name(), self.port)
    }
}

#[derive(Clone)]
pub struct LinkWiring {
    net: Arc<dyn NetTooling>,
}

impl LinkWiring {
    pub fn new(net: Arc<dyn NetTooling>) -> Self {
        Self { net }
    }

    /// Reject requests that cannot produce a valid link
    pub fn validate(a: WireEnd<'_>, b: WireEnd<'_>) -> Result<(), TopologyError> {
        if a.node.name() == b.node.name() && a.port == b.port {
            return Err(TopologyError::InvalidWireRequest(format!(
                "{} cannot be linked to itself",
                a.endpoint()
            )));
        }
        for end in [a, b] {
            if end.node.state() != NodeState::Running {
                return Err(TopologyError::InvalidWireRequest(format!(
                    "node {} is {}",
                    end.node.name(),
                    end.node.state()
                )));
            }
            match end.node.ports().status(end.port) {
                Some(PortStatus::Unbound) => {}
                Some(status) => {
                    return Err(TopologyError::InvalidWireRequest(format!(
                        "{} is already {}",
                        end.endpoint(),
                        status
                    )))
                }
                None => {
                    return Err(TopologyError::InvalidWireRequest(format!(
                        "{} was never declared",
                        end.endpoint()
                    )))
                }
            }
            if !is_valid_ifname(end.port) {
                return Err(TopologyError::InvalidWireRequest(format!(
                    "{} is not a valid interface name",
                    end.port
                )));
            }
        }
        Ok(())
    }

    /// Realize a link between two unbound ports.
    ///
    /// Does not update port state; the caller marks both ports linked on
    /// success. Moved ends are not rolled back on failure: they disappear
    /// with their namespace at teardown.
    pub async fn wire(&self, a: WireEnd<'_>, b: WireEnd<'_>) -> Result<(), TopologyError> {
        Self::validate(a, b)?;

        let host_a = host_ifname(a.node.name(), a.port);
        let host_b = host_ifname(b.node.name(), b.port);
        let fail = |reason: String| TopologyError::Wire {
            a: a.endpoint(),
            b: b.endpoint(),
            reason,
        };

        self.net
            .add_veth(&host_a, &host_b)
            .await
            .map_err(|e| fail(format!("creating veth pair: {}", e)))?;

        if let Err(e) = self.net.move_to_netns(&host_a, a.node.netns()).await {
            self.discard(&host_a).await;
            return Err(fail(format!("moving {} into {}: {}", host_a, a.node.netns(), e)));
        }
        // Until B moves, deleting its host end also removes the peer inside A
        if let Err(e) = self.bring_up(a.node.netns(), &host_a, a.port).await {
            self.discard(&host_b).await;
            return Err(fail(format!("bringing up {}: {}", a.endpoint(), e)));
        }

        if let Err(e) = self.net.move_to_netns(&host_b, b.node.netns()).await {
            self.discard(&host_b).await;
            return Err(fail(format!("moving {} into {}: {}", host_b, b.node.netns(), e)));
        }
        self.bring_up(b.node.netns(), &host_b, b.port)
            .await
            .map_err(|e| fail(format!("bringing up {}: {}", b.endpoint(), e)))?;

        info!("Wired {} <-> {}", a.endpoint(), b.endpoint());
        Ok(())
    }

    async fn bring_up(&self, netns: &str, host_name: &str, port: &str) -> Result<(), NetError> {
        self.net.rename_in_netns(netns, host_name, port).await?;
        self.net.set_up_in_netns(netns, port).await
    }

    async fn discard(&self, host_name: &str) {
        if let Err(e) = self.net.delete_link(host_name).await {
            warn!("Failed to delete stray interface {}: {}", host_name, e);
        }
    }
}
