//! Type definitions shared across the topology engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TopologyError;

/// Role a topology node plays. Unknown kinds are rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Switch,
    Host,
}

impl NodeKind {
    /// Resolve an optional kind string from a topology description.
    ///
    /// A missing kind means `Switch`.
    pub fn resolve(kind: Option<&str>) -> Result<Self, TopologyError> {
        match kind {
            None => Ok(Self::default()),
            Some(s) => s.parse(),
        }
    }

    /// Shells opened when a node of this kind starts
    pub fn shells(&self) -> &'static [ShellKind] {
        match self {
            NodeKind::Switch => &[ShellKind::Bash, ShellKind::Vtysh],
            NodeKind::Host => &[ShellKind::Bash],
        }
    }
}

impl FromStr for NodeKind {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "switch" => Ok(NodeKind::Switch),
            "host" => Ok(NodeKind::Host),
            other => Err(TopologyError::UnsupportedNodeKind(other.to_string())),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Switch => write!(f, "switch"),
            NodeKind::Host => write!(f, "host"),
        }
    }
}

/// Interactive shell flavours a node can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    /// Plain command shell
    Bash,
    /// Routing-control shell on switch nodes
    Vtysh,
}

impl FromStr for ShellKind {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bash" => Ok(ShellKind::Bash),
            "vtysh" => Ok(ShellKind::Vtysh),
            other => Err(TopologyError::Config(format!("unknown shell kind: {}", other))),
        }
    }
}

impl fmt::Display for ShellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellKind::Bash => write!(f, "bash"),
            ShellKind::Vtysh => write!(f, "vtysh"),
        }
    }
}

/// Link status of a declared port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    /// Registered, no interface yet
    Unbound,
    /// Realized as one end of a veth pair
    Linked,
    /// Realized as a tap interface with no peer
    Standalone,
}

impl PortStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PortStatus::Unbound)
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortStatus::Unbound => write!(f, "unbound"),
            PortStatus::Linked => write!(f, "linked"),
            PortStatus::Standalone => write!(f, "standalone"),
        }
    }
}

/// Lifecycle state of a node container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Created => write!(f, "created"),
            NodeState::Running => write!(f, "running"),
            NodeState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A node as declared by the topology description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Stable node identifier; becomes the container and namespace name
    #[serde(rename = "id")]
    pub identifier: String,
    /// `switch` or `host`; left as a string so unknown kinds surface as errors
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Ports declared on this node
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

impl NodeSpec {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            kind: None,
            image: None,
            command: None,
            ports: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_ports<I, S>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ports.extend(ports.into_iter().map(PortSpec::new));
        self
    }
}

/// A port as declared by the topology description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PortSpecRepr", into = "String")]
pub struct PortSpec {
    /// Interface name inside the node
    pub identifier: String,
}

impl PortSpec {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }
}

// Ports may be written as a bare string or as `{ "id": ... }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum PortSpecRepr {
    Name(String),
    Full {
        #[serde(rename = "id")]
        identifier: String,
    },
}

impl From<PortSpecRepr> for PortSpec {
    fn from(repr: PortSpecRepr) -> Self {
        match repr {
            PortSpecRepr::Name(identifier) | PortSpecRepr::Full { identifier } => {
                PortSpec { identifier }
            }
        }
    }
}

impl From<PortSpec> for String {
    fn from(port: PortSpec) -> Self {
        port.identifier
    }
}

/// One side of a declared link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: String,
    pub port: String,
}

impl Endpoint {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// A declared point-to-point link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub a: Endpoint,
    pub b: Endpoint,
}

impl LinkSpec {
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        Self { a, b }
    }
}
