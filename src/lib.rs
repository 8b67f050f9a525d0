//! Container-backed network topology builder
//!
//! This library builds emulated network topologies out of Docker containers.
//! Every node runs in its own network namespace; links between nodes are veth
//! pairs whose ends are moved into the two namespaces, and any declared port
//! left without a link receives a tap interface once the build is complete.
//!
//! The [`Orchestrator`] drives the build phases and owns every node it
//! creates, so several independent topologies can live in one process.

pub mod config;
pub mod exec;
pub mod link;
pub mod namespace;
pub mod nettool;
pub mod node;
pub mod orchestrator;
pub mod ports;
pub mod runtime;
pub mod session;
pub mod testing; // always available
pub mod topology;
pub mod types;

use std::time::Duration;
use thiserror::Error;

pub use config::{PlatformConfig, ShellProfile};
pub use link::LinkWiring;
pub use namespace::NamespaceExposer;
pub use nettool::{IpCommand, NetTooling};
pub use node::{Node, TeardownFailure, TeardownReport, TeardownStep};
pub use orchestrator::{NodeHandle, Orchestrator, Phase};
pub use runtime::{ContainerRuntime, DockerCli};
pub use session::Session;
pub use topology::{build_topology, TopologyDescription};
pub use types::{
    Endpoint, LinkSpec, NodeKind, NodeSpec, NodeState, PortSpec, PortStatus, ShellKind,
};

pub type Result<T> = std::result::Result<T, TopologyError>;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("failed to provision node '{node}': {reason}")]
    Provision { node: String, reason: String },

    #[error("failed to start node '{node}': {reason}")]
    Start { node: String, reason: String },

    #[error("teardown incomplete: {0}")]
    Teardown(TeardownReport),

    #[error("cannot resolve namespace of '{node}': {reason}")]
    NamespaceResolution { node: String, reason: String },

    #[error("invalid wire request: {0}")]
    InvalidWireRequest(String),

    #[error("failed to wire {a} <-> {b}: {reason}")]
    Wire {
        a: Endpoint,
        b: Endpoint,
        reason: String,
    },

    #[error("port '{port}' already declared on '{node}'")]
    DuplicatePort { node: String, port: String },

    #[error("port {node}.{port} cannot go from {from} to {to}")]
    InvalidTransition {
        node: String,
        port: String,
        from: PortStatus,
        to: PortStatus,
    },

    #[error("'{port}' on '{node}' is not a valid interface name")]
    InvalidPortName { node: String, port: String },

    #[error("unsupported node kind '{0}'")]
    UnsupportedNodeKind(String),

    #[error("{shell} session on '{node}' timed out after {after:?}")]
    SessionTimeout {
        node: String,
        shell: ShellKind,
        after: Duration,
        /// Output received before the deadline
        partial: String,
    },

    #[error("{shell} session on '{node}' failed: {reason}")]
    Session {
        node: String,
        shell: ShellKind,
        reason: String,
    },

    #[error("{operation} is not allowed while {phase}")]
    PhaseViolation {
        operation: &'static str,
        phase: Phase,
    },

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("unknown port {node}.{port}")]
    UnknownPort { node: String, port: String },

    #[error("node '{0}' already exists")]
    DuplicateNode(String),

    #[error("node '{node}' is {state}")]
    NotRunning { node: String, state: NodeState },

    #[error("failed to create standalone interface {node}.{port}: {reason}")]
    Finalize {
        node: String,
        port: String,
        reason: String,
    },

    #[error("{} node(s) failed to finalize: {}", .0.len(), join_errors(.0))]
    PostBuild(Vec<TopologyError>),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_errors(errors: &[TopologyError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl TopologyError {
    /// Aggregated teardown failures, if this is a teardown error
    pub fn teardown_report(&self) -> Option<&TeardownReport> {
        match self {
            TopologyError::Teardown(report) => Some(report),
            _ => None,
        }
    }
}
