//! CLI command implementations
//!
//! Kept out of main.rs so config and description handling can be unit tested.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;
use topology_docker::{
    build_topology, NodeHandle, NodeKind, Orchestrator, PlatformConfig, ShellKind,
    TopologyDescription,
};
use tracing::{error, info};

/// Environment variable naming a platform config file
pub const CONFIG_ENV: &str = "TOPOLOGY_DOCKER_CONFIG";

/// Implementation of the 'up' command - builds, holds, then destroys a topology
pub async fn cmd_up(topology: &Path, hold: Option<u64>, config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let description = load_description(topology)?;

    let mut orchestrator = Orchestrator::docker(config)?;
    build_topology(&mut orchestrator, &description).await?;

    for node in orchestrator.nodes() {
        let ports: Vec<String> = node
            .ports()
            .iter()
            .map(|(port, status)| format!("{}={}", port, status))
            .collect();
        info!(
            "  {} ({}, {}): {}",
            node.name(),
            node.kind(),
            node.image(),
            ports.join(" ")
        );
    }

    match hold {
        Some(secs) => {
            info!("Holding topology for {} seconds", secs);
            tokio::select! {
                _ = sleep(Duration::from_secs(secs)) => {
                    info!("Hold time elapsed");
                }
                _ = signal::ctrl_c() => {
                    info!("Interrupted by user");
                }
            }
        }
        None => {
            info!("Topology is up; press Ctrl-C to tear it down");
            signal::ctrl_c().await?;
        }
    }

    orchestrator.destroy().await?;
    info!("Topology torn down successfully");
    Ok(())
}

/// Implementation of the 'validate' command - static checks only
pub fn cmd_validate(topology: &Path, json: bool, config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let description = load_description(topology)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&description)?);
        return Ok(());
    }

    println!(
        "Topology is valid: {} node(s), {} link(s)",
        description.nodes.len(),
        description.links.len()
    );
    for node in &description.nodes {
        let kind = NodeKind::resolve(node.kind.as_deref())?;
        let image = node.image.as_deref().unwrap_or(&config.default_image);
        let ports: Vec<&str> = node.ports.iter().map(|p| p.identifier.as_str()).collect();
        println!(
            "  {} ({}, {}): {}",
            node.identifier,
            kind,
            image,
            ports.join(", ")
        );
    }
    for link in &description.links {
        println!("  {} <-> {}", link.a, link.b);
    }
    Ok(())
}

/// Implementation of the 'exec' command - one command in a freshly built topology
pub async fn cmd_exec(
    topology: &Path,
    node: &str,
    command: &str,
    shell: &str,
    config: Option<&Path>,
) -> Result<()> {
    let shell: ShellKind = shell.parse()?;
    let config = load_config(config)?;
    let description = load_description(topology)?;
    if !description.nodes.iter().any(|n| n.identifier == node) {
        anyhow::bail!("node '{}' is not part of {}", node, topology.display());
    }

    let mut orchestrator = Orchestrator::docker(config)?;
    build_topology(&mut orchestrator, &description).await?;

    let result = orchestrator
        .send_command(&NodeHandle::from(node), shell, command)
        .await;

    // Tear down regardless of how the command went
    if let Err(e) = orchestrator.destroy().await {
        error!("Teardown incomplete: {}", e);
    }

    let output = result?;
    print!("{}", output);
    Ok(())
}

/// Platform config from `--config`, then `$TOPOLOGY_DOCKER_CONFIG`, then defaults
fn load_config(path: Option<&Path>) -> Result<PlatformConfig> {
    let from_env = std::env::var_os(CONFIG_ENV);
    let path = path.or(from_env.as_deref().map(Path::new));
    match path {
        Some(path) => {
            let config = PlatformConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        }
        None => Ok(PlatformConfig::default()),
    }
}

fn load_description(path: &Path) -> Result<TopologyDescription> {
    let description = TopologyDescription::from_file(path)
        .with_context(|| format!("loading topology {}", path.display()))?;
    description
        .validate()
        .with_context(|| format!("invalid topology {}", path.display()))?;
    Ok(description)
}
