//! Interface plumbing through iproute2
//!
//! [`NetTooling`] is the set of kernel operations the wiring engine and port
//! tracker need. [`IpCommand`] runs them with the `ip` binary against named
//! namespaces in the host registry.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::config::PlatformConfig;
use crate::exec::{run_checked, CommandError};

#[derive(Error, Debug)]
pub enum NetError {
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[async_trait]
pub trait NetTooling: Send + Sync {
    /// Create a veth pair in the host namespace
    async fn add_veth(&self, name: &str, peer: &str) -> Result<(), NetError>;
    /// Move a host interface into a named namespace
    async fn move_to_netns(&self, ifname: &str, netns: &str) -> Result<(), NetError>;
    async fn rename_in_netns(&self, netns: &str, from: &str, to: &str) -> Result<(), NetError>;
    async fn set_up_in_netns(&self, netns: &str, ifname: &str) -> Result<(), NetError>;
    /// Create a peerless tap interface inside a named namespace
    async fn add_tap_in_netns(&self, netns: &str, ifname: &str) -> Result<(), NetError>;
    /// Delete a host interface; an absent interface is not an error
    async fn delete_link(&self, ifname: &str) -> Result<(), NetError>;
}

/// [`NetTooling`] backed by the `ip` command
#[derive(Debug, Clone)]
pub struct IpCommand {
    binary: String,
    timeout: Duration,
}

impl IpCommand {
    pub fn new(config: &PlatformConfig) -> Self {
        Self {
            binary: config.ip_binary.clone(),
            timeout: config.runtime_timeout(),
        }
    }

    async fn ip(&self, args: &[&str]) -> Result<(), NetError> {
        run_checked(&self.binary, args, self.timeout).await?;
        Ok(())
    }
}

#[async_trait]
impl NetTooling for IpCommand {
    async fn add_veth(&self, name: &str, peer: &str) -> Result<(), NetError> {
        self.ip(&["link", "add", name, "type", "veth", "peer", "name", peer])
            .await
    }

    async fn move_to_netns(&self, ifname: &str, netns: &str) -> Result<(), NetError> {
        self.ip(&["link", "set", "dev", ifname, "netns", netns]).await
    }

    async fn rename_in_netns(&self, netns: &str, from: &str, to: &str) -> Result<(), NetError> {
        self.ip(&["-n", netns, "link", "set", "dev", from, "name", to])
            .await
    }

    async fn set_up_in_netns(&self, netns: &str, ifname: &str) -> Result<(), NetError> {
        self.ip(&["-n", netns, "link", "set", "dev", ifname, "up"]).await
    }

    async fn add_tap_in_netns(&self, netns: &str, ifname: &str) -> Result<(), NetError> {
        self.ip(&["-n", netns, "tuntap", "add", "dev", ifname, "mode", "tap"])
            .await
    }

    async fn delete_link(&self, ifname: &str) -> Result<(), NetError> {
        match self.ip(&["link", "del", "dev", ifname]).await {
            Err(NetError::Command(e)) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

#[cfg(all(test, feature = "sudo-tests"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn veth_add_and_delete() {
        let ip = IpCommand::new(&PlatformConfig::default());
        ip.add_veth("tdtest-a", "tdtest-b").await.unwrap();
        ip.delete_link("tdtest-a").await.unwrap();
        // Deleting again is tolerated
        ip.delete_link("tdtest-a").await.unwrap();
    }
}
