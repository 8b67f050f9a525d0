//! Platform configuration
//!
//! All fields have defaults, so an empty JSON object is a valid config.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::ShellKind;
use crate::TopologyError;

/// Marker the default bash profile installs as `PS1`
pub const BASH_PROMPT: &str = "topology# ";

/// How to launch one interactive shell inside a node and recognise its prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellProfile {
    /// Command run via `docker exec --interactive <node> ...`
    pub argv: Vec<String>,
    /// Extra environment for the shell process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Regex matched against the tail of the output; a match ends a round trip
    pub prompt: String,
}

impl ShellProfile {
    /// Non-interactive bash with stderr folded into stdout and a fixed prompt
    pub fn bash() -> Self {
        let mut env = BTreeMap::new();
        env.insert("PS1".to_string(), BASH_PROMPT.to_string());
        env.insert("PS2".to_string(), String::new());
        env.insert("TERM".to_string(), "dumb".to_string());
        Self {
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                "exec bash --norc --noprofile -i 2>&1".to_string(),
            ],
            env,
            prompt: format!("{}$", regex::escape(BASH_PROMPT)),
        }
    }

    /// vtysh only prints its prompt on a terminal, so run it under `script`
    pub fn vtysh() -> Self {
        Self {
            argv: vec![
                "script".to_string(),
                "-qfc".to_string(),
                "vtysh".to_string(),
                "/dev/null".to_string(),
            ],
            env: BTreeMap::new(),
            prompt: r"[\w.-]+(\([\w-]+\))?# ?$".to_string(),
        }
    }

    pub fn prompt_regex(&self) -> Result<Regex, regex::Error> {
        Regex::new(&self.prompt)
    }
}

/// Settings for building topologies on the local Docker host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Image used when a node does not name one
    pub default_image: String,
    /// Container entrypoint command when a node does not name one
    pub default_command: String,
    pub docker_binary: String,
    pub ip_binary: String,
    /// Host namespace registry (`ip netns` looks here)
    pub netns_dir: PathBuf,
    /// Deadline for each runtime call and `ip` invocation
    pub runtime_timeout_ms: u64,
    /// Deadline for a session to show its prompt again
    pub session_timeout_ms: u64,
    /// Grace period given to `docker stop`
    pub stop_timeout_secs: u64,
    /// Grant every device and capability. Off by default; see `cap_add`.
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub devices: Vec<String>,
    pub shells: BTreeMap<ShellKind, ShellProfile>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let mut shells = BTreeMap::new();
        shells.insert(ShellKind::Bash, ShellProfile::bash());
        shells.insert(ShellKind::Vtysh, ShellProfile::vtysh());

        Self {
            default_image: "ubuntu".to_string(),
            default_command: "bash".to_string(),
            docker_binary: "docker".to_string(),
            ip_binary: "ip".to_string(),
            netns_dir: PathBuf::from("/var/run/netns"),
            runtime_timeout_ms: 30_000,
            session_timeout_ms: 10_000,
            stop_timeout_secs: 10,
            privileged: false,
            cap_add: vec!["NET_ADMIN".to_string()],
            devices: vec!["/dev/net/tun".to_string()],
            shells,
        }
    }
}

impl PlatformConfig {
    /// Parse and validate a JSON config
    pub fn from_json(raw: &str) -> Result<Self, TopologyError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TopologyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.runtime_timeout_ms == 0 || self.session_timeout_ms == 0 {
            return Err(TopologyError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.default_image.is_empty() {
            return Err(TopologyError::Config("default_image is empty".to_string()));
        }
        for (kind, profile) in &self.shells {
            if profile.argv.is_empty() {
                return Err(TopologyError::Config(format!("shell {} has no argv", kind)));
            }
            profile.prompt_regex().map_err(|e| {
                TopologyError::Config(format!("shell {} prompt: {}", kind, e))
            })?;
        }
        Ok(())
    }

    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_millis(self.runtime_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn shell(&self, kind: ShellKind) -> Result<&ShellProfile, TopologyError> {
        self.shells
            .get(&kind)
            .ok_or_else(|| TopologyError::Config(format!("no profile for shell {}", kind)))
    }
}
