//! Container runtime seam
//!
//! The engine talks to containers only through [`ContainerRuntime`]. The
//! production implementation, [`DockerCli`], drives the `docker` binary; tests
//! use [`crate::testing::FakeRuntime`].

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{PlatformConfig, ShellProfile};
use crate::exec::{run_checked, CommandError};
use crate::session::Session;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("container '{0}' not found")]
    NotFound(String),

    #[error("unexpected inspect output for '{id}': {reason}")]
    BadInspect { id: String, reason: String },

    #[error("invalid command '{command}': {reason}")]
    BadCommand { command: String, reason: String },

    #[error("invalid prompt pattern: {0}")]
    Prompt(#[from] regex::Error),

    #[error("failed to attach to '{name}': {source}")]
    Attach {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything needed to create a node container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: String,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub devices: Vec<String>,
    /// `none` keeps the container off every default bridge
    pub network_mode: String,
}

impl ContainerSpec {
    pub fn new(name: &str, image: &str, command: &str, config: &PlatformConfig) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            command: command.to_string(),
            privileged: config.privileged,
            cap_add: config.cap_add.clone(),
            devices: config.devices.clone(),
            network_mode: "none".to_string(),
        }
    }
}

/// Subset of container state the engine relies on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub pid: u32,
    pub running: bool,
    pub status: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a detached container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;
    /// Block until the container has exited
    async fn wait(&self, id: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;
    /// Open an interactive shell inside the named container
    async fn attach(&self, name: &str, profile: &ShellProfile) -> Result<Session, RuntimeError>;
}

/// [`ContainerRuntime`] backed by the `docker` command-line client
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    timeout: Duration,
    stop_timeout_secs: u64,
    session_limit: Duration,
}

impl DockerCli {
    pub fn new(config: &PlatformConfig) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            timeout: config.runtime_timeout(),
            stop_timeout_secs: config.stop_timeout_secs,
            session_limit: config.session_timeout(),
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<String, RuntimeError> {
        run_checked(&self.binary, args, self.timeout)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    RuntimeError::NotFound(args.last().copied().unwrap_or_default().to_string())
                } else {
                    RuntimeError::Command(e)
                }
            })
    }

    /// Arguments for `docker create`
    pub fn create_args(spec: &ContainerSpec) -> Result<Vec<String>, RuntimeError> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--hostname".to_string(),
            spec.name.clone(),
            "--network".to_string(),
            spec.network_mode.clone(),
            // Keep the entrypoint shell alive while detached
            "--interactive".to_string(),
            "--tty".to_string(),
        ];
        if spec.privileged {
            args.push("--privileged".to_string());
        }
        for cap in &spec.cap_add {
            args.push("--cap-add".to_string());
            args.push(cap.clone());
        }
        for dev in &spec.devices {
            args.push("--device".to_string());
            args.push(dev.clone());
        }
        args.push(spec.image.clone());
        let command = shell_words::split(&spec.command).map_err(|e| RuntimeError::BadCommand {
            command: spec.command.clone(),
            reason: e.to_string(),
        })?;
        args.extend(command);
        Ok(args)
    }
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Pid")]
    pid: u32,
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "Status")]
    status: String,
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let args = Self::create_args(spec)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = run_checked(&self.binary, &args, self.timeout).await?;
        info!("Created container {} ({})", spec.name, short_id(&id));
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker(&["start", id]).await?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let grace = self.stop_timeout_secs.to_string();
        // docker stop blocks for the grace period before killing
        let deadline = self.timeout + Duration::from_secs(self.stop_timeout_secs);
        run_checked(&self.binary, &["stop", "--time", &grace, id], deadline)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    RuntimeError::NotFound(id.to_string())
                } else {
                    RuntimeError::Command(e)
                }
            })?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker(&["wait", id]).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker(&["rm", "--force", id]).await?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let raw = self
            .docker(&["inspect", "--format", "{{json .State}}", id])
            .await?;
        let state: InspectState =
            serde_json::from_str(&raw).map_err(|e| RuntimeError::BadInspect {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(ContainerInfo {
            pid: state.pid,
            running: state.running,
            status: state.status,
        })
    }

    async fn attach(&self, name: &str, profile: &ShellProfile) -> Result<Session, RuntimeError> {
        let mut args = vec!["exec".to_string(), "--interactive".to_string()];
        for (key, value) in &profile.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        args.extend(profile.argv.iter().cloned());
        debug!("Attaching: {} {}", self.binary, args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Attach {
                name: name.to_string(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(RuntimeError::Attach {
                name: name.to_string(),
                source: std::io::Error::other("child pipes unavailable"),
            });
        };

        let prompt = profile.prompt_regex()?;
        let mut session =
            Session::new(stdout, stdin, prompt, self.session_limit).with_child(child);
        // Swallow the banner and first prompt so the next round trip starts clean
        session
            .wait_for_prompt()
            .await
            .map_err(|e| RuntimeError::Attach {
                name: name.to_string(),
                source: std::io::Error::other(e.to_string()),
            })?;
        Ok(session)
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_args_isolate_network() {
        let config = PlatformConfig::default();
        let spec = ContainerSpec::new("s1", "ubuntu", "bash", &config);
        let args = DockerCli::create_args(&spec).unwrap();

        let net = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[net + 1], "none");
        assert!(!args.contains(&"--privileged".to_string()));
        assert!(args.contains(&"NET_ADMIN".to_string()));
        assert_eq!(&args[args.len() - 2..], &["ubuntu", "bash"]);
    }

    #[test]
    fn privileged_is_opt_in() {
        let config = PlatformConfig {
            privileged: true,
            ..PlatformConfig::default()
        };
        let spec = ContainerSpec::new("s1", "ubuntu", "bash -l", &config);
        let args = DockerCli::create_args(&spec).unwrap();
        assert!(args.contains(&"--privileged".to_string()));
        assert_eq!(&args[args.len() - 2..], &["bash", "-l"]);
    }

    #[test]
    fn quoted_command_stays_one_argument() {
        let config = PlatformConfig::default();
        let spec = ContainerSpec::new("h1", "alpine", "sh -c 'sleep infinity'", &config);
        let args = DockerCli::create_args(&spec).unwrap();
        assert_eq!(&args[args.len() - 4..], &["alpine", "sh", "-c", "sleep infinity"]);
    }

    #[test]
    fn unbalanced_quote_is_rejected() {
        let config = PlatformConfig::default();
        let spec = ContainerSpec::new("h1", "alpine", "sh -c 'sleep", &config);
        let err = DockerCli::create_args(&spec).unwrap_err();
        assert!(matches!(err, RuntimeError::BadCommand { ref command, .. } if command == "sh -c 'sleep"));
    }

    #[test]
    fn short_ids_truncate() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
