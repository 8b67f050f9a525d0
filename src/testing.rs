//! In-memory stand-ins for the container runtime and interface tooling
//!
//! [`FakeRuntime`] and [`FakeNet`] record every call and model just enough
//! state (containers, host and namespace interfaces) for the engine's error
//! paths to be exercised without Docker or root. Failures are injected per
//! operation and target name with `fail_on`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::config::{ShellProfile, BASH_PROMPT};
use crate::exec::CommandError;
use crate::nettool::{NetError, NetTooling};
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec, RuntimeError};
use crate::session::Session;

fn injected(program: &str, op: impl std::fmt::Debug, target: &str) -> CommandError {
    CommandError::Failed {
        program: program.to_string(),
        args: format!("{:?} {}", op, target),
        stderr: "injected failure".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeOp {
    Create,
    Start,
    Stop,
    Wait,
    Remove,
    Inspect,
    Attach,
}

/// A call made against [`FakeRuntime`], keyed by container name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Create { name: String, image: String, command: String },
    Start(String),
    Stop(String),
    Wait(String),
    Remove(String),
    Inspect(String),
    Attach(String),
}

/// Answers one command line typed into a fake shell; `None` hangs the shell
pub type Responder = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone)]
struct FakeContainer {
    name: String,
    running: bool,
    status: &'static str,
}

#[derive(Default)]
struct RuntimeState {
    next_id: u64,
    containers: BTreeMap<String, FakeContainer>,
    calls: Vec<RuntimeCall>,
    failures: Vec<(RuntimeOp, String)>,
    exit_on_start: BTreeSet<String>,
}

impl RuntimeState {
    fn check(&self, op: RuntimeOp, name: &str) -> Result<(), RuntimeError> {
        if self.failures.iter().any(|(o, t)| *o == op && t == name) {
            return Err(injected("docker", op, name).into());
        }
        Ok(())
    }

    fn name_of(&self, id: &str) -> Result<String, RuntimeError> {
        self.containers
            .get(id)
            .map(|c| c.name.clone())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

/// Recording [`ContainerRuntime`] with no real containers behind it.
///
/// Running containers report the test process's own pid, so namespace
/// exposure points at a `/proc` entry that exists.
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    responder: Mutex<Responder>,
    session_timeout: Duration,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RuntimeState::default()),
            responder: Mutex::new(Arc::new(|_: &str, line: &str| Some(format!("{}\n", line)))),
            session_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Replace how fake shells answer; the default echoes the line back
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str, &str) -> Option<String> + Send + Sync + 'static,
    {
        *self.responder.lock() = Arc::new(responder);
    }

    /// Make `op` fail for the container named `name`
    pub fn fail_on(&self, op: RuntimeOp, name: &str) {
        self.state.lock().failures.push((op, name.to_string()));
    }

    /// The container named `name` exits as soon as it starts
    pub fn exit_on_start(&self, name: &str) {
        self.state.lock().exit_on_start.insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().calls.clone()
    }

    /// Names of containers that have been created and not removed
    pub fn containers(&self) -> Vec<String> {
        self.state
            .lock()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn running(&self) -> Vec<String> {
        self.state
            .lock()
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| c.name.clone())
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = self.state.lock();
        state.calls.push(RuntimeCall::Create {
            name: spec.name.clone(),
            image: spec.image.clone(),
            command: spec.command.clone(),
        });
        state.check(RuntimeOp::Create, &spec.name)?;
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(CommandError::Failed {
                program: "docker".to_string(),
                args: format!("create --name {}", spec.name),
                stderr: format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            }
            .into());
        }

        state.next_id += 1;
        let id = format!("{:012x}{}", state.next_id, spec.name);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                running: false,
                status: "created",
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let name = state.name_of(id)?;
        state.calls.push(RuntimeCall::Start(name.clone()));
        state.check(RuntimeOp::Start, &name)?;
        let exits = state.exit_on_start.contains(&name);
        if let Some(container) = state.containers.get_mut(id) {
            container.running = !exits;
            container.status = if exits { "exited" } else { "running" };
        }
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let name = state.name_of(id)?;
        state.calls.push(RuntimeCall::Stop(name.clone()));
        state.check(RuntimeOp::Stop, &name)?;
        if let Some(container) = state.containers.get_mut(id) {
            container.running = false;
            container.status = "exited";
        }
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let name = state.name_of(id)?;
        state.calls.push(RuntimeCall::Wait(name.clone()));
        state.check(RuntimeOp::Wait, &name)
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let name = state.name_of(id)?;
        state.calls.push(RuntimeCall::Remove(name.clone()));
        state.check(RuntimeOp::Remove, &name)?;
        state.containers.remove(id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let mut state = self.state.lock();
        let name = state.name_of(id)?;
        state.calls.push(RuntimeCall::Inspect(name.clone()));
        state.check(RuntimeOp::Inspect, &name)?;
        let container = &state.containers[id];
        Ok(ContainerInfo {
            pid: if container.running { std::process::id() } else { 0 },
            running: container.running,
            status: container.status.to_string(),
        })
    }

    async fn attach(&self, name: &str, profile: &ShellProfile) -> Result<Session, RuntimeError> {
        {
            let mut state = self.state.lock();
            state.calls.push(RuntimeCall::Attach(name.to_string()));
            state.check(RuntimeOp::Attach, name)?;
            if !state.containers.values().any(|c| c.name == name && c.running) {
                return Err(RuntimeError::NotFound(name.to_string()));
            }
        }

        let prompt = profile.prompt_regex()?;
        // Pick a prompt text the profile recognises
        let prompt_text = [BASH_PROMPT.to_string(), format!("{}# ", name)]
            .into_iter()
            .find(|candidate| prompt.is_match(candidate))
            .unwrap_or_default();

        let (ours, theirs) = duplex(8192);
        let (read_half, write_half) = split(ours);
        let (shell_read, mut shell_write) = split(theirs);
        let responder = self.responder.lock().clone();
        let node = name.to_string();

        tokio::spawn(async move {
            if shell_write.write_all(prompt_text.as_bytes()).await.is_err() {
                return;
            }
            let mut lines = BufReader::new(shell_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line == "exit" {
                    return;
                }
                let Some(reply) = responder(&node, &line) else {
                    continue;
                };
                let out = format!("{}{}", reply, prompt_text);
                if shell_write.write_all(out.as_bytes()).await.is_err() {
                    return;
                }
            }
        });

        let mut session = Session::new(read_half, write_half, prompt, self.session_timeout);
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetOp {
    AddVeth,
    MoveToNetns,
    Rename,
    SetUp,
    AddTap,
    DeleteLink,
}

/// A call made against [`FakeNet`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetCall {
    AddVeth { name: String, peer: String },
    MoveToNetns { ifname: String, netns: String },
    Rename { netns: String, from: String, to: String },
    SetUp { netns: String, ifname: String },
    AddTap { netns: String, ifname: String },
    DeleteLink(String),
}

/// Where an interface currently lives: `None` is the host namespace
type Location = Option<String>;

#[derive(Default)]
struct NetState {
    calls: Vec<NetCall>,
    failures: Vec<(NetOp, String)>,
    /// (location, name) -> up
    interfaces: BTreeMap<(Location, String), bool>,
    /// veth peer relation, both directions, by (location, name)
    peers: BTreeMap<(Location, String), (Location, String)>,
    taps: Vec<(String, String)>,
}

impl NetState {
    fn check(&self, op: NetOp, args: &[&str]) -> Result<(), NetError> {
        if let Some((_, target)) = self
            .failures
            .iter()
            .find(|(o, t)| *o == op && args.contains(&t.as_str()))
        {
            return Err(injected("ip", op, target).into());
        }
        Ok(())
    }

    fn missing(ifname: &str) -> NetError {
        CommandError::Failed {
            program: "ip".to_string(),
            args: ifname.to_string(),
            stderr: format!("Cannot find device \"{}\"", ifname),
        }
        .into()
    }

    fn exists(ifname: &str) -> NetError {
        CommandError::Failed {
            program: "ip".to_string(),
            args: ifname.to_string(),
            stderr: "RTNETLINK answers: File exists".to_string(),
        }
        .into()
    }

    /// Re-key an interface, keeping its peer relation intact
    fn relocate(&mut self, from: (Location, String), to: (Location, String)) {
        if let Some(up) = self.interfaces.remove(&from) {
            self.interfaces.insert(to.clone(), up);
        }
        if let Some(peer) = self.peers.remove(&from) {
            self.peers.insert(peer.clone(), to.clone());
            self.peers.insert(to, peer);
        }
    }
}

/// Recording [`NetTooling`] that tracks interfaces per namespace
#[derive(Default)]
pub struct FakeNet {
    state: Mutex<NetState>,
}

impl FakeNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail whenever any of its arguments equals `target`
    pub fn fail_on(&self, op: NetOp, target: &str) {
        self.state.lock().failures.push((op, target.to_string()));
    }

    pub fn calls(&self) -> Vec<NetCall> {
        self.state.lock().calls.clone()
    }

    /// Tap interfaces created, as (netns, ifname)
    pub fn taps(&self) -> Vec<(String, String)> {
        self.state.lock().taps.clone()
    }

    /// Interfaces still present in the host namespace
    pub fn host_links(&self) -> Vec<String> {
        self.state
            .lock()
            .interfaces
            .keys()
            .filter(|(loc, _)| loc.is_none())
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn interfaces_in(&self, netns: &str) -> Vec<String> {
        self.state
            .lock()
            .interfaces
            .keys()
            .filter(|(loc, _)| loc.as_deref() == Some(netns))
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn is_up(&self, netns: &str, ifname: &str) -> bool {
        self.state
            .lock()
            .interfaces
            .get(&(Some(netns.to_string()), ifname.to_string()))
            .copied()
            .unwrap_or(false)
    }

    /// The (netns, ifname) at the other end of a veth inside `netns`
    pub fn peer_of(&self, netns: &str, ifname: &str) -> Option<(String, String)> {
        let state = self.state.lock();
        let (loc, name) = state
            .peers
            .get(&(Some(netns.to_string()), ifname.to_string()))?;
        Some((loc.clone()?, name.clone()))
    }
}

#[async_trait]
impl NetTooling for FakeNet {
    async fn add_veth(&self, name: &str, peer: &str) -> Result<(), NetError> {
        let mut state = self.state.lock();
        state.calls.push(NetCall::AddVeth {
            name: name.to_string(),
            peer: peer.to_string(),
        });
        state.check(NetOp::AddVeth, &[name, peer])?;
        for ifname in [name, peer] {
            if state.interfaces.contains_key(&(None, ifname.to_string())) {
                return Err(NetState::exists(ifname));
            }
        }
        let a = (None, name.to_string());
        let b = (None, peer.to_string());
        state.interfaces.insert(a.clone(), false);
        state.interfaces.insert(b.clone(), false);
        state.peers.insert(a.clone(), b.clone());
        state.peers.insert(b, a);
        Ok(())
    }

    async fn move_to_netns(&self, ifname: &str, netns: &str) -> Result<(), NetError> {
        let mut state = self.state.lock();
        state.calls.push(NetCall::MoveToNetns {
            ifname: ifname.to_string(),
            netns: netns.to_string(),
        });
        state.check(NetOp::MoveToNetns, &[ifname, netns])?;
        let from = (None, ifname.to_string());
        if !state.interfaces.contains_key(&from) {
            return Err(NetState::missing(ifname));
        }
        let to = (Some(netns.to_string()), ifname.to_string());
        if state.interfaces.contains_key(&to) {
            return Err(NetState::exists(ifname));
        }
        // Moving resets the link to down
        state.relocate(from, to.clone());
        state.interfaces.insert(to, false);
        Ok(())
    }

    async fn rename_in_netns(&self, netns: &str, from: &str, to: &str) -> Result<(), NetError> {
        let mut state = self.state.lock();
        state.calls.push(NetCall::Rename {
            netns: netns.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
        state.check(NetOp::Rename, &[netns, from, to])?;
        let old = (Some(netns.to_string()), from.to_string());
        if !state.interfaces.contains_key(&old) {
            return Err(NetState::missing(from));
        }
        let new = (Some(netns.to_string()), to.to_string());
        if state.interfaces.contains_key(&new) {
            return Err(NetState::exists(to));
        }
        state.relocate(old, new);
        Ok(())
    }

    async fn set_up_in_netns(&self, netns: &str, ifname: &str) -> Result<(), NetError> {
        let mut state = self.state.lock();
        state.calls.push(NetCall::SetUp {
            netns: netns.to_string(),
            ifname: ifname.to_string(),
        });
        state.check(NetOp::SetUp, &[netns, ifname])?;
        match state
            .interfaces
            .get_mut(&(Some(netns.to_string()), ifname.to_string()))
        {
            Some(up) => {
                *up = true;
                Ok(())
            }
            None => Err(NetState::missing(ifname)),
        }
    }

    async fn add_tap_in_netns(&self, netns: &str, ifname: &str) -> Result<(), NetError> {
        let mut state = self.state.lock();
        state.calls.push(NetCall::AddTap {
            netns: netns.to_string(),
            ifname: ifname.to_string(),
        });
        state.check(NetOp::AddTap, &[netns, ifname])?;
        let key = (Some(netns.to_string()), ifname.to_string());
        if state.interfaces.contains_key(&key) {
            return Err(NetState::exists(ifname));
        }
        state.interfaces.insert(key, false);
        state.taps.push((netns.to_string(), ifname.to_string()));
        Ok(())
    }

    async fn delete_link(&self, ifname: &str) -> Result<(), NetError> {
        let mut state = self.state.lock();
        state.calls.push(NetCall::DeleteLink(ifname.to_string()));
        state.check(NetOp::DeleteLink, &[ifname])?;
        let key = (None, ifname.to_string());
        if state.interfaces.remove(&key).is_some() {
            // A veth pair dies as a whole
            if let Some(peer) = state.peers.remove(&key) {
                state.peers.remove(&peer);
                state.interfaces.remove(&peer);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;

    #[tokio::test]
    async fn fake_net_follows_moves_and_renames() {
        let net = FakeNet::new();
        net.add_veth("tda", "tdb").await.unwrap();
        net.move_to_netns("tda", "h1").await.unwrap();
        net.rename_in_netns("h1", "tda", "eth0").await.unwrap();
        net.set_up_in_netns("h1", "eth0").await.unwrap();

        assert_eq!(net.interfaces_in("h1"), vec!["eth0".to_string()]);
        assert!(net.is_up("h1", "eth0"));
        assert_eq!(net.host_links(), vec!["tdb".to_string()]);

        // Deleting the host end takes the namespaced peer with it
        net.delete_link("tdb").await.unwrap();
        assert!(net.interfaces_in("h1").is_empty());
        net.delete_link("tdb").await.unwrap();
    }

    #[tokio::test]
    async fn fake_runtime_sessions_answer_commands() {
        let runtime = FakeRuntime::new();
        runtime.respond_with(|node, line| Some(format!("{}: {}\n", node, line)));
        let spec = ContainerSpec::new("h1", "ubuntu", "bash", &PlatformConfig::default());
        let id = runtime.create_container(&spec).await.unwrap();
        runtime.start(&id).await.unwrap();

        let mut session = runtime.attach("h1", &ShellProfile::bash()).await.unwrap();
        assert_eq!(session.send_command("hostname").await.unwrap(), "h1: hostname\n");

        let mut vtysh = runtime.attach("h1", &ShellProfile::vtysh()).await.unwrap();
        assert_eq!(vtysh.send_command("show version").await.unwrap(), "h1: show version\n");
    }

    #[tokio::test]
    async fn duplicate_container_names_conflict() {
        let runtime = FakeRuntime::new();
        let spec = ContainerSpec::new("h1", "ubuntu", "bash", &PlatformConfig::default());
        runtime.create_container(&spec).await.unwrap();
        assert!(runtime.create_container(&spec).await.is_err());
        assert_eq!(runtime.containers(), vec!["h1".to_string()]);
    }
}
