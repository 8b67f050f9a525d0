//! Publishing container network namespaces in the host registry
//!
//! Docker keeps a container's network namespace anonymous. To manipulate it
//! with `ip -n <name>`, a named entry in `/var/run/netns` must point at
//! `/proc/<pid>/ns/net` of the container's init process.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::runtime::ContainerRuntime;
use crate::TopologyError;

/// Creates and removes named namespace references in one registry directory
#[derive(Debug, Clone)]
pub struct NamespaceExposer {
    registry: PathBuf,
}

impl NamespaceExposer {
    pub fn new(registry: impl Into<PathBuf>) -> Self {
        Self {
            registry: registry.into(),
        }
    }

    pub fn registry(&self) -> &Path {
        &self.registry
    }

    pub fn entry_path(&self, name: &str) -> PathBuf {
        self.registry.join(name)
    }

    /// Publish the namespace of a running container under `name`.
    ///
    /// Calling this again for the same live process is a no-op; an entry left
    /// over from an earlier process is replaced.
    pub async fn expose(
        &self,
        runtime: &dyn ContainerRuntime,
        container_id: &str,
        name: &str,
    ) -> Result<PathBuf, TopologyError> {
        let unresolved = |reason: String| TopologyError::NamespaceResolution {
            node: name.to_string(),
            reason,
        };

        let info = runtime
            .inspect(container_id)
            .await
            .map_err(|e| unresolved(e.to_string()))?;
        if !info.running || info.pid == 0 {
            return Err(unresolved(format!("container is {}", info.status)));
        }

        let target = PathBuf::from(format!("/proc/{}/ns/net", info.pid));
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(unresolved(format!("process {} has exited", info.pid)));
        }

        tokio::fs::create_dir_all(&self.registry)
            .await
            .map_err(|e| unresolved(format!("cannot create {}: {}", self.registry.display(), e)))?;

        let entry = self.entry_path(name);
        match tokio::fs::read_link(&entry).await {
            Ok(existing) if existing == target => {
                debug!("Namespace {} already exposed", name);
                return Ok(entry);
            }
            Ok(stale) => {
                debug!("Replacing stale namespace entry {} -> {}", name, stale.display());
                tokio::fs::remove_file(&entry)
                    .await
                    .map_err(|e| unresolved(e.to_string()))?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(_) => {
                return Err(unresolved(format!(
                    "{} exists and is not a namespace link",
                    entry.display()
                )))
            }
        }

        tokio::fs::symlink(&target, &entry)
            .await
            .map_err(|e| unresolved(e.to_string()))?;

        info!("Exposed namespace {} -> {}", name, target.display());
        Ok(entry)
    }

    /// Remove the registry entry for `name`; an absent entry counts as removed
    pub async fn unexpose(&self, name: &str) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.entry_path(name)).await {
            Ok(()) => {
                debug!("Removed namespace entry {}", name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::runtime::ContainerSpec;
    use crate::testing::FakeRuntime;

    async fn running(runtime: &FakeRuntime, name: &str) -> String {
        let spec = ContainerSpec::new(name, "ubuntu", "bash", &PlatformConfig::default());
        let id = runtime.create_container(&spec).await.unwrap();
        runtime.start(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn expose_links_to_proc() {
        let dir = tempfile::tempdir().unwrap();
        let exposer = NamespaceExposer::new(dir.path().join("netns"));
        let runtime = FakeRuntime::new();
        let id = running(&runtime, "h1").await;

        let entry = exposer.expose(&runtime, &id, "h1").await.unwrap();
        let target = std::fs::read_link(&entry).unwrap();
        assert_eq!(target, PathBuf::from(format!("/proc/{}/ns/net", std::process::id())));

        // Second call for the same process is accepted
        exposer.expose(&runtime, &id, "h1").await.unwrap();
    }

    #[tokio::test]
    async fn stale_entry_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let exposer = NamespaceExposer::new(dir.path());
        std::os::unix::fs::symlink("/proc/1/ns/net", dir.path().join("h1")).unwrap();

        let runtime = FakeRuntime::new();
        let id = running(&runtime, "h1").await;
        let entry = exposer.expose(&runtime, &id, "h1").await.unwrap();
        assert_ne!(std::fs::read_link(entry).unwrap(), PathBuf::from("/proc/1/ns/net"));
    }

    #[tokio::test]
    async fn stopped_container_cannot_be_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let exposer = NamespaceExposer::new(dir.path());
        let runtime = FakeRuntime::new();
        let spec = ContainerSpec::new("h1", "ubuntu", "bash", &PlatformConfig::default());
        let id = runtime.create_container(&spec).await.unwrap();

        let err = exposer.expose(&runtime, &id, "h1").await.unwrap_err();
        assert!(matches!(err, TopologyError::NamespaceResolution { .. }));
        assert!(!dir.path().join("h1").exists());
    }

    #[tokio::test]
    async fn unknown_container_cannot_be_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let exposer = NamespaceExposer::new(dir.path());
        let runtime = FakeRuntime::new();

        let err = exposer.expose(&runtime, "missing", "h1").await.unwrap_err();
        assert!(matches!(err, TopologyError::NamespaceResolution { .. }));
    }

    #[tokio::test]
    async fn unexpose_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let exposer = NamespaceExposer::new(dir.path());
        let runtime = FakeRuntime::new();
        let id = running(&runtime, "h1").await;

        exposer.expose(&runtime, &id, "h1").await.unwrap();
        exposer.unexpose("h1").await.unwrap();
        assert!(!dir.path().join("h1").exists());
        exposer.unexpose("h1").await.unwrap();
    }
}
