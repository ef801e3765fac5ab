//! Kernel handles and the runtime overlay selection
//!
//! A `Kernel` is the in-memory handle of one live container. It is created
//! by the creation pipeline, mutated only by lifecycle handlers and its own
//! runner, and removed from the registry by the CLEAN handler.

pub mod runner;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::resources::KernelResourceSpec;
use crate::system::OnceEvent;
use crate::types::{ContainerId, KernelId, ServicePort, SessionId};

use runner::KernelRunner;

/// Range of kernelspec versions this agent can drive
pub const MIN_KERNELSPEC: u32 = 1;
pub const MAX_KERNELSPEC: u32 = 3;

/// Image label keys recognized by the agent
pub mod labels {
    pub const KERNELSPEC: &str = "ai.backend.kernelspec";
    pub const FEATURES: &str = "ai.backend.features";
    pub const BASE_DISTRO: &str = "ai.backend.base-distro";
    pub const SERVICE_PORTS: &str = "ai.backend.service-ports";
    pub const ENVS_CORECOUNT: &str = "ai.backend.envs.corecount";
    pub const RUNTIME_TYPE: &str = "ai.backend.runtime-type";
    pub const RUNTIME_PATH: &str = "ai.backend.runtime-path";
    pub const KERNEL_ID: &str = "ai.backend.kernel-id";
}

/// Feature flags declared by kernel images
pub mod features {
    pub const UID_MATCH: &str = "uid-match";
    pub const USER_INPUT: &str = "user-input";
    pub const BATCH_MODE: &str = "batch";
    pub const QUERY_MODE: &str = "query";
    pub const TTY_MODE: &str = "tty";
}

/// Parse the space-separated feature list of an image label.
pub fn parse_features(raw: &str) -> HashSet<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}

/// Select the runtime overlay volume for a kernel image distro.
///
/// Keys of `krunner_volumes` are a distro prefix plus a dotted version
/// ("ubuntu18.04", "alpine3.8"). The entry with the same prefix and the
/// highest version not exceeding the requested one wins; a version-less
/// request takes the newest entry of the prefix.
pub fn match_krunner_volume<'a>(
    krunner_volumes: &'a HashMap<String, String>,
    distro: &str,
) -> crate::Result<(String, &'a str)> {
    let version_suffix = Regex::new(r"(\d+(\.\d+)*)$").unwrap();

    fn parse_version(text: &str) -> Vec<u64> {
        text.split('.').filter_map(|part| part.parse().ok()).collect()
    }

    let (prefix, requested_version) = match version_suffix.find(distro) {
        Some(found) => (&distro[..found.start()], Some(parse_version(found.as_str()))),
        None => (distro, None),
    };

    let mut matched: Vec<(&String, Vec<u64>, &String)> = krunner_volumes
        .iter()
        .filter(|(key, _)| key.starts_with(prefix))
        .filter_map(|(key, volume)| {
            let version = version_suffix.find(key)?;
            Some((key, parse_version(version.as_str()), volume))
        })
        .collect();
    matched.sort_by(|a, b| b.1.cmp(&a.1));

    let selected = match requested_version {
        None => matched.first(),
        Some(requested) => matched.iter().find(|(_, version, _)| version <= &requested),
    };
    match selected {
        Some((key, _, volume)) => Ok(((*key).clone(), volume.as_str())),
        None => Err(crate::AgentError::InvalidConfig(format!(
            "no matching kernel-runner volume for distro {}",
            distro
        ))),
    }
}

/// Live handle of one kernel container.
pub struct Kernel {
    pub kernel_id: KernelId,
    pub session_id: SessionId,
    pub container_id: ContainerId,
    pub cluster_role: String,
    pub image: String,

    pub kernel_host: String,
    pub repl_in_port: u16,
    pub repl_out_port: u16,
    pub stdin_port: u16,
    pub stdout_port: u16,
    pub host_ports: Vec<u16>,

    pub resource_spec: KernelResourceSpec,

    service_ports: RwLock<Vec<ServicePort>>,
    runner: RwLock<Option<Arc<KernelRunner>>>,
    stats_enabled: AtomicBool,
    termination_reason: Mutex<Option<String>>,
    clean_event: Mutex<Option<OnceEvent<()>>>,
}

impl Kernel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kernel_id: KernelId,
        session_id: SessionId,
        container_id: ContainerId,
        cluster_role: String,
        image: String,
        kernel_host: String,
        repl_in_port: u16,
        repl_out_port: u16,
        host_ports: Vec<u16>,
        service_ports: Vec<ServicePort>,
        resource_spec: KernelResourceSpec,
    ) -> Self {
        Self {
            kernel_id,
            session_id,
            container_id,
            cluster_role,
            image,
            kernel_host,
            repl_in_port,
            repl_out_port,
            stdin_port: 0,
            stdout_port: 0,
            host_ports,
            resource_spec,
            service_ports: RwLock::new(service_ports),
            runner: RwLock::new(None),
            stats_enabled: AtomicBool::new(false),
            termination_reason: Mutex::new(None),
            clean_event: Mutex::new(None),
        }
    }

    pub fn attach_runner(&self, runner: Arc<KernelRunner>) {
        *self.runner.write() = Some(runner);
    }

    pub fn runner(&self) -> Option<Arc<KernelRunner>> {
        self.runner.read().clone()
    }

    /// Close and detach the runner, releasing its transports.
    pub async fn close_runner(&self) {
        let runner = self.runner.write().take();
        if let Some(runner) = runner {
            runner.close().await;
        }
    }

    pub fn stats_enabled(&self) -> bool {
        self.stats_enabled.load(Ordering::SeqCst)
    }

    pub fn set_stats_enabled(&self, value: bool) {
        self.stats_enabled.store(value, Ordering::SeqCst);
    }

    /// Record why this kernel is terminating. The first reason sticks; later
    /// events must not overwrite it.
    pub fn set_termination_reason(&self, reason: &str) {
        let mut slot = self.termination_reason.lock();
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }

    pub fn termination_reason(&self) -> Option<String> {
        self.termination_reason.lock().clone()
    }

    /// Register a cleanup waiter. A still-pending previous waiter indicates
    /// overlapping destroy requests; keep the first and warn.
    pub fn set_clean_event(&self, event: OnceEvent<()>) {
        let mut slot = self.clean_event.lock();
        if let Some(existing) = slot.as_ref() {
            if !existing.is_fired() {
                warn!(kernel_id = %self.kernel_id, "overwriting pending clean event");
            }
        }
        *slot = Some(event);
    }

    pub fn fire_clean_event(&self) {
        if let Some(event) = self.clean_event.lock().as_ref() {
            event.fire(());
        }
    }

    pub fn service_ports(&self) -> Vec<ServicePort> {
        self.service_ports.read().clone()
    }

    /// Merge live app descriptors (by name) over the declared service ports.
    pub fn update_service_ports(&self, live: &[ServicePort]) {
        let mut ports = self.service_ports.write();
        for live_port in live {
            if let Some(existing) = ports.iter_mut().find(|p| p.name == live_port.name) {
                *existing = live_port.clone();
            }
        }
    }

    pub fn snapshot(&self) -> KernelSnapshot {
        KernelSnapshot {
            kernel_id: self.kernel_id.clone(),
            session_id: self.session_id.clone(),
            container_id: self.container_id.clone(),
            cluster_role: self.cluster_role.clone(),
            image: self.image.clone(),
            kernel_host: self.kernel_host.clone(),
            repl_in_port: self.repl_in_port,
            repl_out_port: self.repl_out_port,
            stdin_port: self.stdin_port,
            stdout_port: self.stdout_port,
            host_ports: self.host_ports.clone(),
            service_ports: self.service_ports.read().clone(),
            resource_spec: self.resource_spec.clone(),
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("kernel_id", &self.kernel_id)
            .field("container_id", &self.container_id)
            .field("cluster_role", &self.cluster_role)
            .field("kernel_host", &self.kernel_host)
            .finish()
    }
}

/// Serializable registry entry persisted across agent restarts.
///
/// Runners and notifiers are transient: a reloaded kernel starts without a
/// runner until the next execute attaches one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSnapshot {
    pub kernel_id: KernelId,
    pub session_id: SessionId,
    pub container_id: ContainerId,
    pub cluster_role: String,
    pub image: String,
    pub kernel_host: String,
    pub repl_in_port: u16,
    pub repl_out_port: u16,
    pub stdin_port: u16,
    pub stdout_port: u16,
    pub host_ports: Vec<u16>,
    pub service_ports: Vec<ServicePort>,
    pub resource_spec: KernelResourceSpec,
}

impl From<KernelSnapshot> for Kernel {
    fn from(snapshot: KernelSnapshot) -> Self {
        let mut kernel = Kernel::new(
            snapshot.kernel_id,
            snapshot.session_id,
            snapshot.container_id,
            snapshot.cluster_role,
            snapshot.image,
            snapshot.kernel_host,
            snapshot.repl_in_port,
            snapshot.repl_out_port,
            snapshot.host_ports,
            snapshot.service_ports,
            snapshot.resource_spec,
        );
        kernel.stdin_port = snapshot.stdin_port;
        kernel.stdout_port = snapshot.stdout_port;
        kernel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volumes(keys: &[&str]) -> HashMap<String, String> {
        keys.iter()
            .map(|key| (key.to_string(), format!("vol-{}", key)))
            .collect()
    }

    #[test]
    fn test_krunner_exact_version() {
        let vols = volumes(&["ubuntu16.04", "ubuntu18.04", "centos7.6"]);
        let (distro, volume) = match_krunner_volume(&vols, "ubuntu18.04").unwrap();
        assert_eq!(distro, "ubuntu18.04");
        assert_eq!(volume, "vol-ubuntu18.04");
    }

    #[test]
    fn test_krunner_highest_not_exceeding() {
        let vols = volumes(&["ubuntu16.04", "ubuntu18.04"]);
        let (distro, _) = match_krunner_volume(&vols, "ubuntu17.10").unwrap();
        assert_eq!(distro, "ubuntu16.04");
        let (distro, _) = match_krunner_volume(&vols, "ubuntu20.04").unwrap();
        assert_eq!(distro, "ubuntu18.04");
    }

    #[test]
    fn test_krunner_versionless_takes_latest() {
        let vols = volumes(&["ubuntu16.04", "ubuntu18.04"]);
        let (distro, _) = match_krunner_volume(&vols, "ubuntu").unwrap();
        assert_eq!(distro, "ubuntu18.04");
    }

    #[test]
    fn test_krunner_no_match() {
        let vols = volumes(&["ubuntu18.04"]);
        assert!(match_krunner_volume(&vols, "centos7.6").is_err());
    }

    #[test]
    fn test_termination_reason_sticks() {
        let kernel = sample_kernel();
        kernel.set_termination_reason("user-requested");
        kernel.set_termination_reason("self-terminated");
        assert_eq!(kernel.termination_reason().as_deref(), Some("user-requested"));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let kernel = sample_kernel();
        let bytes = rmp_serde::to_vec_named(&kernel.snapshot()).unwrap();
        let snapshot: KernelSnapshot = rmp_serde::from_slice(&bytes).unwrap();
        let restored = Kernel::from(snapshot);
        assert_eq!(restored.kernel_id, kernel.kernel_id);
        assert_eq!(restored.container_id, kernel.container_id);
        assert_eq!(restored.host_ports, kernel.host_ports);
        assert!(restored.runner().is_none());
    }

    fn sample_kernel() -> Kernel {
        Kernel::new(
            KernelId::from("k1"),
            SessionId::from("s1"),
            ContainerId::from("c1"),
            "main".into(),
            "registry/python:3.9".into(),
            "127.0.0.1".into(),
            30001,
            30002,
            vec![30001, 30002],
            vec![],
            KernelResourceSpec::default(),
        )
    }
}
