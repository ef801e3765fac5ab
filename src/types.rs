//! Core identifier and wire types shared across the agent

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::resources::SlotName;
use crate::system::OnceEvent;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a single kernel (one container running a compute session)
    KernelId
);
string_id!(
    /// Identifier of a session (a cluster of one or more kernels)
    SessionId
);
string_id!(
    /// Backend-assigned container identifier
    ContainerId
);

/// Observed status of a backend container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Removing,
}

impl ContainerStatus {
    /// Statuses considered alive for reconciliation purposes
    pub const ACTIVE: &'static [ContainerStatus] = &[
        ContainerStatus::Running,
        ContainerStatus::Restarting,
        ContainerStatus::Paused,
    ];

    /// Statuses of containers that have terminated but still exist
    pub const DEAD: &'static [ContainerStatus] = &[
        ContainerStatus::Exited,
        ContainerStatus::Dead,
        ContainerStatus::Removing,
    ];

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }
}

/// A host-port binding observed on a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: Option<u16>,
}

/// A container as observed from the backend driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub status: ContainerStatus,
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

/// Kind of a lifecycle transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Start,
    Destroy,
    Clean,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Start => f.write_str("START"),
            LifecycleEvent::Destroy => f.write_str("DESTROY"),
            LifecycleEvent::Clean => f.write_str("CLEAN"),
        }
    }
}

/// An enqueued transition request consumed by the lifecycle orchestrator
#[derive(Debug, Clone)]
pub struct ContainerLifecycleEvent {
    pub kernel_id: KernelId,
    pub container_id: Option<ContainerId>,
    pub event: LifecycleEvent,
    pub reason: String,
    pub exit_code: Option<i64>,
    /// Fired when the handler completes; carries the handler result, if any.
    pub done: Option<OnceEvent<Option<serde_json::Value>>>,
}

impl ContainerLifecycleEvent {
    pub fn new(
        kernel_id: KernelId,
        container_id: Option<ContainerId>,
        event: LifecycleEvent,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kernel_id,
            container_id,
            event,
            reason: reason.into(),
            exit_code: None,
            done: None,
        }
    }
}

impl fmt::Display for ContainerLifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(k:{}, reason:{})",
            self.event, self.kernel_id, self.reason
        )
    }
}

/// Protocol of a service app exposed by a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicePortProtocol {
    Tcp,
    Http,
    Pty,
    Preopen,
}

/// A named application port declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub protocol: ServicePortProtocol,
    pub container_ports: Vec<u16>,
    pub host_ports: Vec<Option<u16>>,
}

/// How eagerly the agent pulls images before creating a kernel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoPullBehavior {
    /// Pull when the local digest differs from the requested digest
    #[default]
    Digest,
    /// Pull only when the tag is missing locally
    Tag,
    /// Never pull
    None,
}

/// SSH keypair distributed to all kernels of a cluster session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeypair {
    pub public_key: String,
    pub private_key: String,
}

/// Session-level cluster networking mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMode {
    #[default]
    SingleNode,
    MultiNode,
}

/// Cluster information shared by the manager for a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    #[serde(default)]
    pub mode: ClusterMode,
    #[serde(default)]
    pub network_name: Option<String>,
    #[serde(default)]
    pub ssh_keypair: Option<SshKeypair>,
}

/// Image reference within a kernel creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Canonical image reference (e.g. `registry/project/image:tag`)
    pub canonical: String,
    pub registry: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// A volume-folder mount requested by the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VFolderMount {
    pub name: String,
    pub host: String,
    pub id: String,
    pub permission: crate::resources::MountPermission,
    /// Unmanaged host path override; bypasses the managed mount root.
    #[serde(default)]
    pub host_path: Option<PathBuf>,
}

/// The creation request sent by the manager (persisted as `kconfig.dat`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelCreationConfig {
    pub image: ImageConfig,
    #[serde(default)]
    pub auto_pull: AutoPullBehavior,
    #[serde(default)]
    pub environ: HashMap<String, String>,
    /// Total requested slot amounts (slot name -> decimal)
    #[serde(default)]
    pub resource_slots: IndexMap<SlotName, Decimal>,
    #[serde(default)]
    pub resource_opts: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub mounts: Vec<VFolderMount>,
    /// Overrides of the in-container target path per folder name
    #[serde(default)]
    pub mount_map: HashMap<String, String>,
    /// Role of this kernel within its session ("main" for the lead kernel)
    #[serde(default = "default_cluster_role")]
    pub cluster_role: String,
    #[serde(default)]
    pub preopen_ports: Vec<u16>,
    #[serde(default)]
    pub internal_data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub startup_command: Option<String>,
    /// Per-run execution timeout in seconds; 0 disables the watchdog
    #[serde(default)]
    pub exec_timeout: u64,
}

fn default_cluster_role() -> String {
    "main".to_string()
}

impl KernelCreationConfig {
    /// Merge a patch config over this one, field-granular at the top level.
    /// Used by the restart path to overlay manager-sent updates.
    pub fn merged_with(&self, patch: serde_json::Value) -> crate::Result<Self> {
        let mut base = serde_json::to_value(self)
            .map_err(|e| crate::AgentError::Internal(e.to_string()))?;
        if let (Some(base_map), Some(patch_map)) = (base.as_object_mut(), patch.as_object()) {
            for (key, value) in patch_map {
                base_map.insert(key.clone(), value.clone());
            }
        }
        serde_json::from_value(base).map_err(|e| crate::AgentError::Internal(e.to_string()))
    }
}

/// A device attached to a kernel, reported back to the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedDevice {
    pub device_id: String,
    pub model_name: Option<String>,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

/// Result of a successful kernel creation, returned to the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelCreationResult {
    pub id: KernelId,
    pub kernel_host: String,
    pub repl_in_port: u16,
    pub repl_out_port: u16,
    pub stdin_port: u16,
    pub stdout_port: u16,
    pub service_ports: Vec<ServicePort>,
    pub container_id: ContainerId,
    pub resource_spec: serde_json::Value,
    pub attached_devices: HashMap<String, Vec<AttachedDevice>>,
}
