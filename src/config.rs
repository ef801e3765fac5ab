//! Configuration structures and loading

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Agent identity and manager-facing settings
    pub agent: AgentConfiguration,

    /// Container and kernel-runtime settings
    #[serde(default)]
    pub container: ContainerConfiguration,

    /// Managed volume-folder paths
    #[serde(default)]
    pub vfolder: VFolderConfiguration,

    /// Message bus endpoint
    #[serde(default)]
    pub redis: RedisConfiguration,

    /// Verbosity toggles
    #[serde(default)]
    pub debug: DebugConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        if config.container.port_range.0 > config.container.port_range.1 {
            anyhow::bail!(
                "container.port-range is inverted: {:?}",
                config.container.port_range
            );
        }

        std::fs::create_dir_all(&config.agent.ipc_base_path)?;
        std::fs::create_dir_all(&config.container.scratch_root)?;

        Ok(config)
    }
}

/// Agent identity and manager-facing settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfiguration {
    /// Unique agent id, stable across restarts
    pub id: String,

    /// Address the RPC server binds to
    #[serde(default = "default_rpc_listen_addr")]
    pub rpc_listen_addr: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default = "default_scaling_group")]
    pub scaling_group: String,

    /// Directory for agent-local runtime state (persisted registry, sockets)
    #[serde(default = "default_ipc_base_path")]
    pub ipc_base_path: PathBuf,
}

fn default_rpc_listen_addr() -> String {
    "0.0.0.0:6001".into()
}

fn default_region() -> String {
    "local".into()
}

fn default_scaling_group() -> String {
    "default".into()
}

fn default_ipc_base_path() -> PathBuf {
    PathBuf::from("/tmp/lattice/ipc")
}

/// Statistics collection mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsType {
    #[default]
    Docker,
    Cgroup,
}

/// Sandbox launcher applied to kernel processes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxType {
    #[default]
    Docker,
    Jail,
}

/// Container and kernel-runtime settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContainerConfiguration {
    /// Inclusive host port range for kernel port bindings
    #[serde(default = "default_port_range")]
    pub port_range: (u16, u16),

    #[serde(default)]
    pub stats_type: StatsType,

    /// UID mapped inside the container when the image declares `uid-match`
    #[serde(default = "default_kernel_uid")]
    pub kernel_uid: u32,

    /// GID mapped inside the container when the image declares `uid-match`
    #[serde(default = "default_kernel_gid")]
    pub kernel_gid: u32,

    #[serde(default)]
    pub sandbox_type: SandboxType,

    /// Extra arguments appended to the jail launcher
    #[serde(default)]
    pub jail_args: Option<String>,

    /// Mapping of distro tag (e.g. "ubuntu18.04") to runner volume name
    #[serde(default)]
    pub krunner_volumes: HashMap<String, String>,

    /// Directory holding the per-distro runner helper binaries
    #[serde(default = "default_runner_dir")]
    pub runner_dir: PathBuf,

    /// Root directory of per-kernel scratch spaces
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    #[serde(default)]
    pub container_logs: ContainerLogsConfiguration,
}

impl Default for ContainerConfiguration {
    fn default() -> Self {
        Self {
            port_range: default_port_range(),
            stats_type: StatsType::default(),
            kernel_uid: default_kernel_uid(),
            kernel_gid: default_kernel_gid(),
            sandbox_type: SandboxType::default(),
            jail_args: None,
            krunner_volumes: HashMap::new(),
            runner_dir: default_runner_dir(),
            scratch_root: default_scratch_root(),
            container_logs: ContainerLogsConfiguration::default(),
        }
    }
}

fn default_port_range() -> (u16, u16) {
    (30000, 31000)
}

fn default_kernel_uid() -> u32 {
    1000
}

fn default_kernel_gid() -> u32 {
    1000
}

fn default_runner_dir() -> PathBuf {
    PathBuf::from("/usr/share/lattice/runner")
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from("/var/lib/lattice/scratches")
}

/// Container log shipping settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContainerLogsConfiguration {
    /// Chunk size in bytes for log records pushed to the bus
    #[serde(default = "default_log_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ContainerLogsConfiguration {
    fn default() -> Self {
        Self {
            chunk_size: default_log_chunk_size(),
        }
    }
}

fn default_log_chunk_size() -> usize {
    64 * 1024
}

/// Managed volume-folder paths
#[derive(Debug, Clone, Deserialize)]
pub struct VFolderConfiguration {
    /// Base directory of managed folder hosts
    #[serde(default = "default_vfolder_mount")]
    pub mount: PathBuf,

    /// Path fragment between the host directory and the folder id
    #[serde(default)]
    pub fsprefix: PathBuf,
}

impl Default for VFolderConfiguration {
    fn default() -> Self {
        Self {
            mount: default_vfolder_mount(),
            fsprefix: PathBuf::new(),
        }
    }
}

fn default_vfolder_mount() -> PathBuf {
    PathBuf::from("/mnt")
}

/// Message bus endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfiguration {
    #[serde(default = "default_redis_addr")]
    pub addr: String,

    #[serde(default)]
    pub password: Option<String>,
}

impl RedisConfiguration {
    /// Connection URL for the redis client
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}", password, self.addr),
            None => format!("redis://{}", self.addr),
        }
    }
}

impl Default for RedisConfiguration {
    fn default() -> Self {
        Self {
            addr: default_redis_addr(),
            password: None,
        }
    }
}

fn default_redis_addr() -> String {
    "127.0.0.1:6379".into()
}

/// Verbosity toggles
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DebugConfiguration {
    #[serde(default)]
    pub log_stats: bool,

    #[serde(default)]
    pub log_heartbeats: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config: Configuration = toml::from_str(
            r#"
            [agent]
            id = "i-test"
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.id, "i-test");
        assert_eq!(config.container.port_range, (30000, 31000));
        assert_eq!(config.container.container_logs.chunk_size, 64 * 1024);
        assert_eq!(config.redis.url(), "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_full_config() {
        let config: Configuration = toml::from_str(
            r#"
            [agent]
            id = "i-node01"
            rpc-listen-addr = "10.0.0.5:6001"
            region = "ap-seoul"
            scaling-group = "gpu"

            [container]
            port-range = [31000, 32000]
            stats-type = "cgroup"
            sandbox-type = "jail"
            jail-args = "--mount-proc"
            kernel-uid = 501
            kernel-gid = 501

            [container.krunner-volumes]
            "ubuntu18.04" = "runner-env.ubuntu18.04"

            [container.container-logs]
            chunk-size = 8192

            [vfolder]
            mount = "/vfroot"
            fsprefix = "shared"

            [redis]
            addr = "redis.internal:6379"
            password = "sekrit"

            [debug]
            log-stats = true
            "#,
        )
        .unwrap();
        assert_eq!(config.container.port_range, (31000, 32000));
        assert_eq!(config.container.stats_type, StatsType::Cgroup);
        assert_eq!(config.container.sandbox_type, SandboxType::Jail);
        assert_eq!(config.container.container_logs.chunk_size, 8192);
        assert_eq!(
            config.redis.url(),
            "redis://:sekrit@redis.internal:6379"
        );
        assert!(config.debug.log_stats);
        assert!(!config.debug.log_heartbeats);
    }
}
