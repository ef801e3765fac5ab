//! Container backend driver interface
//!
//! The orchestrator and the creation pipeline drive containers exclusively
//! through this trait; the Docker implementation lives in `docker`. The
//! creation hooks mirror the pipeline stages so a backend can customize
//! scratch layout, networking, and the final spawn.

pub mod docker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::kernel::Kernel;
use crate::resources::{ComputePlugin, DeviceSlotAllocation, KernelResourceSpec, Mount};
use crate::types::{
    AutoPullBehavior, ClusterInfo, Container, ContainerId, ContainerStatus, ImageConfig,
    KernelCreationConfig, KernelId, ServicePort, SessionId,
};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("image not available locally: {0}")]
    ImageNotAvailable(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Per-creation state threaded through the pipeline stages.
#[derive(Debug, Clone)]
pub struct KernelCreationContext {
    pub kspec_version: u32,
    pub kernel_id: KernelId,
    pub session_id: SessionId,
    pub kernel_config: KernelCreationConfig,
    pub kernel_features: HashSet<String>,
    pub image_ref: String,
    pub internal_data: HashMap<String, serde_json::Value>,
    pub restarting: bool,
    /// Container network to join, decided by the network stage.
    pub network_name: Option<String>,
}

impl KernelCreationContext {
    pub fn new(
        kernel_id: KernelId,
        session_id: SessionId,
        kernel_config: KernelCreationConfig,
        restarting: bool,
    ) -> Self {
        let image_labels = &kernel_config.image.labels;
        let kspec_version = image_labels
            .get(crate::kernel::labels::KERNELSPEC)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(1);
        let kernel_features = crate::kernel::parse_features(
            image_labels
                .get(crate::kernel::labels::FEATURES)
                .map(String::as_str)
                .unwrap_or(""),
        );
        let image_ref = kernel_config.image.canonical.clone();
        let internal_data = kernel_config.internal_data.clone();
        Self {
            kspec_version,
            kernel_id,
            session_id,
            kernel_config,
            kernel_features,
            image_ref,
            internal_data,
            restarting,
            network_name: None,
        }
    }

    pub fn image_labels(&self) -> &HashMap<String, String> {
        &self.kernel_config.image.labels
    }
}

/// Everything the backend needs to realize one container.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub resource_spec: KernelResourceSpec,
    pub resource_opts: HashMap<String, serde_json::Value>,
    pub environ: HashMap<String, String>,
    pub service_ports: Vec<ServicePort>,
    /// Ordered (container-port, host-port) bindings
    pub port_bindings: Vec<(u16, u16)>,
    pub cmdargs: Vec<String>,
}

/// Narrow interface to the container runtime.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Containers labeled as kernels, filtered to the given statuses.
    async fn enumerate_containers(
        &self,
        status_filter: &[ContainerStatus],
    ) -> BackendResult<Vec<(KernelId, Container)>>;

    /// Whether the image must be pulled before use.
    async fn check_image(
        &self,
        image: &ImageConfig,
        auto_pull: AutoPullBehavior,
    ) -> BackendResult<bool>;

    async fn pull_image(&self, image: &ImageConfig) -> BackendResult<()>;

    /// Locally available images as (repo tag, digest) pairs.
    async fn scan_images(&self) -> BackendResult<HashMap<String, String>>;

    /// Initiate termination of the kernel's container. Resolves with the
    /// last observed stat payload, when the backend has one.
    async fn destroy_kernel(
        &self,
        kernel_id: &KernelId,
        container_id: Option<&ContainerId>,
    ) -> BackendResult<Option<serde_json::Value>>;

    /// Remove the container and release host-side scratch state. Scratch is
    /// kept when the kernel is restarting.
    async fn clean_kernel(
        &self,
        kernel_id: &KernelId,
        container_id: Option<&ContainerId>,
        restarting: bool,
    ) -> BackendResult<()>;

    /// Byte stream of the container's console log.
    async fn log_stream(
        &self,
        container_id: &ContainerId,
    ) -> BackendResult<BoxStream<'static, Bytes>>;

    async fn create_overlay_network(&self, network_name: &str) -> BackendResult<()>;
    async fn destroy_overlay_network(&self, network_name: &str) -> BackendResult<()>;
    async fn create_local_network(&self, network_name: &str) -> BackendResult<()>;
    async fn destroy_local_network(&self, network_name: &str) -> BackendResult<()>;

    // ========================================================================
    // Creation pipeline hooks
    // ========================================================================

    async fn get_extra_envs(
        &self,
        _ctx: &KernelCreationContext,
    ) -> BackendResult<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    /// Derive a fresh resource spec from the request, or reload the frozen
    /// one persisted by a previous launch when restarting.
    async fn prepare_resource_spec(
        &self,
        ctx: &KernelCreationContext,
    ) -> BackendResult<(KernelResourceSpec, HashMap<String, serde_json::Value>)>;

    /// Lay down the scratch directory tree, config files and dotfiles.
    async fn prepare_scratch(&self, ctx: &KernelCreationContext) -> BackendResult<()>;

    /// Backend-intrinsic mounts (scratch directories), applied before any
    /// user mount.
    async fn get_intrinsic_mounts(
        &self,
        ctx: &KernelCreationContext,
    ) -> BackendResult<Vec<Mount>>;

    /// Apply the session's cluster network to the upcoming container.
    async fn apply_network(
        &self,
        ctx: &mut KernelCreationContext,
        cluster_info: &ClusterInfo,
    ) -> BackendResult<()>;

    /// Install the session SSH keypair inside the scratch.
    async fn install_ssh_keypair(
        &self,
        ctx: &KernelCreationContext,
        cluster_info: &ClusterInfo,
    ) -> BackendResult<()>;

    /// Validate and preprocess the assembled mount plan.
    async fn process_mounts(
        &self,
        ctx: &KernelCreationContext,
        mounts: &[Mount],
    ) -> BackendResult<()>;

    /// Realize a device family's allocation (device files, env variables).
    async fn apply_accelerator_allocation(
        &self,
        ctx: &KernelCreationContext,
        plugin: &dyn ComputePlugin,
        device_alloc: &DeviceSlotAllocation,
    ) -> BackendResult<()>;

    /// Create and start the container; returns the registered kernel handle
    /// with its runner attached when the backend supports live I/O.
    async fn spawn(
        &self,
        ctx: &KernelCreationContext,
        spawn_spec: SpawnSpec,
    ) -> BackendResult<Arc<Kernel>>;

    // ========================================================================
    // Kernel file operations (work-directory scoped)
    // ========================================================================

    async fn accept_file(
        &self,
        kernel_id: &KernelId,
        filename: &str,
        data: &[u8],
    ) -> BackendResult<()>;

    async fn download_file(&self, kernel_id: &KernelId, filepath: &str)
        -> BackendResult<Vec<u8>>;

    async fn list_files(&self, kernel_id: &KernelId, path: &str)
        -> BackendResult<serde_json::Value>;

    // ========================================================================
    // Restart persistence
    // ========================================================================

    /// Load a named config blob persisted for the kernel (scratch-backed).
    async fn load_kernel_config(&self, kernel_id: &KernelId, name: &str) -> BackendResult<Vec<u8>>;

    /// Persist a named config blob for the kernel.
    async fn store_kernel_config(
        &self,
        kernel_id: &KernelId,
        name: &str,
        data: &[u8],
    ) -> BackendResult<()>;
}

#[cfg(test)]
pub mod mock {
    //! Scripted backend double used by the orchestrator and pipeline tests.

    use super::*;
    use indexmap::IndexMap;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MockBackend {
        pub containers: Mutex<Vec<(KernelId, Container)>>,
        pub destroyed: Mutex<Vec<(KernelId, Option<ContainerId>)>>,
        pub cleaned: Mutex<Vec<(KernelId, Option<ContainerId>, bool)>>,
        pub stored_configs: Mutex<HashMap<(KernelId, String), Vec<u8>>>,
        pub networks: Mutex<Vec<String>>,
        pub spawn_count: AtomicUsize,
        pub image_needs_pull: AtomicBool,
        pub pulled: Mutex<Vec<String>>,
        pub fail_spawn: AtomicBool,
        pub log_payload: Mutex<Vec<u8>>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_container(&self, kernel_id: &str, container_id: &str, status: ContainerStatus) {
            self.containers.lock().push((
                KernelId::from(kernel_id),
                Container {
                    id: ContainerId::from(container_id),
                    status,
                    image: "registry/python:3.9".into(),
                    labels: [(
                        crate::kernel::labels::KERNELSPEC.to_string(),
                        "2".to_string(),
                    )]
                    .into_iter()
                    .collect(),
                    ports: vec![],
                },
            ));
        }

        pub fn remove_container(&self, kernel_id: &str) {
            self.containers
                .lock()
                .retain(|(id, _)| id.as_str() != kernel_id);
        }
    }

    #[async_trait]
    impl ContainerBackend for MockBackend {
        async fn enumerate_containers(
            &self,
            status_filter: &[ContainerStatus],
        ) -> BackendResult<Vec<(KernelId, Container)>> {
            Ok(self
                .containers
                .lock()
                .iter()
                .filter(|(_, container)| status_filter.contains(&container.status))
                .cloned()
                .collect())
        }

        async fn check_image(
            &self,
            _image: &ImageConfig,
            auto_pull: AutoPullBehavior,
        ) -> BackendResult<bool> {
            Ok(match auto_pull {
                AutoPullBehavior::None => false,
                _ => self.image_needs_pull.load(Ordering::SeqCst),
            })
        }

        async fn pull_image(&self, image: &ImageConfig) -> BackendResult<()> {
            self.pulled.lock().push(image.canonical.clone());
            Ok(())
        }

        async fn scan_images(&self) -> BackendResult<HashMap<String, String>> {
            Ok([("registry/python:3.9".to_string(), "sha256:abc".to_string())]
                .into_iter()
                .collect())
        }

        async fn destroy_kernel(
            &self,
            kernel_id: &KernelId,
            container_id: Option<&ContainerId>,
        ) -> BackendResult<Option<serde_json::Value>> {
            self.destroyed
                .lock()
                .push((kernel_id.clone(), container_id.cloned()));
            // A destroyed container shows up as exited on the next pass.
            let mut containers = self.containers.lock();
            for (id, container) in containers.iter_mut() {
                if id == kernel_id {
                    container.status = ContainerStatus::Exited;
                }
            }
            Ok(Some(serde_json::json!({"stat": "last"})))
        }

        async fn clean_kernel(
            &self,
            kernel_id: &KernelId,
            container_id: Option<&ContainerId>,
            restarting: bool,
        ) -> BackendResult<()> {
            self.cleaned
                .lock()
                .push((kernel_id.clone(), container_id.cloned(), restarting));
            self.containers.lock().retain(|(id, _)| id != kernel_id);
            Ok(())
        }

        async fn log_stream(
            &self,
            _container_id: &ContainerId,
        ) -> BackendResult<BoxStream<'static, Bytes>> {
            let payload = Bytes::from(self.log_payload.lock().clone());
            Ok(Box::pin(futures_util::stream::iter(
                if payload.is_empty() { vec![] } else { vec![payload] },
            )))
        }

        async fn create_overlay_network(&self, network_name: &str) -> BackendResult<()> {
            self.networks.lock().push(network_name.to_string());
            Ok(())
        }

        async fn destroy_overlay_network(&self, network_name: &str) -> BackendResult<()> {
            self.networks.lock().retain(|name| name != network_name);
            Ok(())
        }

        async fn create_local_network(&self, network_name: &str) -> BackendResult<()> {
            self.create_overlay_network(network_name).await
        }

        async fn destroy_local_network(&self, network_name: &str) -> BackendResult<()> {
            self.destroy_overlay_network(network_name).await
        }

        async fn prepare_resource_spec(
            &self,
            ctx: &KernelCreationContext,
        ) -> BackendResult<(KernelResourceSpec, HashMap<String, serde_json::Value>)> {
            if ctx.restarting {
                let stored = self
                    .stored_configs
                    .lock()
                    .get(&(ctx.kernel_id.clone(), "resource.msgpack".to_string()))
                    .cloned()
                    .ok_or_else(|| BackendError::Other("missing persisted spec".into()))?;
                let mut spec: KernelResourceSpec = rmp_serde::from_slice(&stored)
                    .map_err(|e| BackendError::Other(e.to_string()))?;
                spec.thaw_for_replay();
                return Ok((spec, ctx.kernel_config.resource_opts.clone()));
            }
            let mut slots = IndexMap::new();
            for (slot, amount) in &ctx.kernel_config.resource_slots {
                slots.insert(slot.clone(), *amount);
            }
            Ok((
                KernelResourceSpec::new(slots),
                ctx.kernel_config.resource_opts.clone(),
            ))
        }

        async fn prepare_scratch(&self, _ctx: &KernelCreationContext) -> BackendResult<()> {
            Ok(())
        }

        async fn get_intrinsic_mounts(
            &self,
            ctx: &KernelCreationContext,
        ) -> BackendResult<Vec<Mount>> {
            Ok(vec![Mount::bind(
                format!("/scratches/{}", ctx.kernel_id),
                "/home/work",
                crate::resources::MountPermission::ReadWrite,
            )])
        }

        async fn apply_network(
            &self,
            ctx: &mut KernelCreationContext,
            cluster_info: &ClusterInfo,
        ) -> BackendResult<()> {
            ctx.network_name = cluster_info.network_name.clone();
            Ok(())
        }

        async fn install_ssh_keypair(
            &self,
            _ctx: &KernelCreationContext,
            _cluster_info: &ClusterInfo,
        ) -> BackendResult<()> {
            Ok(())
        }

        async fn process_mounts(
            &self,
            _ctx: &KernelCreationContext,
            _mounts: &[Mount],
        ) -> BackendResult<()> {
            Ok(())
        }

        async fn apply_accelerator_allocation(
            &self,
            _ctx: &KernelCreationContext,
            _plugin: &dyn ComputePlugin,
            _device_alloc: &DeviceSlotAllocation,
        ) -> BackendResult<()> {
            Ok(())
        }

        async fn spawn(
            &self,
            ctx: &KernelCreationContext,
            spawn_spec: SpawnSpec,
        ) -> BackendResult<Arc<Kernel>> {
            if self.fail_spawn.load(Ordering::SeqCst) {
                return Err(BackendError::Spawn("scripted spawn failure".into()));
            }
            let index = self.spawn_count.fetch_add(1, Ordering::SeqCst);
            let container_id = ContainerId::from(format!("c-{}-{}", ctx.kernel_id, index).as_str());

            let repl_in = spawn_spec
                .port_bindings
                .iter()
                .find(|(container_port, _)| *container_port == 2000)
                .map(|(_, host_port)| *host_port)
                .unwrap_or(0);
            let repl_out = spawn_spec
                .port_bindings
                .iter()
                .find(|(container_port, _)| *container_port == 2001)
                .map(|(_, host_port)| *host_port)
                .unwrap_or(0);
            let host_ports = spawn_spec
                .port_bindings
                .iter()
                .map(|(_, host_port)| *host_port)
                .collect();

            let kernel = Arc::new(Kernel::new(
                ctx.kernel_id.clone(),
                ctx.session_id.clone(),
                container_id.clone(),
                ctx.kernel_config.cluster_role.clone(),
                ctx.kernel_config.image.canonical.clone(),
                "127.0.0.1".into(),
                repl_in,
                repl_out,
                host_ports,
                spawn_spec.service_ports.clone(),
                spawn_spec.resource_spec.clone(),
            ));
            self.containers.lock().push((
                ctx.kernel_id.clone(),
                Container {
                    id: container_id,
                    status: ContainerStatus::Running,
                    image: ctx.kernel_config.image.canonical.clone(),
                    labels: HashMap::new(),
                    ports: spawn_spec
                        .port_bindings
                        .iter()
                        .map(|(container_port, host_port)| crate::types::PortMapping {
                            container_port: *container_port,
                            host_port: Some(*host_port),
                        })
                        .collect(),
                },
            ));
            Ok(kernel)
        }

        async fn accept_file(
            &self,
            kernel_id: &KernelId,
            filename: &str,
            data: &[u8],
        ) -> BackendResult<()> {
            self.stored_configs
                .lock()
                .insert((kernel_id.clone(), format!("file:{}", filename)), data.to_vec());
            Ok(())
        }

        async fn download_file(
            &self,
            kernel_id: &KernelId,
            filepath: &str,
        ) -> BackendResult<Vec<u8>> {
            self.stored_configs
                .lock()
                .get(&(kernel_id.clone(), format!("file:{}", filepath)))
                .cloned()
                .ok_or_else(|| BackendError::Other(format!("no such file {}", filepath)))
        }

        async fn list_files(
            &self,
            kernel_id: &KernelId,
            path: &str,
        ) -> BackendResult<serde_json::Value> {
            let prefix = format!("file:{}", path.trim_start_matches('/'));
            let files: Vec<String> = self
                .stored_configs
                .lock()
                .keys()
                .filter(|(id, name)| id == kernel_id && name.starts_with(&prefix))
                .map(|(_, name)| name.trim_start_matches("file:").to_string())
                .collect();
            Ok(serde_json::json!({ "files": files, "abspath": path }))
        }

        async fn load_kernel_config(
            &self,
            kernel_id: &KernelId,
            name: &str,
        ) -> BackendResult<Vec<u8>> {
            self.stored_configs
                .lock()
                .get(&(kernel_id.clone(), name.to_string()))
                .cloned()
                .ok_or_else(|| BackendError::Other(format!("no stored config {}", name)))
        }

        async fn store_kernel_config(
            &self,
            kernel_id: &KernelId,
            name: &str,
            data: &[u8],
        ) -> BackendResult<()> {
            self.stored_configs
                .lock()
                .insert((kernel_id.clone(), name.to_string()), data.to_vec());
            Ok(())
        }
    }
}
