//! Docker implementation of the container backend

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{HostConfig, MountTypeEnum, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::kernel::runner::{ClientFeature, KernelRunner};
use crate::kernel::{labels, Kernel};
use crate::resources::{
    ComputePlugin, DeviceSlotAllocation, KernelResourceSpec, Mount, MountType,
    RESOURCE_ALLOCATIONS_LABEL,
};
use crate::types::{
    AutoPullBehavior, ClusterInfo, Container, ContainerId, ContainerStatus, ImageConfig,
    KernelId, PortMapping,
};

use super::{
    BackendError, BackendResult, ContainerBackend, KernelCreationContext, SpawnSpec,
};

/// Address kernels are reached at; ports are host-bound.
const KERNEL_HOST: &str = "127.0.0.1";

const RUNNER_CONNECT_ATTEMPTS: u32 = 5;
const RUNNER_CONNECT_DELAY: Duration = Duration::from_millis(300);

pub struct DockerBackend {
    client: Docker,
    config: Arc<Configuration>,
}

impl DockerBackend {
    pub fn new(config: Arc<Configuration>) -> BackendResult<Self> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self { client, config })
    }

    pub fn with_client(config: Arc<Configuration>, client: Docker) -> Self {
        Self { client, config }
    }

    fn container_name(kernel_id: &KernelId) -> String {
        format!("kernel.{}", kernel_id)
    }

    fn scratch_dir(&self, kernel_id: &KernelId) -> PathBuf {
        self.config.container.scratch_root.join(kernel_id.as_str())
    }

    /// Resolve a user-supplied path inside the kernel's work directory,
    /// rejecting traversal outside it.
    fn work_path(&self, kernel_id: &KernelId, relative: &str) -> BackendResult<PathBuf> {
        let trimmed = relative.trim_start_matches('/');
        let candidate = std::path::Path::new(trimmed);
        if candidate
            .components()
            .any(|part| matches!(part, std::path::Component::ParentDir))
        {
            return Err(BackendError::Other(format!(
                "path escapes the work directory: {}",
                relative
            )));
        }
        Ok(self.scratch_dir(kernel_id).join("work").join(candidate))
    }

    fn map_status(state: Option<&str>) -> Option<ContainerStatus> {
        match state? {
            "running" => Some(ContainerStatus::Running),
            "restarting" => Some(ContainerStatus::Restarting),
            "paused" => Some(ContainerStatus::Paused),
            "exited" => Some(ContainerStatus::Exited),
            "dead" => Some(ContainerStatus::Dead),
            "removing" => Some(ContainerStatus::Removing),
            _ => None,
        }
    }

    fn is_not_found(error: &bollard::errors::Error) -> bool {
        matches!(
            error,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }
        )
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn enumerate_containers(
        &self,
        status_filter: &[ContainerStatus],
    ) -> BackendResult<Vec<(KernelId, Container)>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![labels::KERNEL_ID.to_string()]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self.client.list_containers(Some(options)).await?;
        let mut containers = Vec::new();
        for summary in summaries {
            let Some(status) = Self::map_status(summary.state.as_deref()) else {
                continue;
            };
            if !status_filter.contains(&status) {
                continue;
            }
            let container_labels = summary.labels.unwrap_or_default();
            let Some(kernel_id) = container_labels.get(labels::KERNEL_ID).cloned() else {
                continue;
            };
            let Some(id) = summary.id else {
                continue;
            };
            let ports = summary
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|port| PortMapping {
                    container_port: port.private_port,
                    host_port: port.public_port,
                })
                .collect();
            containers.push((
                KernelId(kernel_id),
                Container {
                    id: ContainerId(id),
                    status,
                    image: summary.image.unwrap_or_default(),
                    labels: container_labels,
                    ports,
                },
            ));
        }
        Ok(containers)
    }

    async fn check_image(
        &self,
        image: &ImageConfig,
        auto_pull: AutoPullBehavior,
    ) -> BackendResult<bool> {
        let inspected = self.client.inspect_image(&image.canonical).await;
        match auto_pull {
            AutoPullBehavior::Digest => match inspected {
                Ok(info) => {
                    let local_digests = info.repo_digests.unwrap_or_default();
                    let matches = image.digest.is_empty()
                        || local_digests
                            .iter()
                            .any(|digest| digest.ends_with(&image.digest));
                    Ok(!matches)
                }
                Err(error) if Self::is_not_found(&error) => Ok(true),
                Err(error) => Err(BackendError::Docker(error)),
            },
            AutoPullBehavior::Tag => match inspected {
                Ok(_) => Ok(false),
                Err(error) if Self::is_not_found(&error) => Ok(true),
                Err(error) => Err(BackendError::Docker(error)),
            },
            AutoPullBehavior::None => match inspected {
                Ok(_) => Ok(false),
                Err(error) if Self::is_not_found(&error) => {
                    Err(BackendError::ImageNotAvailable(image.canonical.clone()))
                }
                Err(error) => Err(BackendError::Docker(error)),
            },
        }
    }

    async fn pull_image(&self, image: &ImageConfig) -> BackendResult<()> {
        let options = CreateImageOptions {
            from_image: image.canonical.as_str(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("Pull {}: {}", image.canonical, status);
                    }
                }
                Err(error) => {
                    return Err(BackendError::ImagePull(error.to_string()));
                }
            }
        }
        info!("Successfully pulled image {}", image.canonical);
        Ok(())
    }

    async fn scan_images(&self) -> BackendResult<HashMap<String, String>> {
        let options = ListImagesOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = self.client.list_images(Some(options)).await?;
        let mut images = HashMap::new();
        for summary in summaries {
            let digest = summary
                .repo_digests
                .first()
                .cloned()
                .unwrap_or_else(|| summary.id.clone());
            for repo_tag in summary.repo_tags {
                if repo_tag != "<none>:<none>" {
                    images.insert(repo_tag, digest.clone());
                }
            }
        }
        Ok(images)
    }

    async fn destroy_kernel(
        &self,
        kernel_id: &KernelId,
        container_id: Option<&ContainerId>,
    ) -> BackendResult<Option<serde_json::Value>> {
        let target = container_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| Self::container_name(kernel_id));

        // Graceful stop first; the daemon escalates to SIGKILL after the
        // timeout on its own.
        let options = StopContainerOptions { t: 3 };
        match self.client.stop_container(&target, Some(options)).await {
            Ok(_) => {}
            Err(error) if Self::is_not_found(&error) => {
                debug!("Container {} already gone", target);
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                // Already stopped.
            }
            Err(error) => return Err(BackendError::Docker(error)),
        }
        Ok(None)
    }

    async fn clean_kernel(
        &self,
        kernel_id: &KernelId,
        container_id: Option<&ContainerId>,
        restarting: bool,
    ) -> BackendResult<()> {
        let target = container_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| Self::container_name(kernel_id));
        let options = RemoveContainerOptions {
            force: true,
            v: false,
            ..Default::default()
        };
        match self.client.remove_container(&target, Some(options)).await {
            Ok(_) => {
                info!("Removed container {}", target);
            }
            Err(error) if Self::is_not_found(&error) => {
                debug!("Container {} doesn't exist, nothing to remove", target);
            }
            Err(error) => return Err(BackendError::Docker(error)),
        }

        if !restarting {
            let scratch = self.scratch_dir(kernel_id);
            if let Err(error) = tokio::fs::remove_dir_all(&scratch).await {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove scratch {}: {}", scratch.display(), error);
                }
            }
        }
        Ok(())
    }

    async fn log_stream(
        &self,
        container_id: &ContainerId,
    ) -> BackendResult<BoxStream<'static, Bytes>> {
        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        let target = container_id.to_string();
        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                ..Default::default()
            };
            let mut stream = client.logs(&target, Some(options));
            while let Some(result) = stream.next().await {
                match result {
                    Ok(output) => {
                        if tx.send(output.into_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!("Error reading logs of {}: {}", target, error);
                        break;
                    }
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn create_overlay_network(&self, network_name: &str) -> BackendResult<()> {
        let options = CreateNetworkOptions {
            name: network_name,
            driver: "overlay",
            attachable: true,
            ..Default::default()
        };
        self.client.create_network(options).await?;
        Ok(())
    }

    async fn destroy_overlay_network(&self, network_name: &str) -> BackendResult<()> {
        self.client.remove_network(network_name).await?;
        Ok(())
    }

    async fn create_local_network(&self, network_name: &str) -> BackendResult<()> {
        let options = CreateNetworkOptions {
            name: network_name,
            driver: "bridge",
            ..Default::default()
        };
        self.client.create_network(options).await?;
        Ok(())
    }

    async fn destroy_local_network(&self, network_name: &str) -> BackendResult<()> {
        self.client.remove_network(network_name).await?;
        Ok(())
    }

    async fn prepare_resource_spec(
        &self,
        ctx: &KernelCreationContext,
    ) -> BackendResult<(KernelResourceSpec, HashMap<String, serde_json::Value>)> {
        if ctx.restarting {
            let stored = self
                .load_kernel_config(&ctx.kernel_id, "resource.msgpack")
                .await?;
            let mut spec: KernelResourceSpec =
                rmp_serde::from_slice(&stored).map_err(|e| BackendError::Other(e.to_string()))?;
            spec.thaw_for_replay();
            return Ok((spec, ctx.kernel_config.resource_opts.clone()));
        }
        let spec = KernelResourceSpec::new(ctx.kernel_config.resource_slots.clone());
        Ok((spec, ctx.kernel_config.resource_opts.clone()))
    }

    async fn prepare_scratch(&self, ctx: &KernelCreationContext) -> BackendResult<()> {
        let scratch = self.scratch_dir(&ctx.kernel_id);
        tokio::fs::create_dir_all(scratch.join("work")).await?;
        tokio::fs::create_dir_all(scratch.join("config")).await?;

        // Dotfiles requested by the manager land inside the work directory.
        if let Some(dotfiles) = ctx.internal_data.get("dotfiles").and_then(|v| v.as_array()) {
            for dotfile in dotfiles {
                let (Some(path), Some(data)) = (
                    dotfile.get("path").and_then(|v| v.as_str()),
                    dotfile.get("data").and_then(|v| v.as_str()),
                ) else {
                    continue;
                };
                let relative = path.trim_start_matches('/');
                let target = scratch.join("work").join(relative);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, data.as_bytes()).await?;
            }
        }
        Ok(())
    }

    async fn get_intrinsic_mounts(
        &self,
        ctx: &KernelCreationContext,
    ) -> BackendResult<Vec<Mount>> {
        let scratch = self.scratch_dir(&ctx.kernel_id);
        Ok(vec![
            Mount::bind(
                scratch.join("work"),
                "/home/work",
                crate::resources::MountPermission::ReadWrite,
            ),
            Mount::bind(
                scratch.join("config"),
                "/home/config",
                crate::resources::MountPermission::ReadOnly,
            ),
        ])
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
        ctx: &KernelCreationContext,
        cluster_info: &ClusterInfo,
    ) -> BackendResult<()> {
        let Some(keypair) = &cluster_info.ssh_keypair else {
            return Ok(());
        };
        let ssh_dir = self.scratch_dir(&ctx.kernel_id).join("work").join(".ssh");
        tokio::fs::create_dir_all(&ssh_dir).await?;
        tokio::fs::write(ssh_dir.join("authorized_keys"), &keypair.public_key).await?;
        tokio::fs::write(ssh_dir.join("id_cluster"), &keypair.private_key).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700)).await?;
            tokio::fs::set_permissions(
                ssh_dir.join("authorized_keys"),
                std::fs::Permissions::from_mode(0o600),
            )
            .await?;
            tokio::fs::set_permissions(
                ssh_dir.join("id_cluster"),
                std::fs::Permissions::from_mode(0o600),
            )
            .await?;
        }
        Ok(())
    }

    async fn process_mounts(
        &self,
        _ctx: &KernelCreationContext,
        mounts: &[Mount],
    ) -> BackendResult<()> {
        for mount in mounts {
            if mount.kind == MountType::Bind && !mount.is_unmanaged {
                if !tokio::fs::try_exists(&mount.source).await.unwrap_or(false) {
                    warn!("Mount source missing: {}", mount.source.display());
                }
            }
        }
        Ok(())
    }

    async fn apply_accelerator_allocation(
        &self,
        _ctx: &KernelCreationContext,
        plugin: &dyn ComputePlugin,
        device_alloc: &DeviceSlotAllocation,
    ) -> BackendResult<()> {
        debug!(
            family = %plugin.key(),
            devices = device_alloc.values().map(|d| d.len()).sum::<usize>(),
            "accelerator allocation applied"
        );
        Ok(())
    }

    async fn spawn(
        &self,
        ctx: &KernelCreationContext,
        spawn_spec: SpawnSpec,
    ) -> BackendResult<Arc<Kernel>> {
        let spec = &spawn_spec.resource_spec;
        let name = Self::container_name(&ctx.kernel_id);

        let env_vars: Vec<String> = spawn_spec
            .environ
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for (container_port, host_port) in &spawn_spec.port_bindings {
            let key = format!("{}/tcp", container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let mounts: Vec<bollard::models::Mount> = spec
            .mounts
            .iter()
            .map(|mount| bollard::models::Mount {
                target: Some(mount.target.to_string_lossy().into_owned()),
                source: Some(mount.source.to_string_lossy().into_owned()),
                typ: Some(match mount.kind {
                    MountType::Bind => MountTypeEnum::BIND,
                    MountType::Volume => MountTypeEnum::VOLUME,
                }),
                read_only: Some(mount.permission == crate::resources::MountPermission::ReadOnly),
                ..Default::default()
            })
            .collect();

        let mut container_labels = HashMap::new();
        container_labels.insert(labels::KERNEL_ID.to_string(), ctx.kernel_id.to_string());
        container_labels.insert(
            labels::KERNELSPEC.to_string(),
            ctx.kspec_version.to_string(),
        );
        container_labels.insert(
            RESOURCE_ALLOCATIONS_LABEL.to_string(),
            serde_json::to_string(&spec.allocations)
                .map_err(|e| BackendError::Other(e.to_string()))?,
        );

        let memory_limit = spec
            .slots
            .get(&crate::resources::SlotName::from("mem"))
            .and_then(|amount| amount.to_i64());
        let cpuset: Option<String> = spec
            .allocations
            .get(&crate::resources::DeviceName::from("cpu"))
            .and_then(|family| family.get(&crate::resources::SlotName::from("cpu")))
            .map(|per_device| {
                per_device
                    .keys()
                    .map(|device| device.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .filter(|set| !set.is_empty());
        let shm_size = spawn_spec
            .resource_opts
            .get("shmem")
            .and_then(|value| value.as_i64());

        let host_config = HostConfig {
            mounts: Some(mounts),
            port_bindings: Some(port_bindings),
            memory: memory_limit,
            cpuset_cpus: cpuset,
            shm_size,
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            network_mode: ctx.network_name.clone(),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                ..Default::default()
            }),
            ..Default::default()
        };

        let uid_match = ctx
            .kernel_features
            .contains(crate::kernel::features::UID_MATCH);
        let user = uid_match.then(|| {
            format!(
                "{}:{}",
                self.config.container.kernel_uid, self.config.container.kernel_gid
            )
        });

        let container_config = Config {
            hostname: Some(ctx.kernel_id.to_string()),
            user,
            env: Some(env_vars),
            image: Some(ctx.kernel_config.image.canonical.clone()),
            cmd: Some(spawn_spec.cmdargs.clone()),
            exposed_ports: Some(exposed_ports),
            labels: Some(container_labels),
            working_dir: Some("/home/work".to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let created = self
            .client
            .create_container(Some(options), container_config)
            .await?;
        self.client
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|error| {
                warn!("Failed to start container {}: {}", name, error);
                BackendError::Docker(error)
            })?;
        info!("Started container {} for kernel {}", created.id, ctx.kernel_id);

        let repl_in_port = binding_for(&spawn_spec.port_bindings, 2000);
        let repl_out_port = binding_for(&spawn_spec.port_bindings, 2001);
        let host_ports = spawn_spec
            .port_bindings
            .iter()
            .map(|(_, host_port)| *host_port)
            .collect();

        let kernel = Arc::new(Kernel::new(
            ctx.kernel_id.clone(),
            ctx.session_id.clone(),
            ContainerId(created.id),
            ctx.kernel_config.cluster_role.clone(),
            ctx.kernel_config.image.canonical.clone(),
            KERNEL_HOST.to_string(),
            repl_in_port,
            repl_out_port,
            host_ports,
            spawn_spec.service_ports.clone(),
            spawn_spec.resource_spec.clone(),
        ));

        // The runner inside the container needs a moment to bind its REPL
        // ports after the bootstrap script runs.
        let mut attempt = 0;
        loop {
            match KernelRunner::connect(
                ctx.kernel_id.clone(),
                KERNEL_HOST,
                repl_in_port,
                repl_out_port,
                Duration::from_secs(ctx.kernel_config.exec_timeout),
                [ClientFeature::Input, ClientFeature::Continuation]
                    .into_iter()
                    .collect(),
            )
            .await
            {
                Ok(runner) => {
                    kernel.attach_runner(Arc::new(runner));
                    break;
                }
                Err(error) if attempt < RUNNER_CONNECT_ATTEMPTS => {
                    attempt += 1;
                    debug!(
                        "Runner not reachable yet for kernel {} (attempt {}): {}",
                        ctx.kernel_id, attempt, error
                    );
                    tokio::time::sleep(RUNNER_CONNECT_DELAY).await;
                }
                Err(error) => {
                    warn!(
                        "Giving up connecting runner for kernel {}: {}",
                        ctx.kernel_id, error
                    );
                    break;
                }
            }
        }

        Ok(kernel)
    }

    async fn accept_file(
        &self,
        kernel_id: &KernelId,
        filename: &str,
        data: &[u8],
    ) -> BackendResult<()> {
        let target = self.work_path(kernel_id, filename)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, data).await?;
        Ok(())
    }

    async fn download_file(
        &self,
        kernel_id: &KernelId,
        filepath: &str,
    ) -> BackendResult<Vec<u8>> {
        let target = self.work_path(kernel_id, filepath)?;
        Ok(tokio::fs::read(&target).await?)
    }

    async fn list_files(
        &self,
        kernel_id: &KernelId,
        path: &str,
    ) -> BackendResult<serde_json::Value> {
        let target = self.work_path(kernel_id, path)?;
        let mut entries = tokio::fs::read_dir(&target).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            files.push(serde_json::json!({
                "filename": entry.file_name().to_string_lossy(),
                "size": metadata.len(),
                "mode": if metadata.is_dir() { "dir" } else { "file" },
            }));
        }
        Ok(serde_json::json!({ "files": files, "abspath": target.to_string_lossy() }))
    }

    async fn load_kernel_config(&self, kernel_id: &KernelId, name: &str) -> BackendResult<Vec<u8>> {
        let path = self.scratch_dir(kernel_id).join("config").join(name);
        Ok(tokio::fs::read(path).await?)
    }

    async fn store_kernel_config(
        &self,
        kernel_id: &KernelId,
        name: &str,
        data: &[u8],
    ) -> BackendResult<()> {
        let dir = self.scratch_dir(kernel_id).join("config");
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(name), data).await?;
        Ok(())
    }
}

fn binding_for(port_bindings: &[(u16, u16)], container_port: u16) -> u16 {
    port_bindings
        .iter()
        .find(|(port, _)| *port == container_port)
        .map(|(_, host_port)| *host_port)
        .unwrap_or(0)
}
