//! The staged kernel creation pipeline
//!
//! Stages run strictly in order; any failure before the backend spawn
//! succeeds releases every reservation made within the same call. The
//! assembled resource spec is frozen and persisted before the spawn so a
//! crash mid-spawn still permits cleanup and restarts can replay it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::backend::{KernelCreationContext, SpawnSpec};
use crate::error::{AgentError, Result};
use crate::kernel::{features, labels, match_krunner_volume};
use crate::resources::{
    DeviceName, DeviceSlotAllocation, InsufficientResource, KernelResourceSpec, Mount,
    MountPermission, SlotName,
};
use crate::types::{
    ClusterInfo, KernelCreationConfig, KernelCreationResult, KernelId, ServicePort,
    ServicePortProtocol, SessionId,
};

use super::Agent;

/// Fixed REPL channel ports inside every kernel container.
const REPL_IN_PORT: u16 = 2000;
const REPL_OUT_PORT: u16 = 2001;
const SSHD_PORT: u16 = 2200;
const TTYD_PORT: u16 = 7681;

/// Reservations to undo when a later stage fails before the spawn.
#[derive(Default)]
struct CreationRollback {
    allocations: IndexMap<DeviceName, DeviceSlotAllocation>,
    host_ports: Vec<u16>,
}

impl Agent {
    /// Create a new kernel (or re-create one on the restart path).
    pub async fn create_kernel(
        self: &Arc<Self>,
        session_id: SessionId,
        kernel_id: KernelId,
        kernel_config: KernelCreationConfig,
        cluster_info: ClusterInfo,
        restarting: bool,
    ) -> Result<KernelCreationResult> {
        if !restarting {
            self.producer
                .produce_event("kernel_preparing", vec![json!(kernel_id.as_str())])
                .await
                .map_err(AgentError::from)?;
        }

        let mut ctx =
            KernelCreationContext::new(kernel_id.clone(), session_id, kernel_config, restarting);
        let mut environ: HashMap<String, String> = ctx.kernel_config.environ.clone();
        if ctx.kernel_features.contains(features::UID_MATCH) {
            environ.insert(
                "LOCAL_USER_ID".into(),
                self.config.container.kernel_uid.to_string(),
            );
            environ.insert(
                "LOCAL_GROUP_ID".into(),
                self.config.container.kernel_gid.to_string(),
            );
        }
        environ.extend(self.backend.get_extra_envs(&ctx).await?);

        let do_pull = self
            .backend
            .check_image(&ctx.kernel_config.image, ctx.kernel_config.auto_pull)
            .await?;
        if do_pull {
            self.producer
                .produce_event(
                    "kernel_pulling",
                    vec![json!(kernel_id.as_str()), json!(ctx.image_ref)],
                )
                .await
                .map_err(AgentError::from)?;
            self.backend.pull_image(&ctx.kernel_config.image).await?;
        }

        if !restarting {
            self.producer
                .produce_event("kernel_creating", vec![json!(kernel_id.as_str())])
                .await
                .map_err(AgentError::from)?;
        }

        let (mut resource_spec, resource_opts) =
            self.backend.prepare_resource_spec(&ctx).await?;
        for mount in self.backend.get_intrinsic_mounts(&ctx).await? {
            resource_spec.push_mount(mount);
        }

        let mut rollback = CreationRollback::default();
        let outcome = self
            .assemble_and_spawn(
                &mut ctx,
                &mut resource_spec,
                resource_opts,
                environ,
                &cluster_info,
                &mut rollback,
            )
            .await;
        match outcome {
            Ok(result) => Ok(result),
            Err(error) => {
                self.undo_reservations(rollback).await;
                Err(error)
            }
        }
    }

    /// Stages 7..18: everything that must compensate its reservations when a
    /// later stage fails before the spawn succeeded.
    async fn assemble_and_spawn(
        self: &Arc<Self>,
        ctx: &mut KernelCreationContext,
        resource_spec: &mut KernelResourceSpec,
        resource_opts: HashMap<String, serde_json::Value>,
        mut environ: HashMap<String, String>,
        cluster_info: &ClusterInfo,
        rollback: &mut CreationRollback,
    ) -> Result<KernelCreationResult> {
        let kernel_id = ctx.kernel_id.clone();

        // Slot reservation, one device family at a time. On shortage, free
        // what this call already took and surface the shortfall.
        if !ctx.restarting {
            let mut resources = self.resources.lock().await;
            for dev_name in resource_spec.device_names() {
                let device_slots: IndexMap<SlotName, Decimal> = resource_spec
                    .slots
                    .iter()
                    .filter(|(slot, _)| slot.device_name() == dev_name)
                    .map(|(slot, amount)| (slot.clone(), *amount))
                    .collect();
                let context = resources.computers.get_mut(&dev_name).ok_or_else(|| {
                    AgentError::InvalidConfig(format!("unknown device family: {}", dev_name))
                })?;
                match context.alloc_map.allocate(&device_slots, dev_name.as_str()) {
                    Ok(allocation) => {
                        resource_spec
                            .allocations
                            .insert(dev_name.clone(), allocation.clone());
                        rollback.allocations.insert(dev_name, allocation);
                    }
                    Err(shortfall) => {
                        info!(
                            "insufficient resource: {:?} of {} (alloc map: {:?})",
                            device_slots,
                            dev_name,
                            context.alloc_map.allocations()
                        );
                        // Roll back the families reserved earlier in this
                        // call before surfacing.
                        for (name, allocation) in rollback.allocations.drain(..) {
                            if let Some(other) = resources.computers.get_mut(&name) {
                                other.alloc_map.free(&allocation);
                            }
                        }
                        return Err(AgentError::InsufficientResource(shortfall));
                    }
                }
            }
        }

        self.backend.prepare_scratch(ctx).await?;
        self.backend.apply_network(ctx, cluster_info).await?;
        self.backend.install_ssh_keypair(ctx, cluster_info).await?;

        self.mount_vfolders(ctx, resource_spec)?;
        self.mount_krunner(ctx, resource_spec, &mut environ).await?;

        // Core-count env variables listed by the image.
        let cpu_core_count = resource_spec
            .allocations
            .get(&DeviceName::from("cpu"))
            .and_then(|family| family.get(&SlotName::from("cpu")))
            .map(|per_device| per_device.len())
            .unwrap_or(0);
        if let Some(raw) = ctx.image_labels().get(labels::ENVS_CORECOUNT) {
            for name in raw.split(',').filter(|name| !name.is_empty()) {
                environ.insert(name.trim().to_string(), cpu_core_count.to_string());
            }
        }

        self.backend.process_mounts(ctx, &resource_spec.mounts).await?;

        let mut attached_devices = HashMap::new();
        {
            let resources = self.resources.lock().await;
            for (dev_name, allocation) in &resource_spec.allocations {
                if let Some(context) = resources.computers.get(dev_name) {
                    attached_devices.insert(
                        dev_name.to_string(),
                        context.instance.get_attached_devices(allocation).await?,
                    );
                }
            }
        }

        // Port plan: REPL pair, then the service ports of the lead kernel.
        let mut exposed_ports: Vec<u16> = vec![REPL_IN_PORT, REPL_OUT_PORT];
        let mut service_ports: Vec<ServicePort> = Vec::new();
        if matches!(ctx.kernel_config.cluster_role.as_str(), "main" | "master") {
            let mut port_map: IndexMap<String, ServicePort> = IndexMap::new();
            for sport in parse_service_ports(
                ctx.image_labels()
                    .get(labels::SERVICE_PORTS)
                    .map(String::as_str)
                    .unwrap_or(""),
            ) {
                port_map.insert(sport.name.clone(), sport);
            }
            port_map.insert(
                "sshd".into(),
                ServicePort {
                    name: "sshd".into(),
                    protocol: ServicePortProtocol::Tcp,
                    container_ports: vec![SSHD_PORT],
                    host_ports: vec![None],
                },
            );
            port_map.insert(
                "ttyd".into(),
                ServicePort {
                    name: "ttyd".into(),
                    protocol: ServicePortProtocol::Http,
                    container_ports: vec![TTYD_PORT],
                    host_ports: vec![None],
                },
            );
            for preopen in &ctx.kernel_config.preopen_ports {
                let sport = ServicePort {
                    name: preopen.to_string(),
                    protocol: ServicePortProtocol::Preopen,
                    container_ports: vec![*preopen],
                    host_ports: vec![None],
                };
                exposed_ports.extend(&sport.container_ports);
                service_ports.push(sport);
            }
            for sport in port_map.into_values() {
                exposed_ports.extend(&sport.container_ports);
                service_ports.push(sport);
            }
            debug!("exposed ports: {:?}", exposed_ports);
        }

        let host_ports = {
            let mut resources = self.resources.lock().await;
            resources
                .port_pool
                .allocate_many(exposed_ports.len())
                .ok_or_else(|| {
                    AgentError::InsufficientResource(InsufficientResource {
                        context: "host-ports".into(),
                        slot: SlotName::from("port"),
                        requested: Decimal::from(exposed_ports.len()),
                        available: Decimal::from(resources.port_pool.available()),
                    })
                })?
        };
        rollback.host_ports = host_ports.clone();
        let port_bindings: Vec<(u16, u16)> = exposed_ports
            .iter()
            .copied()
            .zip(host_ports.iter().copied())
            .collect();
        for sport in &mut service_ports {
            sport.host_ports = sport
                .container_ports
                .iter()
                .map(|container_port| {
                    port_bindings
                        .iter()
                        .find(|(exposed, _)| exposed == container_port)
                        .map(|(_, host_port)| *host_port)
                })
                .collect();
        }

        let cmdargs = self.build_cmdargs(ctx)?;

        // Persist before spawn: a crash between here and the spawn leaves
        // enough on disk to clean up and to replay a restart.
        resource_spec.freeze();
        self.backend
            .store_kernel_config(
                &kernel_id,
                "kconfig.dat",
                &rmp_serde::to_vec_named(&ctx.kernel_config)
                    .map_err(|e| AgentError::Internal(e.to_string()))?,
            )
            .await?;
        if !ctx.restarting {
            self.backend
                .store_kernel_config(
                    &kernel_id,
                    "cluster.json",
                    &serde_json::to_vec(cluster_info)
                        .map_err(|e| AgentError::Internal(e.to_string()))?,
                )
                .await?;
        }
        self.backend
            .store_kernel_config(
                &kernel_id,
                "resource.msgpack",
                &rmp_serde::to_vec_named(&resource_spec)
                    .map_err(|e| AgentError::Internal(e.to_string()))?,
            )
            .await?;

        let spawn_spec = SpawnSpec {
            resource_spec: resource_spec.clone(),
            resource_opts,
            environ,
            service_ports: service_ports.clone(),
            port_bindings,
            cmdargs,
        };
        let kernel = self.backend.spawn(ctx, spawn_spec).await?;
        // Spawn succeeded: reservations now belong to the kernel.
        rollback.allocations.clear();
        rollback.host_ports.clear();

        self.registry.insert(kernel_id.clone(), kernel.clone());
        debug!(
            "kernel repl-in address: {}:{}",
            kernel.kernel_host, kernel.repl_in_port
        );
        debug!(
            "kernel repl-out address: {}:{}",
            kernel.kernel_host, kernel.repl_out_port
        );

        // Wait for the in-container bootstrap, then refresh the service-port
        // metadata with what the runner actually serves.
        if let Some(runner) = kernel.runner() {
            runner.check_status().await.map_err(AgentError::from)?;
            let live_services = runner.get_service_apps().await.map_err(AgentError::from)?;
            if live_services["status"] != "failed" {
                let live: Vec<ServicePort> = live_services["data"]
                    .as_array()
                    .map(|apps| {
                        apps.iter()
                            .filter_map(|app| serde_json::from_value(app.clone()).ok())
                            .collect()
                    })
                    .unwrap_or_default();
                kernel.update_service_ports(&live);
            }
        }
        debug!("service ports: {:?}", kernel.service_ports());

        Ok(KernelCreationResult {
            id: kernel_id,
            kernel_host: kernel.kernel_host.clone(),
            repl_in_port: kernel.repl_in_port,
            repl_out_port: kernel.repl_out_port,
            stdin_port: kernel.stdin_port,
            stdout_port: kernel.stdout_port,
            service_ports: kernel.service_ports(),
            container_id: kernel.container_id.clone(),
            resource_spec: resource_spec.to_json(),
            attached_devices,
        })
    }

    async fn undo_reservations(&self, rollback: CreationRollback) {
        if rollback.allocations.is_empty() && rollback.host_ports.is_empty() {
            return;
        }
        let mut resources = self.resources.lock().await;
        for (dev_name, allocation) in &rollback.allocations {
            if let Some(context) = resources.computers.get_mut(dev_name) {
                context.alloc_map.free(allocation);
            }
        }
        for port in rollback.host_ports {
            resources.port_pool.release(port);
        }
    }

    /// User volume-folder mounts: bind sources resolved against the managed
    /// mount root unless an unmanaged host path was given; targets default
    /// to `/home/work/<name>` with optional overrides kept under
    /// `/home/work/`.
    fn mount_vfolders(
        &self,
        ctx: &KernelCreationContext,
        resource_spec: &mut KernelResourceSpec,
    ) -> Result<()> {
        let prevent_mounts = ctx
            .internal_data
            .get("prevent_vfolder_mounts")
            .and_then(|value| value.as_bool())
            .unwrap_or(false);
        for folder in &ctx.kernel_config.mounts {
            // Restricted kernels may only see their log folder.
            if prevent_mounts && folder.name != ".logs" {
                continue;
            }
            let mut is_unmanaged = false;
            let host_path = match &folder.host_path {
                Some(raw) => {
                    is_unmanaged = true;
                    raw.clone()
                }
                None => {
                    let id_path = Path::new(&folder.id);
                    if id_path.is_absolute() {
                        // Storage-proxy-provided path, used as-is.
                        id_path.to_path_buf()
                    } else {
                        self.config
                            .vfolder
                            .mount
                            .join(&folder.host)
                            .join(&self.config.vfolder.fsprefix)
                            .join(&folder.id)
                    }
                }
            };
            let kernel_path = match ctx.kernel_config.mount_map.get(&folder.name) {
                Some(raw) => {
                    if !raw.starts_with("/home/work/") {
                        return Err(AgentError::InvalidConfig(format!(
                            "error while mounting {} to {}: all vfolder mounts should be under /home/work",
                            folder.name, raw
                        )));
                    }
                    PathBuf::from(raw)
                }
                None => PathBuf::from(format!("/home/work/{}", folder.name)),
            };
            let mut mount = Mount::bind(host_path, kernel_path, folder.permission);
            mount.is_unmanaged = is_unmanaged;
            resource_spec.push_mount(mount);
        }
        Ok(())
    }

    /// The kernel-runner overlay: per-distro helper binaries, the runner
    /// volume, and the accelerator hook libraries, with `LD_PRELOAD` wired
    /// up for the hooks.
    async fn mount_krunner(
        &self,
        ctx: &KernelCreationContext,
        resource_spec: &mut KernelResourceSpec,
        environ: &mut HashMap<String, String>,
    ) -> Result<()> {
        let distro = ctx
            .image_labels()
            .get(labels::BASE_DISTRO)
            .cloned()
            .unwrap_or_else(|| "ubuntu16.04".to_string());
        let (matched_distro, krunner_volume) =
            match_krunner_volume(&self.config.container.krunner_volumes, &distro)?;
        let libc_style = if matched_distro.starts_with("alpine") {
            "musl"
        } else {
            "glibc"
        };
        let arch = std::env::consts::ARCH;
        let runner_dir = &self.config.container.runner_dir;

        // Python version of the runner volume, from a small text resource.
        let pyver_path = runner_dir.join(format!("krunner-python.{}.txt", matched_distro));
        let krunner_pyver = match tokio::fs::read_to_string(&pyver_path).await {
            Ok(raw) => raw.trim().to_string(),
            Err(_) => "3.6".to_string(),
        };
        debug!("selected krunner: {}", matched_distro);
        debug!("selected libc style: {}", libc_style);
        debug!("krunner volume: {}", krunner_volume);
        debug!("krunner python: {}", krunner_pyver);

        let ro = MountPermission::ReadOnly;
        let mut push = |source: PathBuf, target: &str| {
            resource_spec.push_mount(Mount::bind(source, target, ro));
        };

        if libc_style == "musl" {
            push(
                runner_dir.join("terminfo.alpine3.8"),
                "/home/work/.terminfo",
            );
        }
        push(
            runner_dir.join("extract_dotfiles.py"),
            "/opt/kernel/extract_dotfiles.py",
        );
        push(runner_dir.join("entrypoint.sh"), "/opt/kernel/entrypoint.sh");
        push(
            runner_dir.join(format!("su-exec.{}.{}.bin", matched_distro, arch)),
            "/opt/kernel/su-exec",
        );
        if self.config.container.sandbox_type == crate::config::SandboxType::Jail {
            push(
                runner_dir.join(format!("jail.{}.bin", matched_distro)),
                "/opt/kernel/jail",
            );
        }
        push(
            runner_dir.join(format!("libbaihook.{}.{}.so", matched_distro, arch)),
            "/opt/kernel/libbaihook.so",
        );
        push(
            runner_dir.join(format!("dropbear.{}.{}.bin", libc_style, arch)),
            "/opt/kernel/dropbear",
        );
        push(
            runner_dir.join(format!("dropbearconvert.{}.{}.bin", libc_style, arch)),
            "/opt/kernel/dropbearconvert",
        );
        push(
            runner_dir.join(format!("dropbearkey.{}.{}.bin", libc_style, arch)),
            "/opt/kernel/dropbearkey",
        );
        push(
            runner_dir.join(format!("tmux.{}.{}.bin", libc_style, arch)),
            "/opt/kernel/tmux",
        );
        push(
            runner_dir.join(format!("sftp-server.{}.{}.bin", matched_distro, arch)),
            "/usr/libexec/sftp-server",
        );
        push(
            runner_dir.join(format!("scp.{}.{}.bin", matched_distro, arch)),
            "/usr/bin/scp",
        );

        resource_spec.push_mount(Mount::volume(krunner_volume, "/opt/backend.ai", ro));
        let pylib = format!("/opt/backend.ai/lib/python{}/site-packages/", krunner_pyver);
        resource_spec.push_mount(Mount::bind(
            runner_dir.join("kernel"),
            format!("{}ai/backend/kernel", pylib),
            ro,
        ));
        resource_spec.push_mount(Mount::bind(
            runner_dir.join("helpers"),
            format!("{}ai/backend/helpers", pylib),
            ro,
        ));
        environ.insert("LD_PRELOAD".into(), "/opt/kernel/libbaihook.so".into());

        // Accelerator hook libraries, each bound once under a randomized
        // name so concurrent kernels never collide.
        let mut injected: HashSet<PathBuf> = HashSet::new();
        let resources = self.resources.lock().await;
        let allocations = resource_spec.allocations.clone();
        for (dev_name, allocation) in &allocations {
            let Some(context) = resources.computers.get(dev_name) else {
                continue;
            };
            self.backend
                .apply_accelerator_allocation(ctx, context.instance.as_ref(), allocation)
                .await?;
            let alloc_sum: Decimal = allocation
                .values()
                .flat_map(|per_device| per_device.values())
                .copied()
                .sum();
            if alloc_sum <= Decimal::ZERO {
                continue;
            }
            let hooks = context.instance.get_hooks(&matched_distro, arch).await?;
            if !hooks.is_empty() {
                debug!(
                    "accelerator {} provides hooks: {:?}",
                    dev_name, hooks
                );
            }
            for hook_path in hooks {
                if !injected.insert(hook_path.clone()) {
                    continue;
                }
                let nonce: u64 = rand::random::<u64>() & 0xffff_ffff_ffff;
                let container_hook_path =
                    format!("/opt/kernel/lib{}{:012x}.so", dev_name, nonce);
                let mut mount = Mount::bind(hook_path, &container_hook_path, ro);
                mount.is_unmanaged = true;
                resource_spec.push_mount(mount);
                let preload = environ.entry("LD_PRELOAD".into()).or_default();
                preload.push(':');
                preload.push_str(&container_hook_path);
            }
        }
        Ok(())
    }

    /// Kernel command line: optional jail launcher prefix, then the runner
    /// module for the image's runtime type.
    fn build_cmdargs(&self, ctx: &KernelCreationContext) -> Result<Vec<String>> {
        let mut cmdargs: Vec<String> = Vec::new();
        if self.config.container.sandbox_type == crate::config::SandboxType::Jail {
            cmdargs.push("/opt/kernel/jail".into());
            cmdargs.push("-policy".into());
            cmdargs.push("/etc/backend.ai/jail/policy.yml".into());
            if let Some(jail_args) = &self.config.container.jail_args {
                let extra = shell_words::split(jail_args)
                    .map_err(|e| AgentError::InvalidConfig(format!("bad jail-args: {}", e)))?;
                cmdargs.extend(extra);
            }
        }
        cmdargs.push("/opt/backend.ai/bin/python".into());
        cmdargs.push("-m".into());
        cmdargs.push("ai.backend.kernel".into());
        cmdargs.push(
            ctx.image_labels()
                .get(labels::RUNTIME_TYPE)
                .cloned()
                .unwrap_or_else(|| "python".to_string()),
        );
        if let Some(runtime_path) = ctx.image_labels().get(labels::RUNTIME_PATH) {
            cmdargs.push(runtime_path.clone());
        }
        Ok(cmdargs)
    }
}

/// Parse the image's service-port declarations:
/// `name:protocol:port[,name:protocol:[p1,p2]]...`
pub fn parse_service_ports(raw: &str) -> Vec<ServicePort> {
    let mut ports = Vec::new();
    for item in split_top_level(raw) {
        let parts: Vec<&str> = item.splitn(3, ':').collect();
        if parts.len() != 3 {
            if !item.trim().is_empty() {
                warn!("ignoring malformed service-port entry: {}", item);
            }
            continue;
        }
        let protocol = match parts[1] {
            "tcp" => ServicePortProtocol::Tcp,
            "http" => ServicePortProtocol::Http,
            "pty" => ServicePortProtocol::Pty,
            "preopen" => ServicePortProtocol::Preopen,
            other => {
                warn!("ignoring service port with unknown protocol: {}", other);
                continue;
            }
        };
        let port_spec = parts[2].trim();
        let container_ports: Vec<u16> = if port_spec.starts_with('[') && port_spec.ends_with(']') {
            port_spec[1..port_spec.len() - 1]
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect()
        } else {
            port_spec.parse().ok().into_iter().collect()
        };
        if container_ports.is_empty() {
            warn!("ignoring service-port entry without ports: {}", item);
            continue;
        }
        ports.push(ServicePort {
            name: parts[0].trim().to_string(),
            protocol,
            host_ports: vec![None; container_ports.len()],
            container_ports,
        });
    }
    ports
}

/// Split on commas that are not inside a bracketed port list.
fn split_top_level(raw: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in raw.chars() {
        match ch {
            '[' => {
                depth += 1;
                current.push(ch);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                items.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        items.push(current);
    }
    items
}
