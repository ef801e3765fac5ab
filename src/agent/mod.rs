//! The per-node agent
//!
//! Owns the kernel registry and serializes every lifecycle transition
//! through a single-consumer event queue. Creation goes through the staged
//! pipeline in `creation`; everything else the manager calls lands on the
//! methods of `Agent`.

mod creation;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::ContainerBackend;
use crate::bus::MessageBus;
use crate::config::Configuration;
use crate::error::{AgentError, Result};
use crate::events::EventProducer;
use crate::kernel::runner::{RunMode, RunStatus};
use crate::kernel::{labels, Kernel, KernelSnapshot, MAX_KERNELSPEC, MIN_KERNELSPEC};
use crate::ports::PortPool;
use crate::resources::{ComputePlugin, ComputerContext, DeviceName, SlotName};
use crate::stats::StatCollector;
use crate::system::{Flag, OnceEvent};
use crate::types::{
    ContainerId, ContainerLifecycleEvent, ContainerStatus, KernelId, LifecycleEvent, SessionId,
};

/// Error reporting collaborator; implementations forward to an external
/// monitor. Handler failures are reported here and swallowed so the
/// lifecycle loop never dies.
#[async_trait]
pub trait ErrorMonitor: Send + Sync {
    async fn capture(&self, context: &str, error: &AgentError);
}

/// Default monitor: structured logging only.
pub struct LogErrorMonitor;

#[async_trait]
impl ErrorMonitor for LogErrorMonitor {
    async fn capture(&self, context: &str, error: &AgentError) {
        error!("{}: {}", context, error);
    }
}

/// Book-keeping of one in-progress restart.
pub struct RestartTracker {
    pub request_lock: tokio::sync::Mutex<()>,
    pub destroy_done: Flag,
    pub done: Flag,
}

impl RestartTracker {
    fn new() -> Self {
        Self {
            request_lock: tokio::sync::Mutex::new(()),
            destroy_done: Flag::new(),
            done: Flag::new(),
        }
    }
}

/// Shared resource bookkeeping guarded by one async mutex: slot allocation,
/// the host port pool, and the advertised totals.
pub struct ResourceState {
    pub computers: IndexMap<DeviceName, ComputerContext>,
    pub port_pool: PortPool,
    pub slots: IndexMap<SlotName, Decimal>,
}

enum LifecycleItem {
    Event(ContainerLifecycleEvent),
    /// Clean shutdown: persist the registry and stop the consumer.
    Sentinel,
}

const RESTART_DESTROY_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Agent {
    pub(crate) config: Arc<Configuration>,
    pub(crate) backend: Arc<dyn ContainerBackend>,
    pub(crate) producer: Arc<EventProducer>,
    stat_collector: Arc<dyn StatCollector>,
    pub(crate) error_monitor: Arc<dyn ErrorMonitor>,

    pub(crate) registry: DashMap<KernelId, Arc<Kernel>>,
    pub(crate) resources: tokio::sync::Mutex<ResourceState>,
    images: parking_lot::RwLock<HashMap<String, String>>,
    restarting_kernels: DashMap<KernelId, Arc<RestartTracker>>,

    lifecycle_tx: mpsc::UnboundedSender<LifecycleItem>,
    lifecycle_rx: Mutex<Option<mpsc::UnboundedReceiver<LifecycleItem>>>,
    lifecycle_done: OnceEvent<()>,
    lifecycle_handle: Mutex<Option<JoinHandle<()>>>,
    timer_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    pub async fn new(
        config: Arc<Configuration>,
        backend: Arc<dyn ContainerBackend>,
        bus: Arc<dyn MessageBus>,
        plugins: Vec<Arc<dyn ComputePlugin>>,
        stat_collector: Arc<dyn StatCollector>,
        error_monitor: Arc<dyn ErrorMonitor>,
    ) -> Result<Arc<Self>> {
        let mut computers = IndexMap::new();
        let mut slots = IndexMap::new();
        for plugin in plugins {
            let devices = plugin.list_devices().await?;
            let alloc_map = plugin.create_alloc_map().await?;
            for (slot, amount) in plugin.available_slots().await? {
                slots.insert(slot, amount);
            }
            computers.insert(
                plugin.key(),
                ComputerContext {
                    instance: plugin,
                    devices,
                    alloc_map,
                },
            );
        }

        let (low, high) = config.container.port_range;
        let producer = Arc::new(EventProducer::new(
            bus,
            config.agent.id.clone(),
            config.debug.log_heartbeats,
        ));
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            config,
            backend,
            producer,
            stat_collector,
            error_monitor,
            registry: DashMap::new(),
            resources: tokio::sync::Mutex::new(ResourceState {
                computers,
                port_pool: PortPool::new(low, high),
                slots,
            }),
            images: parking_lot::RwLock::new(HashMap::new()),
            restarting_kernels: DashMap::new(),
            lifecycle_tx,
            lifecycle_rx: Mutex::new(Some(lifecycle_rx)),
            lifecycle_done: OnceEvent::new(),
            lifecycle_handle: Mutex::new(None),
            timer_tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent.id
    }

    /// Start the lifecycle consumer, run the boot-time scan, and install the
    /// periodic timers.
    pub async fn start(self: &Arc<Self>, skip_initial_scan: bool) -> Result<()> {
        let receiver = self
            .lifecycle_rx
            .lock()
            .take()
            .ok_or_else(|| AgentError::Internal("agent already started".into()))?;
        let consumer = {
            let agent = self.clone();
            tokio::spawn(agent.process_lifecycle_events(receiver))
        };
        *self.lifecycle_handle.lock() = Some(consumer);

        if !skip_initial_scan {
            match self.backend.scan_images().await {
                Ok(images) => *self.images.write() = images,
                Err(error) => warn!("initial image scan failed: {}", error),
            }
            self.scan_running_kernels().await?;
        }

        self.spawn_timer("image-scan", Duration::from_secs(20), |agent| async move {
            let images = agent.backend.scan_images().await?;
            *agent.images.write() = images;
            Ok(())
        });
        self.spawn_timer("node-stats", Duration::from_secs(5), |agent| async move {
            if agent.config.debug.log_stats {
                debug!("collecting node statistics");
            }
            agent.stat_collector.collect_node_stat().await
        });
        self.spawn_timer("container-stats", Duration::from_secs(5), |agent| async move {
            agent.collect_container_stats().await
        });
        self.spawn_timer("heartbeat", Duration::from_secs(3), |agent| async move {
            agent.heartbeat().await
        });
        self.spawn_timer("reconcile", Duration::from_secs(10), |agent| async move {
            agent.sync_container_lifecycles().await
        });

        self.producer
            .produce_event("instance_started", vec![json!("self-started")])
            .await
            .map_err(AgentError::from)?;
        Ok(())
    }

    /// Orderly shutdown: close runners, optionally destroy all kernels,
    /// stop the timers, then stop the consumer through the sentinel so the
    /// registry is persisted.
    pub async fn shutdown(&self, terminate_kernels: bool) {
        let kernels: Vec<Arc<Kernel>> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for kernel in kernels {
            kernel.close_runner().await;
        }
        if terminate_kernels {
            self.clean_all_kernels(true).await;
        }

        let timers = std::mem::take(&mut *self.timer_tasks.lock());
        for timer in &timers {
            timer.abort();
        }
        for timer in timers {
            if let Err(join_error) = timer.await {
                if !join_error.is_cancelled() {
                    error!("timer cancellation error: {}", join_error);
                }
            }
        }

        let _ = self.lifecycle_tx.send(LifecycleItem::Sentinel);
        self.lifecycle_done.wait().await;

        if let Err(error) = self
            .producer
            .produce_event("instance_terminated", vec![json!("shutdown")])
            .await
        {
            warn!("failed to announce termination: {}", error);
        }
    }

    fn spawn_timer<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, body: F)
    where
        F: Fn(Arc<Agent>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let agent = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(error) = body(agent.clone()).await {
                    error!("periodic task {} failed: {}", name, error);
                    agent.error_monitor.capture(name, &error).await;
                }
            }
        });
        self.timer_tasks.lock().push(handle);
    }

    // ========================================================================
    // Lifecycle orchestrator
    // ========================================================================

    /// Post a lifecycle transition. When the kernel is registered, its
    /// sticky termination reason wins over the event's and the container id
    /// is taken from the handle (mismatches are warned and overridden).
    #[allow(clippy::too_many_arguments)]
    pub fn inject_lifecycle_event(
        &self,
        kernel_id: &KernelId,
        event: LifecycleEvent,
        reason: &str,
        container_id: Option<ContainerId>,
        exit_code: Option<i64>,
        done: Option<OnceEvent<Option<serde_json::Value>>>,
        clean_event: Option<OnceEvent<()>>,
    ) {
        let mut reason = reason.to_string();
        let mut container_id = container_id;
        if let Some(kernel) = self.registry.get(kernel_id) {
            if let Some(sticky) = kernel.termination_reason() {
                reason = sticky;
            }
            if let Some(clean_event) = clean_event {
                kernel.set_clean_event(clean_event);
            }
            if let Some(event_cid) = &container_id {
                if *event_cid != kernel.container_id {
                    warn!(
                        "container id mismatch for kernel {} (handle: {}, event: {})",
                        kernel_id, kernel.container_id, event_cid
                    );
                }
            }
            container_id = Some(kernel.container_id.clone());
        }
        let mut lifecycle_event =
            ContainerLifecycleEvent::new(kernel_id.clone(), container_id, event, reason);
        lifecycle_event.exit_code = exit_code;
        lifecycle_event.done = done;
        let _ = self.lifecycle_tx.send(LifecycleItem::Event(lifecycle_event));
    }

    async fn process_lifecycle_events(
        self: Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<LifecycleItem>,
    ) {
        while let Some(item) = receiver.recv().await {
            let event = match item {
                LifecycleItem::Sentinel => {
                    if let Err(error) = self.persist_registry().await {
                        error!("failed to persist the kernel registry: {}", error);
                    }
                    self.lifecycle_done.fire(());
                    return;
                }
                LifecycleItem::Event(event) => event,
            };
            info!("lifecycle event: {}", event);
            let agent = self.clone();
            match event.event {
                LifecycleEvent::Start => {
                    tokio::spawn(async move { agent.handle_start_event(event).await });
                }
                LifecycleEvent::Destroy => {
                    tokio::spawn(async move { agent.handle_destroy_event(event).await });
                }
                LifecycleEvent::Clean => {
                    tokio::spawn(async move { agent.handle_clean_event(event).await });
                }
            }
        }
    }

    async fn handle_start_event(&self, event: ContainerLifecycleEvent) {
        if let Some(kernel) = self.registry.get(&event.kernel_id) {
            kernel.set_stats_enabled(true);
        }
    }

    async fn handle_destroy_event(self: Arc<Self>, event: ContainerLifecycleEvent) {
        let work = async {
            let kernel = self
                .registry
                .get(&event.kernel_id)
                .map(|entry| entry.value().clone());
            match kernel {
                None => {
                    warn!(
                        "destroy_kernel(k:{}) kernel missing (already dead?)",
                        event.kernel_id
                    );
                    if event.container_id.is_none() {
                        if let Err(error) = self.rescan_resource_usage().await {
                            warn!("resource rescan failed: {}", error);
                        }
                        self.producer
                            .produce_event(
                                "kernel_terminated",
                                vec![
                                    json!(event.kernel_id.as_str()),
                                    json!("already-terminated"),
                                    json!(null),
                                ],
                            )
                            .await
                            .map_err(AgentError::from)?;
                        return Ok(None);
                    }
                    // A container we know nothing about: destroy it, then
                    // let the CLEAN handler finish the bookkeeping.
                    self.inject_lifecycle_event(
                        &event.kernel_id,
                        LifecycleEvent::Clean,
                        &event.reason,
                        event.container_id.clone(),
                        None,
                        None,
                        None,
                    );
                }
                Some(kernel) => {
                    kernel.set_stats_enabled(false);
                    kernel.set_termination_reason(&event.reason);
                    kernel.close_runner().await;
                }
            }
            let result = self
                .backend
                .destroy_kernel(&event.kernel_id, event.container_id.as_ref())
                .await?;
            Ok::<_, AgentError>(result)
        };
        let result = match work.await {
            Ok(result) => {
                // The backend only signals termination; removal happens in
                // the CLEAN handler it chains to.
                if self.registry.contains_key(&event.kernel_id) {
                    self.inject_lifecycle_event(
                        &event.kernel_id,
                        LifecycleEvent::Clean,
                        &event.reason,
                        event.container_id.clone(),
                        event.exit_code,
                        None,
                        None,
                    );
                }
                result
            }
            Err(error) => {
                error!("unhandled error while processing a DESTROY event: {}", error);
                self.error_monitor.capture("destroy-handler", &error).await;
                None
            }
        };
        if let Some(done) = &event.done {
            done.fire(result);
        }
    }

    async fn handle_clean_event(self: Arc<Self>, event: ContainerLifecycleEvent) {
        let work = async {
            let kernel = self
                .registry
                .get(&event.kernel_id)
                .map(|entry| entry.value().clone());
            if let Some(kernel) = &kernel {
                kernel.close_runner().await;
            }
            if let Some(container_id) = &event.container_id {
                match self.backend.log_stream(container_id).await {
                    Ok(stream) => {
                        let chunk_size = self.config.container.container_logs.chunk_size;
                        if let Err(error) = self
                            .producer
                            .ship_container_logs(&event.kernel_id, container_id, chunk_size, stream)
                            .await
                        {
                            warn!("failed to ship container logs: {}", error);
                        }
                    }
                    Err(error) => warn!("failed to open the container log stream: {}", error),
                }
            }
            let restarting = self.restarting_kernels.contains_key(&event.kernel_id);
            self.backend
                .clean_kernel(&event.kernel_id, event.container_id.as_ref(), restarting)
                .await?;
            Ok::<_, AgentError>(None)
        };
        let result = match work.await {
            Ok(result) => result,
            Err(error) => {
                error!("unhandled error while processing a CLEAN event: {}", error);
                self.error_monitor.capture("clean-handler", &error).await;
                None
            }
        };

        // Bookkeeping runs regardless of how the cleanup itself went.
        if let Some((_, kernel)) = self.registry.remove(&event.kernel_id) {
            {
                let mut resources = self.resources.lock().await;
                for port in &kernel.host_ports {
                    resources.port_pool.release(*port);
                }
            }
            kernel.close_runner().await;
            kernel.fire_clean_event();
        }
        if let Some(done) = &event.done {
            done.fire(result);
        }
        if let Some(tracker) = self.restarting_kernels.get(&event.kernel_id) {
            tracker.destroy_done.set();
        } else {
            if let Err(error) = self.rescan_resource_usage().await {
                warn!("resource rescan failed: {}", error);
            }
            if let Err(error) = self
                .producer
                .produce_event(
                    "kernel_terminated",
                    vec![
                        json!(event.kernel_id.as_str()),
                        json!(event.reason),
                        json!(null),
                    ],
                )
                .await
            {
                warn!("failed to announce kernel termination: {}", error);
            }
        }
    }

    async fn persist_registry(&self) -> Result<()> {
        let snapshots: Vec<KernelSnapshot> = self
            .registry
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        let path = self.registry_path();
        let encoded =
            rmp_serde::to_vec_named(&snapshots).map_err(|e| AgentError::Internal(e.to_string()))?;
        tokio::fs::write(&path, encoded).await?;
        info!(
            "persisted {} kernel(s) to {}",
            snapshots.len(),
            path.display()
        );
        Ok(())
    }

    fn registry_path(&self) -> std::path::PathBuf {
        self.config
            .agent
            .ipc_base_path
            .join(format!("last_registry.{}.dat", self.agent_id()))
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Re-derive the allocation maps from the containers the backend
    /// actually has.
    pub async fn rescan_resource_usage(&self) -> Result<()> {
        let mut resources = self.resources.lock().await;
        for context in resources.computers.values_mut() {
            context.alloc_map.clear();
        }
        let containers = self
            .backend
            .enumerate_containers(ContainerStatus::ACTIVE)
            .await?;
        for (_, container) in &containers {
            for context in resources.computers.values_mut() {
                let plugin = context.instance.clone();
                plugin
                    .restore_from_container(container, &mut context.alloc_map)
                    .await;
            }
        }
        Ok(())
    }

    /// Periodic diff of the registry against backend-observed containers.
    /// State changes flow through the lifecycle queue only.
    pub async fn sync_container_lifecycles(&self) -> Result<()> {
        let _resources = self.resources.lock().await;

        let mut alive: HashMap<KernelId, ContainerId> = HashMap::new();
        for (kernel_id, container) in self
            .backend
            .enumerate_containers(ContainerStatus::ACTIVE)
            .await?
        {
            alive.insert(kernel_id, container.id);
        }
        let mut known: HashMap<KernelId, ContainerId> = HashMap::new();
        for entry in self.registry.iter() {
            known.insert(entry.key().clone(), entry.value().container_id.clone());
        }

        // Registry has the kernel but its container is gone.
        for (kernel_id, container_id) in &known {
            if alive.contains_key(kernel_id) || self.restarting_kernels.contains_key(kernel_id) {
                continue;
            }
            let _ = self
                .lifecycle_tx
                .send(LifecycleItem::Event(ContainerLifecycleEvent::new(
                    kernel_id.clone(),
                    Some(container_id.clone()),
                    LifecycleEvent::Clean,
                    "self-terminated",
                )));
        }
        // A container not spawned by us (or forgotten after a crash).
        for (kernel_id, container_id) in &alive {
            if known.contains_key(kernel_id) || self.restarting_kernels.contains_key(kernel_id) {
                continue;
            }
            let _ = self
                .lifecycle_tx
                .send(LifecycleItem::Event(ContainerLifecycleEvent::new(
                    kernel_id.clone(),
                    Some(container_id.clone()),
                    LifecycleEvent::Destroy,
                    "terminated-unknown-container",
                )));
        }
        Ok(())
    }

    /// Boot-time scan: reload the persisted registry and reconcile it with
    /// the containers still present on the backend.
    pub async fn scan_running_kernels(&self) -> Result<()> {
        match tokio::fs::read(self.registry_path()).await {
            Ok(bytes) => {
                let snapshots: Vec<KernelSnapshot> = rmp_serde::from_slice(&bytes)
                    .map_err(|e| AgentError::Internal(e.to_string()))?;
                for snapshot in snapshots {
                    let kernel = Arc::new(Kernel::from(snapshot));
                    self.registry.insert(kernel.kernel_id.clone(), kernel);
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        let statuses: Vec<ContainerStatus> = ContainerStatus::ACTIVE
            .iter()
            .chain(ContainerStatus::DEAD)
            .copied()
            .collect();
        let containers = self.backend.enumerate_containers(&statuses).await?;
        {
            let mut resources = self.resources.lock().await;
            for (kernel_id, container) in &containers {
                if container.status.is_active() {
                    let kernelspec: u32 = container
                        .labels
                        .get(labels::KERNELSPEC)
                        .and_then(|raw| raw.parse().ok())
                        .unwrap_or(1);
                    if !(MIN_KERNELSPEC..=MAX_KERNELSPEC).contains(&kernelspec) {
                        continue;
                    }
                    for port in &container.ports {
                        if let Some(host_port) = port.host_port {
                            resources.port_pool.consume(host_port);
                        }
                    }
                    for context in resources.computers.values_mut() {
                        let plugin = context.instance.clone();
                        plugin
                            .restore_from_container(container, &mut context.alloc_map)
                            .await;
                    }
                    self.inject_lifecycle_event(
                        kernel_id,
                        LifecycleEvent::Start,
                        "resuming-agent-operation",
                        Some(container.id.clone()),
                        None,
                        None,
                        None,
                    );
                } else {
                    info!(
                        "detected dead container while agent was down (k:{}, c:{})",
                        kernel_id, container.id
                    );
                    self.inject_lifecycle_event(
                        kernel_id,
                        LifecycleEvent::Clean,
                        "self-terminated",
                        Some(container.id.clone()),
                        None,
                        None,
                        None,
                    );
                }
            }
            info!("starting with resource allocations");
            for (name, context) in &resources.computers {
                info!("{}: {:?}", name, context.alloc_map.allocations());
            }
        }
        Ok(())
    }

    // ========================================================================
    // Periodic reporting
    // ========================================================================

    async fn heartbeat(&self) -> Result<()> {
        let (res_slots, compute_plugins) = {
            let resources = self.resources.lock().await;
            let mut res_slots = serde_json::Map::new();
            let mut compute_plugins = serde_json::Map::new();
            for context in resources.computers.values() {
                for (slot, slot_type) in context.instance.slot_types() {
                    let total = resources
                        .slots
                        .get(&slot)
                        .copied()
                        .unwrap_or(Decimal::ZERO);
                    res_slots.insert(slot.to_string(), json!([slot_type, total.to_string()]));
                }
                let mut info = serde_json::Map::new();
                info.insert("version".into(), json!(context.instance.version()));
                for (key, value) in context.instance.extra_info().await {
                    info.insert(key, json!(value));
                }
                compute_plugins.insert(context.instance.key().to_string(), info.into());
            }
            (res_slots, compute_plugins)
        };

        let images = {
            let images = self.images.read();
            let pairs: Vec<(String, String)> = images
                .iter()
                .map(|(tag, digest)| (tag.clone(), digest.clone()))
                .collect();
            pairs
        };
        let encoded_images =
            rmp_serde::to_vec(&images).map_err(|e| AgentError::Internal(e.to_string()))?;
        let mut compressor = GzEncoder::new(Vec::new(), Compression::fast());
        std::io::Write::write_all(&mut compressor, &encoded_images)?;
        let compressed = compressor
            .finish()
            .map_err(|e| AgentError::Internal(e.to_string()))?;

        let rpc_addr = &self.config.agent.rpc_listen_addr;
        let ip = rpc_addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(rpc_addr);
        let agent_info = json!({
            "ip": ip,
            "region": self.config.agent.region,
            "scaling_group": self.config.agent.scaling_group,
            "addr": format!("tcp://{}", rpc_addr),
            "resource_slots": res_slots,
            "version": env!("CARGO_PKG_VERSION"),
            "compute_plugins": compute_plugins,
            "images": base64::engine::general_purpose::STANDARD.encode(compressed),
        });
        self.producer
            .produce_event("instance_heartbeat", vec![agent_info])
            .await
            .map_err(AgentError::from)
    }

    async fn collect_container_stats(&self) -> Result<()> {
        if self.config.debug.log_stats {
            debug!("collecting container statistics");
        }
        // Snapshot the registry first; map guards must not be held across
        // the collection awaits.
        let kernels: Vec<Arc<Kernel>> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut updated: Vec<String> = Vec::new();
        for kernel in kernels {
            if !kernel.stats_enabled() {
                continue;
            }
            updated.push(kernel.kernel_id.to_string());
            self.stat_collector
                .collect_container_stat(&kernel.container_id)
                .await?;
        }
        if !updated.is_empty() {
            self.producer
                .produce_event("kernel_stat_sync", vec![json!(updated.join(","))])
                .await
                .map_err(AgentError::from)?;
        }
        Ok(())
    }

    // ========================================================================
    // Manager-facing operations
    // ========================================================================

    /// Initiate destruction; resolves with the handler's result payload once
    /// the DESTROY handler completed.
    pub async fn destroy_kernel(
        &self,
        kernel_id: &KernelId,
        reason: &str,
    ) -> Result<Option<serde_json::Value>> {
        let done = OnceEvent::new();
        self.inject_lifecycle_event(
            kernel_id,
            LifecycleEvent::Destroy,
            reason,
            None,
            None,
            Some(done.clone()),
            None,
        );
        Ok(done.wait().await)
    }

    /// Destroy every registered kernel; with `blocking` the call returns
    /// only after all CLEAN handlers finished.
    pub async fn clean_all_kernels(&self, blocking: bool) {
        let kernel_ids: Vec<KernelId> =
            self.registry.iter().map(|entry| entry.key().clone()).collect();
        let mut clean_events = Vec::new();
        for kernel_id in &kernel_ids {
            let clean_event = blocking.then(OnceEvent::<()>::new);
            if let Some(event) = &clean_event {
                clean_events.push(event.clone());
            }
            self.inject_lifecycle_event(
                kernel_id,
                LifecycleEvent::Destroy,
                "agent-termination",
                None,
                None,
                None,
                clean_event,
            );
        }
        for event in clean_events {
            event.wait().await;
        }
    }

    /// Restart a kernel in place: destroy the container while keeping its
    /// scratch and frozen resource spec, then replay the creation pipeline.
    pub async fn restart_kernel(
        self: &Arc<Self>,
        session_id: SessionId,
        kernel_id: KernelId,
        patch_config: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let tracker = self
            .restarting_kernels
            .entry(kernel_id.clone())
            .or_insert_with(|| Arc::new(RestartTracker::new()))
            .clone();

        let existing_config = self
            .backend
            .load_kernel_config(&kernel_id, "kconfig.dat")
            .await?;
        let existing_config: crate::types::KernelCreationConfig =
            rmp_serde::from_slice(&existing_config)
                .map_err(|e| AgentError::Internal(e.to_string()))?;
        let cluster_info: crate::types::ClusterInfo = serde_json::from_slice(
            &self
                .backend
                .load_kernel_config(&kernel_id, "cluster.json")
                .await?,
        )
        .map_err(|e| AgentError::Internal(e.to_string()))?;
        let kernel_config = existing_config.merged_with(patch_config)?;

        let _request = tracker.request_lock.lock().await;
        tracker.done.clear();
        tracker.destroy_done.clear();
        self.inject_lifecycle_event(
            &kernel_id,
            LifecycleEvent::Destroy,
            "restarting",
            None,
            None,
            None,
            None,
        );
        match tokio::time::timeout(RESTART_DESTROY_TIMEOUT, tracker.destroy_done.wait()).await {
            Err(_) => {
                warn!("timeout detected while restarting kernel {}", kernel_id);
                self.restarting_kernels.remove(&kernel_id);
                self.inject_lifecycle_event(
                    &kernel_id,
                    LifecycleEvent::Clean,
                    "restart-timeout",
                    None,
                    None,
                    None,
                    None,
                );
                return Err(AgentError::Timeout(format!(
                    "destroying kernel {} for restart",
                    kernel_id
                )));
            }
            Ok(()) => {
                let created = self
                    .create_kernel(session_id, kernel_id.clone(), kernel_config, cluster_info, true)
                    .await;
                self.restarting_kernels.remove(&kernel_id);
                tracker.done.set();
                if let Err(error) = created {
                    error!("restart_kernel(k:{}): re-creation failure", kernel_id);
                    return Err(error);
                }
            }
        }

        let kernel = self
            .registry
            .get(&kernel_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AgentError::KernelNotFound(kernel_id.clone()))?;
        Ok(json!({
            "container_id": kernel.container_id,
            "repl_in_port": kernel.repl_in_port,
            "repl_out_port": kernel.repl_out_port,
            "stdin_port": kernel.stdin_port,
            "stdout_port": kernel.stdout_port,
            "service_ports": kernel.service_ports(),
        }))
    }

    fn kernel(&self, kernel_id: &KernelId) -> Result<Arc<Kernel>> {
        self.registry
            .get(kernel_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AgentError::KernelNotFound(kernel_id.clone()))
    }

    /// Run one execution round on a kernel. A missing kernel schedules a
    /// DESTROY and surfaces a retryable error.
    pub async fn execute(
        &self,
        kernel_id: &KernelId,
        run_id: Option<String>,
        mode: RunMode,
        text: &str,
        opts: serde_json::Value,
        api_version: u32,
        flush_timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        if let Some(tracker) = self
            .restarting_kernels
            .get(kernel_id)
            .map(|entry| entry.value().clone())
        {
            tracker.done.wait().await;
        }

        let kernel = match self.kernel(kernel_id) {
            Ok(kernel) => kernel,
            Err(error) => {
                // The container is gone but the manager still believes in
                // the kernel; let the lifecycle subsystem settle the state.
                self.inject_lifecycle_event(
                    kernel_id,
                    LifecycleEvent::Destroy,
                    "self-terminated",
                    None,
                    None,
                    None,
                    None,
                );
                return Err(error);
            }
        };
        let runner = kernel
            .runner()
            .ok_or(crate::kernel::runner::RunnerError::NotAttached)?;
        let result = runner
            .execute(run_id, mode, text, &opts, api_version, flush_timeout)
            .await?;

        if matches!(result.status, RunStatus::Finished | RunStatus::ExecTimeout) {
            debug!("execute(k:{}) {}", kernel_id, result.status.as_str());
        }
        if result.status == RunStatus::ExecTimeout {
            self.inject_lifecycle_event(
                kernel_id,
                LifecycleEvent::Destroy,
                "exec-timeout",
                None,
                None,
                None,
                None,
            );
        }
        let mut payload = result.to_json();
        // Kept for API backward-compatibility.
        payload["files"] = json!([]);
        Ok(payload)
    }

    /// Drive a batch-type session to completion through repeated execute
    /// rounds, reporting the outcome as session events.
    pub async fn execute_batch(&self, kernel_id: KernelId, startup_command: String) {
        let mut mode = RunMode::Batch;
        let mut opts = json!({ "exec": startup_command });
        loop {
            let result = self
                .execute(
                    &kernel_id,
                    Some("batch-job".to_string()),
                    mode,
                    "",
                    opts.clone(),
                    3,
                    Some(Duration::from_secs(1)),
                )
                .await;
            let result = match result {
                Ok(result) => result,
                Err(AgentError::KernelNotFound(_)) => {
                    let _ = self
                        .producer
                        .produce_event(
                            "kernel_terminated",
                            vec![
                                json!(kernel_id.as_str()),
                                json!("self-terminated"),
                                json!(null),
                            ],
                        )
                        .await;
                    break;
                }
                Err(error) => {
                    warn!("execute_batch(k:{}) failed: {}", kernel_id, error);
                    break;
                }
            };
            match result["status"].as_str() {
                Some("finished") => {
                    let exit_code = result["exitCode"].as_i64().unwrap_or(-1);
                    let event = if exit_code == 0 {
                        ("session_success", 0, "task-done")
                    } else {
                        ("session_failure", exit_code, "task-failed")
                    };
                    let _ = self
                        .producer
                        .produce_event(
                            event.0,
                            vec![json!(kernel_id.as_str()), json!(event.1), json!(event.2)],
                        )
                        .await;
                    break;
                }
                Some("exec-timeout") => {
                    let _ = self
                        .producer
                        .produce_event(
                            "session_failure",
                            vec![json!(kernel_id.as_str()), json!(-2), json!("task-timeout")],
                        )
                        .await;
                    break;
                }
                _ => {
                    opts = json!({ "exec": "" });
                    mode = RunMode::Continue;
                }
            }
        }
    }

    pub async fn get_completions(
        &self,
        kernel_id: &KernelId,
        text: &str,
        opts: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let kernel = self.kernel(kernel_id)?;
        let runner = kernel
            .runner()
            .ok_or(crate::kernel::runner::RunnerError::NotAttached)?;
        Ok(runner.feed_and_get_completion(text, &opts).await?)
    }

    pub async fn get_logs(&self, kernel_id: &KernelId) -> Result<serde_json::Value> {
        let kernel = self.kernel(kernel_id)?;
        let mut stream = self.backend.log_stream(&kernel.container_id).await?;
        let mut collected = Vec::new();
        use futures_util::StreamExt;
        while let Some(fragment) = stream.next().await {
            collected.extend_from_slice(&fragment);
        }
        Ok(json!({ "logs": String::from_utf8_lossy(&collected) }))
    }

    pub async fn interrupt_kernel(&self, kernel_id: &KernelId) -> Result<()> {
        let kernel = self.kernel(kernel_id)?;
        let runner = kernel
            .runner()
            .ok_or(crate::kernel::runner::RunnerError::NotAttached)?;
        Ok(runner.feed_interrupt().await?)
    }

    /// Ask the runner to launch a declared service app; port information is
    /// resolved from the kernel's service-port table.
    pub async fn start_service(
        &self,
        kernel_id: &KernelId,
        service: &str,
        opts: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let kernel = self.kernel(kernel_id)?;
        let runner = kernel
            .runner()
            .ok_or(crate::kernel::runner::RunnerError::NotAttached)?;
        let Some(declared) = kernel
            .service_ports()
            .into_iter()
            .find(|port| port.name == service)
        else {
            return Ok(json!({"status": "failed", "error": "invalid service name"}));
        };
        let service_info = json!({
            "name": declared.name,
            "port": declared.container_ports.first(),
            "ports": declared.container_ports,
            "protocol": declared.protocol,
            "options": opts,
        });
        Ok(runner.feed_start_service(&service_info).await?)
    }

    pub async fn shutdown_service(&self, kernel_id: &KernelId, service: &str) {
        let result: Result<()> = async {
            let kernel = self.kernel(kernel_id)?;
            let runner = kernel
                .runner()
                .ok_or(crate::kernel::runner::RunnerError::NotAttached)?;
            Ok(runner.feed_shutdown_service(service).await?)
        }
        .await;
        if let Err(error) = result {
            error!("unhandled error while shutting down service {}: {}", service, error);
        }
    }

    pub async fn accept_file(
        &self,
        kernel_id: &KernelId,
        filename: &str,
        data: &[u8],
    ) -> Result<()> {
        let _kernel = self.kernel(kernel_id)?;
        Ok(self.backend.accept_file(kernel_id, filename, data).await?)
    }

    pub async fn download_file(&self, kernel_id: &KernelId, filepath: &str) -> Result<Vec<u8>> {
        let _kernel = self.kernel(kernel_id)?;
        Ok(self.backend.download_file(kernel_id, filepath).await?)
    }

    pub async fn list_files(
        &self,
        kernel_id: &KernelId,
        path: &str,
    ) -> Result<serde_json::Value> {
        let _kernel = self.kernel(kernel_id)?;
        Ok(self.backend.list_files(kernel_id, path).await?)
    }

    pub async fn create_overlay_network(&self, network_name: &str) -> Result<()> {
        Ok(self.backend.create_overlay_network(network_name).await?)
    }

    pub async fn destroy_overlay_network(&self, network_name: &str) -> Result<()> {
        Ok(self.backend.destroy_overlay_network(network_name).await?)
    }

    pub async fn create_local_network(&self, network_name: &str) -> Result<()> {
        Ok(self.backend.create_local_network(network_name).await?)
    }

    pub async fn destroy_local_network(&self, network_name: &str) -> Result<()> {
        Ok(self.backend.destroy_local_network(network_name).await?)
    }

    pub fn is_restarting(&self, kernel_id: &KernelId) -> bool {
        self.restarting_kernels.contains_key(kernel_id)
    }

    #[cfg(test)]
    pub(crate) fn pending_lifecycle_events(&self) -> Vec<ContainerLifecycleEvent> {
        let mut receiver = self.lifecycle_rx.lock();
        let Some(receiver) = receiver.as_mut() else {
            return Vec::new();
        };
        let mut drained = Vec::new();
        while let Ok(item) = receiver.try_recv() {
            if let LifecycleItem::Event(event) = item {
                drained.push(event);
            }
        }
        drained
    }
}
