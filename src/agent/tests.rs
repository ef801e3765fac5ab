//! Orchestrator, reconciler, restart, and pipeline tests over the scripted
//! backend and the in-memory bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde_json::json;

use crate::backend::mock::MockBackend;
use crate::bus::MemoryBus;
use crate::config::Configuration;
use crate::events::EVENTS_LIST_KEY;
use crate::kernel::runner::{ClientFeature, KernelRunner, RunMode};
use crate::resources::{
    AllocationMap, ComputeDevice, ComputePlugin, CpuPlugin, DeviceName, DeviceSlotAllocation,
    MemoryPlugin, SlotName, SlotTypes,
};
use crate::stats::NullStatCollector;
use crate::types::{
    AttachedDevice, ClusterInfo, Container, ImageConfig, KernelCreationConfig, KernelId,
    SessionId,
};

use super::{Agent, LogErrorMonitor, RestartTracker};

struct TestEnv {
    agent: Arc<Agent>,
    backend: Arc<MockBackend>,
    bus: Arc<MemoryBus>,
    _root: tempfile::TempDir,
}

/// GPU family with zero devices, for shortfall scenarios.
struct ZeroGpuPlugin;

#[async_trait]
impl ComputePlugin for ZeroGpuPlugin {
    fn key(&self) -> DeviceName {
        DeviceName::from("cuda")
    }

    fn slot_types(&self) -> Vec<(SlotName, SlotTypes)> {
        vec![(SlotName::from("cuda.device"), SlotTypes::Count)]
    }

    fn version(&self) -> String {
        "0.0.0".into()
    }

    async fn list_devices(&self) -> crate::Result<Vec<ComputeDevice>> {
        Ok(vec![])
    }

    async fn available_slots(&self) -> crate::Result<IndexMap<SlotName, Decimal>> {
        let mut slots = IndexMap::new();
        slots.insert(SlotName::from("cuda.device"), Decimal::ZERO);
        Ok(slots)
    }

    async fn create_alloc_map(&self) -> crate::Result<AllocationMap> {
        Ok(AllocationMap::new(IndexMap::new()))
    }

    async fn get_attached_devices(
        &self,
        _alloc: &DeviceSlotAllocation,
    ) -> crate::Result<Vec<AttachedDevice>> {
        Ok(vec![])
    }

    async fn restore_from_container(&self, _container: &Container, _alloc_map: &mut AllocationMap) {
    }
}

fn test_config(root: &std::path::Path) -> Arc<Configuration> {
    let ipc = root.join("ipc");
    let scratch = root.join("scratches");
    std::fs::create_dir_all(&ipc).unwrap();
    std::fs::create_dir_all(&scratch).unwrap();
    let raw = format!(
        r#"
        [agent]
        id = "i-test"
        ipc-base-path = "{}"

        [container]
        port-range = [30000, 30019]
        scratch-root = "{}"

        [container.krunner-volumes]
        "ubuntu18.04" = "krunner.ubuntu18.04"
        "#,
        ipc.display(),
        scratch.display(),
    );
    Arc::new(toml::from_str(&raw).unwrap())
}

async fn test_env_with_plugins(plugins: Vec<Arc<dyn ComputePlugin>>) -> TestEnv {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let backend = Arc::new(MockBackend::new());
    let bus = Arc::new(MemoryBus::new());
    let agent = Agent::new(
        config,
        backend.clone(),
        bus.clone(),
        plugins,
        Arc::new(NullStatCollector::new(Default::default())),
        Arc::new(LogErrorMonitor),
    )
    .await
    .unwrap();
    TestEnv {
        agent,
        backend,
        bus,
        _root: root,
    }
}

async fn test_env() -> TestEnv {
    test_env_with_plugins(vec![
        Arc::new(CpuPlugin::with_cores(4)),
        Arc::new(MemoryPlugin::with_bytes(1 << 30)),
    ])
    .await
}

fn creation_config(slots: &[(&str, i64)]) -> KernelCreationConfig {
    let mut resource_slots = IndexMap::new();
    for (slot, amount) in slots {
        resource_slots.insert(SlotName::from(*slot), Decimal::from(*amount));
    }
    KernelCreationConfig {
        image: ImageConfig {
            canonical: "registry/python:3.9".into(),
            registry: "registry".into(),
            digest: "sha256:abc".into(),
            labels: [
                (crate::kernel::labels::KERNELSPEC.to_string(), "2".to_string()),
                (
                    crate::kernel::labels::BASE_DISTRO.to_string(),
                    "ubuntu18.04".to_string(),
                ),
                (
                    crate::kernel::labels::ENVS_CORECOUNT.to_string(),
                    "OPENBLAS_NUM_THREADS".to_string(),
                ),
            ]
            .into_iter()
            .collect(),
        },
        auto_pull: Default::default(),
        environ: HashMap::new(),
        resource_slots,
        resource_opts: HashMap::new(),
        mounts: vec![],
        mount_map: HashMap::new(),
        cluster_role: "main".into(),
        preopen_ports: vec![],
        internal_data: HashMap::new(),
        startup_command: None,
        exec_timeout: 0,
    }
}

fn decoded_events(bus: &MemoryBus) -> Vec<(String, Vec<serde_json::Value>)> {
    bus.list(EVENTS_LIST_KEY)
        .iter()
        .map(|payload| {
            let value: serde_json::Value = rmp_serde::from_slice(payload).unwrap();
            (
                value["event_name"].as_str().unwrap().to_string(),
                value["args"].as_array().cloned().unwrap_or_default(),
            )
        })
        .collect()
}

fn event_names(bus: &MemoryBus) -> Vec<String> {
    decoded_events(bus).into_iter().map(|(name, _)| name).collect()
}

async fn wait_until(description: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met: {}", description);
}

#[tokio::test]
async fn test_create_kernel_registers_and_reserves() {
    let env = test_env().await;
    let result = env
        .agent
        .create_kernel(
            SessionId::from("s1"),
            KernelId::from("k1"),
            creation_config(&[("cpu", 2), ("mem", 1024)]),
            ClusterInfo::default(),
            false,
        )
        .await
        .unwrap();

    assert_eq!(result.id, KernelId::from("k1"));
    assert!((30000..=30019).contains(&result.repl_in_port));
    assert!((30000..=30019).contains(&result.repl_out_port));
    assert!(env.agent.registry.contains_key(&KernelId::from("k1")));

    // Lead kernel: REPL pair plus sshd and ttyd are bound.
    let resources = env.agent.resources.lock().await;
    assert_eq!(resources.port_pool.available(), 20 - 4);
    assert_eq!(
        resources.computers[&DeviceName::from("cpu")]
            .alloc_map
            .used(&SlotName::from("cpu")),
        Decimal::from(2)
    );
    drop(resources);

    // Pipeline events, in order, and no pull for a locally present image.
    assert_eq!(
        event_names(&env.bus),
        vec!["kernel_preparing", "kernel_creating"]
    );

    // Everything a restart needs is persisted.
    let stored = env.backend.stored_configs.lock();
    for name in ["kconfig.dat", "cluster.json", "resource.msgpack"] {
        assert!(
            stored.contains_key(&(KernelId::from("k1"), name.to_string())),
            "missing persisted {}",
            name
        );
    }
}

#[tokio::test]
async fn test_insufficient_gpu_rolls_back_cpu_reservation() {
    let env = test_env_with_plugins(vec![
        Arc::new(CpuPlugin::with_cores(4)),
        Arc::new(MemoryPlugin::with_bytes(1 << 30)),
        Arc::new(ZeroGpuPlugin),
    ])
    .await;

    let error = env
        .agent
        .create_kernel(
            SessionId::from("s1"),
            KernelId::from("k1"),
            creation_config(&[("cpu", 1), ("cuda.device", 1)]),
            ClusterInfo::default(),
            false,
        )
        .await
        .unwrap_err();

    match &error {
        crate::AgentError::InsufficientResource(shortfall) => {
            assert_eq!(shortfall.slot, SlotName::from("cuda.device"));
            assert_eq!(shortfall.requested, Decimal::ONE);
            assert_eq!(shortfall.available, Decimal::ZERO);
        }
        other => panic!("unexpected error: {}", other),
    }

    // The CPU reservation made earlier in the same call is undone and no
    // ports were taken.
    let resources = env.agent.resources.lock().await;
    assert_eq!(
        resources.computers[&DeviceName::from("cpu")]
            .alloc_map
            .used(&SlotName::from("cpu")),
        Decimal::ZERO
    );
    assert_eq!(resources.port_pool.available(), 20);
    drop(resources);

    assert!(!env.agent.registry.contains_key(&KernelId::from("k1")));
    // Creating was announced, pulling was not (image already local).
    assert_eq!(
        event_names(&env.bus),
        vec!["kernel_preparing", "kernel_creating"]
    );
}

#[tokio::test]
async fn test_destroy_missing_kernel_announces_already_terminated() {
    let env = test_env().await;
    env.agent.start(true).await.unwrap();

    let result = env
        .agent
        .destroy_kernel(&KernelId::from("ghost"), "user-requested")
        .await
        .unwrap();
    assert!(result.is_none());

    wait_until("already-terminated announced", || {
        decoded_events(&env.bus)
            .iter()
            .any(|(name, args)| name == "kernel_terminated" && args[1] == json!("already-terminated"))
    })
    .await;
    let count = decoded_events(&env.bus)
        .iter()
        .filter(|(name, _)| name == "kernel_terminated")
        .count();
    assert_eq!(count, 1);
    // No backend call was made for the unknown kernel.
    assert!(env.backend.destroyed.lock().is_empty());
}

#[tokio::test]
async fn test_reconciler_cleans_unknown_container() {
    let env = test_env().await;
    env.agent.start(true).await.unwrap();
    env.backend
        .add_container("K9", "c9", crate::types::ContainerStatus::Running);

    env.agent.sync_container_lifecycles().await.unwrap();

    wait_until("unknown container destroyed and cleaned", || {
        env.backend
            .destroyed
            .lock()
            .iter()
            .any(|(kernel_id, _)| kernel_id.as_str() == "K9")
            && env
                .backend
                .cleaned
                .lock()
                .iter()
                .any(|(kernel_id, _, _)| kernel_id.as_str() == "K9")
    })
    .await;
    wait_until("termination announced", || {
        decoded_events(&env.bus).iter().any(|(name, args)| {
            name == "kernel_terminated"
                && args[0] == json!("K9")
                && args[1] == json!("terminated-unknown-container")
        })
    })
    .await;
}

#[tokio::test]
async fn test_reconciler_idempotent_when_in_sync() {
    let env = test_env().await;
    // Registry and backend agree on one kernel.
    env.agent
        .create_kernel(
            SessionId::from("s1"),
            KernelId::from("k1"),
            creation_config(&[("cpu", 1)]),
            ClusterInfo::default(),
            false,
        )
        .await
        .unwrap();

    env.agent.sync_container_lifecycles().await.unwrap();
    env.agent.sync_container_lifecycles().await.unwrap();
    assert!(env.agent.pending_lifecycle_events().is_empty());
}

#[tokio::test]
async fn test_reconciler_skips_restarting_kernels() {
    let env = test_env().await;
    env.agent
        .create_kernel(
            SessionId::from("s1"),
            KernelId::from("k1"),
            creation_config(&[("cpu", 1)]),
            ClusterInfo::default(),
            false,
        )
        .await
        .unwrap();
    // The container vanishes while a restart is in flight.
    env.backend.remove_container("k1");
    env.agent
        .restarting_kernels
        .insert(KernelId::from("k1"), Arc::new(RestartTracker::new()));

    env.agent.sync_container_lifecycles().await.unwrap();
    assert!(env.agent.pending_lifecycle_events().is_empty());
}

#[tokio::test]
async fn test_restart_timeout_drops_tracker_and_cleans() {
    tokio::time::pause();
    let env = test_env().await;
    // Creation persisted the config blobs the restart path loads.
    env.agent
        .create_kernel(
            SessionId::from("s1"),
            KernelId::from("k1"),
            creation_config(&[("cpu", 1)]),
            ClusterInfo::default(),
            false,
        )
        .await
        .unwrap();

    // No consumer is running, so destroy-complete can never fire.
    let error = env
        .agent
        .restart_kernel(SessionId::from("s1"), KernelId::from("k1"), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(error, crate::AgentError::Timeout(_)));
    assert!(!env.agent.is_restarting(&KernelId::from("k1")));

    let pending = env.agent.pending_lifecycle_events();
    let kinds: Vec<(String, String)> = pending
        .iter()
        .map(|event| (event.event.to_string(), event.reason.clone()))
        .collect();
    assert!(kinds.contains(&("DESTROY".to_string(), "restarting".to_string())));
    assert!(kinds.contains(&("CLEAN".to_string(), "restart-timeout".to_string())));
}

#[tokio::test]
async fn test_restart_recreates_without_termination_event() {
    let env = test_env().await;
    env.agent.start(true).await.unwrap();
    env.agent
        .create_kernel(
            SessionId::from("s1"),
            KernelId::from("k1"),
            creation_config(&[("cpu", 1)]),
            ClusterInfo::default(),
            false,
        )
        .await
        .unwrap();
    let old_container = env
        .agent
        .registry
        .get(&KernelId::from("k1"))
        .unwrap()
        .container_id
        .clone();

    let result = env
        .agent
        .restart_kernel(SessionId::from("s1"), KernelId::from("k1"), json!({}))
        .await
        .unwrap();

    let kernel = env.agent.registry.get(&KernelId::from("k1")).unwrap().clone();
    assert_ne!(kernel.container_id, old_container);
    assert_eq!(result["container_id"], json!(kernel.container_id));
    assert!(!env.agent.is_restarting(&KernelId::from("k1")));

    // A restarting kernel's CLEAN must not announce termination.
    assert!(!event_names(&env.bus).contains(&"kernel_terminated".to_string()));

    // Ports released by CLEAN and re-taken by the re-create.
    let resources = env.agent.resources.lock().await;
    assert_eq!(resources.port_pool.available(), 20 - 4);
}

#[tokio::test]
async fn test_execute_on_missing_kernel_is_retryable() {
    let env = test_env().await;
    env.agent.start(true).await.unwrap();

    let error = env
        .agent
        .execute(
            &KernelId::from("ghost"),
            None,
            RunMode::Query,
            "1+1",
            json!({}),
            2,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(error, crate::AgentError::KernelNotFound(_)));
    assert!(error.is_retryable());

    // The lifecycle subsystem settles the stale state.
    wait_until("termination announced for the missing kernel", || {
        decoded_events(&env.bus).iter().any(|(name, args)| {
            name == "kernel_terminated" && args[0] == json!("ghost")
        })
    })
    .await;
}

#[tokio::test]
async fn test_exec_timeout_destroys_kernel() {
    let env = test_env().await;
    env.agent.start(true).await.unwrap();
    env.agent
        .create_kernel(
            SessionId::from("s1"),
            KernelId::from("k1"),
            creation_config(&[("cpu", 1)]),
            ClusterInfo::default(),
            false,
        )
        .await
        .unwrap();

    // Wire an in-memory runner with a short execution timeout.
    let (input_local, _input_remote) = tokio::io::duplex(1 << 16);
    let (output_local, _output_remote) = tokio::io::duplex(1 << 16);
    let (_, input_writer) = tokio::io::split(input_local);
    let (output_reader, _) = tokio::io::split(output_local);
    let runner = KernelRunner::from_streams(
        KernelId::from("k1"),
        Box::new(input_writer),
        Box::new(output_reader),
        Duration::from_millis(50),
        [ClientFeature::Continuation].into_iter().collect(),
    );
    env.agent
        .registry
        .get(&KernelId::from("k1"))
        .unwrap()
        .attach_runner(Arc::new(runner));

    let result = env
        .agent
        .execute(
            &KernelId::from("k1"),
            Some("r1".into()),
            RunMode::Query,
            "while True: pass",
            json!({}),
            2,
            None,
        )
        .await
        .unwrap();
    assert_eq!(result["status"], json!("exec-timeout"));

    wait_until("timeout termination announced", || {
        decoded_events(&env.bus).iter().any(|(name, args)| {
            name == "kernel_terminated"
                && args[0] == json!("k1")
                && args[1] == json!("exec-timeout")
        })
    })
    .await;
    assert!(!env.agent.registry.contains_key(&KernelId::from("k1")));
}

#[tokio::test]
async fn test_clean_ships_container_logs() {
    let env = test_env().await;
    env.agent.start(true).await.unwrap();
    *env.backend.log_payload.lock() = b"boot log line".to_vec();
    env.agent
        .create_kernel(
            SessionId::from("s1"),
            KernelId::from("k1"),
            creation_config(&[("cpu", 1)]),
            ClusterInfo::default(),
            false,
        )
        .await
        .unwrap();
    let container_id = env
        .agent
        .registry
        .get(&KernelId::from("k1"))
        .unwrap()
        .container_id
        .clone();

    env.agent
        .destroy_kernel(&KernelId::from("k1"), "user-requested")
        .await
        .unwrap();

    let log_key = format!("containerlog.{}", container_id);
    wait_until("logs pushed and announced", || {
        !env.bus.list(&log_key).is_empty()
            && event_names(&env.bus).contains(&"kernel_log".to_string())
    })
    .await;
    assert_eq!(env.bus.list(&log_key), vec![b"boot log line".to_vec()]);
}

#[tokio::test]
async fn test_clean_all_kernels_blocking_empties_registry() {
    let env = test_env().await;
    env.agent.start(true).await.unwrap();
    for kernel in ["k1", "k2"] {
        env.agent
            .create_kernel(
                SessionId::from("s1"),
                KernelId::from(kernel),
                creation_config(&[("cpu", 1)]),
                ClusterInfo::default(),
                false,
            )
            .await
            .unwrap();
    }

    env.agent.clean_all_kernels(true).await;

    assert!(env.agent.registry.is_empty());
    let resources = env.agent.resources.lock().await;
    assert_eq!(resources.port_pool.available(), 20);
    drop(resources);
    let terminated: Vec<_> = decoded_events(&env.bus)
        .into_iter()
        .filter(|(name, _)| name == "kernel_terminated")
        .collect();
    assert_eq!(terminated.len(), 2);
    for (_, args) in terminated {
        assert_eq!(args[1], json!("agent-termination"));
    }
}

#[tokio::test]
async fn test_shutdown_persists_registry_and_boot_reconciles() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let backend = Arc::new(MockBackend::new());
    let bus = Arc::new(MemoryBus::new());

    let agent1 = Agent::new(
        config.clone(),
        backend.clone(),
        bus.clone(),
        vec![Arc::new(CpuPlugin::with_cores(4))],
        Arc::new(NullStatCollector::new(Default::default())),
        Arc::new(LogErrorMonitor),
    )
    .await
    .unwrap();
    agent1.start(true).await.unwrap();
    agent1
        .create_kernel(
            SessionId::from("s1"),
            KernelId::from("k1"),
            creation_config(&[("cpu", 1)]),
            ClusterInfo::default(),
            false,
        )
        .await
        .unwrap();
    agent1.shutdown(false).await;

    let registry_file = root.path().join("ipc").join("last_registry.i-test.dat");
    assert!(registry_file.exists());

    // One container died while the agent was down.
    backend.add_container("k2", "c2", crate::types::ContainerStatus::Exited);

    let agent2 = Agent::new(
        config,
        backend.clone(),
        bus.clone(),
        vec![Arc::new(CpuPlugin::with_cores(4))],
        Arc::new(NullStatCollector::new(Default::default())),
        Arc::new(LogErrorMonitor),
    )
    .await
    .unwrap();
    agent2.start(false).await.unwrap();

    // The reloaded kernel resumes stat collection; the dead one is cleaned.
    wait_until("reloaded kernel resumed", || {
        agent2
            .registry
            .get(&KernelId::from("k1"))
            .map(|kernel| kernel.stats_enabled())
            .unwrap_or(false)
    })
    .await;
    wait_until("dead container cleaned", || {
        backend
            .cleaned
            .lock()
            .iter()
            .any(|(kernel_id, _, _)| kernel_id.as_str() == "k2")
    })
    .await;

    // The reloaded kernel's host ports were consumed from the fresh pool.
    let resources = agent2.resources.lock().await;
    assert_eq!(resources.port_pool.available(), 20 - 4);
}
