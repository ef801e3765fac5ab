//! Compute device registry and pluggable resource families
//!
//! Each resource family (CPU, memory, accelerators) is owned by a compute
//! plugin that enumerates its devices, builds an allocation map, and
//! provides device-specific hook libraries for the kernel runtime overlay.

mod alloc;
mod spec;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{AttachedDevice, Container};

pub use alloc::{AllocationMap, DeviceSlotAllocation, DeviceSlotInfo, InsufficientResource};
pub use spec::{KernelResourceSpec, Mount, MountPermission, MountType};

macro_rules! name_type {
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
    };
}

name_type!(
    /// Name of a resource family ("cpu", "mem", "cuda", ...)
    DeviceName
);
name_type!(
    /// Name of an allocatable slot ("cpu", "mem", "cuda.device", ...)
    SlotName
);
name_type!(
    /// Identifier of a single device within a family
    DeviceId
);

impl SlotName {
    /// The device family a slot belongs to: everything before the first dot.
    pub fn device_name(&self) -> DeviceName {
        match self.0.split_once('.') {
            Some((head, _)) => DeviceName(head.to_string()),
            None => DeviceName(self.0.clone()),
        }
    }
}

/// Unit of a slot's amounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotTypes {
    Count,
    Bytes,
}

/// A single enumerated device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeDevice {
    pub device_id: DeviceId,
    pub hw_location: String,
    pub numa_node: Option<u32>,
    pub memory_size: u64,
    pub processing_units: u32,
}

/// A pluggable module owning one resource family.
#[async_trait]
pub trait ComputePlugin: Send + Sync {
    /// Family key; doubles as the slot-name prefix.
    fn key(&self) -> DeviceName;

    fn slot_types(&self) -> Vec<(SlotName, SlotTypes)>;

    fn version(&self) -> String;

    async fn extra_info(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    async fn list_devices(&self) -> crate::Result<Vec<ComputeDevice>>;

    /// Total allocatable amount per slot, summed over devices.
    async fn available_slots(&self) -> crate::Result<IndexMap<SlotName, Decimal>>;

    /// Build the allocation map over the currently present devices.
    async fn create_alloc_map(&self) -> crate::Result<AllocationMap>;

    /// Hook libraries to preload inside kernels using this family.
    async fn get_hooks(&self, _distro: &str, _arch: &str) -> crate::Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    /// Resolve the allocation of this family into attached-device metadata.
    async fn get_attached_devices(
        &self,
        alloc: &DeviceSlotAllocation,
    ) -> crate::Result<Vec<AttachedDevice>>;

    /// Re-derive this family's allocations from a container observed on the
    /// backend, so in-memory bookkeeping matches ground truth after an agent
    /// restart.
    async fn restore_from_container(&self, container: &Container, alloc_map: &mut AllocationMap);
}

/// Per-family plugin state held by the agent
pub struct ComputerContext {
    pub instance: std::sync::Arc<dyn ComputePlugin>,
    pub devices: Vec<ComputeDevice>,
    pub alloc_map: AllocationMap,
}

/// Container label carrying the serialized per-family allocations, written
/// at spawn and read back by `restore_from_container`.
pub const RESOURCE_ALLOCATIONS_LABEL: &str = "ai.backend.resource-allocations";

fn allocation_from_label(
    container: &Container,
    family: &DeviceName,
) -> Option<DeviceSlotAllocation> {
    let raw = container.labels.get(RESOURCE_ALLOCATIONS_LABEL)?;
    let all: IndexMap<DeviceName, DeviceSlotAllocation> = serde_json::from_str(raw).ok()?;
    all.get(family).cloned()
}

/// Intrinsic CPU plugin: one device per logical core, one `cpu` slot
/// counted in whole cores.
pub struct CpuPlugin {
    core_count: u32,
}

impl CpuPlugin {
    pub fn new() -> Self {
        Self {
            core_count: num_cpus::get() as u32,
        }
    }

    pub fn with_cores(core_count: u32) -> Self {
        Self { core_count }
    }
}

impl Default for CpuPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputePlugin for CpuPlugin {
    fn key(&self) -> DeviceName {
        DeviceName::from("cpu")
    }

    fn slot_types(&self) -> Vec<(SlotName, SlotTypes)> {
        vec![(SlotName::from("cpu"), SlotTypes::Count)]
    }

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    async fn list_devices(&self) -> crate::Result<Vec<ComputeDevice>> {
        Ok((0..self.core_count)
            .map(|idx| ComputeDevice {
                device_id: DeviceId(idx.to_string()),
                hw_location: "root".to_string(),
                numa_node: None,
                memory_size: 0,
                processing_units: 1,
            })
            .collect())
    }

    async fn available_slots(&self) -> crate::Result<IndexMap<SlotName, Decimal>> {
        let mut slots = IndexMap::new();
        slots.insert(SlotName::from("cpu"), Decimal::from(self.core_count));
        Ok(slots)
    }

    async fn create_alloc_map(&self) -> crate::Result<AllocationMap> {
        let devices = self
            .list_devices()
            .await?
            .into_iter()
            .map(|dev| {
                (
                    dev.device_id,
                    DeviceSlotInfo::new(SlotName::from("cpu"), Decimal::ONE),
                )
            })
            .collect();
        Ok(AllocationMap::new(devices))
    }

    async fn get_attached_devices(
        &self,
        alloc: &DeviceSlotAllocation,
    ) -> crate::Result<Vec<AttachedDevice>> {
        let mut attached = Vec::new();
        if let Some(per_device) = alloc.get(&SlotName::from("cpu")) {
            for device_id in per_device.keys() {
                attached.push(AttachedDevice {
                    device_id: device_id.to_string(),
                    model_name: Some("cpu-core".to_string()),
                    data: HashMap::new(),
                });
            }
        }
        Ok(attached)
    }

    async fn restore_from_container(&self, container: &Container, alloc_map: &mut AllocationMap) {
        if let Some(alloc) = allocation_from_label(container, &self.key()) {
            alloc_map.apply(&alloc);
        }
    }
}

/// Intrinsic memory plugin: a single device covering node RAM, one `mem`
/// slot counted in bytes.
pub struct MemoryPlugin {
    total_bytes: u64,
}

impl MemoryPlugin {
    pub fn new() -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        Self {
            total_bytes: system.total_memory(),
        }
    }

    pub fn with_bytes(total_bytes: u64) -> Self {
        Self { total_bytes }
    }
}

impl Default for MemoryPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputePlugin for MemoryPlugin {
    fn key(&self) -> DeviceName {
        DeviceName::from("mem")
    }

    fn slot_types(&self) -> Vec<(SlotName, SlotTypes)> {
        vec![(SlotName::from("mem"), SlotTypes::Bytes)]
    }

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    async fn list_devices(&self) -> crate::Result<Vec<ComputeDevice>> {
        Ok(vec![ComputeDevice {
            device_id: DeviceId::from("root"),
            hw_location: "root".to_string(),
            numa_node: None,
            memory_size: self.total_bytes,
            processing_units: 0,
        }])
    }

    async fn available_slots(&self) -> crate::Result<IndexMap<SlotName, Decimal>> {
        let mut slots = IndexMap::new();
        slots.insert(SlotName::from("mem"), Decimal::from(self.total_bytes));
        Ok(slots)
    }

    async fn create_alloc_map(&self) -> crate::Result<AllocationMap> {
        let devices = [(
            DeviceId::from("root"),
            DeviceSlotInfo::new(SlotName::from("mem"), Decimal::from(self.total_bytes)),
        )]
        .into_iter()
        .collect();
        Ok(AllocationMap::new(devices))
    }

    async fn get_attached_devices(
        &self,
        alloc: &DeviceSlotAllocation,
    ) -> crate::Result<Vec<AttachedDevice>> {
        let mut attached = Vec::new();
        if let Some(per_device) = alloc.get(&SlotName::from("mem")) {
            for device_id in per_device.keys() {
                attached.push(AttachedDevice {
                    device_id: device_id.to_string(),
                    model_name: None,
                    data: HashMap::new(),
                });
            }
        }
        Ok(attached)
    }

    async fn restore_from_container(&self, container: &Container, alloc_map: &mut AllocationMap) {
        if let Some(alloc) = allocation_from_label(container, &self.key()) {
            alloc_map.apply(&alloc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_device_name() {
        assert_eq!(SlotName::from("cuda.device").device_name(), DeviceName::from("cuda"));
        assert_eq!(SlotName::from("cpu").device_name(), DeviceName::from("cpu"));
    }

    #[tokio::test]
    async fn test_cpu_plugin_devices() {
        let plugin = CpuPlugin::with_cores(4);
        let devices = plugin.list_devices().await.unwrap();
        assert_eq!(devices.len(), 4);
        let slots = plugin.available_slots().await.unwrap();
        assert_eq!(slots[&SlotName::from("cpu")], Decimal::from(4));
    }

    #[tokio::test]
    async fn test_restore_from_label() {
        let plugin = CpuPlugin::with_cores(2);
        let mut alloc_map = plugin.create_alloc_map().await.unwrap();

        let mut slots = indexmap::IndexMap::new();
        slots.insert(SlotName::from("cpu"), Decimal::from(1));
        let alloc = alloc_map.allocate(&slots, "cpu").unwrap();

        let mut all = IndexMap::new();
        all.insert(DeviceName::from("cpu"), alloc);
        let label = serde_json::to_string(&all).unwrap();

        let container = Container {
            id: crate::types::ContainerId::from("c1"),
            status: crate::types::ContainerStatus::Running,
            image: "img".into(),
            labels: [(RESOURCE_ALLOCATIONS_LABEL.to_string(), label)]
                .into_iter()
                .collect(),
            ports: vec![],
        };

        let mut fresh = plugin.create_alloc_map().await.unwrap();
        plugin.restore_from_container(&container, &mut fresh).await;
        assert_eq!(
            fresh.used(&SlotName::from("cpu")),
            Decimal::from(1),
        );
    }
}
