//! Frozen resource plans and container mounts

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{DeviceName, DeviceSlotAllocation, SlotName};

/// How a mount source is realized by the container runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    Bind,
    Volume,
}

/// Mount access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountPermission {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl fmt::Display for MountPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountPermission::ReadOnly => f.write_str("ro"),
            MountPermission::ReadWrite => f.write_str("rw"),
        }
    }
}

/// One mount applied to a kernel container.
///
/// Application order matters: intrinsic mounts come first, then user folder
/// mounts, then the runner/hook overlays, so later mounts shadow earlier
/// ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub kind: MountType,
    /// Host path for binds; volume name for volumes
    pub source: PathBuf,
    pub target: PathBuf,
    pub permission: MountPermission,
    /// True when the source lives outside the managed folder tree
    #[serde(default)]
    pub is_unmanaged: bool,
    #[serde(default)]
    pub opts: Option<HashMap<String, String>>,
}

impl Mount {
    pub fn bind(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        permission: MountPermission,
    ) -> Self {
        Self {
            kind: MountType::Bind,
            source: source.into(),
            target: target.into(),
            permission,
            is_unmanaged: false,
            opts: None,
        }
    }

    pub fn volume(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        permission: MountPermission,
    ) -> Self {
        Self {
            kind: MountType::Volume,
            source: source.into(),
            target: target.into(),
            permission,
            is_unmanaged: false,
            opts: None,
        }
    }

    pub fn unmanaged(mut self) -> Self {
        self.is_unmanaged = true;
        self
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.source.display(),
            self.target.display(),
            self.permission
        )
    }
}

/// The frozen allocation plan of one kernel.
///
/// Assembled stage by stage in the creation pipeline, frozen just before the
/// backend spawn, and persisted so a restart can replay it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelResourceSpec {
    /// Total requested amount per slot
    pub slots: IndexMap<SlotName, Decimal>,

    /// Realized reservations per family
    pub allocations: IndexMap<DeviceName, DeviceSlotAllocation>,

    /// Ordered mount plan
    pub mounts: Vec<Mount>,

    /// Host-side scratch directories bound into the container
    pub scratch_dirs: Vec<PathBuf>,

    /// Numeric/free-form resource options (shared memory size etc.)
    pub resource_opts: HashMap<String, serde_json::Value>,

    frozen: bool,
}

impl KernelResourceSpec {
    pub fn new(slots: IndexMap<SlotName, Decimal>) -> Self {
        Self {
            slots,
            ..Default::default()
        }
    }

    /// Mark the spec immutable. Mutating accessors must not be used after
    /// this; the spec is persisted and replayed on restart.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Reopen a persisted spec for a restart replay: slot totals and
    /// realized allocations survive, the mount plan is rebuilt by the
    /// pipeline stages.
    pub fn thaw_for_replay(&mut self) {
        self.frozen = false;
        self.mounts.clear();
        self.scratch_dirs.clear();
    }

    pub fn push_mount(&mut self, mount: Mount) {
        debug_assert!(!self.frozen, "mount added to a frozen resource spec");
        self.mounts.push(mount);
    }

    /// Device families referenced by the requested slots.
    pub fn device_names(&self) -> Vec<DeviceName> {
        let mut names = Vec::new();
        for slot in self.slots.keys() {
            let name = slot.device_name();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> KernelResourceSpec {
        let mut slots = IndexMap::new();
        slots.insert(SlotName::from("cpu"), Decimal::from(2));
        slots.insert(SlotName::from("mem"), Decimal::from(1073741824u64));
        slots.insert(SlotName::from("cuda.device"), Decimal::from(1));
        let mut spec = KernelResourceSpec::new(slots);
        spec.push_mount(Mount::bind("/scratches/k1", "/home/work", MountPermission::ReadWrite));
        spec.push_mount(
            Mount::volume("runner-env", "/opt/backend.ai", MountPermission::ReadOnly),
        );
        spec.resource_opts
            .insert("shmem".into(), serde_json::json!(67108864));
        spec
    }

    #[test]
    fn test_serde_round_trip() {
        let mut spec = sample_spec();
        spec.freeze();
        let serialized = serde_json::to_string(&spec).unwrap();
        let restored: KernelResourceSpec = serde_json::from_str(&serialized).unwrap();
        assert_eq!(spec, restored);
        assert!(restored.is_frozen());
    }

    #[test]
    fn test_msgpack_round_trip() {
        let spec = sample_spec();
        let bytes = rmp_serde::to_vec_named(&spec).unwrap();
        let restored: KernelResourceSpec = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(spec, restored);
    }

    #[test]
    fn test_device_names_deduplicated() {
        let spec = sample_spec();
        let names = spec.device_names();
        assert_eq!(
            names,
            vec![
                DeviceName::from("cpu"),
                DeviceName::from("mem"),
                DeviceName::from("cuda"),
            ]
        );
    }

    #[test]
    fn test_mount_ordering_preserved() {
        let spec = sample_spec();
        assert_eq!(spec.mounts[0].target, PathBuf::from("/home/work"));
        assert_eq!(spec.mounts[1].target, PathBuf::from("/opt/backend.ai"));
    }
}
