//! Typed slot reservation over the devices of one resource family

use indexmap::IndexMap;
use rust_decimal::Decimal;
use thiserror::Error;

use super::{DeviceId, SlotName};

/// Requested slots cannot be satisfied; carries the shortfall details.
#[derive(Debug, Clone, Error)]
#[error(
    "insufficient resource in {context}: slot {slot} requested {requested}, available {available}"
)]
pub struct InsufficientResource {
    pub context: String,
    pub slot: SlotName,
    pub requested: Decimal,
    pub available: Decimal,
}

/// Allocation result for one family: slot -> device -> amount
pub type DeviceSlotAllocation = IndexMap<SlotName, IndexMap<DeviceId, Decimal>>;

/// Capacity of a single device in the slot it provides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSlotInfo {
    pub slot_name: SlotName,
    pub amount: Decimal,
}

impl DeviceSlotInfo {
    pub fn new(slot_name: SlotName, amount: Decimal) -> Self {
        Self { slot_name, amount }
    }
}

/// Book-keeper of slot reservations across the devices of one family.
///
/// Device selection prefers the least-loaded device so allocations spread
/// evenly when capacities are tied.
#[derive(Debug, Clone)]
pub struct AllocationMap {
    device_slots: IndexMap<DeviceId, DeviceSlotInfo>,
    allocations: IndexMap<SlotName, IndexMap<DeviceId, Decimal>>,
}

impl AllocationMap {
    pub fn new(device_slots: IndexMap<DeviceId, DeviceSlotInfo>) -> Self {
        let mut allocations: IndexMap<SlotName, IndexMap<DeviceId, Decimal>> = IndexMap::new();
        for (device_id, info) in &device_slots {
            allocations
                .entry(info.slot_name.clone())
                .or_default()
                .insert(device_id.clone(), Decimal::ZERO);
        }
        Self {
            device_slots,
            allocations,
        }
    }

    fn remaining(&self, slot: &SlotName, device_id: &DeviceId) -> Decimal {
        let capacity = self
            .device_slots
            .get(device_id)
            .map(|info| info.amount)
            .unwrap_or(Decimal::ZERO);
        let used = self
            .allocations
            .get(slot)
            .and_then(|per_device| per_device.get(device_id))
            .copied()
            .unwrap_or(Decimal::ZERO);
        capacity - used
    }

    /// Total amount currently allocated for a slot across all devices.
    pub fn used(&self, slot: &SlotName) -> Decimal {
        self.allocations
            .get(slot)
            .map(|per_device| per_device.values().copied().sum())
            .unwrap_or(Decimal::ZERO)
    }

    /// Reserve the requested amounts. Either the whole request succeeds or
    /// nothing is reserved.
    pub fn allocate(
        &mut self,
        slots: &IndexMap<SlotName, Decimal>,
        context: &str,
    ) -> Result<DeviceSlotAllocation, InsufficientResource> {
        let mut result: DeviceSlotAllocation = IndexMap::new();
        for (slot, requested) in slots {
            if requested.is_zero() {
                result.insert(slot.clone(), IndexMap::new());
                continue;
            }
            let mut candidates: Vec<(DeviceId, Decimal)> = self
                .device_slots
                .iter()
                .filter(|(_, info)| &info.slot_name == slot)
                .map(|(device_id, _)| (device_id.clone(), self.remaining(slot, device_id)))
                .filter(|(_, remaining)| *remaining > Decimal::ZERO)
                .collect();
            let available: Decimal = candidates.iter().map(|(_, r)| *r).sum();
            if available < *requested {
                // Undo what this call reserved so far.
                self.free(&result);
                return Err(InsufficientResource {
                    context: context.to_string(),
                    slot: slot.clone(),
                    requested: *requested,
                    available,
                });
            }

            // Least-loaded first for an even spread.
            candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            let mut needed = *requested;
            let mut per_device: IndexMap<DeviceId, Decimal> = IndexMap::new();
            for (device_id, remaining) in candidates {
                if needed.is_zero() {
                    break;
                }
                let take = remaining.min(needed);
                needed -= take;
                *self
                    .allocations
                    .entry(slot.clone())
                    .or_default()
                    .entry(device_id.clone())
                    .or_insert(Decimal::ZERO) += take;
                per_device.insert(device_id, take);
            }
            result.insert(slot.clone(), per_device);
        }
        Ok(result)
    }

    /// Return a previous allocation to the pool.
    pub fn free(&mut self, alloc: &DeviceSlotAllocation) {
        for (slot, per_device) in alloc {
            if let Some(current) = self.allocations.get_mut(slot) {
                for (device_id, amount) in per_device {
                    if let Some(used) = current.get_mut(device_id) {
                        *used -= *amount;
                        if used.is_sign_negative() {
                            *used = Decimal::ZERO;
                        }
                    }
                }
            }
        }
    }

    /// Mark an externally observed allocation as used (restore path).
    pub fn apply(&mut self, alloc: &DeviceSlotAllocation) {
        for (slot, per_device) in alloc {
            let current = self.allocations.entry(slot.clone()).or_default();
            for (device_id, amount) in per_device {
                *current.entry(device_id.clone()).or_insert(Decimal::ZERO) += *amount;
            }
        }
    }

    /// Drop all allocations.
    pub fn clear(&mut self) {
        for per_device in self.allocations.values_mut() {
            for used in per_device.values_mut() {
                *used = Decimal::ZERO;
            }
        }
    }

    pub fn allocations(&self) -> &IndexMap<SlotName, IndexMap<DeviceId, Decimal>> {
        &self.allocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_map(cores: u32) -> AllocationMap {
        let devices = (0..cores)
            .map(|idx| {
                (
                    DeviceId(idx.to_string()),
                    DeviceSlotInfo::new(SlotName::from("cpu"), Decimal::ONE),
                )
            })
            .collect();
        AllocationMap::new(devices)
    }

    fn request(slot: &str, amount: i64) -> IndexMap<SlotName, Decimal> {
        let mut slots = IndexMap::new();
        slots.insert(SlotName::from(slot), Decimal::from(amount));
        slots
    }

    #[test]
    fn test_allocate_spreads_across_devices() {
        let mut map = cpu_map(4);
        let alloc = map.allocate(&request("cpu", 2), "cpu").unwrap();
        let per_device = &alloc[&SlotName::from("cpu")];
        assert_eq!(per_device.len(), 2);
        assert_eq!(map.used(&SlotName::from("cpu")), Decimal::from(2));
    }

    #[test]
    fn test_insufficient_reports_shortfall() {
        let mut map = cpu_map(2);
        let err = map.allocate(&request("cpu", 3), "cpu").unwrap_err();
        assert_eq!(err.slot, SlotName::from("cpu"));
        assert_eq!(err.requested, Decimal::from(3));
        assert_eq!(err.available, Decimal::from(2));
        // Nothing must remain reserved after a failed call.
        assert_eq!(map.used(&SlotName::from("cpu")), Decimal::ZERO);
    }

    #[test]
    fn test_failed_multi_slot_request_rolls_back() {
        let devices: IndexMap<DeviceId, DeviceSlotInfo> = [
            (
                DeviceId::from("cpu0"),
                DeviceSlotInfo::new(SlotName::from("cpu"), Decimal::from(2)),
            ),
            (
                DeviceId::from("gpu0"),
                DeviceSlotInfo::new(SlotName::from("cuda.device"), Decimal::ZERO),
            ),
        ]
        .into_iter()
        .collect();
        let mut map = AllocationMap::new(devices);

        let mut slots = IndexMap::new();
        slots.insert(SlotName::from("cpu"), Decimal::from(1));
        slots.insert(SlotName::from("cuda.device"), Decimal::from(1));
        let err = map.allocate(&slots, "mixed").unwrap_err();
        assert_eq!(err.slot, SlotName::from("cuda.device"));
        assert_eq!(map.used(&SlotName::from("cpu")), Decimal::ZERO);
    }

    #[test]
    fn test_free_and_clear() {
        let mut map = cpu_map(2);
        let alloc = map.allocate(&request("cpu", 2), "cpu").unwrap();
        map.free(&alloc);
        assert_eq!(map.used(&SlotName::from("cpu")), Decimal::ZERO);

        map.allocate(&request("cpu", 1), "cpu").unwrap();
        map.clear();
        assert_eq!(map.used(&SlotName::from("cpu")), Decimal::ZERO);
    }

    #[test]
    fn test_apply_restores_observed_allocation() {
        let mut map = cpu_map(2);
        let alloc = map.allocate(&request("cpu", 1), "cpu").unwrap();
        let mut fresh = cpu_map(2);
        fresh.apply(&alloc);
        assert_eq!(fresh.used(&SlotName::from("cpu")), Decimal::ONE);
    }
}
