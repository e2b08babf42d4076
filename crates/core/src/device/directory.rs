//! Read-only view of the device inventory.

use std::collections::BTreeMap;

use super::types::Device;

/// Lookup of devices owned by an external inventory.
pub trait DeviceDirectory: Send + Sync {
    fn get(&self, id: &str) -> Option<Device>;

    /// All devices, ordered by id.
    fn list(&self) -> Vec<Device>;

    fn in_region(&self, region: &str) -> Vec<Device> {
        self.list()
            .into_iter()
            .filter(|d| d.region.as_deref() == Some(region))
            .collect()
    }
}

/// Directory backed by the `[[devices]]` entries of the configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceDirectory {
    devices: BTreeMap<String, Device>,
}

impl StaticDeviceDirectory {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceDirectory for StaticDeviceDirectory {
    fn get(&self, id: &str) -> Option<Device> {
        self.devices.get(id).cloned()
    }

    fn list(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }
}
