//! The boundary to whatever owns the devices registers are bridged into.
//!
//! The bridge never controls the lifecycle of a device. It only asks whether one already exists
//! for a register key, asks for one to be created, and pushes values into it.
use std::collections::BTreeMap;

use crate::fields::Kind;
use crate::value::DeviceValue;

pub type DeviceId = u32;

/// Everything a registry needs to know to present a device for a register.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DeviceSpec {
    /// The stable `circuit:message:index` register key.
    pub key: String,
    pub name: String,
    pub kind: Kind,
    /// Unit string for numeric kinds, empty otherwise.
    pub unit: String,
    /// Selector level names, in ordinal order.
    pub levels: Vec<String>,
    pub settable: bool,
    pub comment: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExistingDevice {
    pub id: DeviceId,
    /// How the device is presented right now.
    pub spec: DeviceSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// `None` until the first value has been pushed.
    pub value: Option<DeviceValue>,
    pub timed_out: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceUpdate {
    pub value: DeviceValue,
    /// Whether the host should record this as a change of value.
    pub log_change: bool,
    /// Replace the presentation of the device before applying the value.
    pub reconfigure: Option<DeviceSpec>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no more than {0} devices can be created")]
    CapacityExhausted(usize),
    #[error("the device registry is not available right now")]
    Unavailable,
    #[error("the device registry refused a device for `{0}`")]
    Rejected(String),
}

pub trait DeviceRegistry {
    fn find(&self, key: &str) -> Option<ExistingDevice>;
    fn create(&mut self, spec: &DeviceSpec) -> Result<DeviceId, RegistryError>;
    fn snapshot(&self, id: DeviceId) -> Option<DeviceSnapshot>;
    /// Push a full value update. Clears the timed out marker.
    fn update(&mut self, id: DeviceId, update: DeviceUpdate);
    /// Record that the device is alive without changing its value.
    fn touch(&mut self, id: DeviceId);
    fn set_timed_out(&mut self, id: DeviceId, timed_out: bool);
}

#[derive(Clone, Debug)]
pub struct MemoryDevice {
    pub spec: DeviceSpec,
    pub value: Option<DeviceValue>,
    pub timed_out: bool,
    /// Number of full value pushes.
    pub updates: usize,
    /// Number of pushes that were recorded as changes.
    pub changes: usize,
    pub touches: usize,
}

/// A registry that keeps its devices in memory.
#[derive(Debug)]
pub struct MemoryRegistry {
    capacity: usize,
    available: bool,
    devices: Vec<MemoryDevice>,
    by_key: BTreeMap<String, DeviceId>,
}

impl MemoryRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, available: true, devices: Vec::new(), by_key: BTreeMap::new() }
    }

    /// Make device creation fail with [`RegistryError::Unavailable`] until re-enabled.
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    pub fn device(&self, id: DeviceId) -> Option<&MemoryDevice> {
        self.devices.get(usize::try_from(id).ok()?)
    }

    pub fn by_key(&self, key: &str) -> Option<&MemoryDevice> {
        self.device(*self.by_key.get(key)?)
    }

    pub fn devices(&self) -> impl Iterator<Item = &MemoryDevice> {
        self.devices.iter()
    }

    fn device_mut(&mut self, id: DeviceId) -> Option<&mut MemoryDevice> {
        self.devices.get_mut(usize::try_from(id).ok()?)
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn find(&self, key: &str) -> Option<ExistingDevice> {
        let id = *self.by_key.get(key)?;
        let device = self.device(id)?;
        Some(ExistingDevice { id, spec: device.spec.clone() })
    }

    fn create(&mut self, spec: &DeviceSpec) -> Result<DeviceId, RegistryError> {
        if !self.available {
            return Err(RegistryError::Unavailable);
        }
        if self.devices.len() >= self.capacity {
            return Err(RegistryError::CapacityExhausted(self.capacity));
        }
        let id = DeviceId::try_from(self.devices.len())
            .map_err(|_| RegistryError::CapacityExhausted(self.capacity))?;
        self.devices.push(MemoryDevice {
            spec: spec.clone(),
            value: None,
            timed_out: false,
            updates: 0,
            changes: 0,
            touches: 0,
        });
        self.by_key.insert(spec.key.clone(), id);
        Ok(id)
    }

    fn snapshot(&self, id: DeviceId) -> Option<DeviceSnapshot> {
        let device = self.device(id)?;
        Some(DeviceSnapshot { value: device.value.clone(), timed_out: device.timed_out })
    }

    fn update(&mut self, id: DeviceId, update: DeviceUpdate) {
        let Some(device) = self.device_mut(id) else { return };
        if let Some(spec) = update.reconfigure {
            device.spec = spec;
        }
        device.value = Some(update.value);
        device.timed_out = false;
        device.updates += 1;
        device.changes += usize::from(update.log_change);
    }

    fn touch(&mut self, id: DeviceId) {
        if let Some(device) = self.device_mut(id) {
            device.touches += 1;
        }
    }

    fn set_timed_out(&mut self, id: DeviceId, timed_out: bool) {
        if let Some(device) = self.device_mut(id) {
            device.timed_out = timed_out;
        }
    }
}
