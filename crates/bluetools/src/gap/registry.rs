//! In-memory device registry
//!
//! Keeps the last known record of every device seen by the controller, keyed
//! by hardware address. Re-registering an address replaces the whole record.

use crate::error::{Error, Result};
use crate::gap::types::{BdAddr, Device};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a classic device scan does with addresses that are already registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnownDevicePolicy {
    /// Replace the stored record with a minimal address-only record
    #[default]
    Overwrite,
    /// Keep the stored record and report it unchanged
    Preserve,
}

/// Thread-safe store of device records
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<BdAddr, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff the address was registered since the last reset
    pub fn exists(&self, address: &BdAddr) -> bool {
        self.devices.lock().contains_key(address)
    }

    /// Stores `device`, returning the record it replaced
    pub fn register(&self, device: Device) -> Option<Device> {
        debug!("Registering device {}", device);
        self.devices.lock().insert(device.address, device)
    }

    /// Stores `device` only if its address is unknown.
    ///
    /// The check and the insert happen under one lock. Returns `true` when the
    /// record was inserted.
    pub fn register_if_absent(&self, device: Device) -> bool {
        let mut devices = self.devices.lock();
        if devices.contains_key(&device.address) {
            return false;
        }
        debug!("Registering device {}", device);
        devices.insert(device.address, device);
        true
    }

    pub fn get(&self, address: &BdAddr) -> Result<Device> {
        self.devices
            .lock()
            .get(address)
            .cloned()
            .ok_or(Error::UnknownDevice(*address))
    }

    /// Drops every record
    pub fn reset(&self) {
        self.devices.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// Copy of all records, ordered by address
    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.lock().values().cloned().collect();
        devices.sort_by_key(|d| {
            let mut key = d.address.bytes;
            key.reverse();
            key
        });
        devices
    }
}
