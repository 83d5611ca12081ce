// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory device registry.
//
// Built once from the configured device list. Indices are list positions and
// stay stable for the life of the process. The only mutation is the copy
// capability downgrade, which is never written back to the settings file.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{LabwerkError, Result};
use crate::types::{Device, DeviceKind, DeviceSelector, DeviceSummary};

/// Registry shared between the print and scan pipelines.
pub type SharedRegistry = Arc<RwLock<DeviceRegistry>>;

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<Device>) -> Self {
        for (index, device) in devices.iter().enumerate() {
            if let DeviceKind::Other(tag) = &device.kind {
                warn!(index, device = %device.name, %tag, "unknown device type; listed but never driven");
            }
        }
        debug!(count = devices.len(), "device registry loaded");
        Self { devices }
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    /// Devices with their registry indices, in registry order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Device)> {
        self.devices.iter().enumerate()
    }

    /// Find a device by index, or the first device whose type tag matches.
    pub fn resolve(&self, selector: &DeviceSelector) -> Result<(usize, &Device)> {
        match selector {
            DeviceSelector::Index(index) => usize::try_from(*index)
                .ok()
                .and_then(|i| self.devices.get(i).map(|d| (i, d)))
                .ok_or_else(|| LabwerkError::DeviceNotFound(format!("no device with index {index}"))),
            DeviceSelector::Kind(tag) => {
                let kind = DeviceKind::from(tag.as_str());
                self.iter()
                    .find(|(_, d)| d.kind == kind)
                    .ok_or_else(|| LabwerkError::DeviceNotFound(format!("no device of type {tag}")))
            }
        }
    }

    /// Like [`resolve`](Self::resolve) but also insists the device prints.
    ///
    /// Returns an owned copy so the caller can drop the registry lock before
    /// running a long job.
    pub fn resolve_printer(&self, selector: &DeviceSelector) -> Result<(usize, Device)> {
        let (index, device) = self.resolve(selector)?;
        if !device.kind.is_printer() {
            return Err(LabwerkError::NotAPrinter {
                index,
                kind: device.kind.to_string(),
            });
        }
        Ok((index, device.clone()))
    }

    pub fn summaries(&self) -> Vec<DeviceSummary> {
        self.iter()
            .map(|(index, d)| DeviceSummary {
                index,
                name: d.name.clone(),
                kind: d.kind.clone(),
            })
            .collect()
    }

    /// First scanning device in registry order. Only one scanner is ever
    /// driven per session.
    pub fn first_scanner(&self) -> Option<(usize, &Device)> {
        self.iter().find(|(_, d)| d.kind.is_scanner())
    }

    /// Switch a device to per-copy printing. Returns `true` if the flag
    /// changed.
    pub fn downgrade_copies(&mut self, index: usize) -> bool {
        match self.devices.get_mut(index) {
            Some(device) if device.supports_copies => {
                device.supports_copies = false;
                warn!(
                    index,
                    device = %device.name,
                    "driver cannot repeat copies for this device; printing one copy per invocation from now on"
                );
                true
            }
            _ => false,
        }
    }
}
