// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print job pipeline: resolve -> validate -> spool -> drive -> clean up.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use labwerk_core::error::Result;
use labwerk_core::registry::SharedRegistry;
use labwerk_core::types::{CopyCount, DeviceSelector};
use labwerk_session::Payload;

use crate::driver::PrintDriver;
use crate::spool::Spooler;

/// What a finished job did, returned to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrintReport {
    pub index: usize,
    pub device: String,
    pub copies: u32,
    pub invocations: u32,
    pub bytes: u64,
}

pub struct PrintPipeline {
    registry: SharedRegistry,
    driver: Arc<dyn PrintDriver>,
    spooler: Spooler,
    device_locks: Mutex<HashMap<usize, Arc<Mutex<()>>>>,
}

impl PrintPipeline {
    pub fn new(registry: SharedRegistry, driver: Arc<dyn PrintDriver>, spooler: Spooler) -> Self {
        Self {
            registry,
            driver,
            spooler,
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run one print job to completion.
    ///
    /// Jobs on the same device run one after another; the artifact is
    /// removed on every exit path unless the spooler keeps artifacts.
    #[instrument(skip_all, fields(selector = %selector, copies = %copies))]
    pub async fn print(
        &self,
        selector: &DeviceSelector,
        payload: Payload,
        copies: &Value,
    ) -> Result<PrintReport> {
        let (index, _) = self.registry.read().await.resolve_printer(selector)?;
        let copies = CopyCount::from_value(copies)?;

        let lock = self.device_lock(index).await;
        let _turn = lock.lock().await;
        // Re-read under the device lock: an earlier job may have downgraded it.
        let (_, mut device) = self
            .registry
            .read()
            .await
            .resolve_printer(&DeviceSelector::at(index))?;

        let artifact = self.spooler.spool(payload).await?;
        info!(
            device = %device.name,
            copies = copies.get(),
            bytes = artifact.len(),
            "printing"
        );

        let mut invocations = 0;
        if device.supports_copies && self.driver.native_copies(&device) {
            self.driver
                .invoke(&device, artifact.path(), copies.get())
                .await
                .inspect_err(|e| warn!(device = %device.name, error = %e, "print failed"))?;
            invocations = 1;
        } else {
            if device.supports_copies {
                self.registry.write().await.downgrade_copies(index);
                device.supports_copies = false;
            }
            let mut remaining = copies.get();
            while remaining > 0 {
                let outstanding = CopyCount::new(i64::from(remaining))?;
                self.driver
                    .invoke(&device, artifact.path(), outstanding.get())
                    .await
                    .inspect_err(|e| {
                        warn!(
                            device = %device.name,
                            copy = invocations + 1,
                            error = %e,
                            "print failed; abandoning remaining copies"
                        )
                    })?;
                invocations += 1;
                remaining -= 1;
            }
        }

        info!(device = %device.name, invocations, "print job complete");
        Ok(PrintReport {
            index,
            device: device.name.clone(),
            copies: copies.get(),
            invocations,
            bytes: artifact.len(),
        })
    }

    async fn device_lock(&self, index: usize) -> Arc<Mutex<()>> {
        let mut locks = self.device_locks.lock().await;
        Arc::clone(locks.entry(index).or_default())
    }
}
