// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Starts the configured scanner when the controller is ready for scans and
// stops it when the connection goes away.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use labwerk_core::config::ScannerSettings;
use labwerk_core::error::{LabwerkError, Result};
use labwerk_core::types::{Device, DeviceKind, ScanEvent};
use labwerk_core::SharedRegistry;
use labwerk_scan::{
    ByteStreamSource, CommandCapture, HidKeyboardDecoder, PolledCapture, ScanHandle, ScanSink,
    open_hid_device,
};
use labwerk_session::{Method, PeerProxy, SessionHooks};

/// Queues codes for the controller without waiting for its answer.
struct PeerScanSink {
    queue: mpsc::UnboundedSender<ScanEvent>,
}

#[async_trait]
impl ScanSink for PeerScanSink {
    async fn on_code(&self, event: ScanEvent) {
        info!(code = %event.code, "scanned");
        if self.queue.send(event).is_err() {
            debug!("scan reporter gone; code dropped");
        }
    }
}

/// Reports queued codes one at a time, so the controller sees them in scan
/// order with at most one report outstanding.
fn spawn_reporter(peer: PeerProxy) -> (PeerScanSink, JoinHandle<()>) {
    let (queue, mut codes) = mpsc::unbounded_channel::<ScanEvent>();
    let task = tokio::spawn(async move {
        while let Some(event) = codes.recv().await {
            if let Err(e) = peer.report_scan(&event.code).await {
                warn!(code = %event.code, error = %e, "could not report scan");
            }
        }
    });
    (PeerScanSink { queue }, task)
}

/// The running source and the task reporting its codes.
struct ActiveScanner {
    source: ScanHandle,
    reporter: JoinHandle<()>,
}

impl ActiveScanner {
    async fn shutdown(self) {
        if self.source.is_finished() {
            debug!("scan source had already ended");
        }
        self.source.shutdown().await;
        self.reporter.abort();
    }
}

pub struct ScanController {
    registry: SharedRegistry,
    settings: ScannerSettings,
    active: Mutex<Option<ActiveScanner>>,
}

impl ScanController {
    pub fn new(registry: SharedRegistry, settings: ScannerSettings) -> Self {
        Self {
            registry,
            settings,
            active: Mutex::new(None),
        }
    }

    /// A device's own `device` wins over the scanner settings.
    fn device_spec<'a>(&'a self, device: &'a Device) -> &'a str {
        if device.device.is_empty() {
            &self.settings.device
        } else {
            &device.device
        }
    }

    async fn start_source(&self, device: &Device, sink: Arc<dyn ScanSink>) -> Result<ScanHandle> {
        let spec = self.device_spec(device);
        match &device.kind {
            DeviceKind::WebcamScanner => {
                let tool = CommandCapture::new(spec, &self.settings);
                Ok(PolledCapture::new(Arc::new(tool), self.settings.poll_interval()).start(sink))
            }
            DeviceKind::KeyboardScanner => {
                let file = open_hid_device(spec).await?;
                info!(device = %spec, "initialised USB HID barcode scanner");
                Ok(ByteStreamSource::new(
                    file,
                    Box::new(HidKeyboardDecoder::new()),
                    self.settings.hid_report_len,
                )
                .start(sink))
            }
            kind => Err(LabwerkError::Config(format!("{kind} is not a scanner"))),
        }
    }
}

#[async_trait]
impl SessionHooks for ScanController {
    async fn on_peer_ready(&self, peer: PeerProxy) {
        if !peer.supports(Method::ReportScan) {
            info!("controller does not take scans; scanner left idle");
            return;
        }
        let scanner = {
            let registry = self.registry.read().await;
            registry.first_scanner().map(|(i, d)| (i, d.clone()))
        };
        let Some((index, device)) = scanner else {
            return;
        };

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.shutdown().await;
        }
        let (sink, reporter) = spawn_reporter(peer);
        match self.start_source(&device, Arc::new(sink)).await {
            Ok(source) => {
                info!(index, device = %device.name, kind = %device.kind, "scanner started");
                *active = Some(ActiveScanner { source, reporter });
            }
            Err(e) => {
                reporter.abort();
                error!(index, device = %device.name, error = %e, "could not start scanner");
            }
        }
    }

    async fn on_disconnect(&self) {
        if let Some(scanner) = self.active.lock().await.take() {
            scanner.shutdown().await;
            info!("scanner stopped");
        }
    }
}
