// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Labwerk scan — turns webcam captures and raw HID reports into decoded
// barcode events.

pub mod capture;
pub mod hid;
pub mod keyboard;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use labwerk_core::types::ScanEvent;

pub use capture::{CaptureTool, CommandCapture, PolledCapture};
pub use hid::{ByteStreamSource, open_hid_device};
pub use keyboard::{HidKeyboardDecoder, LineBuffer, ScancodeDecoder};

/// Receives every decoded code, in order.
#[async_trait]
pub trait ScanSink: Send + Sync {
    async fn on_code(&self, event: ScanEvent);
}

/// A running scan source. Stopped explicitly or when dropped.
pub struct ScanHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ScanHandle {
    pub(crate) fn new(stop: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { stop, task }
    }

    /// Whether the source has ended, by request or by abandoning its device.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop and wait for the source to wind down.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        // Errors here mean the task panicked or was aborted; either way it is done.
        let _ = (&mut self.task).await;
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
