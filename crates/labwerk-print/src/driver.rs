// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print drivers: the seam between the pipeline and the OS print tools.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use labwerk_core::error::{LabwerkError, Result};
use labwerk_core::types::{Device, DeviceKind};

/// Captured output of a successful driver run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait PrintDriver: Send + Sync {
    /// Whether one invocation can print `copies` copies on this device.
    fn native_copies(&self, device: &Device) -> bool;

    /// Print the artifact once. `copies` is the full count when the driver
    /// repeats natively, otherwise the number of copies still outstanding.
    async fn invoke(&self, device: &Device, artifact: &Path, copies: u32) -> Result<DriverOutput>;
}

/// Runs `ql570` for Brother QL printers and `lpr` for Dymo printers.
///
/// Arguments are passed as argv, never through a shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandDriver;

impl CommandDriver {
    /// Program and arguments for one invocation.
    pub fn command_line(
        &self,
        device: &Device,
        artifact: &Path,
        copies: u32,
    ) -> Result<(String, Vec<String>)> {
        let path = artifact.to_string_lossy().into_owned();
        match &device.kind {
            DeviceKind::QlPrinter => {
                let program = device.command.clone().unwrap_or_else(|| "ql570".into());
                let mut args = vec![
                    device.device.clone(),
                    device.paper_type.clone().unwrap_or_else(|| "n".into()),
                ];
                args.extend(device.extra_args());
                args.push(path);
                Ok((program, args))
            }
            DeviceKind::DymoPrinter => {
                let program = device.command.clone().unwrap_or_else(|| "lpr".into());
                let mut args = vec!["-P".to_owned(), device.device.clone()];
                args.extend(device.extra_args());
                if self.native_copies(device) {
                    args.push("-#".into());
                    args.push(copies.to_string());
                }
                args.push(path);
                Ok((program, args))
            }
            kind => Err(LabwerkError::PrintDriver {
                status: None,
                stderr: format!("no print driver for {kind} devices"),
            }),
        }
    }
}

#[async_trait]
impl PrintDriver for CommandDriver {
    fn native_copies(&self, device: &Device) -> bool {
        // ql570 has no copy-count flag.
        device.kind == DeviceKind::DymoPrinter && device.supports_copies
    }

    async fn invoke(&self, device: &Device, artifact: &Path, copies: u32) -> Result<DriverOutput> {
        let (program, args) = self.command_line(device, artifact, copies)?;
        debug!(device = %device.name, %program, ?args, "running print driver");

        let output = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LabwerkError::PrintDriver {
                status: None,
                stderr: format!("failed to run {program}: {e}"),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if !output.status.success() {
            return Err(LabwerkError::PrintDriver {
                status: output.status.code(),
                stderr,
            });
        }
        if !stdout.is_empty() || !stderr.is_empty() {
            debug!(%program, %stdout, %stderr, "print driver output");
        }
        Ok(DriverOutput { stdout, stderr })
    }
}
