// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Raw HID scanner input: locate the hidraw node and read fixed-size
// reports from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use labwerk_core::error::{LabwerkError, Result};

use crate::keyboard::{LineBuffer, ScancodeDecoder};
use crate::{ScanHandle, ScanSink};

const SYS_HIDRAW: &str = "/sys/class/hidraw";
const DEV_ROOT: &str = "/dev";

/// Reads reports of `report_len` bytes, decodes them and reports every
/// completed line. Any read error, end of stream included, abandons the
/// source.
pub struct ByteStreamSource<R> {
    reader: R,
    decoder: Box<dyn ScancodeDecoder>,
    report_len: usize,
}

impl<R> ByteStreamSource<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    pub fn new(reader: R, decoder: Box<dyn ScancodeDecoder>, report_len: usize) -> Self {
        Self {
            reader,
            decoder,
            report_len: report_len.max(1),
        }
    }

    pub fn start(self, sink: Arc<dyn ScanSink>) -> ScanHandle {
        let stop = CancellationToken::new();
        let task = tokio::spawn(self.run(sink, stop.clone()));
        ScanHandle::new(stop, task)
    }

    async fn run(mut self, sink: Arc<dyn ScanSink>, stop: CancellationToken) {
        let mut report = vec![0u8; self.report_len];
        let mut lines = LineBuffer::new();
        info!(report_len = self.report_len, "keyboard scanning started");

        loop {
            let read = tokio::select! {
                _ = stop.cancelled() => break,
                r = self.reader.read_exact(&mut report) => r,
            };
            if let Err(e) = read {
                let err = LabwerkError::DeviceStream(e.to_string());
                error!(error = %err, "scanner device lost; keyboard scanning abandoned");
                return;
            }
            let typed = self.decoder.decode(&report);
            for event in lines.extend(&typed) {
                debug!(code = %event.code, "code scanned");
                sink.on_code(event).await;
            }
        }
        info!("keyboard scanning stopped");
    }
}

/// Parse a `vvvv:pppp` USB vendor/product pair.
pub fn parse_usb_id(spec: &str) -> Option<(u16, u16)> {
    let (vendor, product) = spec.trim().split_once(':')?;
    Some((
        u16::from_str_radix(vendor, 16).ok()?,
        u16::from_str_radix(product, 16).ok()?,
    ))
}

/// Resolve a device spec to a hidraw node. Absolute paths are used as is;
/// `vvvv:pppp` is matched against the `HID_ID` of every hidraw device.
pub fn resolve_hidraw(spec: &str) -> Result<PathBuf> {
    resolve_hidraw_in(Path::new(SYS_HIDRAW), Path::new(DEV_ROOT), spec)
}

fn resolve_hidraw_in(sys_root: &Path, dev_root: &Path, spec: &str) -> Result<PathBuf> {
    if spec.starts_with('/') {
        return Ok(PathBuf::from(spec));
    }
    let wanted = parse_usb_id(spec).ok_or_else(|| {
        LabwerkError::Config(format!(
            "scanner device `{spec}` is neither a path nor a vvvv:pppp id"
        ))
    })?;

    let entries = std::fs::read_dir(sys_root)
        .map_err(|e| LabwerkError::DeviceStream(format!("{}: {e}", sys_root.display())))?;
    let mut names: Vec<_> = entries.filter_map(|e| e.ok()).map(|e| e.file_name()).collect();
    names.sort();

    for name in names {
        let uevent = sys_root.join(&name).join("device").join("uevent");
        let Ok(contents) = std::fs::read_to_string(&uevent) else {
            continue;
        };
        if hid_id(&contents) == Some(wanted) {
            let node = dev_root.join(&name);
            debug!(spec, node = %node.display(), "resolved scanner");
            return Ok(node);
        }
    }
    Err(LabwerkError::DeviceStream(format!(
        "no hidraw device with id {spec}"
    )))
}

/// Vendor and product from a uevent `HID_ID=bbbb:vvvvvvvv:pppppppp` line.
fn hid_id(uevent: &str) -> Option<(u16, u16)> {
    let value = uevent
        .lines()
        .find_map(|line| line.strip_prefix("HID_ID="))?;
    let mut parts = value.trim().split(':').skip(1);
    let vendor = u32::from_str_radix(parts.next()?, 16).ok()?;
    let product = u32::from_str_radix(parts.next()?, 16).ok()?;
    Some((u16::try_from(vendor).ok()?, u16::try_from(product).ok()?))
}

/// Resolve and open the scanner for reading.
pub async fn open_hid_device(spec: &str) -> Result<tokio::fs::File> {
    let owned = spec.to_owned();
    let path = tokio::task::spawn_blocking(move || resolve_hidraw(&owned))
        .await
        .map_err(|e| LabwerkError::DeviceStream(format!("device lookup aborted: {e}")))??;
    tokio::fs::File::open(&path).await.map_err(|e| {
        LabwerkError::DeviceStream(format!(
            "cannot open {}: {e} (is the agent allowed to read hidraw devices?)",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyboard::HidKeyboardDecoder;
    use async_trait::async_trait;
    use labwerk_core::types::ScanEvent;

    #[derive(Default)]
    struct Collect(tokio::sync::Mutex<Vec<String>>);

    #[async_trait]
    impl ScanSink for Collect {
        async fn on_code(&self, event: ScanEvent) {
            self.0.lock().await.push(event.code);
        }
    }

    fn reports(keys: &[(u8, u8)]) -> Vec<u8> {
        let mut out = Vec::new();
        for &(modifiers, key) in keys {
            out.extend_from_slice(&[modifiers, 0, key, 0, 0, 0, 0, 0]);
            out.extend_from_slice(&[0; 8]);
        }
        out
    }

    #[tokio::test]
    async fn decodes_a_scan_from_the_device() {
        let bytes = reports(&[(0x02, 0x04), (0, 0x1e), (0x02, 0x05), (0, 0x1f), (0, 0x28)]);
        let sink = Arc::new(Collect::default());
        let handle = ByteStreamSource::new(
            std::io::Cursor::new(bytes),
            Box::new(HidKeyboardDecoder::new()),
            8,
        )
        .start(sink.clone());

        // End of stream abandons the source once everything is decoded.
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(*sink.0.lock().await, ["A1B2"]);
    }

    #[tokio::test]
    async fn truncated_report_abandons_without_partial_code() {
        let mut bytes = reports(&[(0, 0x06), (0, 0x07)]);
        bytes.extend_from_slice(&[0, 0, 0x28]);
        let sink = Arc::new(Collect::default());
        let handle = ByteStreamSource::new(
            std::io::Cursor::new(bytes),
            Box::new(HidKeyboardDecoder::new()),
            8,
        )
        .start(sink.clone());

        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(sink.0.lock().await.is_empty());
    }

    #[tokio::test]
    async fn stop_interrupts_a_quiet_device() {
        let (_keep_open, reader) = tokio::io::duplex(64);
        let sink = Arc::new(Collect::default());
        let handle =
            ByteStreamSource::new(reader, Box::new(HidKeyboardDecoder::new()), 8).start(sink);
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        handle.shutdown().await;
    }

    #[test]
    fn usb_ids() {
        assert_eq!(parse_usb_id("0c2e:0b61"), Some((0x0c2e, 0x0b61)));
        assert_eq!(parse_usb_id("0C2E:0B61"), Some((0x0c2e, 0x0b61)));
        assert_eq!(parse_usb_id("0c2e"), None);
        assert_eq!(parse_usb_id("zzzz:0001"), None);
    }

    #[test]
    fn resolves_hidraw_node_by_id() {
        let sys = tempfile::tempdir().unwrap();
        for (name, id) in [
            ("hidraw0", "0003:0000046D:0000C52B"),
            ("hidraw1", "0003:00000C2E:00000B61"),
        ] {
            let dir = sys.path().join(name).join("device");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("uevent"),
                format!("DRIVER=hid-generic\nHID_ID={id}\nHID_NAME=Scanner\n"),
            )
            .unwrap();
        }

        let node = resolve_hidraw_in(sys.path(), Path::new("/dev"), "0c2e:0b61").unwrap();
        assert_eq!(node, PathBuf::from("/dev/hidraw1"));

        let err = resolve_hidraw_in(sys.path(), Path::new("/dev"), "dead:beef").unwrap_err();
        assert!(matches!(err, LabwerkError::DeviceStream(_)));
    }

    #[test]
    fn paths_pass_through_and_garbage_is_rejected() {
        let sys = Path::new("/nonexistent");
        assert_eq!(
            resolve_hidraw_in(sys, Path::new("/dev"), "/dev/hidraw3").unwrap(),
            PathBuf::from("/dev/hidraw3")
        );
        assert!(matches!(
            resolve_hidraw_in(sys, Path::new("/dev"), "scanner").unwrap_err(),
            LabwerkError::Config(_)
        ));
    }
}
