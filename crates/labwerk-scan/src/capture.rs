// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Polled webcam capture: grab a frame, look for a Data Matrix code, repeat.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use labwerk_core::config::ScannerSettings;
use labwerk_core::error::{LabwerkError, Result};
use labwerk_core::types::ScanEvent;

use crate::{ScanHandle, ScanSink};

/// One capture-and-decode attempt against the camera.
#[async_trait]
pub trait CaptureTool: Send + Sync {
    /// Prepare the camera. Runs once before the first poll.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// `Ok(None)` when the frame held no readable code.
    async fn capture_once(&self) -> Result<Option<String>>;
}

/// Shell pipeline used when no override is configured.
pub fn default_capture_command(device: &str) -> String {
    format!(
        "streamer -q -c {} -f jpeg -s 1024x768 -o /dev/stdout | dmtxread -m 200 -N1 /dev/stdin",
        shell_quote(device)
    )
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:".contains(c))
    {
        return arg.to_owned();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Runs the capture pipeline through `sh -c` on every poll.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    command: String,
    init_commands: Vec<String>,
}

impl CommandCapture {
    pub fn new(device: &str, settings: &ScannerSettings) -> Self {
        Self {
            command: settings
                .capture_command
                .clone()
                .unwrap_or_else(|| default_capture_command(device)),
            init_commands: settings.init_commands.clone(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

async fn run_shell(command: &str) -> Result<std::process::Output> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| LabwerkError::Capture(format!("failed to spawn sh: {e}")))
}

#[async_trait]
impl CaptureTool for CommandCapture {
    async fn init(&self) -> Result<()> {
        for command in &self.init_commands {
            debug!(%command, "initialising camera");
            let output = run_shell(command).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(LabwerkError::Capture(format!(
                    "`{command}` failed: {}",
                    stderr.trim()
                )));
            }
        }
        Ok(())
    }

    async fn capture_once(&self) -> Result<Option<String>> {
        let output = run_shell(&self.command).await?;
        let code = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if !code.is_empty() {
            return Ok(Some(code));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        // dmtxread exits non-zero on a frame without a code, and says nothing.
        if !output.status.success() && !stderr.is_empty() {
            return Err(LabwerkError::Capture(stderr));
        }
        Ok(None)
    }
}

/// Polls a [`CaptureTool`] sequentially until stopped.
pub struct PolledCapture {
    tool: Arc<dyn CaptureTool>,
    interval: Duration,
}

impl PolledCapture {
    pub fn new(tool: Arc<dyn CaptureTool>, interval: Duration) -> Self {
        Self { tool, interval }
    }

    pub fn start(self, sink: Arc<dyn ScanSink>) -> ScanHandle {
        let stop = CancellationToken::new();
        let task = tokio::spawn(self.run(sink, stop.clone()));
        ScanHandle::new(stop, task)
    }

    async fn run(self, sink: Arc<dyn ScanSink>, stop: CancellationToken) {
        let init = tokio::select! {
            _ = stop.cancelled() => return,
            r = self.tool.init() => r,
        };
        if let Err(e) = init {
            error!(error = %e, "camera initialisation failed; webcam scanning disabled");
            return;
        }
        info!(interval_ms = self.interval.as_millis() as u64, "webcam scanning started");

        while !stop.is_cancelled() {
            let attempt = tokio::select! {
                _ = stop.cancelled() => break,
                r = self.tool.capture_once() => r,
            };
            match attempt {
                Ok(Some(raw)) => {
                    if let Some(event) = ScanEvent::new(&raw) {
                        debug!(code = %event.code, "code captured");
                        sink.on_code(event).await;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "capture failed"),
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("webcam scanning stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Collect(tokio::sync::Mutex<Vec<String>>);

    #[async_trait]
    impl ScanSink for Collect {
        async fn on_code(&self, event: ScanEvent) {
            self.0.lock().await.push(event.code);
        }
    }

    struct Scripted {
        results: Mutex<VecDeque<Result<Option<String>>>>,
        polls: AtomicUsize,
        init_fails: bool,
    }

    impl Scripted {
        fn new(results: Vec<Result<Option<String>>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                polls: AtomicUsize::new(0),
                init_fails: false,
            }
        }
    }

    #[async_trait]
    impl CaptureTool for Scripted {
        async fn init(&self) -> Result<()> {
            if self.init_fails {
                return Err(LabwerkError::Capture("no such control".into()));
            }
            Ok(())
        }

        async fn capture_once(&self) -> Result<Option<String>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_the_first_readable_frame_and_keeps_polling() {
        let mut script: Vec<Result<Option<String>>> = (0..5).map(|_| Ok(None)).collect();
        script.push(Ok(Some("X9\n".into())));
        let tool = Arc::new(Scripted::new(script));
        let sink = Arc::new(Collect::default());

        let handle = PolledCapture::new(tool.clone(), Duration::from_millis(250))
            .start(sink.clone());
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(*sink.0.lock().await, ["X9"]);
        assert!(tool.polls.load(Ordering::SeqCst) > 6);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn capture_errors_do_not_stop_polling() {
        let tool = Arc::new(Scripted::new(vec![
            Err(LabwerkError::Capture("device busy".into())),
            Ok(Some("  ".into())),
            Ok(Some("AB12".into())),
        ]));
        let sink = Arc::new(Collect::default());

        let handle = PolledCapture::new(tool, Duration::from_millis(100)).start(sink.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*sink.0.lock().await, ["AB12"]);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_loop() {
        let tool = Arc::new(Scripted::new(Vec::new()));
        let sink = Arc::new(Collect::default());
        let handle = PolledCapture::new(tool.clone(), Duration::from_millis(250))
            .start(sink.clone());

        tokio::time::sleep(Duration::from_millis(600)).await;
        handle.shutdown().await;

        let polls = tool.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tool.polls.load(Ordering::SeqCst), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_init_disables_the_source() {
        let mut tool = Scripted::new(vec![Ok(Some("X9".into()))]);
        tool.init_fails = true;
        let tool = Arc::new(tool);
        let sink = Arc::new(Collect::default());

        let handle = PolledCapture::new(tool.clone(), Duration::from_millis(250))
            .start(sink.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(handle.is_finished());
        assert_eq!(tool.polls.load(Ordering::SeqCst), 0);
        assert!(sink.0.lock().await.is_empty());
    }

    #[test]
    fn default_command_quotes_odd_device_paths() {
        assert!(default_capture_command("/dev/video0").starts_with("streamer -q -c /dev/video0 "));
        assert!(default_capture_command("/dev/my cam").contains("-c '/dev/my cam' "));
    }

    #[test]
    fn override_replaces_pipeline() {
        let settings = ScannerSettings {
            capture_command: Some("cat /tmp/code".into()),
            ..ScannerSettings::default()
        };
        assert_eq!(CommandCapture::new("/dev/video0", &settings).command(), "cat /tmp/code");
    }

    #[tokio::test]
    async fn command_capture_classifies_exit_status() {
        let mut settings = ScannerSettings {
            init_commands: Vec::new(),
            ..ScannerSettings::default()
        };

        settings.capture_command = Some("printf ' X9 \\n'".into());
        let found = CommandCapture::new("", &settings).capture_once().await.unwrap();
        assert_eq!(found.as_deref(), Some("X9"));

        settings.capture_command = Some("exit 1".into());
        let silent = CommandCapture::new("", &settings).capture_once().await.unwrap();
        assert!(silent.is_none());

        settings.capture_command = Some("echo 'no camera' >&2; exit 1".into());
        let err = CommandCapture::new("", &settings).capture_once().await.unwrap_err();
        assert!(matches!(err, LabwerkError::Capture(ref m) if m == "no camera"));
    }

    #[tokio::test]
    async fn failing_init_command_is_a_capture_error() {
        let settings = ScannerSettings {
            init_commands: vec!["true".into(), "echo bad control >&2; false".into()],
            ..ScannerSettings::default()
        };
        let err = CommandCapture::new("/dev/video0", &settings).init().await.unwrap_err();
        assert!(err.to_string().contains("bad control"));
    }
}
