// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Agent configuration.
//
// Loaded once at startup from `settings.json` and then split: connection
// parameters go to the session manager as an immutable value, the device
// list becomes the shared `DeviceRegistry`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LabwerkError, Result};
use crate::types::Device;

/// Port the controller listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 5555;

/// Upper bound on `max_missed_beats`.
pub const MAX_MISSED_BEATS: f64 = 100.0;

/// Persistent agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Display name reported by `identify`.
    pub name: String,
    /// Controller host name or address.
    pub host: String,
    /// Controller port.
    pub port: u16,
    pub tls: TlsSettings,
    pub heartbeat: HeartbeatSettings,
    pub backoff: BackoffSettings,
    pub spool: SpoolSettings,
    pub scanner: ScannerSettings,
    /// Static device list; registry order is list order.
    pub devices: Vec<Device>,
    /// Verbose logging.
    pub debug: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "labwerk-agent".into(),
            host: String::new(),
            port: DEFAULT_PORT,
            tls: TlsSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            backoff: BackoffSettings::default(),
            spool: SpoolSettings::default(),
            scanner: ScannerSettings::default(),
            devices: Vec::new(),
            debug: false,
        }
    }
}

impl AgentConfig {
    /// Read a JSON settings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let mut config: Self = serde_json::from_str(&data)?;
        config.name = sanitize_name(&config.name);
        Ok(config)
    }

    /// Write the settings back as pretty-printed JSON.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Reject settings the agent cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(LabwerkError::Config("no controller host configured".into()));
        }
        if self.port == 0 {
            return Err(LabwerkError::Config("controller port must be non-zero".into()));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(LabwerkError::Config("heartbeat interval must be non-zero".into()));
        }
        let missed = self.heartbeat.max_missed_beats;
        if missed.is_nan() || missed <= 1.0 || missed > MAX_MISSED_BEATS {
            return Err(LabwerkError::Config(format!(
                "max_missed_beats must be in (1, {MAX_MISSED_BEATS}]"
            )));
        }
        if self.backoff.initial_delay_ms == 0
            || self.backoff.max_delay_ms < self.backoff.initial_delay_ms
        {
            return Err(LabwerkError::Config(
                "backoff needs 0 < initial_delay_ms <= max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// TLS parameters for the controller connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Use TLS at all. Plain TCP is only meant for lab benches.
    pub enabled: bool,
    /// PEM certificate the controller presents; its fingerprint is pinned.
    pub server_cert: Option<PathBuf>,
    /// PEM client certificate chain for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// PEM private key matching `client_cert`.
    pub client_key: Option<PathBuf>,
    /// Extra accepted SHA-256 fingerprints (hex, colons allowed).
    pub pinned_fingerprints: Vec<String>,
    /// SNI name; defaults to the controller host.
    pub server_name: Option<String>,
    /// Accept any controller certificate.
    pub insecure: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            server_cert: None,
            client_cert: None,
            client_key: None,
            pinned_fingerprints: Vec::new(),
            server_name: None,
            insecure: false,
        }
    }
}

/// Liveness probing over the multiplexed channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_ms: u64,
    /// The peer is dead after `interval × max_missed_beats` of silence.
    pub max_missed_beats: f64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            max_missed_beats: 3.5,
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Silence after which the peer is declared dead. Saturates instead of
    /// overflowing for settings `validate` would reject.
    pub fn dead_after(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval().as_secs_f64() * self.max_missed_beats)
            .unwrap_or(Duration::MAX)
    }
}

/// Reconnect delay bounds (Fibonacci growth between them).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 3_000,
            max_delay_ms: 30_000,
        }
    }
}

impl BackoffSettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Where print payloads are spooled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolSettings {
    /// Spool directory; the system temp dir when unset.
    pub dir: Option<PathBuf>,
    /// Leave spooled artifacts on disk for inspection.
    pub keep_artifacts: bool,
}

/// Scanner input parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    /// Video device for webcam capture, or hidraw path / `vvvv:pppp` ids
    /// for a keyboard scanner.
    pub device: String,
    /// Pause between capture polls.
    pub poll_interval_ms: u64,
    /// Override for the capture pipeline run through `sh -c`.
    pub capture_command: Option<String>,
    /// Camera set-up commands run once before polling.
    pub init_commands: Vec<String>,
    /// Bytes per HID input report.
    pub hid_report_len: usize,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            poll_interval_ms: 250,
            capture_command: None,
            init_commands: vec![
                "v4l2-ctl -c brightness=100".into(),
                "v4l2-ctl -c contrast=100".into(),
            ],
            hid_report_len: 8,
        }
    }
}

impl ScannerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Replace characters outside `[A-Za-z0-9._-]` with `-`.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        AgentConfig::default().name
    } else {
        cleaned
    }
}
