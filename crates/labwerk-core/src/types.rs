// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Labwerk edge agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LabwerkError, Result};

/// Hard ceiling on copies per print call. Guards against runaway physical
/// printing from a malformed or hostile request.
pub const MAX_COPIES: u32 = 20;

/// Kind of peripheral attached to the agent.
///
/// Serialized with the camelCase tags the controller already knows
/// (`qlPrinter`, `dymoPrinter`, `webcamScanner`, `keyboardScanner`). Any
/// other tag is kept as `Other` so one unfamiliar entry does not stop the
/// agent from loading its settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceKind {
    /// Brother QL label printer driven through `ql570`.
    QlPrinter,
    /// DYMO label printer driven through CUPS `lpr`.
    DymoPrinter,
    /// Webcam polled for DataMatrix codes.
    WebcamScanner,
    /// USB HID scanner that types codes like a keyboard.
    KeyboardScanner,
    /// A tag this agent has no driver for.
    Other(String),
}

impl DeviceKind {
    /// The wire tag for this kind.
    pub fn tag(&self) -> &str {
        match self {
            Self::QlPrinter => "qlPrinter",
            Self::DymoPrinter => "dymoPrinter",
            Self::WebcamScanner => "webcamScanner",
            Self::KeyboardScanner => "keyboardScanner",
            Self::Other(tag) => tag.as_str(),
        }
    }

    /// Printers are recognised by tag, known driver or not.
    pub fn is_printer(&self) -> bool {
        match self {
            Self::QlPrinter | Self::DymoPrinter => true,
            Self::Other(tag) => tag.ends_with("Printer"),
            _ => false,
        }
    }

    pub fn is_scanner(&self) -> bool {
        matches!(self, Self::WebcamScanner | Self::KeyboardScanner)
    }
}

impl From<&str> for DeviceKind {
    fn from(tag: &str) -> Self {
        match tag {
            "qlPrinter" => Self::QlPrinter,
            "dymoPrinter" => Self::DymoPrinter,
            "webcamScanner" => Self::WebcamScanner,
            "keyboardScanner" => Self::KeyboardScanner,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl From<String> for DeviceKind {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<DeviceKind> for String {
    fn from(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Other(tag) => tag,
            known => known.tag().to_owned(),
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A configured peripheral.
///
/// Field names follow the controller's settings format, so an existing
/// device list can be dropped into `settings.json` unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    /// Printer queue, device node, or USB id the driver talks to.
    #[serde(default)]
    pub device: String,
    /// Override for the driver executable (`ql570`, `lpr`, ...).
    #[serde(default, alias = "cmd")]
    pub command: Option<String>,
    /// Media/paper parameter passed to the driver.
    #[serde(default)]
    pub paper_type: Option<String>,
    /// Extra whitespace-separated driver arguments.
    #[serde(default)]
    pub args: Option<String>,
    /// Whether the driver repeats copies itself when given a count.
    #[serde(default)]
    pub supports_copies: bool,
}

impl Device {
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            device: String::new(),
            command: None,
            paper_type: None,
            args: None,
            supports_copies: false,
        }
    }

    /// Extra driver arguments split on whitespace.
    pub fn extra_args(&self) -> Vec<String> {
        self.args
            .as_deref()
            .map(|a| a.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default()
    }
}

/// Public view of a device returned by `identify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub index: usize,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
}

/// Reply to the controller's `identify` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub devices: Vec<DeviceSummary>,
}

/// How the controller picks a device: registry position or kind tag.
///
/// Any JSON integer is a valid index; negative or too-large ones simply
/// match no device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceSelector {
    Index(i64),
    Kind(String),
}

impl DeviceSelector {
    /// Selector for a known registry position.
    pub fn at(index: usize) -> Self {
        Self::Index(i64::try_from(index).unwrap_or(i64::MAX))
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(i) => write!(f, "index {i}"),
            Self::Kind(k) => write!(f, "type {k}"),
        }
    }
}

/// A validated copy count in `1..=MAX_COPIES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CopyCount(u32);

impl CopyCount {
    pub fn new(n: i64) -> Result<Self> {
        if (1..=i64::from(MAX_COPIES)).contains(&n) {
            Ok(Self(n as u32))
        } else {
            Err(LabwerkError::InvalidCopyCount(n.to_string()))
        }
    }

    /// Interpret the loosely-typed `copies` argument of a print call.
    ///
    /// Accepts integers, floats (truncated) and strings with a leading
    /// integer (`"3"`, `" 2 copies"`). A missing value means one copy.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        use serde_json::Value;

        let invalid = || LabwerkError::InvalidCopyCount(value.to_string());
        match value {
            Value::Null => Ok(Self(1)),
            Value::Number(n) => {
                let whole = match n.as_i64() {
                    Some(i) => i,
                    None => {
                        let f = n.as_f64().ok_or_else(invalid)?;
                        if !f.is_finite() {
                            return Err(invalid());
                        }
                        f.trunc() as i64
                    }
                };
                Self::new(whole).map_err(|_| invalid())
            }
            Value::String(s) => {
                let whole = parse_leading_int(s).ok_or_else(invalid)?;
                Self::new(whole).map_err(|_| invalid())
            }
            _ => Err(invalid()),
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

/// Parse an optional sign followed by decimal digits, ignoring leading
/// whitespace and anything after the digits.
fn parse_leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    // Anything that overflows is far outside the allowed range anyway.
    let magnitude: i64 = digits.parse().unwrap_or(i64::MAX);
    Some(if negative { -magnitude } else { magnitude })
}

/// A decoded barcode reported to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub code: String,
    pub observed_at: DateTime<Utc>,
}

impl ScanEvent {
    /// Trim `raw` and wrap it; blank input is not a scan.
    pub fn new(raw: &str) -> Option<Self> {
        let code = raw.trim();
        if code.is_empty() {
            return None;
        }
        Some(Self {
            code: code.to_owned(),
            observed_at: Utc::now(),
        })
    }
}

/// Lifecycle of the agent's session with the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Dead,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}
