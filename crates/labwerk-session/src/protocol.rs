// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Wire vocabulary shared by agent and controller.
//
// Every frame is a JSON header plus an optional raw body. The set of remote
// operations is closed: both sides agree on `Call` up front and advertise
// which of them they serve in `Hello`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use labwerk_core::error::{ErrorCode, LabwerkError, Result};
use labwerk_core::types::DeviceSelector;

/// Names of the remote operations, as advertised in `Hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Identify,
    Print,
    ReportScan,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Identify => "identify",
            Self::Print => "print",
            Self::ReportScan => "report_scan",
        };
        f.write_str(s)
    }
}

/// A remote invocation with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
    Identify,
    Print {
        selector: DeviceSelector,
        /// Left loosely typed; the print pipeline owns its validation.
        #[serde(default)]
        copies: Value,
    },
    ReportScan {
        code: String,
    },
}

impl Call {
    pub fn method(&self) -> Method {
        match self {
            Self::Identify => Method::Identify,
            Self::Print { .. } => Method::Print,
            Self::ReportScan { .. } => Method::ReportScan,
        }
    }
}

/// Where a call's binary argument travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadDescriptor {
    #[default]
    None,
    /// In the body of the call frame itself.
    Inline,
    /// In `StreamChunk` frames that follow, closed by `StreamEnd`.
    Stream { stream: u64 },
}

/// Result of a call as carried in a `Reply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok {
        #[serde(default)]
        value: Value,
    },
    Err {
        code: ErrorCode,
        message: String,
    },
}

impl From<Result<Value>> for Outcome {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self::Ok { value },
            Err(e) => Self::Err {
                code: e.code(),
                message: e.to_string(),
            },
        }
    }
}

impl Outcome {
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Ok { value } => Ok(value),
            Self::Err { code, message } => Err(LabwerkError::remote(code, message)),
        }
    }
}

/// Frame header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        methods: Vec<Method>,
    },
    Call {
        id: u64,
        call: Call,
        #[serde(default)]
        payload: PayloadDescriptor,
    },
    Reply {
        id: u64,
        outcome: Outcome,
    },
    Heartbeat {
        seq: u64,
        sent_at: DateTime<Utc>,
    },
    HeartbeatAck {
        seq: u64,
    },
    StreamChunk {
        stream: u64,
    },
    StreamEnd {
        stream: u64,
    },
    StreamAbort {
        stream: u64,
        message: String,
    },
    /// A call whose arguments did not parse. Made by the decoder so the
    /// caller can be answered; never written to the wire.
    #[serde(skip)]
    Malformed {
        id: u64,
        reason: String,
    },
}

impl Frame {
    /// Liveness traffic that must never queue behind payload data.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::Hello { .. }
                | Self::Reply { .. }
                | Self::Heartbeat { .. }
                | Self::HeartbeatAck { .. }
        )
    }
}

/// One decoded frame: header plus raw body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub frame: Frame,
    pub body: Bytes,
}

impl Message {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            body: Bytes::new(),
        }
    }

    pub fn with_body(frame: Frame, body: Bytes) -> Self {
        Self { frame, body }
    }
}
