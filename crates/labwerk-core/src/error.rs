// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Labwerk.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for all Labwerk operations.
#[derive(Debug, Error)]
pub enum LabwerkError {
    // -- Session errors --
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("controller rejected: {0}")]
    TlsRejected(String),

    #[error("peer stopped answering heartbeats")]
    PeerDeath,

    #[error("connection closed: {0}")]
    Disconnected(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("remote call failed ({code}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("peer does not expose method `{0}`")]
    UnknownMethod(String),

    #[error("call abandoned: connection torn down")]
    CallAbandoned,

    // -- Print errors --
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device {index} ({kind}) is not a printer")]
    NotAPrinter { index: usize, kind: String },

    #[error("invalid or disallowed number of copies: {0}")]
    InvalidCopyCount(String),

    #[error("failed to spool print payload: {0}")]
    Spool(String),

    #[error("print driver failed (exit status {status:?}): {stderr}")]
    PrintDriver { status: Option<i32>, stderr: String },

    // -- Scan errors --
    #[error("capture failed: {0}")]
    Capture(String),

    #[error("scanner device error: {0}")]
    DeviceStream(String),

    // -- Configuration / persistence --
    #[error("configuration error: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LabwerkError>;

/// Wire-level classification of a failed remote call.
///
/// Carried in reply frames so the caller can tell input errors from
/// execution errors without parsing message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    DeviceNotFound,
    NotAPrinter,
    InvalidCopyCount,
    SpoolError,
    PrintDriverError,
    UnknownMethod,
    BadRequest,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DeviceNotFound => "device_not_found",
            Self::NotAPrinter => "not_a_printer",
            Self::InvalidCopyCount => "invalid_copy_count",
            Self::SpoolError => "spool_error",
            Self::PrintDriverError => "print_driver_error",
            Self::UnknownMethod => "unknown_method",
            Self::BadRequest => "bad_request",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl LabwerkError {
    /// The code reported to a remote caller when this error ends a call.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::DeviceNotFound(_) => ErrorCode::DeviceNotFound,
            Self::NotAPrinter { .. } => ErrorCode::NotAPrinter,
            Self::InvalidCopyCount(_) => ErrorCode::InvalidCopyCount,
            Self::Spool(_) => ErrorCode::SpoolError,
            Self::PrintDriver { .. } => ErrorCode::PrintDriverError,
            Self::UnknownMethod(_) => ErrorCode::UnknownMethod,
            Self::Protocol(_) | Self::Serialization(_) => ErrorCode::BadRequest,
            Self::Remote { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Rebuild an error received from the peer.
    pub fn remote(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    /// Whether the condition is expected to clear on its own (network blips,
    /// dropped peers) as opposed to needing a different request or an operator.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_)
            | Self::PeerDeath
            | Self::Disconnected(_)
            | Self::CallAbandoned
            | Self::Capture(_) => true,
            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
