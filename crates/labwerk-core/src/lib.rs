// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Labwerk — Core types, error definitions, configuration and the device
// registry shared across all crates.

pub mod config;
pub mod error;
pub mod identity;
pub mod registry;
pub mod types;

pub use config::AgentConfig;
pub use error::{ErrorCode, LabwerkError, Result};
pub use identity::NodeIdentity;
pub use registry::{DeviceRegistry, SharedRegistry};
pub use types::*;
