// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Labwerk print — spools controller payloads and drives label printers
// under the copy-count and capability policy.

pub mod driver;
pub mod pipeline;
pub mod spool;

pub use driver::{CommandDriver, DriverOutput, PrintDriver};
pub use pipeline::{PrintPipeline, PrintReport};
pub use spool::{SpoolArtifact, Spooler};
