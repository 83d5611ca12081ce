// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Labwerk session — framed bidirectional calls over one duplex stream, kept
// alive by heartbeats and re-established with backoff.

pub mod backoff;
pub mod codec;
pub mod heartbeat;
pub mod mux;
pub mod protocol;
pub mod session;

pub use backoff::Backoff;
pub use heartbeat::HeartbeatMonitor;
pub use mux::{MethodHandler, MuxHandle, Multiplexer, Payload, PeerProxy};
pub use protocol::{Call, Method};
pub use session::{SessionConfig, SessionHooks, SessionManager};
