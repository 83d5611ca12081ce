// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Stable node identity.
//
// The controller tells agents apart by a UUID kept in a small file next to
// the settings. A missing or mangled file is replaced with a fresh id.

use std::path::Path;

use tracing::{info, warn};
use uuid::Uuid;

/// Length of a hyphenated UUID string.
const NODE_ID_LEN: usize = 36;

/// The agent's identity as reported to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: String,
    pub name: String,
}

impl NodeIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Read the node id stored at `path`, regenerating it when absent or
    /// malformed. Failure to store a fresh id is logged; the id is still
    /// used for this run.
    pub fn load_or_create(path: impl AsRef<Path>, name: impl Into<String>) -> Self {
        let path = path.as_ref();
        let id = match std::fs::read_to_string(path) {
            Ok(stored) if is_valid_node_id(stored.trim_end()) => stored.trim_end().to_owned(),
            Ok(_) => {
                warn!(path = %path.display(), "invalid node ID, regenerating");
                regenerate(path)
            }
            Err(_) => regenerate(path),
        };
        Self::new(id, name)
    }
}

fn is_valid_node_id(candidate: &str) -> bool {
    candidate.len() == NODE_ID_LEN && Uuid::parse_str(candidate).is_ok()
}

fn regenerate(path: &Path) -> String {
    let id = Uuid::new_v4().to_string();
    match std::fs::write(path, &id) {
        Ok(()) => info!(path = %path.display(), node_id = %id, "generated new node ID"),
        Err(e) => warn!(path = %path.display(), error = %e, "could not store node ID"),
    }
    id
}
