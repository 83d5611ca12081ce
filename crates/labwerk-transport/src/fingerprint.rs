// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Certificate fingerprints and the peer-identity predicate.

use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Decides whether a controller presenting this SHA-256 fingerprint (lowercase
/// hex, no separators) is trusted.
pub type PeerVerifier = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// SHA-256 of a DER certificate as lowercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der);
    hex::encode(hasher.finalize())
}

/// Canonical form of a user-supplied fingerprint: separators stripped,
/// lowercase.
pub fn normalize(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Trust exactly the given fingerprints.
pub fn pinned<I, S>(fingerprints: I) -> PeerVerifier
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: HashSet<String> = fingerprints
        .into_iter()
        .map(|f| normalize(f.as_ref()))
        .filter(|f| !f.is_empty())
        .collect();
    Arc::new(move |presented| set.contains(presented))
}

/// Trust anything. Only for `--insecure` bench setups.
pub fn accept_any() -> PeerVerifier {
    Arc::new(|_| true)
}
