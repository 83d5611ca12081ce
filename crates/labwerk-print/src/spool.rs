// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spooling of print payloads to uniquely named temporary artifacts.
//
// An artifact removes itself when dropped, so every exit path of a print
// job cleans up. With `keep_artifacts` it is left on disk instead.

use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use labwerk_core::config::SpoolSettings;
use labwerk_core::error::{LabwerkError, Result};
use labwerk_session::Payload;

const ARTIFACT_PREFIX: &str = "labwerk-";
const ARTIFACT_SUFFIX: &str = ".label";

#[derive(Debug, Clone)]
pub struct Spooler {
    dir: PathBuf,
    keep: bool,
}

impl Spooler {
    pub fn new(dir: impl Into<PathBuf>, keep: bool) -> Self {
        Self {
            dir: dir.into(),
            keep,
        }
    }

    /// Spool into the configured directory, or the system temp dir.
    pub fn from_settings(settings: &SpoolSettings) -> Self {
        let dir = settings.dir.clone().unwrap_or_else(std::env::temp_dir);
        Self::new(dir, settings.keep_artifacts)
    }

    /// Write `payload` to a fresh artifact. On failure the partial artifact
    /// is cleaned up like any other.
    pub async fn spool(&self, payload: Payload) -> Result<SpoolArtifact> {
        let dir = self.dir.clone();
        let named = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(ARTIFACT_PREFIX)
                .suffix(ARTIFACT_SUFFIX)
                .tempfile_in(dir)
        })
        .await
        .map_err(|e| LabwerkError::Spool(format!("artifact creation aborted: {e}")))?
        .map_err(|e| {
            LabwerkError::Spool(format!("cannot create artifact in {}: {e}", self.dir.display()))
        })?;

        let (file, temp) = named.into_parts();
        let mut artifact = SpoolArtifact {
            path: temp.to_path_buf(),
            temp: Some(temp),
            keep: self.keep,
            len: 0,
        };
        debug!(path = %artifact.path.display(), "opened artifact");

        let mut file = tokio::fs::File::from_std(file);
        match write_payload(&mut file, payload).await {
            Ok(0) => Err(LabwerkError::Spool("print payload is empty".into())),
            Ok(len) => {
                artifact.len = len;
                Ok(artifact)
            }
            Err(e) => {
                warn!(path = %artifact.path.display(), error = %e, "error writing artifact");
                Err(LabwerkError::Spool(e.to_string()))
            }
        }
    }
}

async fn write_payload(file: &mut tokio::fs::File, payload: Payload) -> std::io::Result<u64> {
    let len = match payload {
        Payload::Empty => 0,
        Payload::Bytes(bytes) => {
            file.write_all(&bytes).await?;
            bytes.len() as u64
        }
        Payload::Stream(mut reader) => tokio::io::copy(&mut reader, file).await?,
    };
    file.flush().await?;
    Ok(len)
}

/// A spooled payload on disk.
#[derive(Debug)]
pub struct SpoolArtifact {
    path: PathBuf,
    temp: Option<TempPath>,
    keep: bool,
    len: u64,
}

impl SpoolArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SpoolArtifact {
    fn drop(&mut self) {
        let Some(temp) = self.temp.take() else {
            return;
        };
        if self.keep {
            match temp.keep() {
                Ok(path) => info!(path = %path.display(), "keeping print artifact"),
                Err(e) => warn!(error = %e, "could not keep print artifact"),
            }
        } else if let Err(e) = temp.close() {
            warn!(path = %self.path.display(), error = %e, "could not remove print artifact");
        } else {
            debug!(path = %self.path.display(), "removed print artifact");
        }
    }
}
