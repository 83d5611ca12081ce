// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Plain TCP transport for bench setups without TLS.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use labwerk_core::error::{LabwerkError, Result};

use crate::{BoxedStream, CONNECT_TIMEOUT, TransportProvider};

/// Unencrypted connection to the controller.
pub struct TcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Open a TCP socket within `timeout`.
pub(crate) async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| {
            LabwerkError::Connect(format!(
                "connection to {addr} timed out after {}s",
                timeout.as_secs()
            ))
        })?
        .map_err(|e| LabwerkError::Connect(format!("connect to {addr}: {e}")))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "could not disable Nagle");
    }
    Ok(stream)
}

#[async_trait]
impl TransportProvider for TcpTransport {
    async fn connect(&self) -> Result<BoxedStream> {
        let stream = connect_tcp(&self.host, self.port, self.timeout).await?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
