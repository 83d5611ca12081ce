// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Labwerk transport — duplex byte streams to the controller over plain TCP
// or fingerprint-pinned TLS.

pub mod fingerprint;
pub mod tcp;
pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use labwerk_core::config::TlsSettings;
use labwerk_core::error::Result;

pub use fingerprint::PeerVerifier;
pub use tcp::TcpTransport;
pub use tls::TlsTransport;

/// Time allowed for TCP connect and, separately, the TLS handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Any bidirectional byte stream the session can run over.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// Yields a fresh duplex stream to the controller, or a `Connect` error.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream>;

    /// `host:port` for log lines.
    fn describe(&self) -> String;
}

/// Pick TLS or plain TCP from the settings.
pub fn from_settings(
    host: &str,
    port: u16,
    tls: &TlsSettings,
) -> Result<Arc<dyn TransportProvider>> {
    if tls.enabled {
        Ok(Arc::new(TlsTransport::new(host, port, tls)?))
    } else {
        warn!(host, port, "TLS disabled; controller traffic is unencrypted");
        Ok(Arc::new(TcpTransport::new(host, port)))
    }
}
