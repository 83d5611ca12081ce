// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// TLS transport with fingerprint-pinned controller certificates.
//
// Controllers run with self-signed certificates, so WebPKI path building does
// not apply. Handshake signatures are still verified with the ring provider;
// trust is decided by a `PeerVerifier` over the SHA-256 fingerprint of the
// presented end-entity certificate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use labwerk_core::config::TlsSettings;
use labwerk_core::error::{LabwerkError, Result};

use crate::fingerprint::{self, PeerVerifier};
use crate::tcp::connect_tcp;
use crate::{BoxedStream, CONNECT_TIMEOUT, TransportProvider};

/// Encrypted connection to the controller.
pub struct TlsTransport {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    timeout: Duration,
}

impl TlsTransport {
    /// Build a transport from settings, deriving the peer predicate from
    /// the pinned fingerprints, the controller certificate, or `insecure`.
    pub fn new(host: impl Into<String>, port: u16, settings: &TlsSettings) -> Result<Self> {
        let verifier = if settings.insecure {
            warn!("TLS peer verification disabled; any controller certificate is accepted");
            fingerprint::accept_any()
        } else {
            let mut pins = settings.pinned_fingerprints.clone();
            if let Some(path) = &settings.server_cert {
                for cert in load_certs(path)? {
                    pins.push(fingerprint::fingerprint(cert.as_ref()));
                }
            }
            if pins.is_empty() {
                return Err(LabwerkError::Config(
                    "TLS needs a server_cert, pinned_fingerprints, or insecure mode".into(),
                ));
            }
            fingerprint::pinned(pins)
        };
        Self::with_verifier(host, port, settings, verifier)
    }

    /// Build a transport with a caller-supplied peer predicate.
    pub fn with_verifier(
        host: impl Into<String>,
        port: u16,
        settings: &TlsSettings,
        verifier: PeerVerifier,
    ) -> Result<Self> {
        let host = host.into();
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| LabwerkError::Config(format!("TLS protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(FingerprintVerifier {
                verifier,
                provider,
            }));

        let config = match (&settings.client_cert, &settings.client_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
                    LabwerkError::Config(format!("client key {}: {e}", key_path.display()))
                })?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| LabwerkError::Config(format!("client certificate: {e}")))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(LabwerkError::Config(
                    "client_cert and client_key must be configured together".into(),
                ));
            }
        };

        let sni = settings.server_name.clone().unwrap_or_else(|| host.clone());
        let server_name = ServerName::try_from(sni.clone())
            .map_err(|e| LabwerkError::Config(format!("invalid TLS server name {sni}: {e}")))?;

        Ok(Self {
            host,
            port,
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
            timeout: CONNECT_TIMEOUT,
        })
    }

}

#[async_trait]
impl TransportProvider for TlsTransport {
    async fn connect(&self) -> Result<BoxedStream> {
        let tcp = connect_tcp(&self.host, self.port, self.timeout).await?;
        let tls = tokio::time::timeout(
            self.timeout,
            self.connector.connect(self.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| LabwerkError::Connect(format!("TLS handshake with {} timed out", self.describe())))?
        .map_err(|e| handshake_error(&self.describe(), e))?;

        debug!(peer = %self.describe(), "TLS session established");
        Ok(Box::new(tls))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A handshake refused by rustls itself (bad certificate, no common
/// protocol) will not clear by retrying; anything else is a network fault.
fn handshake_error(peer: &str, e: std::io::Error) -> LabwerkError {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        Some(tls) => LabwerkError::TlsRejected(format!("TLS handshake with {peer}: {tls}")),
        None => LabwerkError::Connect(format!("TLS handshake with {peer}: {e}")),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| LabwerkError::Config(format!("certificate {}: {e}", path.display())))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| LabwerkError::Config(format!("certificate {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(LabwerkError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Accepts the controller iff its end-entity fingerprint passes the predicate.
struct FingerprintVerifier {
    verifier: PeerVerifier,
    provider: Arc<CryptoProvider>,
}

impl std::fmt::Debug for FingerprintVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let presented = fingerprint::fingerprint(end_entity.as_ref());
        if (self.verifier)(&presented) {
            debug!(fingerprint = %presented, "controller certificate accepted");
            Ok(ServerCertVerified::assertion())
        } else {
            warn!(fingerprint = %presented, "controller certificate rejected");
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
