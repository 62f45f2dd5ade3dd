//! TLS client configuration

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::errors::{PoolError, PoolResult};

/// How server certificates are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Certificate chain and hostname are verified against the trust roots
    Verified,

    /// Any certificate for any hostname is accepted
    InsecureTrustAll,
}

impl TlsPolicy {
    pub fn from_config(config: &PoolConfig) -> Self {
        if config.verify_ssl {
            TlsPolicy::Verified
        } else {
            TlsPolicy::InsecureTrustAll
        }
    }

    pub fn is_insecure(self) -> bool {
        matches!(self, TlsPolicy::InsecureTrustAll)
    }
}

impl fmt::Display for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsPolicy::Verified => f.write_str("verified"),
            TlsPolicy::InsecureTrustAll => f.write_str("INSECURE (certificate verification disabled)"),
        }
    }
}

/// Build the rustls client configuration for `config`
pub(crate) fn client_config(config: &PoolConfig) -> PoolResult<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| PoolError::config(format!("TLS protocol setup failed: {e}")))?;

    let client_config = match TlsPolicy::from_config(config) {
        TlsPolicy::Verified => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            if let Some(path) = &config.ca_certificates {
                let added = load_pem_roots(path, &mut roots)?;
                debug!(path = %path.display(), added, "loaded extra trust roots");
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TlsPolicy::InsecureTrustAll => {
            warn!("TLS certificate and hostname verification is DISABLED; every server certificate will be trusted");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustAllVerifier { provider }))
                .with_no_client_auth()
        }
    };

    Ok(Arc::new(client_config))
}

fn load_pem_roots(path: &Path, roots: &mut RootCertStore) -> PoolResult<usize> {
    let file = File::open(path)
        .map_err(|e| PoolError::config(format!("cannot open CA bundle {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert
            .map_err(|e| PoolError::config(format!("malformed PEM in {}: {e}", path.display())))?;
        roots
            .add(cert)
            .map_err(|e| PoolError::config(format!("rejected CA certificate in {}: {e}", path.display())))?;
        added += 1;
    }

    if added == 0 {
        return Err(PoolError::config(format!("no certificates found in {}", path.display())));
    }
    Ok(added)
}

/// Accepts every certificate and hostname; only signatures are still checked
#[derive(Debug)]
struct TrustAllVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for TrustAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
