//! rustls client configuration for the upstream tunnel.
//!
//! The default trust mode skips certificate verification entirely. Hypervisor
//! hosts typically present self-signed certificates and sit on a management
//! network the operator already trusts; deployments that cannot accept that
//! set `upstream.verify_certificates` and point `upstream.ca_file` at the
//! pool's CA bundle.

use crate::config::TlsTrust;
use console_core::{ConsoleError, ConsoleResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::Path;
use std::sync::Arc;

/// Build the client config for the given trust mode.
pub fn client_config(trust: &TlsTrust) -> ConsoleResult<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConsoleError::Config(format!("TLS config error: {e}")))?;

    let config = match trust {
        TlsTrust::InsecureSkipVerify => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification { provider }))
            .with_no_client_auth(),
        TlsTrust::CaFile(path) => builder
            .with_root_certificates(load_roots(path)?)
            .with_no_client_auth(),
    };

    Ok(config)
}

fn load_roots(path: &Path) -> ConsoleResult<RootCertStore> {
    let pem = std::fs::read(path)
        .map_err(|e| ConsoleError::Config(format!("cannot read CA file {}: {e}", path.display())))?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        let cert = cert.map_err(|e| ConsoleError::Config(format!("bad CA PEM: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| ConsoleError::Config(format!("bad CA certificate: {e}")))?;
    }

    if roots.is_empty() {
        return Err(ConsoleError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(roots)
}

/// Certificate verifier that accepts any server certificate.
///
/// Handshake signatures are still checked so the session keys belong to
/// whoever holds the presented certificate.
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipServerVerification {
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insecure_config_builds() {
        assert!(client_config(&TlsTrust::InsecureSkipVerify).is_ok());
    }

    #[test]
    fn missing_ca_file_is_config_error() {
        let trust = TlsTrust::CaFile("/nonexistent/ca.pem".into());
        assert!(matches!(client_config(&trust), Err(ConsoleError::Config(_))));
    }

    #[test]
    fn ca_file_with_certificate_builds() {
        let cert = rcgen::generate_simple_self_signed(vec!["xen.local".to_string()]).unwrap();
        let path = std::env::temp_dir().join(format!("console-proxy-ca-{}.pem", std::process::id()));
        std::fs::write(&path, cert.cert.pem()).unwrap();
        let result = client_config(&TlsTrust::CaFile(path.clone()));
        let _ = std::fs::remove_file(&path);
        assert!(result.is_ok());
    }
}
