use std::sync::Arc;

use anyhow::Result;
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
    server::WebPkiClientVerifier,
};

/// certificate presented by anonymous endpoints that only need an
/// encrypted channel. It pairs with the demo server key shipped under
/// `credentials/`.
const DEFAULT_CERTIFICATE: &[u8] = include_bytes!("../credentials/default-cert.pem");

/// TLS settings for a server that verifies peers: clients must present a
/// certificate chaining to `authority`.
///
/// Only TLS 1.2 and 1.3 are ever negotiated, with ephemeral key exchange
/// on every session. A missing or malformed file fails here, before any
/// socket is opened.
pub fn server_verified(key: &str, certificate: &str, authority: &str) -> Result<Arc<ServerConfig>> {
    let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(authority)?)).build()?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            certificate_chain(certificate)?,
            PrivateKeyDer::from_pem_file(key)?,
        )?;

    Ok(Arc::new(config))
}

/// TLS settings for a server that skips peer verification. The bundled
/// default certificate backs the handshake and no client certificate is
/// requested.
pub fn server_anonymous(key: &str) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from_pem_slice(DEFAULT_CERTIFICATE)?],
            PrivateKeyDer::from_pem_file(key)?,
        )?;

    Ok(Arc::new(config))
}

/// TLS settings for a client that verifies the server against
/// `authority` and presents its own certificate for mutual auth.
pub fn client_verified(key: &str, certificate: &str, authority: &str) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder()
        .with_root_certificates(root_store(authority)?)
        .with_client_auth_cert(
            certificate_chain(certificate)?,
            PrivateKeyDer::from_pem_file(key)?,
        )?;

    Ok(Arc::new(config))
}

/// TLS settings for a client that accepts any server certificate.
///
/// The caller's key must still load cleanly, but an anonymous peer never
/// requests client credentials, so the handshake carries none.
pub fn client_anonymous(key: &str) -> Result<Arc<ClientConfig>> {
    PrivateKeyDer::from_pem_file(key)?;

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        .with_no_client_auth();

    Ok(Arc::new(config))
}

fn root_store(authority: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for certificate in CertificateDer::pem_file_iter(authority)? {
        roots.add(certificate?)?;
    }

    Ok(roots)
}

fn certificate_chain(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    Ok(CertificateDer::pem_file_iter(path)?.collect::<Result<Vec<_>, _>>()?)
}

/// server certificate verifier that accepts whatever the peer presents.
///
/// Signatures over the handshake transcript are still checked, so the
/// channel keeps its integrity; only the peer identity goes unverified.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
            &self.0.signature_verification_algorithms,
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
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(name: &str) -> String {
        format!("{}/credentials/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    #[test]
    fn server_configurations_load() {
        server_verified(
            &credential("server-key.pem"),
            &credential("server-cert.pem"),
            &credential("server-cert.pem"),
        )
        .unwrap();

        server_anonymous(&credential("server-key.pem")).unwrap();
    }

    #[test]
    fn client_configurations_load() {
        client_verified(
            &credential("client-key.pem"),
            &credential("client-cert.pem"),
            &credential("server-cert.pem"),
        )
        .unwrap();

        client_anonymous(&credential("client-key.pem")).unwrap();
    }

    #[test]
    fn missing_files_are_rejected() {
        assert!(server_anonymous("/does/not/exist/key.pem").is_err());
        assert!(client_anonymous("/does/not/exist/key.pem").is_err());
        assert!(
            server_verified(
                &credential("server-key.pem"),
                &credential("server-cert.pem"),
                "/does/not/exist/authority.pem",
            )
            .is_err()
        );
    }

    #[test]
    fn malformed_key_is_rejected() {
        // a certificate file holds no private key sections.
        assert!(server_anonymous(&credential("server-cert.pem")).is_err());
    }
}
