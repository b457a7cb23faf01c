use std::sync::Arc;
use std::sync::OnceLock;

use rustls::client::danger::ServerCertVerifier;

use crate::tls_session_cache::TlsSessionCache;

/// Build a TLS client config for an upstream connection.
///
/// The certificate verifier is the pluggable seam: `None` selects the
/// standard WebPKI verifier over the bundled roots. The session store is
/// scoped by the caller to `(server_name, alpn)` through
/// [`TlsSessionCache::store_for`].
pub fn create_client_config(
    verifier: Option<Arc<dyn ServerCertVerifier>>,
    alpn_protocols: &[&[u8]],
    session_cache: &TlsSessionCache,
) -> rustls::ClientConfig {
    let builder = rustls::ClientConfig::builder_with_provider(get_crypto_provider())
        .with_safe_default_protocol_versions()
        .expect("default protocol versions are supported by the provider");

    let builder = match verifier {
        Some(verifier) => builder.dangerous().with_custom_certificate_verifier(verifier),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(get_webpki_verifier()),
    };

    let mut config = builder.with_no_client_auth();
    config.alpn_protocols = alpn_protocols.iter().map(|p| p.to_vec()).collect();
    config.resumption =
        rustls::client::Resumption::store(session_cache.store_for(alpn_protocols));
    config
}

pub fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    static INSTANCE: OnceLock<Arc<rustls::crypto::CryptoProvider>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .clone()
}

fn get_webpki_verifier() -> Arc<dyn ServerCertVerifier> {
    static INSTANCE: OnceLock<Arc<dyn ServerCertVerifier>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| {
            rustls::client::WebPkiServerVerifier::builder_with_provider(
                get_root_cert_store(),
                get_crypto_provider(),
            )
            .build()
            .expect("bundled roots are valid")
        })
        .clone()
}

/// Certificate verifier that accepts any chain. Only for upstreams the
/// caller explicitly opted out of verification for (e.g. stamps with
/// `DNSSEC`-only trust or test fixtures).
#[derive(Debug)]
pub struct DisabledVerifier {
    supported_algs: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl DisabledVerifier {
    pub fn new() -> Self {
        Self {
            supported_algs: get_crypto_provider().signature_verification_algorithms,
        }
    }
}

impl Default for DisabledVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCertVerifier for DisabledVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

fn get_root_cert_store() -> Arc<rustls::RootCertStore> {
    static INSTANCE: OnceLock<Arc<rustls::RootCertStore>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| {
            let root_store = rustls::RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            Arc::new(root_store)
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_carries_alpn() {
        let cache = TlsSessionCache::new(64);
        let config = create_client_config(None, &[b"dot"], &cache);
        assert_eq!(config.alpn_protocols, vec![b"dot".to_vec()]);
    }
}
