//! rustls pieces both hosts share: the restricted provider and server
//! certificate pinning. A server is trusted only if one certificate it
//! presents hashes (SHA3-256) to the configured fingerprint; there are no CA roots.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use tracing::{debug, warn};

use crate::integrity::{certificate_fingerprint, HASH_LEN};

/// ring with AES-256-GCM suites only, ECDHE key exchange.
pub fn crypto_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![
            ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ],
        ..ring::default_provider()
    }
}

#[derive(Debug)]
pub struct FingerprintVerifier {
    fingerprint: [u8; HASH_LEN],
    algorithms: WebPkiSupportedAlgorithms,
}

impl FingerprintVerifier {
    pub fn new(fingerprint: [u8; HASH_LEN], algorithms: WebPkiSupportedAlgorithms) -> Self {
        Self {
            fingerprint,
            algorithms,
        }
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    /// Accept if the leaf or any intermediate the server sent matches the pin.
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let matched = std::iter::once(end_entity)
            .chain(intermediates)
            .position(|cert| certificate_fingerprint(cert.as_ref()) == self.fingerprint);
        match matched {
            Some(depth) => {
                debug!(depth, "server certificate chain matches pinned fingerprint");
                Ok(ServerCertVerified::assertion())
            }
            None => {
                warn!(
                    presented = %hex::encode(certificate_fingerprint(end_entity.as_ref())),
                    expected = %hex::encode(self.fingerprint),
                    chain = intermediates.len() + 1,
                    "no server certificate matches pinned fingerprint"
                );
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

pub fn client_config(fingerprint: [u8; HASH_LEN]) -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(crypto_provider());
    let verifier = Arc::new(FingerprintVerifier::new(
        fingerprint,
        provider.signature_verification_algorithms,
    ));
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier_for(cert: &[u8]) -> FingerprintVerifier {
        FingerprintVerifier::new(
            certificate_fingerprint(cert),
            crypto_provider().signature_verification_algorithms,
        )
    }

    fn check(
        verifier: &FingerprintVerifier,
        leaf: &[u8],
        chain: &[&[u8]],
    ) -> Result<ServerCertVerified, rustls::Error> {
        let intermediates: Vec<CertificateDer<'_>> =
            chain.iter().map(|c| CertificateDer::from(c.to_vec())).collect();
        verifier.verify_server_cert(
            &CertificateDer::from(leaf.to_vec()),
            &intermediates,
            &ServerName::try_from("localhost").unwrap(),
            &[],
            UnixTime::now(),
        )
    }

    #[test]
    fn pin_may_match_any_certificate_in_chain() {
        let (leaf, intermediate, root) = (&b"leaf"[..], &b"intermediate"[..], &b"root"[..]);
        assert!(check(&verifier_for(leaf), leaf, &[intermediate, root]).is_ok());
        assert!(check(&verifier_for(intermediate), leaf, &[intermediate, root]).is_ok());
        assert!(check(&verifier_for(root), leaf, &[intermediate, root]).is_ok());
    }

    #[test]
    fn unmatched_chain_is_rejected() {
        let err = check(&verifier_for(b"elsewhere"), b"leaf", &[b"intermediate"]).unwrap_err();
        assert_eq!(
            err,
            rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
        );
    }

    #[test]
    fn provider_offers_only_aes256() {
        let provider = crypto_provider();
        assert_eq!(provider.cipher_suites.len(), 3);
        for suite in &provider.cipher_suites {
            assert!(format!("{:?}", suite.suite()).contains("AES_256_GCM"));
        }
    }

    #[test]
    fn verifier_offers_provider_schemes() {
        assert!(!verifier_for(b"cert").supported_verify_schemes().is_empty());
    }

    #[test]
    fn client_config_builds() {
        assert!(client_config([0; HASH_LEN]).is_ok());
    }
}
