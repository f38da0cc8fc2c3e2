//! TLS dialer. Trust comes from the pinned fingerprint in `blocksync_core::tls`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// TCP connect plus TLS handshake, bounded by `limit` as a whole.
pub async fn connect(
    addr: &str,
    server_name: &str,
    config: ClientConfig,
    limit: Duration,
) -> anyhow::Result<TlsStream<TcpStream>> {
    let name = ServerName::try_from(server_name.to_string())
        .with_context(|| format!("invalid server name {server_name}"))?;
    let connector = TlsConnector::from(Arc::new(config));
    let dial = async {
        let tcp = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        connector
            .connect(name, tcp)
            .await
            .context("TLS handshake failed")
    };
    tokio::time::timeout(limit, dial)
        .await
        .with_context(|| format!("connecting to {addr} timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksync_core::integrity::{certificate_fingerprint, HASH_LEN};
    use blocksync_core::tls::{client_config, crypto_provider};
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::ServerConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    fn server_config(chain: Vec<CertificateDer<'static>>, key: &KeyPair) -> ServerConfig {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        ServerConfig::builder_with_provider(Arc::new(crypto_provider()))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .unwrap()
    }

    /// Self-signed leaf: (config, leaf fingerprint).
    fn self_signed() -> (ServerConfig, [u8; HASH_LEN]) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let der = cert.cert.der().clone();
        let fingerprint = certificate_fingerprint(der.as_ref());
        (server_config(vec![der], &cert.key_pair), fingerprint)
    }

    /// Leaf signed by a local CA, served with the CA appended:
    /// (config, leaf fingerprint, CA fingerprint).
    fn ca_signed() -> (ServerConfig, [u8; HASH_LEN], [u8; HASH_LEN]) {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .signed_by(&leaf_key, &ca, &ca_key)
            .unwrap();

        let leaf_fp = certificate_fingerprint(leaf.der().as_ref());
        let ca_fp = certificate_fingerprint(ca.der().as_ref());
        let config = server_config(vec![leaf.der().clone(), ca.der().clone()], &leaf_key);
        (config, leaf_fp, ca_fp)
    }

    /// Handshake over an in-memory pipe and push one message through.
    async fn handshake(server: ServerConfig, pin: [u8; HASH_LEN]) -> bool {
        let acceptor = TlsAcceptor::from(Arc::new(server));
        let connector = TlsConnector::from(Arc::new(client_config(pin).unwrap()));
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let mut tls = acceptor.accept(server_io).await.ok()?;
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.ok()?;
            Some(buf)
        });
        let name = ServerName::try_from("localhost").unwrap();
        let Ok(mut tls) = connector.connect(name, client_io).await else {
            assert_eq!(server.await.unwrap(), None);
            return false;
        };
        tls.write_all(b"ping").await.unwrap();
        tls.flush().await.unwrap();
        assert_eq!(server.await.unwrap(), Some(*b"ping"));
        true
    }

    #[tokio::test]
    async fn pinned_leaf_is_accepted() {
        let (config, fingerprint) = self_signed();
        assert!(handshake(config, fingerprint).await);
    }

    #[tokio::test]
    async fn other_fingerprint_is_rejected() {
        let (config, fingerprint) = self_signed();
        let mut wrong = fingerprint;
        wrong[0] ^= 0xff;
        assert!(!handshake(config, wrong).await);
    }

    #[tokio::test]
    async fn pinned_issuer_in_chain_is_accepted() {
        let (config, _, ca_fp) = ca_signed();
        assert!(handshake(config, ca_fp).await);
        let (config, leaf_fp, _) = ca_signed();
        assert!(handshake(config, leaf_fp).await);
    }

    #[tokio::test]
    async fn connect_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // accepts TCP but never answers the ClientHello
        let _hold = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });
        let err = connect(
            &addr,
            "localhost",
            client_config([0; HASH_LEN]).unwrap(),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
