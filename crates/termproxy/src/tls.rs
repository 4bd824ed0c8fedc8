//! Mutually-authenticated TLS on both ends.
//!
//! The server only completes a handshake with peers presenting a certificate
//! signed by the configured CA. The client trusts the CA plus the server's
//! own certificate and presents its certificate in turn.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::error::{ProxyError, Result};
use crate::transport::Transport;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ProxyError::Tls(format!("could not open {}: {e}", path.display())))
}

/// Read every PEM certificate in `path`. A file with none is an error.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| ProxyError::Tls(format!("could not parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) in `path`.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Tls(format!("could not parse {}: {e}", path.display())))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in {}", path.display())))
}

fn root_store(paths: &[&Path]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for path in paths {
        let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
        tracing::debug!(path = %path.display(), added, ignored, "loaded trust anchors");
    }
    if roots.is_empty() {
        return Err(ProxyError::Tls("no usable trust anchors".into()));
    }
    Ok(roots)
}

/// Server side: present `cert`/`key`, require a client certificate issued
/// by `ca`.
pub fn server_acceptor(ca: &Path, cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let roots = root_store(&[ca])?;
    let certs = load_certs(cert)?;
    let key = load_key(key)?;
    let provider = provider();

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| ProxyError::Tls(format!("could not build client verifier: {e}")))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("invalid server certificate or key: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client side: trust `ca` and `server_cert`, authenticate with
/// `cert`/`key`.
pub fn client_connector(
    ca: &Path,
    server_cert: &Path,
    cert: &Path,
    key: &Path,
) -> Result<TlsConnector> {
    let roots = root_store(&[ca, server_cert])?;
    let certs = load_certs(cert)?;
    let key = load_key(key)?;

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("invalid client certificate or key: {e}")))?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Dial `addr` and complete the TLS handshake, verifying the server as
/// `server_name`.
pub async fn connect(
    connector: &TlsConnector,
    addr: &str,
    server_name: &str,
) -> Result<client::TlsStream<TcpStream>> {
    let name = ServerName::try_from(server_name)
        .map_err(|e| ProxyError::Tls(format!("invalid server name {server_name:?}: {e}")))?
        .to_owned();

    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| ProxyError::Network(format!("could not connect to {addr}: {e}")))?;
    tcp.set_nodelay(true)
        .map_err(|e| ProxyError::Network(e.to_string()))?;

    let stream = connector
        .connect(name, tcp)
        .await
        .map_err(|e| ProxyError::Tls(format!("handshake with {addr} failed: {e}")))?;
    tracing::debug!(addr, "tls session established");
    Ok(stream)
}

impl Transport for TlsAcceptor {
    type Stream = server::TlsStream<TcpStream>;

    async fn establish(&self, tcp: TcpStream) -> io::Result<Self::Stream> {
        tcp.set_nodelay(true)?;
        self.accept(tcp).await
    }
}
