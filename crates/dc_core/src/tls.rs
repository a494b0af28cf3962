//! TLS setup for both ends, on rustls with the ring provider.
//!
//! The client trusts exactly the CA (or self-signed certificate) named in
//! its config; there is no fallback to system roots.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{
    self,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    RootCertStore,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::ClientConfig;
use crate::error::{CourierError, Result};

pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn tls_err(e: impl std::fmt::Display) -> CourierError {
    CourierError::Tls(e.to_string())
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| CourierError::Tls(format!("cannot read {}: {e}", path.display())))
}

pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(tls_err)?;
    if certs.is_empty() {
        return Err(CourierError::Tls("no certificates found".into()));
    }
    Ok(certs)
}

pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(tls_err)?
        .ok_or_else(|| CourierError::Tls("no private key found".into()))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    parse_certs(&read_pem(path)?)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    parse_private_key(&read_pem(path)?)
}

pub fn server_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_no_client_auth()
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(tls_err)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub fn client_connector(ca_cert: &Path) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_cert)? {
        roots.add(cert).map_err(tls_err)?;
    }
    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Open a TCP connection to the configured server and complete the TLS
/// handshake.
pub async fn connect(config: &ClientConfig) -> Result<TlsStream<TcpStream>> {
    let ca_cert = config
        .ca_cert
        .as_deref()
        .ok_or_else(|| CourierError::Config("ca_cert must be set to connect".into()))?;
    let connector = client_connector(ca_cert)?;
    let name = ServerName::try_from(config.server_name.clone())
        .map_err(|e| CourierError::Config(format!("invalid server_name: {e}")))?;

    let tcp = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(&config.server_addr))
        .await
        .map_err(|_| CourierError::Timeout("connect"))??;
    let _ = tcp.set_nodelay(true);
    let tls = timeout(HANDSHAKE_TIMEOUT, connector.connect(name, tcp))
        .await
        .map_err(|_| CourierError::Timeout("complete the TLS handshake"))?
        .map_err(tls_err)?;
    tracing::info!(target: "dc_core", addr = %config.server_addr, "connected");
    Ok(tls)
}
