//! Certificate loading and rustls server configuration.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::error::ServerError;

/// ALPN protocols offered to clients, h2 preferred.
pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1"];

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Where the server certificate comes from.
#[derive(Debug, Clone)]
pub enum CertificateSource {
    /// PEM files on disk: certificate chain and private key.
    Pem { cert_path: PathBuf, key_path: PathBuf },
    /// A ready rustls configuration (in-memory material, custom resolvers).
    Rustls(Arc<rustls::ServerConfig>),
}

impl CertificateSource {
    /// PEM certificate chain and key files.
    pub fn pem(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self::Pem {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

/// Load certificates from a PEM file.
pub fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no certificates found in {}", path.display()),
        ));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no private key found in {}", path.display()),
        )
    })
}

/// Build the rustls server configuration.
///
/// PEM material gets [`ALPN_PROTOCOLS`]. A supplied configuration is kept as
/// is, except that `http/1.1` is appended to its ALPN list when missing.
pub fn build_server_config(
    source: &CertificateSource,
) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    match source {
        CertificateSource::Pem {
            cert_path,
            key_path,
        } => {
            let certs = load_certs(cert_path).map_err(ServerError::Certificate)?;
            let key = load_private_key(key_path).map_err(ServerError::Certificate)?;

            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let mut config = rustls::ServerConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()?
                .with_no_client_auth()
                .with_single_cert(certs, key)?;
            config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
            Ok(Arc::new(config))
        }
        CertificateSource::Rustls(config) => {
            if config.alpn_protocols.iter().any(|p| p == ALPN_HTTP1) {
                return Ok(Arc::clone(config));
            }
            let mut config = rustls::ServerConfig::clone(config);
            config.alpn_protocols.push(ALPN_HTTP1.to_vec());
            Ok(Arc::new(config))
        }
    }
}

/// Build a TLS acceptor from the certificate source.
pub fn build_acceptor(source: &CertificateSource) -> Result<TlsAcceptor, ServerError> {
    Ok(TlsAcceptor::from(build_server_config(source)?))
}
