//! TLS Termination Material
//!
//! Loads a PEM certificate chain and private key into a `tokio-rustls`
//! acceptor backed by the `ring` provider.

use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

/// TLS setup errors.
#[derive(Debug, Error)]
pub enum TlsError {
    /// PEM file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// No certificate in the chain file.
    #[error("No certificates found")]
    NoCertificates,

    /// No usable private key in the key file.
    #[error("No valid private key found")]
    NoPrivateKey,

    /// PEM section could not be decoded.
    #[error("Invalid PEM: {0}")]
    Pem(std::io::Error),

    /// rustls rejected the material.
    #[error("TLS config error: {0}")]
    Config(#[from] rustls::Error),
}

/// Build an acceptor from PEM files on disk.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let read = |path: &Path| {
        std::fs::read(path).map_err(|source| TlsError::Read {
            path: path.display().to_string(),
            source,
        })
    };
    acceptor_from_pem(&read(cert_path)?, &read(key_path)?)
}

/// Build an acceptor from in-memory PEM.
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, TlsError> {
    let certs = parse_certs(cert_pem)?;
    let key = parse_private_key(key_pem)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Pem)?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}

/// PKCS#8 first, then PKCS#1 (RSA), then SEC1 (EC).
fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    if let Some(Ok(key)) = rustls_pemfile::pkcs8_private_keys(&mut Cursor::new(pem)).next() {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }
    if let Some(Ok(key)) = rustls_pemfile::rsa_private_keys(&mut Cursor::new(pem)).next() {
        return Ok(PrivateKeyDer::Pkcs1(key));
    }
    if let Some(Ok(key)) = rustls_pemfile::ec_private_keys(&mut Cursor::new(pem)).next() {
        return Ok(PrivateKeyDer::Sec1(key));
    }
    Err(TlsError::NoPrivateKey)
}
