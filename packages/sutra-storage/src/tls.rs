//! TLS configuration for secure TCP connections
//!
//! Loads PEM certificate/key pairs and builds the rustls acceptor used by
//! the TCP server. Plaintext listeners are only allowed on loopback (or
//! with dev mode explicitly enabled).

use anyhow::{anyhow, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build a TLS acceptor from PEM cert/key files
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("TLS config error: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    let certs = certs(&mut reader)
        .map_err(|e| anyhow!("Failed to parse certificates: {}", e))?
        .into_iter()
        .map(Certificate)
        .collect::<Vec<_>>();

    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", path.display()));
    }
    Ok(certs)
}

/// Load a PKCS#8 private key from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    let keys = pkcs8_private_keys(&mut reader)
        .map_err(|e| anyhow!("Failed to parse private key: {}", e))?;

    if keys.is_empty() {
        return Err(anyhow!("No private keys found in {}", path.display()));
    }
    if keys.len() > 1 {
        log::warn!("Multiple private keys found, using first one");
    }

    Ok(PrivateKey(keys[0].clone()))
}
