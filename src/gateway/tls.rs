//! Listener-side TLS: a rustls acceptor built from PEM cert/key files.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};

/// Build a TLS acceptor from PEM certificate chain and private key files.
pub fn load_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let cert_file = File::open(cert_path)
        .map_err(|e| Error::Config(format!("cannot open cert file {}: {}", cert_path, e)))?;
    let key_file = File::open(key_path)
        .map_err(|e| Error::Config(format!("cannot open key file {}: {}", key_path, e)))?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| Error::Config(format!("cannot parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            cert_path
        )));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::Config(format!("cannot parse private key: {}", e)))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", key_path)))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("TLS configuration error: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
