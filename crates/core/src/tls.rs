//! Mutual TLS credentials
//!
//! Both sides load a CA bundle, their own certificate chain and private key
//! from PEM files. The server requires a client certificate signed by the CA.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_rustls::rustls::server::AllowAnyAuthenticatedClient;
use tokio_rustls::rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig};

use crate::{CoreError, Result};

/// PEM file locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| CoreError::Credentials(format!("{}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| CoreError::Credentials(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(CoreError::Credentials(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    let mut reader = open(path)?;
    loop {
        let item = rustls_pemfile::read_one(&mut reader)
            .map_err(|e| CoreError::Credentials(format!("{}: {}", path.display(), e)))?;
        match item {
            Some(rustls_pemfile::Item::PKCS8Key(key))
            | Some(rustls_pemfile::Item::RSAKey(key))
            | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(PrivateKey(key)),
            Some(_) => continue,
            None => break,
        }
    }
    Err(CoreError::Credentials(format!(
        "{}: no private key found",
        path.display()
    )))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(&cert)
            .map_err(|e| CoreError::Credentials(format!("{}: {}", path.display(), e)))?;
    }
    Ok(roots)
}

/// Server config requiring an authenticated client certificate
pub fn server_tls_config(paths: &TlsPaths) -> Result<Arc<ServerConfig>> {
    let roots = load_roots(&paths.ca_cert)?;
    let certs = load_certs(&paths.cert)?;
    let key = load_key(&paths.key)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
        .with_single_cert(certs, key)
        .map_err(|e| CoreError::Credentials(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Client config presenting the node certificate
pub fn client_tls_config(paths: &TlsPaths) -> Result<Arc<ClientConfig>> {
    let roots = load_roots(&paths.ca_cert)?;
    let certs = load_certs(&paths.cert)?;
    let key = load_key(&paths.key)?;

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| CoreError::Credentials(e.to_string()))?;
    Ok(Arc::new(config))
}
