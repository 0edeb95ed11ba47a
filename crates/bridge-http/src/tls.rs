//! TLS termination for the gateway

use crate::{Result, ServerError};
use rustls::ServerConfig as RustlsServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

#[derive(Clone, Debug, Default)]
pub enum TlsConfig {
    /// Plain HTTP
    #[default]
    Disabled,
    /// PEM certificate chain and private key
    Enabled { cert_path: PathBuf, key_path: PathBuf },
}

impl TlsConfig {
    pub fn with_certs(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        TlsConfig::Enabled {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, TlsConfig::Enabled { .. })
    }

    /// `None` when TLS is disabled
    pub fn build_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        match self {
            TlsConfig::Disabled => Ok(None),
            TlsConfig::Enabled {
                cert_path,
                key_path,
            } => {
                info!(cert = %cert_path.display(), key = %key_path.display(), "Loading TLS certificate");
                create_tls_acceptor(cert_path, key_path).map(Some)
            }
        }
    }
}

fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = File::open(cert_path).map_err(|e| {
        ServerError::CertificateError(format!("Failed to open {}: {}", cert_path.display(), e))
    })?;
    let key_file = File::open(key_path).map_err(|e| {
        ServerError::CertificateError(format!("Failed to open {}: {}", key_path.display(), e))
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ServerError::CertificateError(format!("Failed to read certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(ServerError::CertificateError(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ServerError::CertificateError(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| {
            ServerError::CertificateError(format!("No private key found in {}", key_path.display()))
        })?;

    let mut tls_config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::TlsError(e.to_string()))?;
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_has_no_acceptor() {
        assert!(TlsConfig::disabled().build_acceptor().unwrap().is_none());
        assert!(!TlsConfig::default().is_enabled());
    }

    #[test]
    fn test_missing_files_are_certificate_errors() {
        let config = TlsConfig::with_certs("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(config.is_enabled());
        assert!(matches!(
            config.build_acceptor(),
            Err(ServerError::CertificateError(_))
        ));
    }
}
