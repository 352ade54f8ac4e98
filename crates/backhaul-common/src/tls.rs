use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;

use crate::TlsError;

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| {
        TlsError::Certificate(format!("Failed to open cert file {:?}: {}", path, e))
    })?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("Failed to parse certificates: {}", e)))
}

/// Load a private key from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| {
        TlsError::Certificate(format!("Failed to open key file {:?}: {}", path, e))
    })?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .map_err(|e| TlsError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TlsError::Certificate("No private key found in file".to_string()))
}

fn load_certs_from_pem(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("Failed to parse certificates: {}", e)))
}

fn load_private_key_from_pem(pem_content: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| TlsError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TlsError::Certificate("No private key found in PEM content".to_string()))
}

fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, TlsError> {
    if certs.is_empty() {
        return Err(TlsError::Certificate(
            "No certificates found".to_string(),
        ));
    }

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Tls(format!("Failed to build server config: {}", e)))
}

/// Load the server TLS config shared by the tunnel port and the HTTPS plane
///
/// Clients authenticate with their `Auth` message, not with certificates.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    tracing::debug!("Loaded {} certificate(s) from {:?}", certs.len(), cert_path);
    build_server_config(certs, key)
}

/// Load the server TLS config from PEM content strings
pub fn load_server_config_from_pem(cert_pem: &str, key_pem: &str) -> Result<ServerConfig, TlsError> {
    let certs = load_certs_from_pem(cert_pem)?;
    let key = load_private_key_from_pem(key_pem)?;
    build_server_config(certs, key)
}

/// Load a client TLS config trusting the given CA
///
/// # Arguments
/// * `ca_pem` - CA certificate PEM content used to verify the server
pub fn load_client_config_from_pem(ca_pem: &str) -> Result<ClientConfig, TlsError> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs_from_pem(ca_pem)? {
        root_store.add(cert).map_err(|e| {
            TlsError::Certificate(format!("Failed to add CA certificate: {}", e))
        })?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pem_rejected() {
        let err = load_server_config_from_pem("", "").unwrap_err();
        assert!(matches!(err, TlsError::Certificate(_)));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_server_config(
            Path::new("/nonexistent/backhaul.crt"),
            Path::new("/nonexistent/backhaul.key"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("backhaul.crt"));
    }
}
