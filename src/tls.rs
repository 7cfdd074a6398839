use crate::mitm::tls_config::TlsConfigError;
use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use std::io::{BufRead, BufReader};

/// Read a PEM certificate chain and private key from files, checking both parse
pub fn load_pem_files(cert_path: &str, key_path: &str) -> Result<(String, String)> {
    let cert_pem = std::fs::read_to_string(cert_path)
        .with_context(|| format!("Cannot read certificate file {}", cert_path))?;
    let key_pem = std::fs::read_to_string(key_path)
        .with_context(|| format!("Cannot read key file {}", key_path))?;

    read_certs(&mut BufReader::new(cert_pem.as_bytes()))
        .with_context(|| format!("Invalid certificate file {}", cert_path))?;
    read_key(&mut BufReader::new(key_pem.as_bytes()))
        .with_context(|| format!("Invalid key file {}", key_path))?;

    Ok((cert_pem, key_pem))
}

/// Parse an in-memory PEM certificate chain and private key
pub fn parse_pem_identity(
    cert_pem: &str,
    key_pem: &str,
) -> std::result::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsConfigError> {
    let certs = read_certs(&mut cert_pem.as_bytes())?;
    let key = read_key(&mut key_pem.as_bytes())?;
    Ok((certs, key))
}

fn read_certs(
    reader: &mut dyn BufRead,
) -> std::result::Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let certs = certs(reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsConfigError::InvalidCertificate(
            "no certificates found".to_string(),
        ));
    }
    Ok(certs)
}

fn read_key(reader: &mut dyn BufRead) -> std::result::Result<PrivateKeyDer<'static>, TlsConfigError> {
    private_key(reader)
        .map_err(|e| TlsConfigError::InvalidPrivateKey(e.to_string()))?
        .ok_or_else(|| TlsConfigError::InvalidPrivateKey("no private key found".to_string()))
}
