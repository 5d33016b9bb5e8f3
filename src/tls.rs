use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::Item;
use tokio_rustls::TlsAcceptor;

/// Build the STARTTLS acceptor from PEM files. Certificate chain and key
/// may live in the same file, as `control/servercert.pem` usually does.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to open certificate: {:?}", cert_path))?;
    let key_pem = if key_path == cert_path {
        cert_pem.clone()
    } else {
        std::fs::read(key_path)
            .with_context(|| format!("Failed to open private key: {:?}", key_path))?
    };
    acceptor_from_pem(&cert_pem, &key_pem)
}

pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor> {
    // Read the certificate chain
    let cert_chain: Vec<Certificate> = rustls_pemfile::read_all(&mut BufReader::new(cert_pem))
        .map_err(|_| anyhow!("Failed to parse certificate"))?
        .into_iter()
        .filter_map(|item| match item {
            Item::X509Certificate(der) => Some(Certificate(der)),
            _ => None,
        })
        .collect();
    if cert_chain.is_empty() {
        return Err(anyhow!("No certificate found"));
    }

    // Read the private key
    let private_key = rustls_pemfile::read_all(&mut BufReader::new(key_pem))
        .map_err(|_| anyhow!("Failed to parse private key"))?
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| anyhow!("No private key found"))?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| anyhow!("Failed to build TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_pem_file() {
        let (cert, key, _) = testing::self_signed();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servercert.pem");
        std::fs::write(&path, format!("{cert}{key}")).unwrap();

        assert!(load_acceptor(&path, &path).is_ok());
    }

    #[test]
    fn separate_files() {
        let (cert, key, _) = testing::self_signed();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert).unwrap();
        std::fs::write(&key_path, key).unwrap();

        assert!(load_acceptor(&cert_path, &key_path).is_ok());
        assert!(load_acceptor(&cert_path, &cert_path).is_err());
        assert!(load_acceptor(&dir.path().join("missing.pem"), &key_path).is_err());
    }
}
