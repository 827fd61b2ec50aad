//! Certificates for the HTTPS listener
//!
//! Each domain may have a `<domain>.crt` / `<domain>.key` PEM pair in the
//! proxy secrets directory. Domains without one are served a self-signed
//! certificate covering every routed domain.

use parking_lot::RwLock;
use rcgen::{generate_simple_self_signed, CertifiedKey as GeneratedCert};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

struct Certificates {
    by_domain: HashMap<String, Arc<CertifiedKey>>,
    fallback: Arc<CertifiedKey>,
}

/// SNI certificate resolver, reloadable in place
pub struct CertStore {
    dir: PathBuf,
    certs: RwLock<Certificates>,
}

impl CertStore {
    /// Load every pair for `domains` from `dir`
    pub fn load(dir: &Path, domains: &[String]) -> anyhow::Result<Arc<Self>> {
        let certs = load_certificates(dir, domains)?;
        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            certs: RwLock::new(certs),
        }))
    }

    /// Re-read the secrets directory for a new domain list. The previous
    /// certificates stay in place on failure.
    pub fn reload(&self, domains: &[String]) -> anyhow::Result<()> {
        let certs = load_certificates(&self.dir, domains)?;
        *self.certs.write() = certs;
        Ok(())
    }

    /// Domains with their own certificate files
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.certs.read().by_domain.keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn certificate_for(&self, server_name: Option<&str>) -> Arc<CertifiedKey> {
        let certs = self.certs.read();
        server_name
            .and_then(|name| certs.by_domain.get(&name.to_lowercase()))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&certs.fallback))
    }

    pub fn acceptor(self: &Arc<Self>) -> anyhow::Result<TlsAcceptor> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::clone(self) as Arc<dyn ResolvesServerCert>);
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.certificate_for(client_hello.server_name()))
    }
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("dir", &self.dir)
            .field("domains", &self.domains())
            .finish()
    }
}

fn load_certificates(dir: &Path, domains: &[String]) -> anyhow::Result<Certificates> {
    let mut by_domain = HashMap::new();
    let mut uncovered = Vec::new();

    for domain in domains {
        let cert_path = dir.join(format!("{}.crt", domain));
        let key_path = dir.join(format!("{}.key", domain));
        if !cert_path.is_file() || !key_path.is_file() {
            uncovered.push(domain.clone());
            continue;
        }
        match load_pair(&cert_path, &key_path) {
            Ok(cert) => {
                debug!(domain, cert = %cert_path.display(), "Loaded certificate");
                by_domain.insert(domain.clone(), cert);
            }
            Err(e) => {
                warn!(domain, error = %e, "Unusable certificate, falling back to self-signed");
                uncovered.push(domain.clone());
            }
        }
    }

    if !uncovered.is_empty() {
        warn!(domains = ?uncovered, "Serving self-signed certificate (not for production)");
    }
    let fallback = self_signed(uncovered)?;
    info!(files = by_domain.len(), "TLS certificates loaded");

    Ok(Certificates { by_domain, fallback })
}

fn load_pair(cert_path: &Path, key_path: &Path) -> anyhow::Result<Arc<CertifiedKey>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let signing_key = any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("Unsupported key in {}: {}", key_path.display(), e))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path.display(), e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }

    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path.display(), e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path.display())
}

fn self_signed(mut names: Vec<String>) -> anyhow::Result<Arc<CertifiedKey>> {
    names.push("localhost".to_string());

    let GeneratedCert { cert, key_pair } = generate_simple_self_signed(names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;
    let signing_key = any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;

    Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
}
