use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use rustls::ServerConfig;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCertUsingSni;
use rustls::sign::CertifiedKey;
use rustls_pemfile::{certs, ec_private_keys, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Builds an SNI-dispatching TLS acceptor from operator-provisioned
/// certificates: the certificate dir holds one `<host>.pem`/`<host>.key`
/// pair per configured virtual host. Hosts without a pair are skipped and
/// served over plain HTTP clients will not reach them via TLS.
pub fn build_acceptor(dir: &Path, hosts: &[String]) -> Result<TlsAcceptor> {
    let provider = Arc::new(ring::default_provider());
    let mut resolver = ResolvesServerCertUsingSni::new();
    let mut loaded = 0usize;

    for host in hosts {
        let cert_path = dir.join(format!("{host}.pem"));
        let key_path = dir.join(format!("{host}.key"));
        if !cert_path.is_file() || !key_path.is_file() {
            warn!(host, "no certificate pair in TLSCertificateDir; skipping");
            continue;
        }
        let chain = load_certs(&cert_path)?;
        let key = load_private_key(&key_path)?;
        let signing_key = provider
            .key_provider
            .load_private_key(key)
            .map_err(|err| anyhow!("unusable private key {}: {err}", key_path.display()))?;
        resolver
            .add(host, CertifiedKey::new(chain, signing_key))
            .map_err(|err| anyhow!("failed to register certificate for {host}: {err}"))?;
        info!(host, "loaded certificate");
        loaded += 1;
    }

    if loaded == 0 {
        bail!("TLSCertificateDir is set but holds no certificate pair for any configured host");
    }

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open certificate {}", path.display()))?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificate {}", path.display()))?;
    if chain.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let open = || -> Result<BufReader<File>> {
        let file = File::open(path)
            .with_context(|| format!("failed to open private key {}", path.display()))?;
        Ok(BufReader::new(file))
    };

    if let Some(key) = pkcs8_private_keys(&mut open()?).next() {
        return Ok(PrivateKeyDer::Pkcs8(key?));
    }
    if let Some(key) = rsa_private_keys(&mut open()?).next() {
        return Ok(PrivateKeyDer::Pkcs1(key?));
    }
    if let Some(key) = ec_private_keys(&mut open()?).next() {
        return Ok(PrivateKeyDer::Sec1(key?));
    }
    bail!("no private key found in {}", path.display());
}
