//! TLS listener setup for the client-facing endpoint: mutual TLS with a
//! CA bundle, server certificate and private key. No raw-socket TLS
//! precedent existed in the inherited dependency stack (the teacher only
//! terminates TLS inside an HTTP proxy); `rustls`/`tokio-rustls` is the
//! same pairing used elsewhere in the broader example pack for bare
//! socket mutual TLS.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};

pub fn build_acceptor(ca_path: &Path, cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let ca_certs = load_certs(ca_path)?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert).map_err(|e| Error::Tls(rustls::Error::General(e.to_string())))?;
    }

    let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::Tls(rustls::Error::General(e.to_string())))?;

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::Io)
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no private key found")))
}
