use std::{
    fs::File,
    io::{self, BufReader},
    path::Path,
};

use rustls::RootCertStore;
use rustls_pemfile::certs;
use rustls_pki_types::CertificateDer;
use thiserror::Error;

/// Load a PEM file of root certificates into a trust store, used to reach object stores
/// that sit behind a private certificate authority.
pub fn load_trust_store(root_certificate_file: &Path) -> Result<RootCertStore, TrustStoreError> {
    let file = File::open(root_certificate_file).map_err(TrustStoreError::LoadRootCertificate)?;

    let root_certificates: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(file))
        .collect::<io::Result<_>>()
        .map_err(TrustStoreError::LoadRootCertificate)?;

    if root_certificates.is_empty() {
        return Err(TrustStoreError::NoRootCertificate);
    }

    let mut trust_store = RootCertStore::empty();
    for certificate in root_certificates {
        trust_store.add(certificate)?;
    }

    Ok(trust_store)
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum TrustStoreError {
    #[error("Failed to load the root certificate file\n{0}")]
    LoadRootCertificate(#[source] io::Error),

    #[error("The root certificate file contained no certificates.")]
    NoRootCertificate,

    #[error("Failed to create the trust store\n{0}")]
    CreateTrustStore(#[from] rustls::Error),
}
