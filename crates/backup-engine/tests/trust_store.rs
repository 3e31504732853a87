#![allow(missing_docs)]

use std::fs;

use shared::{TrustStoreError, load_trust_store};

#[test]
fn loads_generated_authority() {
    let directory = tempfile::tempdir().unwrap();
    let (_key, certificate) = shared::test::new_certificate_authority();

    let path = directory.path().join("ca.pem");
    fs::write(&path, certificate.pem()).unwrap();

    let store = load_trust_store(&path).unwrap();
    assert_eq!(store.len(), 1);
}

#[test]
fn empty_file_has_no_certificates() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("empty.pem");
    fs::write(&path, "").unwrap();

    assert!(matches!(
        load_trust_store(&path),
        Err(TrustStoreError::NoRootCertificate)
    ));
}

#[test]
fn missing_file() {
    let directory = tempfile::tempdir().unwrap();
    assert!(matches!(
        load_trust_store(&directory.path().join("missing.pem")),
        Err(TrustStoreError::LoadRootCertificate(_))
    ));
}
