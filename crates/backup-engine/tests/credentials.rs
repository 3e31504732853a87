#![allow(missing_docs)]

use std::sync::Arc;

use backup_engine::{
    Classify, ErrorClass,
    credentials::{CredentialStore, CredentialUpdate, REDACTED},
    database::Database,
    queue::JobState,
    snapshot::MockProvider,
    storage::{ArtifactFilter, RemoteOptions, StorageConfig},
    vault::Vault,
};
use common::{TestEngine, object_server, status_server, test_engine_with};
use shared::ArtifactKind;

mod common;

const BUCKET: &str = "backups";

/// An engine plus a second credential store sharing its database and vault key.
fn engine_with_store() -> (TestEngine, CredentialStore) {
    let directory = tempfile::tempdir().unwrap();
    let key_file = directory.path().join("vault.key");
    let database = Arc::new(Database::open_in_memory().unwrap());

    let vault = Vault::open_or_create(&key_file).unwrap();
    let store = CredentialStore::new(
        Arc::clone(&database),
        Vault::open_or_create(&key_file).unwrap(),
    );

    let test = test_engine_with(MockProvider::new(2048), directory, database, vault);
    (test, store)
}

fn update(endpoint: &str, access_key_id: &str, secret_access_key: &str) -> CredentialUpdate {
    CredentialUpdate {
        endpoint: endpoint.to_string(),
        bucket: BUCKET.to_string(),
        region: "us-east-1".to_string(),
        access_key_id: access_key_id.to_string(),
        secret_access_key: secret_access_key.to_string(),
    }
}

#[test]
fn stored_secrets_are_never_shown() {
    let (test, store) = engine_with_store();
    let (endpoint, _, _) = object_server(BUCKET);

    assert_eq!(test.engine.credentials().unwrap(), None);

    test.engine
        .set_credentials(&update(&endpoint, "AKIDEXAMPLE", "wJalrXUtnFEMI"))
        .unwrap();

    let view = test.engine.credentials().unwrap().unwrap();
    assert_eq!(view.endpoint, endpoint);
    assert_eq!(view.bucket, BUCKET);
    assert_eq!(view.access_key_id, REDACTED);
    assert_eq!(view.secret_access_key, REDACTED);

    let ciphertext = store.ciphertext().unwrap().unwrap();
    assert!(!ciphertext.contains("wJalrXUtnFEMI"));

    let loaded = store.load().unwrap().unwrap();
    assert_eq!(loaded.key.access_key_id, "AKIDEXAMPLE");
    assert_eq!(loaded.key.secret_access_key, "wJalrXUtnFEMI");
}

#[test]
fn redacted_or_blank_secrets_keep_the_stored_values() {
    let (test, store) = engine_with_store();
    let (endpoint, _, _) = object_server(BUCKET);

    test.engine
        .set_credentials(&update(&endpoint, "AKIDEXAMPLE", "wJalrXUtnFEMI"))
        .unwrap();

    let mut changed = update(&endpoint, REDACTED, "");
    changed.region = "eu-west-1".to_string();
    test.engine.set_credentials(&changed).unwrap();

    let loaded = store.load().unwrap().unwrap();
    assert_eq!(loaded.location.region, "eu-west-1");
    assert_eq!(loaded.key.access_key_id, "AKIDEXAMPLE");
    assert_eq!(loaded.key.secret_access_key, "wJalrXUtnFEMI");
}

#[test]
fn rejected_credentials_are_not_stored() {
    let (test, store) = engine_with_store();
    let (endpoint, _, _) = object_server(BUCKET);

    test.engine
        .set_credentials(&update(&endpoint, "AKIDEXAMPLE", "wJalrXUtnFEMI"))
        .unwrap();
    let before = store.ciphertext().unwrap();
    let view_before = test.engine.credentials().unwrap();

    let forbidden = status_server("403 Forbidden");
    let attempt = update(&forbidden, "AKIDOTHER", "other-secret");

    let error = test.engine.test_storage_connection(&attempt).unwrap_err();
    assert_eq!(error.class(), ErrorClass::Auth);

    let error = test.engine.set_credentials(&attempt).unwrap_err();
    assert_eq!(error.class(), ErrorClass::Auth);
    assert!(error.class().to_string().starts_with("AuthError"));

    assert_eq!(store.ciphertext().unwrap(), before);
    assert_eq!(test.engine.credentials().unwrap(), view_before);
}

#[test]
fn missing_secret_without_stored_credentials_is_an_auth_error() {
    let (test, store) = engine_with_store();
    let (endpoint, _, seen) = object_server(BUCKET);

    let error = test
        .engine
        .set_credentials(&update(&endpoint, "AKIDEXAMPLE", ""))
        .unwrap_err();
    assert_eq!(error.class(), ErrorClass::Auth);

    assert_eq!(store.ciphertext().unwrap(), None);
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn connection_test_leaves_nothing_behind() {
    let (test, store) = engine_with_store();
    let (endpoint, objects, seen) = object_server(BUCKET);

    test.engine
        .test_storage_connection(&update(&endpoint, "AKIDEXAMPLE", "wJalrXUtnFEMI"))
        .unwrap();

    assert!(objects.lock().unwrap().is_empty());
    let methods: Vec<_> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|request| request.method.clone())
        .collect();
    assert_eq!(methods, vec!["PUT", "GET", "DELETE"]);

    // Testing never stores anything.
    assert_eq!(store.ciphertext().unwrap(), None);
}

#[test]
fn switching_to_remote_storage_writes_new_artifacts_there() {
    let (test, _store) = engine_with_store();
    let (endpoint, objects, _) = object_server(BUCKET);

    // Remote storage needs stored credentials first.
    let error = test
        .engine
        .set_storage(StorageConfig::Remote(RemoteOptions::default()))
        .unwrap_err();
    assert_eq!(error.class(), ErrorClass::Auth);
    assert!(matches!(test.engine.storage_config(), StorageConfig::Local { .. }));

    test.engine
        .set_credentials(&update(&endpoint, "AKIDEXAMPLE", "wJalrXUtnFEMI"))
        .unwrap();
    test.engine
        .set_storage(StorageConfig::Remote(RemoteOptions {
            prefix: "server-a/".to_string(),
            ..Default::default()
        }))
        .unwrap();

    test.engine.start().unwrap();
    let id = test.engine.enqueue("web", ArtifactKind::Manual).unwrap();
    let progress = test.engine.wait(id).unwrap();
    assert_eq!(progress.state, JobState::Complete, "{progress:?}");

    let artifact = progress.artifact.unwrap();
    {
        let objects = objects.lock().unwrap();
        assert!(objects.contains_key(&format!("server-a/{artifact}")));
        assert!(objects.contains_key(&format!("server-a/{artifact}.json")));
    }

    let listed = test.engine.list_artifacts(&ArtifactFilter::default()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, artifact);
    assert_eq!(listed[0].kind, Some(ArtifactKind::Manual));

    // Nothing was written locally.
    let local = std::fs::read_dir(test.artifact_directory())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .count();
    assert_eq!(local, 0);
}
