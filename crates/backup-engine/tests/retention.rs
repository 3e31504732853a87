#![allow(missing_docs)]

use std::{collections::BTreeSet, io::Cursor};

use backup_engine::{
    audit::{AuditFilter, AuditStatus, Operation},
    policy::RetentionPolicy,
    queue::JobState,
    retention::select_for_deletion,
    snapshot::MockProvider,
    storage::{ArtifactFilter, Consistency, LocalStore, Payload, StorageBackend, StoredArtifact},
};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use common::{SERVER_ID, test_engine};
use shared::{ArtifactKind, ArtifactName, Sidecar, TargetName};

mod common;

fn target(name: &str) -> TargetName {
    TargetName::try_from(name).unwrap()
}

fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 3, 0, 0).unwrap() + TimeDelta::minutes(minutes)
}

fn artifact(target_name: &str, minutes: i64, kind: ArtifactKind, server_id: &str) -> StoredArtifact {
    let created_at = at(minutes);
    let name = ArtifactName::new(&target(target_name), created_at);

    StoredArtifact {
        name: name.as_str().to_string(),
        target: target(target_name),
        size: 10,
        created_at,
        kind: Some(kind),
        server_id: Some(server_id.to_string()),
        descriptor: None,
        consistency: Consistency::Consistent,
    }
}

fn names(selected: &[&StoredArtifact]) -> Vec<String> {
    selected.iter().map(|artifact| artifact.name.clone()).collect()
}

#[test]
fn keeps_newest_scheduled_and_deletes_oldest_first() {
    let artifacts: Vec<_> = (0..5)
        .map(|minutes| artifact("web", minutes, ArtifactKind::Scheduled, SERVER_ID))
        .collect();

    let selected = select_for_deletion(&artifacts, &target("web"), SERVER_ID, 2);
    assert_eq!(
        names(&selected),
        vec![
            artifacts[2].name.clone(),
            artifacts[1].name.clone(),
            artifacts[0].name.clone()
        ]
    );
}

#[test]
fn fewer_than_keep_deletes_nothing() {
    let artifacts = vec![
        artifact("web", 0, ArtifactKind::Scheduled, SERVER_ID),
        artifact("web", 1, ArtifactKind::Scheduled, SERVER_ID),
    ];

    assert!(select_for_deletion(&artifacts, &target("web"), SERVER_ID, 2).is_empty());
    assert!(select_for_deletion(&artifacts, &target("web"), SERVER_ID, 7).is_empty());
}

#[test]
fn manual_artifacts_are_never_counted_or_selected() {
    let mut artifacts: Vec<_> = (0..10)
        .map(|minutes| artifact("web", minutes, ArtifactKind::Manual, SERVER_ID))
        .collect();
    artifacts.push(artifact("web", 100, ArtifactKind::Scheduled, SERVER_ID));
    artifacts.push(artifact("web", 101, ArtifactKind::Scheduled, SERVER_ID));

    let selected = select_for_deletion(&artifacts, &target("web"), SERVER_ID, 1);
    assert_eq!(names(&selected), vec![artifacts[10].name.clone()]);
}

#[test]
fn other_targets_servers_and_unknown_artifacts_are_left_alone() {
    let mut unknown = artifact("web", 0, ArtifactKind::Scheduled, SERVER_ID);
    unknown.kind = None;
    unknown.server_id = None;
    unknown.consistency = Consistency::MissingSidecar;

    let artifacts = vec![
        unknown,
        artifact("web", 1, ArtifactKind::Scheduled, "other-server"),
        artifact("db", 2, ArtifactKind::Scheduled, SERVER_ID),
        artifact("web", 3, ArtifactKind::Scheduled, SERVER_ID),
    ];

    assert!(select_for_deletion(&artifacts, &target("web"), SERVER_ID, 1).is_empty());
}

#[test]
fn pruning_through_the_engine_is_audited_per_deletion() {
    let test = test_engine(MockProvider::new(1024));
    test.engine.start().unwrap();

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(test.engine.enqueue("web", ArtifactKind::Scheduled).unwrap());
    }
    for _ in 0..2 {
        ids.push(test.engine.enqueue("web", ArtifactKind::Manual).unwrap());
    }
    assert!(test
        .wait_all(&ids)
        .iter()
        .all(|progress| progress.state == JobState::Complete));

    // A scheduled artifact written by another server sharing the store.
    let foreign_store = LocalStore::new(test.artifact_directory()).unwrap();
    let foreign_name = ArtifactName::new(&target("web"), at(0));
    foreign_store
        .put(
            &foreign_name,
            Payload {
                reader: Box::new(Cursor::new(vec![0u8; 16])),
                len: 16,
            },
            &Sidecar {
                server_id: "other-server".to_string(),
                kind: ArtifactKind::Scheduled,
                created_at: at(0),
                target: target("web"),
                size: 16,
                descriptor: None,
            },
        )
        .unwrap();

    let policy = RetentionPolicy {
        targets: BTreeSet::from([target("web")]),
        keep: 1,
        ..Default::default()
    };
    test.engine.set_policy(&policy).unwrap();

    let scheduled_before = test
        .engine
        .list_artifacts(&ArtifactFilter {
            kind: Some(ArtifactKind::Scheduled),
            server_id: Some(SERVER_ID.to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(scheduled_before.len(), 4);

    let report = test.engine.apply_retention().unwrap();
    assert_eq!(report.deleted.len(), 3);
    assert!(report.failed.is_empty());

    let remaining = test.engine.list_artifacts(&ArtifactFilter::default()).unwrap();
    let count = |kind: ArtifactKind, server: &str| {
        remaining
            .iter()
            .filter(|artifact| {
                artifact.kind == Some(kind) && artifact.server_id.as_deref() == Some(server)
            })
            .count()
    };
    assert_eq!(count(ArtifactKind::Scheduled, SERVER_ID), 1);
    assert_eq!(count(ArtifactKind::Manual, SERVER_ID), 2);
    assert_eq!(count(ArtifactKind::Scheduled, "other-server"), 1);

    // The newest scheduled artifact is the one kept.
    let kept = remaining
        .iter()
        .find(|artifact| {
            artifact.kind == Some(ArtifactKind::Scheduled)
                && artifact.server_id.as_deref() == Some(SERVER_ID)
        })
        .unwrap();
    assert_eq!(kept.name, scheduled_before[0].name);

    let cleanups = test
        .engine
        .audit_log(&AuditFilter {
            operation: Some(Operation::Cleanup),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(cleanups.len(), 3);
    assert!(cleanups
        .iter()
        .all(|entry| entry.status == AuditStatus::Completed && entry.target == "web"));
}
