//! End-to-end lifecycle coverage: ingestion and versioning, version
//! purge, soft delete and recovery, merge patch, and replay.

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use record_common::{
    Acl, InMemoryBlobStore, InMemoryMetadataRepository, Legal, MetadataRepository, MockClock,
    Record,
};
use record_store::authorization::GroupEntitlements;
use record_store::messaging::{DeletionType, InMemoryMessageBus};
use record_store::replay::{ReplayFilter, ReplayRequest, ReplayState};
use record_store::{Config, RecordStore};
use serde_json::json;

const USER: &str = "user@tenant1.com";

struct Harness {
    store: RecordStore,
    repo: Arc<InMemoryMetadataRepository>,
    blobs: Arc<InMemoryBlobStore>,
    bus: Arc<InMemoryMessageBus>,
    entitlements: Arc<GroupEntitlements>,
    clock: Arc<MockClock>,
}

fn harness(config: Config) -> Harness {
    let repo = Arc::new(InMemoryMetadataRepository::new());
    let blobs = Arc::new(InMemoryBlobStore::new());
    let bus = Arc::new(InMemoryMessageBus::new());
    let entitlements = Arc::new(GroupEntitlements::new());
    entitlements.grant(USER, "viewers@tenant1");
    entitlements.grant(USER, "owners@tenant1");
    let clock = Arc::new(MockClock::with_time(
        UNIX_EPOCH + Duration::from_millis(1_000),
    ));
    let store = RecordStore::builder(config)
        .metadata_repository(repo.clone())
        .query_repository(repo.clone())
        .blob_store(blobs.clone())
        .message_bus(bus.clone())
        .entitlements(entitlements.clone())
        .clock(clock.clone())
        .build();
    Harness {
        store,
        repo,
        blobs,
        bus,
        entitlements,
        clock,
    }
}

fn record(id: &str, data: serde_json::Value) -> Record {
    Record {
        id: Some(id.to_string()),
        kind: "tenant1:src:well:1.0.0".into(),
        acl: Acl {
            viewers: vec!["viewers@tenant1".into()],
            owners: vec!["owners@tenant1".into()],
        },
        legal: Legal {
            legaltags: vec!["tenant1-public".into()],
            other_relevant_data_countries: vec![],
        },
        data,
        meta: None,
        tags: Default::default(),
        ancestry: None,
        version: None,
    }
}

/// Ingests `bodies.len()` versions of the record, advancing the clock
/// between writes, and returns the version numbers.
async fn ingest_versions(h: &Harness, id: &str, bodies: &[serde_json::Value]) -> Vec<i64> {
    let mut versions = Vec::new();
    for body in bodies {
        let transfer = h
            .store
            .ingestion()
            .create_update_records(false, vec![record(id, body.clone())], USER, None)
            .await
            .unwrap();
        versions.push(transfer.version);
        h.clock.advance(Duration::from_millis(100));
    }
    versions
}

#[tokio::test]
async fn should_create_record_and_append_versions() {
    // given
    let h = harness(Config::default());

    // when
    let versions = ingest_versions(
        &h,
        "tenant1:well:1",
        &[json!({"depth": 100}), json!({"depth": 200})],
    )
    .await;

    // then
    let meta = h.repo.get("tenant1:well:1", None).await.unwrap().unwrap();
    assert_eq!(meta.version_paths.len(), 2);
    assert_eq!(meta.latest_version(), Some(versions[1]));
    let read = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, None)
        .await
        .unwrap();
    assert_eq!(read.data, json!({"depth": 200}));
    assert_eq!(read.version, Some(versions[1]));
    assert_eq!(h.bus.legacy_messages().len(), 2);
}

#[tokio::test]
async fn should_skip_records_whose_body_is_unchanged() {
    // given
    let h = harness(Config::default());
    ingest_versions(&h, "tenant1:well:1", &[json!({"depth": 100})]).await;

    // when
    let transfer = h
        .store
        .ingestion()
        .create_update_records(
            true,
            vec![record("tenant1:well:1", json!({"depth": 100}))],
            USER,
            None,
        )
        .await
        .unwrap();

    // then
    assert_eq!(transfer.skipped_record_ids, vec!["tenant1:well:1".to_string()]);
    assert!(transfer.record_ids.is_empty());
    let meta = h.repo.get("tenant1:well:1", None).await.unwrap().unwrap();
    assert_eq!(meta.version_paths.len(), 1);
}

#[tokio::test]
async fn should_mint_id_when_record_arrives_without_one() {
    // given
    let h = harness(Config::default());
    let mut r = record("ignored", json!({"x": 1}));
    r.id = None;

    // when
    let transfer = h
        .store
        .ingestion()
        .create_update_records(false, vec![r], USER, None)
        .await
        .unwrap();

    // then
    assert_eq!(transfer.record_ids.len(), 1);
    assert!(transfer.record_ids[0].starts_with("tenant1:well:"));
}

#[tokio::test]
async fn should_reject_duplicate_ids_in_one_request() {
    // given
    let h = harness(Config::default());

    // when
    let err = h
        .store
        .ingestion()
        .create_update_records(
            false,
            vec![
                record("tenant1:well:1", json!({"a": 1})),
                record("tenant1:well:1", json!({"a": 2})),
            ],
            USER,
            None,
        )
        .await
        .unwrap_err();

    // then
    assert_eq!(err.code, 400);
    assert_eq!(
        err.message,
        "Cannot update the same record multiple times in the same request. Id: tenant1:well:1"
    );
}

#[tokio::test]
async fn should_roll_back_written_bodies_when_metadata_commit_is_locked() {
    // given
    let h = harness(Config::default());
    h.repo.lock("tenant1:well:1").await;

    // when
    let err = h
        .store
        .ingestion()
        .create_update_records(
            false,
            vec![record("tenant1:well:1", json!({"a": 1}))],
            USER,
            None,
        )
        .await
        .unwrap_err();

    // then
    assert_eq!(err.code, 423);
    assert!(h.blobs.is_empty().await);
    assert!(h.repo.get("tenant1:well:1", None).await.unwrap().is_none());
}

#[tokio::test]
async fn should_restore_pre_batch_metadata_when_an_update_batch_rolls_back() {
    // given two records with one committed version each
    let h = harness(Config::default());
    ingest_versions(&h, "tenant1:well:a", &[json!({"depth": 100})]).await;
    ingest_versions(&h, "tenant1:well:b", &[json!({"depth": 100})]).await;
    let before = h.repo.get("tenant1:well:a", None).await.unwrap().unwrap();
    h.repo.lock("tenant1:well:b").await;

    // when an update batch hits the locked sibling
    let err = h
        .store
        .ingestion()
        .create_update_records(
            false,
            vec![
                record("tenant1:well:a", json!({"depth": 200})),
                record("tenant1:well:b", json!({"depth": 200})),
            ],
            USER,
            None,
        )
        .await
        .unwrap_err();

    // then the survivor keeps its pre-batch metadata, hash included
    assert_eq!(err.code, 423);
    let after = h.repo.get("tenant1:well:a", None).await.unwrap().unwrap();
    assert_eq!(after, before);

    // and a dedup retry of the never-persisted body is written, not skipped
    h.repo.unlock("tenant1:well:b").await;
    let transfer = h
        .store
        .ingestion()
        .create_update_records(
            true,
            vec![record("tenant1:well:a", json!({"depth": 200}))],
            USER,
            None,
        )
        .await
        .unwrap();
    assert!(transfer.skipped_record_ids.is_empty());
    assert_eq!(transfer.record_ids, vec!["tenant1:well:a".to_string()]);
    let latest = h
        .store
        .query()
        .get_record("tenant1:well:a", USER, None)
        .await
        .unwrap();
    assert_eq!(latest.data, json!({"depth": 200}));
}

#[tokio::test]
async fn should_list_versions_and_serve_a_specific_one() {
    // given
    let h = harness(Config::default());
    let versions = ingest_versions(
        &h,
        "tenant1:well:1",
        &[json!({"v": 1}), json!({"v": 2}), json!({"v": 3})],
    )
    .await;

    // when
    let listing = h
        .store
        .query()
        .get_record_versions("tenant1:well:1", USER, None)
        .await
        .unwrap();
    let oldest = h
        .store
        .query()
        .get_record_version("tenant1:well:1", versions[0], USER, None)
        .await
        .unwrap();

    // then
    assert_eq!(listing.record_id, "tenant1:well:1");
    assert_eq!(listing.versions, versions);
    assert_eq!(oldest.data, json!({"v": 1}));
    assert_eq!(oldest.version, Some(versions[0]));

    // and an unknown version is a 404
    let err = h
        .store
        .query()
        .get_record_version("tenant1:well:1", 42, USER, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, 404);
    assert!(err.message.contains("version '42'"));
}

#[tokio::test]
async fn should_purge_selected_versions_but_never_the_latest() {
    // given
    let h = harness(Config::default());
    let versions = ingest_versions(
        &h,
        "tenant1:well:1",
        &[json!({"v": 1}), json!({"v": 2}), json!({"v": 3}), json!({"v": 4})],
    )
    .await;

    // when
    h.store
        .purge()
        .purge_record_versions(
            "tenant1:well:1",
            Some(&versions[1..3].to_vec()),
            None,
            None,
            USER,
            None,
        )
        .await
        .unwrap();

    // then
    let meta = h.repo.get("tenant1:well:1", None).await.unwrap().unwrap();
    assert_eq!(meta.version_paths.len(), 2);
    assert_eq!(meta.latest_version(), Some(versions[3]));
    assert!(!h.blobs.contains(&meta.version_path(versions[1])).await);
    assert!(h.blobs.contains(&meta.version_path(versions[3])).await);

    // and the latest version is rejected as a purge target
    let err = h
        .store
        .purge()
        .purge_record_versions(
            "tenant1:well:1",
            Some(&[versions[3]]),
            None,
            None,
            USER,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.message,
        format!(
            "Invalid Version Ids. The versionIds contains latest record version '{}'",
            versions[3]
        )
    );
}

#[tokio::test]
async fn should_require_a_version_selector() {
    // given
    let h = harness(Config::default());
    ingest_versions(&h, "tenant1:well:1", &[json!({"v": 1}), json!({"v": 2})]).await;

    // when
    let err = h
        .store
        .purge()
        .purge_record_versions("tenant1:well:1", None, None, None, USER, None)
        .await
        .unwrap_err();

    // then
    assert_eq!(err.code, 400);
    assert_eq!(err.reason, "Invalid versionIds/limit/from");
    assert_eq!(
        err.message,
        "Either [versionIds or limit or from] value is required"
    );
}

#[tokio::test]
async fn should_refuse_to_purge_versions_of_a_single_version_record() {
    // given
    let h = harness(Config::default());
    ingest_versions(&h, "tenant1:well:1", &[json!({"v": 1})]).await;

    // when
    let err = h
        .store
        .purge()
        .purge_record_versions("tenant1:well:1", None, Some(1), None, USER, None)
        .await
        .unwrap_err();

    // then
    assert_eq!(err.reason, "No Record versions to purge");
    assert_eq!(
        err.message,
        "The record 'tenant1:well:1' has only one version"
    );
}

#[tokio::test]
async fn should_validate_limit_against_purgeable_version_count() {
    // given
    let h = harness(Config::default());
    ingest_versions(
        &h,
        "tenant1:well:1",
        &[json!({"v": 1}), json!({"v": 2}), json!({"v": 3})],
    )
    .await;

    // when
    let err = h
        .store
        .purge()
        .purge_record_versions("tenant1:well:1", None, Some(5), None, USER, None)
        .await
        .unwrap_err();

    // then
    assert_eq!(err.reason, "Invalid limit.");
    assert_eq!(
        err.message,
        "The record 'tenant1:well:1' version count (excluding latest version) is : 2 , which is less than limit value : 5 "
    );
}

#[tokio::test]
async fn should_purge_window_selected_by_from_and_limit() {
    // given
    let h = harness(Config::default());
    let versions = ingest_versions(
        &h,
        "tenant1:well:1",
        &[json!({"v": 1}), json!({"v": 2}), json!({"v": 3}), json!({"v": 4}), json!({"v": 5})],
    )
    .await;

    // when
    h.store
        .purge()
        .purge_record_versions(
            "tenant1:well:1",
            None,
            Some(2),
            Some(versions[2]),
            USER,
            None,
        )
        .await
        .unwrap();

    // then
    let meta = h.repo.get("tenant1:well:1", None).await.unwrap().unwrap();
    let remaining: Vec<i64> = meta
        .version_paths
        .iter()
        .filter_map(|p| p.rsplit('/').next().and_then(|v| v.parse().ok()))
        .collect();
    assert_eq!(remaining, vec![versions[0], versions[3], versions[4]]);
}

#[tokio::test]
async fn should_purge_whole_record_and_its_bodies() {
    // given
    let h = harness(Config::default());
    ingest_versions(&h, "tenant1:well:1", &[json!({"v": 1}), json!({"v": 2})]).await;

    // when
    h.store
        .purge()
        .purge_record("tenant1:well:1", USER, None)
        .await
        .unwrap();

    // then
    assert!(h.repo.get("tenant1:well:1", None).await.unwrap().is_none());
    assert!(h.blobs.is_empty().await);
    let err = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, 404);
    let last = h.bus.legacy_messages().pop().unwrap();
    assert_eq!(last.deletion_type, Some(DeletionType::Hard));
}

#[tokio::test]
async fn should_soft_delete_and_recover_record() {
    // given
    let h = harness(Config::default());
    ingest_versions(&h, "tenant1:well:1", &[json!({"v": 1})]).await;

    // when
    h.store
        .delete()
        .delete_record("tenant1:well:1", USER, None)
        .await
        .unwrap();

    // then the record is hidden but its bodies remain
    let err = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, 404);
    assert!(!h.blobs.is_empty().await);
    let last = h.bus.legacy_messages().pop().unwrap();
    assert_eq!(last.deletion_type, Some(DeletionType::Soft));

    // and deleting it again reports not found
    let err = h
        .store
        .delete()
        .delete_record("tenant1:well:1", USER, None)
        .await
        .unwrap_err();
    assert_eq!(
        err.message,
        "Record with id 'tenant1:well:1' does not exist"
    );

    // when it is recovered through a merge patch
    h.store
        .merge_patch()
        .merge_patch_record("tenant1:well:1", &json!({"deleted": false}), USER, None)
        .await
        .unwrap();

    // then it reads again with its old content
    let read = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, None)
        .await
        .unwrap();
    assert_eq!(read.data, json!({"v": 1}));
}

#[tokio::test]
async fn should_reject_any_other_patch_on_deleted_record() {
    // given
    let h = harness(Config::default());
    ingest_versions(&h, "tenant1:well:1", &[json!({"v": 1})]).await;
    h.store
        .delete()
        .delete_record("tenant1:well:1", USER, None)
        .await
        .unwrap();

    // when
    let err = h
        .store
        .merge_patch()
        .merge_patch_record("tenant1:well:1", &json!({"data": {"v": 2}}), USER, None)
        .await
        .unwrap_err();

    // then
    assert_eq!(err.code, 400);
    assert_eq!(err.reason, "Invalid merge patch");
}

#[tokio::test]
async fn should_report_per_record_outcomes_on_bulk_delete() {
    // given
    let h = harness(Config::default());
    ingest_versions(&h, "tenant1:well:1", &[json!({"v": 1})]).await;

    // when
    let err = h
        .store
        .delete()
        .bulk_delete_records(
            &["tenant1:well:1".to_string(), "tenant1:well:missing".to_string()],
            USER,
            None,
        )
        .await
        .unwrap_err();

    // then the present record was still deleted
    let meta = h.repo.get("tenant1:well:1", None).await.unwrap().unwrap();
    assert_eq!(meta.status, record_common::RecordState::Deleted);
    match err {
        record_store::delete::BulkDeleteError::NotDeleted(e) => {
            assert_eq!(e.not_deleted.len(), 1);
            assert_eq!(e.not_deleted[0].id, "tenant1:well:missing");
            assert_eq!(
                e.not_deleted[0].message,
                "Record with id 'tenant1:well:missing' not found"
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn should_merge_data_into_new_version_and_tags_in_place() {
    // given
    let h = harness(Config::default());
    ingest_versions(&h, "tenant1:well:1", &[json!({"depth": 100, "name": "w1"})]).await;

    // when data is merged
    h.store
        .merge_patch()
        .merge_patch_record(
            "tenant1:well:1",
            &json!({"data": {"depth": 250, "name": null}}),
            USER,
            None,
        )
        .await
        .unwrap();

    // then a new version carries the merged body
    let meta = h.repo.get("tenant1:well:1", None).await.unwrap().unwrap();
    assert_eq!(meta.version_paths.len(), 2);
    let read = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, None)
        .await
        .unwrap();
    assert_eq!(read.data, json!({"depth": 250}));

    // when tags are merged
    h.store
        .merge_patch()
        .merge_patch_record(
            "tenant1:well:1",
            &json!({"tags": {"env": "prod"}}),
            USER,
            None,
        )
        .await
        .unwrap();

    // then the version count is unchanged
    let meta = h.repo.get("tenant1:well:1", None).await.unwrap().unwrap();
    assert_eq!(meta.version_paths.len(), 2);
    assert_eq!(meta.tags["env"], "prod");
}

#[tokio::test]
async fn should_reject_deleted_flag_combined_with_other_fields() {
    // given
    let h = harness(Config::default());
    ingest_versions(&h, "tenant1:well:1", &[json!({"v": 1})]).await;

    // when
    let err = h
        .store
        .merge_patch()
        .merge_patch_record(
            "tenant1:well:1",
            &json!({"deleted": true, "tags": {"a": "b"}}),
            USER,
            None,
        )
        .await
        .unwrap_err();

    // then
    assert_eq!(
        err.message,
        "The 'deleted' field must be the only field in the patch"
    );
}

#[tokio::test]
async fn should_run_replay_to_completion_over_all_kinds() {
    // given
    let h = harness(Config::default());
    for i in 0..5 {
        ingest_versions(&h, &format!("tenant1:well:{i}"), &[json!({"i": i})]).await;
    }
    let request = ReplayRequest {
        replay_id: "replay-1".into(),
        operation: "replay".into(),
        filter: None,
    };

    // when
    let response = h
        .store
        .replay()
        .handle_replay_request(&request, "corr-1")
        .await
        .unwrap();
    assert_eq!(response.replay_id, "replay-1");
    let before = h.bus.legacy_messages().len();
    let mut guard = 0;
    loop {
        let pending = h.bus.take_replay_messages();
        if pending.is_empty() {
            break;
        }
        for message in pending {
            h.store.replay().process_replay_message(&message).await.unwrap();
        }
        guard += 1;
        assert!(guard < 100, "replay did not converge");
    }

    // then every record was re-announced and the status is complete
    assert_eq!(h.bus.legacy_messages().len(), before + 5);
    let status = h.store.replay().get_replay_status("replay-1").await.unwrap();
    assert_eq!(status.overall_state, ReplayState::Completed);
    assert_eq!(status.total_records, 5);
    assert_eq!(status.processed_records, 5);
}

#[tokio::test]
async fn should_reject_replay_for_unknown_kind() {
    // given
    let h = harness(Config::default());
    let request = ReplayRequest {
        replay_id: "replay-1".into(),
        operation: "reindex".into(),
        filter: Some(ReplayFilter {
            kinds: vec!["tenant1:src:missing:1.0.0".into()],
        }),
    };

    // when
    let err = h
        .store
        .replay()
        .handle_replay_request(&request, "corr-1")
        .await
        .unwrap_err();

    // then
    assert_eq!(err.code, 400);
    assert_eq!(err.reason, "Kind is invalid.");
}

#[tokio::test]
async fn should_fail_replay_request_when_kickoff_publish_fails() {
    // given
    let h = harness(Config::default());
    ingest_versions(&h, "tenant1:well:1", &[json!({"v": 1})]).await;
    h.bus.fail_next_replay_publish();
    let request = ReplayRequest {
        replay_id: "replay-1".into(),
        operation: "replay".into(),
        filter: None,
    };

    // when
    let err = h
        .store
        .replay()
        .handle_replay_request(&request, "corr-1")
        .await
        .unwrap_err();

    // then
    assert_eq!(err.code, 500);
    assert_eq!(
        err.reason,
        "The exception occurred during the start replay operation."
    );
}

#[tokio::test]
async fn should_deny_writes_to_non_owners() {
    // given
    let h = harness(Config::default());
    ingest_versions(&h, "tenant1:well:1", &[json!({"v": 1})]).await;
    h.entitlements.grant("reader@tenant1.com", "viewers@tenant1");

    // when a viewer tries to delete
    let err = h
        .store
        .delete()
        .delete_record("tenant1:well:1", "reader@tenant1.com", None)
        .await
        .unwrap_err();

    // then
    assert_eq!(err.code, 403);
    assert_eq!(err.reason, "Access denied");

    // but the viewer can still read
    assert!(h
        .store
        .query()
        .get_record("tenant1:well:1", "reader@tenant1.com", None)
        .await
        .is_ok());
}
