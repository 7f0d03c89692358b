//! Bulk patch partitioning and collaboration-namespace coverage.

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use record_common::{
    Acl, CollaborationContext, InMemoryBlobStore, InMemoryMetadataRepository, Legal,
    MetadataRepository, MockClock, Record,
};
use record_store::authorization::GroupEntitlements;
use record_store::messaging::InMemoryMessageBus;
use record_store::patch::{PatchOp, PatchOperation};
use record_store::validation::{PATCH_RECORDS_MAX, RECORD_ID_LIST_NOT_EMPTY};
use record_store::{Config, RecordStore};
use serde_json::{json, Value};
use uuid::Uuid;

const USER: &str = "user@tenant1.com";

struct Harness {
    store: RecordStore,
    repo: Arc<InMemoryMetadataRepository>,
    bus: Arc<InMemoryMessageBus>,
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
        .blob_store(blobs)
        .message_bus(bus.clone())
        .entitlements(entitlements)
        .clock(clock.clone())
        .build();
    Harness {
        store,
        repo,
        bus,
        clock,
    }
}

fn record(id: &str, data: Value) -> Record {
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

fn op(kind: PatchOp, path: &str, values: &[Value]) -> PatchOperation {
    PatchOperation {
        op: kind,
        path: path.into(),
        value: values.to_vec(),
    }
}

async fn ingest(h: &Harness, records: Vec<Record>, ctx: Option<&CollaborationContext>) {
    h.store
        .ingestion()
        .create_update_records(false, records, USER, ctx)
        .await
        .unwrap();
    h.clock.advance(Duration::from_millis(100));
}

fn ctx() -> CollaborationContext {
    CollaborationContext {
        id: Uuid::new_v4(),
        application: "pilot-app".into(),
    }
}

#[tokio::test]
async fn should_partition_patch_outcomes_per_record() {
    // given
    let h = harness(Config::default());
    ingest(&h, vec![record("tenant1:well:ok", json!({"v": 1}))], None).await;
    ingest(&h, vec![record("tenant1:well:locked", json!({"v": 1}))], None).await;
    let mut foreign = record("tenant1:well:foreign", json!({"v": 1}));
    foreign.acl.owners = vec!["owners@other".into()];
    ingest(&h, vec![foreign], None).await;
    h.repo.lock("tenant1:well:locked").await;

    // when
    let response = h
        .store
        .patch()
        .patch_records(
            vec![
                "tenant1:well:ok".into(),
                "tenant1:well:locked".into(),
                "tenant1:well:missing".into(),
                "tenant1:well:foreign".into(),
            ],
            vec![op(PatchOp::Add, "/tags", &[json!("env:prod")])],
            USER,
            None,
        )
        .await
        .unwrap();

    // then
    assert_eq!(response.record_ids, vec!["tenant1:well:ok".to_string()]);
    assert_eq!(
        response.not_found_record_ids,
        vec!["tenant1:well:missing".to_string()]
    );
    assert_eq!(
        response.unauthorized_record_ids,
        vec!["tenant1:well:foreign".to_string()]
    );
    assert_eq!(
        response.locked_record_ids,
        vec!["tenant1:well:locked".to_string()]
    );
    assert_eq!(response.http_status(), 206);
    let meta = h.repo.get("tenant1:well:ok", None).await.unwrap().unwrap();
    assert_eq!(meta.tags["env"], "prod");
}

#[tokio::test]
async fn should_not_bump_version_on_governance_patch() {
    // given
    let h = harness(Config::default());
    ingest(&h, vec![record("tenant1:well:1", json!({"v": 1}))], None).await;
    let before = h.repo.get("tenant1:well:1", None).await.unwrap().unwrap();

    // when
    let response = h
        .store
        .patch()
        .patch_records(
            vec!["tenant1:well:1".into()],
            vec![
                op(PatchOp::Add, "/acl/viewers", &[json!("extra@tenant1")]),
                op(PatchOp::Add, "/tags", &[json!("env:prod")]),
            ],
            USER,
            None,
        )
        .await
        .unwrap();

    // then
    assert_eq!(response.http_status(), 200);
    let after = h.repo.get("tenant1:well:1", None).await.unwrap().unwrap();
    assert_eq!(after.version_paths, before.version_paths);
    assert_eq!(after.modify_user.as_deref(), Some(USER));
    assert!(after.acl.viewers.contains(&"extra@tenant1".to_string()));
}

#[tokio::test]
async fn should_bump_version_on_data_patch() {
    // given
    let h = harness(Config::default());
    ingest(&h, vec![record("tenant1:well:1", json!({"depth": 100}))], None).await;

    // when
    let response = h
        .store
        .patch()
        .patch_records(
            vec!["tenant1:well:1".into()],
            vec![op(PatchOp::Replace, "/data/depth", &[json!(300)])],
            USER,
            None,
        )
        .await
        .unwrap();

    // then
    assert_eq!(response.record_ids, vec!["tenant1:well:1".to_string()]);
    let meta = h.repo.get("tenant1:well:1", None).await.unwrap().unwrap();
    assert_eq!(meta.version_paths.len(), 2);
    let read = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, None)
        .await
        .unwrap();
    assert_eq!(read.data, json!({"depth": 300}));
}

#[tokio::test]
async fn should_apply_acl_add_idempotently() {
    // given
    let h = harness(Config::default());
    ingest(&h, vec![record("tenant1:well:1", json!({"v": 1}))], None).await;
    let ops = vec![op(
        PatchOp::Add,
        "/acl/viewers",
        &[json!("viewers@tenant1"), json!("extra@tenant1")],
    )];

    // when the same patch is applied twice
    for _ in 0..2 {
        h.store
            .patch()
            .patch_records(vec!["tenant1:well:1".into()], ops.clone(), USER, None)
            .await
            .unwrap();
    }

    // then the viewer list holds each group once
    let meta = h.repo.get("tenant1:well:1", None).await.unwrap().unwrap();
    assert_eq!(
        meta.acl.viewers,
        vec!["viewers@tenant1".to_string(), "extra@tenant1".to_string()]
    );
}

#[tokio::test]
async fn should_reject_empty_and_oversized_id_lists() {
    // given
    let h = harness(Config::default());
    let ops = vec![op(PatchOp::Add, "/tags", &[json!("a:b")])];

    // when / then
    let err = h
        .store
        .patch()
        .patch_records(vec![], ops.clone(), USER, None)
        .await
        .unwrap_err();
    assert_eq!(err.message, RECORD_ID_LIST_NOT_EMPTY);

    let ids: Vec<String> = (0..101).map(|i| format!("tenant1:well:{i}")).collect();
    let err = h
        .store
        .patch()
        .patch_records(ids, ops, USER, None)
        .await
        .unwrap_err();
    assert_eq!(err.message, PATCH_RECORDS_MAX);
}

#[tokio::test]
async fn should_keep_collaboration_namespaces_isolated() {
    // given
    let h = harness(Config::default().with_collaboration(true));
    let ctx = ctx();
    ingest(&h, vec![record("tenant1:well:1", json!({"space": "sor"}))], None).await;
    ingest(
        &h,
        vec![record("tenant1:well:1", json!({"space": "collab"}))],
        Some(&ctx),
    )
    .await;

    // when
    let sor = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, None)
        .await
        .unwrap();
    let collab = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, Some(&ctx))
        .await
        .unwrap();

    // then
    assert_eq!(sor.data, json!({"space": "sor"}));
    assert_eq!(collab.data, json!({"space": "collab"}));
}

#[tokio::test]
async fn should_hide_collaboration_records_from_other_contexts() {
    // given a record created only under context a
    let h = harness(Config::default().with_collaboration(true));
    let ctx_a = ctx();
    let ctx_b = ctx();
    ingest(
        &h,
        vec![record("tenant1:well:1", json!({"rev": "a1"}))],
        Some(&ctx_a),
    )
    .await;

    // then neither context b nor the primary store sees it
    let err = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, Some(&ctx_b))
        .await
        .unwrap_err();
    assert_eq!(err.code, 404);
    let err = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, 404);

    // when each namespace accumulates its own versions
    ingest(
        &h,
        vec![record("tenant1:well:1", json!({"rev": "a2"}))],
        Some(&ctx_a),
    )
    .await;
    ingest(&h, vec![record("tenant1:well:1", json!({"rev": "p1"}))], None).await;
    ingest(&h, vec![record("tenant1:well:1", json!({"rev": "p2"}))], None).await;

    // then each context serves its own latest
    let in_a = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, Some(&ctx_a))
        .await
        .unwrap();
    let primary = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, None)
        .await
        .unwrap();
    assert_eq!(in_a.data, json!({"rev": "a2"}));
    assert_eq!(primary.data, json!({"rev": "p2"}));
    let meta_a = h
        .repo
        .get("tenant1:well:1", Some(&ctx_a))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta_a.version_paths.len(), 2);
    let meta_primary = h.repo.get("tenant1:well:1", None).await.unwrap().unwrap();
    assert_eq!(meta_primary.version_paths.len(), 2);
}

#[tokio::test]
async fn should_reject_collaboration_context_when_feature_is_disabled() {
    // given
    let h = harness(Config::default());
    let ctx = ctx();

    // when
    let err = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, Some(&ctx))
        .await
        .unwrap_err();

    // then
    assert_eq!(err.code, 423);
    assert_eq!(err.message, "Collaboration feature is not enabled");
}

#[tokio::test]
async fn should_copy_references_into_collaboration_namespace() {
    // given
    let h = harness(Config::default().with_collaboration(true));
    let target = ctx();
    ingest(&h, vec![record("tenant1:well:1", json!({"v": 1}))], None).await;

    // when
    h.store
        .query()
        .copy_record_references(
            vec!["tenant1:well:1".into()],
            Some(target.clone()),
            None,
            USER,
        )
        .await
        .unwrap();

    // then the record reads under the target namespace
    let copied = h
        .store
        .query()
        .get_record("tenant1:well:1", USER, Some(&target))
        .await
        .unwrap();
    assert_eq!(copied.data, json!({"v": 1}));

    // and copying again conflicts
    let err = h
        .store
        .query()
        .copy_record_references(
            vec!["tenant1:well:1".into()],
            Some(target),
            None,
            USER,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, 409);
    assert_eq!(err.reason, "Records already exists");
}

#[tokio::test]
async fn should_refuse_copy_without_source_or_target() {
    // given
    let h = harness(Config::default().with_collaboration(true));

    // when
    let err = h
        .store
        .query()
        .copy_record_references(vec!["tenant1:well:1".into()], None, None, USER)
        .await
        .unwrap_err();

    // then
    assert_eq!(err.code, 409);
    assert_eq!(err.reason, "Can't copy from SOR to SOR");
    assert_eq!(
        err.message,
        "Source and target id is absent. You cant copy from System of Record to System of Record."
    );
}

#[tokio::test]
async fn should_report_missing_source_records_on_copy() {
    // given
    let h = harness(Config::default().with_collaboration(true));
    let target = ctx();

    // when
    let err = h
        .store
        .query()
        .copy_record_references(
            vec!["tenant1:well:ghost".into()],
            Some(target),
            None,
            USER,
        )
        .await
        .unwrap_err();

    // then
    assert_eq!(err.code, 404);
    assert_eq!(err.reason, "Records not found");
    assert!(err.message.contains("tenant1:well:ghost"));
}

#[tokio::test]
async fn should_publish_versioned_messages_for_collaboration_writes() {
    // given
    let h = harness(Config::default().with_collaboration(true));
    let ctx = ctx();

    // when
    ingest(
        &h,
        vec![record("tenant1:well:1", json!({"v": 1}))],
        Some(&ctx),
    )
    .await;

    // then only the versioned channel saw the write
    assert!(h.bus.legacy_messages().is_empty());
    let v2 = h.bus.v2_messages();
    assert_eq!(v2.len(), 1);
    let (message_ctx, message) = &v2[0];
    assert_eq!(message_ctx.as_ref().map(|c| c.id), Some(ctx.id));
    assert_eq!(message.id, "tenant1:well:1");
    assert!(message.version.is_some());
}
