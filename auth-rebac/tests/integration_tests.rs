//! End-to-end tests through `RebacEngine`
//!
//! Covers:
//! 1. Zone isolation on writes
//! 2. Cross-zone share visibility from both zones
//! 3. Permission hierarchy of the sharing relations
//! 4. Expiry
//! 5. Cycle rejection on `parent`
//! 6. Revision monotonicity under concurrent writers
//! 7. Cache correctness after revoke
//! 8. Group userset scenario, expand, explain and batch checks
//! 9. Traversal limits reported apart from deny

use auth_rebac::{
    CheckItem, CheckRequest, EngineConfig, Entity, ExplanationOutcome, ExplanationStep, GraphLimit,
    InMemoryTupleRepository, RebacEngine, RebacError, Subject, TupleFilter, TupleRepository, TupleWrite,
    CROSS_ZONE_ALLOWED_RELATIONS,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

fn create_test_engine() -> (Arc<RebacEngine>, Arc<InMemoryTupleRepository>) {
    let repo = Arc::new(InMemoryTupleRepository::new());
    let engine = RebacEngine::with_defaults(repo.clone()).unwrap();
    (Arc::new(engine), repo)
}

fn bob() -> Entity {
    Entity::new("user", "bob@partner")
}

fn acme_doc() -> Entity {
    Entity::file("/acme/doc.txt")
}

fn share(relation: &str) -> TupleWrite {
    TupleWrite::new(bob(), relation, acme_doc())
        .in_zone("acme")
        .with_subject_zone("partner")
}

async fn check(engine: &RebacEngine, subject: Entity, permission: &str, object: Entity, zone: &str) -> bool {
    engine
        .rebac_check(CheckRequest::new(subject, permission, object).in_zone(zone))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_zone_isolation_rejects_non_sharing_relations() {
    let (engine, repo) = create_test_engine();

    for relation in ["direct_viewer", "direct_owner", "parent", "member-of"] {
        let err = engine.rebac_create(share(relation)).await.unwrap_err();
        match err {
            RebacError::ZoneIsolation {
                relation: rejected,
                subject_zone,
                object_zone,
            } => {
                assert_eq!(rejected, relation);
                assert_eq!(subject_zone, "partner");
                assert_eq!(object_zone, "acme");
            }
            other => panic!("expected zone isolation error, got {:?}", other),
        }
    }
    assert!(repo.is_empty());

    for relation in CROSS_ZONE_ALLOWED_RELATIONS {
        engine.rebac_create(share(relation)).await.unwrap();
    }
    assert_eq!(repo.len(), 3);
}

#[tokio::test]
async fn test_cross_zone_share_visibility() {
    let (engine, repo) = create_test_engine();
    engine.rebac_create(share("shared-viewer")).await.unwrap();

    assert!(check(&engine, bob(), "shared-viewer", acme_doc(), "acme").await);
    // Discoverable from the recipient's own zone too.
    assert!(check(&engine, bob(), "read", acme_doc(), "partner").await);

    let with_subject = repo
        .fetch_tuples_for_traversal("partner", Some(&bob()))
        .await
        .unwrap();
    assert_eq!(with_subject.len(), 1);
    assert_eq!(with_subject[0].relation, "shared-viewer");

    let without_subject = repo.fetch_tuples_for_traversal("partner", None).await.unwrap();
    assert!(without_subject.is_empty());
}

#[tokio::test]
async fn test_sharing_permission_hierarchy() {
    let cases: [(&str, &[&str], &[&str]); 3] = [
        ("shared-viewer", &["read"], &["write", "owner"]),
        ("shared-editor", &["read", "write"], &["owner", "execute"]),
        ("shared-owner", &["read", "write", "owner"], &[]),
    ];

    for (relation, granted, denied) in cases {
        let (engine, _) = create_test_engine();
        engine.rebac_create(share(relation)).await.unwrap();

        for permission in granted {
            assert!(
                check(&engine, bob(), permission, acme_doc(), "acme").await,
                "{} should imply {}",
                relation,
                permission
            );
        }
        for permission in denied {
            assert!(
                !check(&engine, bob(), permission, acme_doc(), "acme").await,
                "{} should not imply {}",
                relation,
                permission
            );
        }
    }
}

#[tokio::test]
async fn test_expired_share_denies_and_future_share_allows() {
    let (engine, _) = create_test_engine();
    engine
        .rebac_create(share("shared-viewer").expires_at(Utc::now() - ChronoDuration::hours(1)))
        .await
        .unwrap();
    assert!(!check(&engine, bob(), "read", acme_doc(), "acme").await);

    let (engine, _) = create_test_engine();
    engine
        .rebac_create(share("shared-viewer").expires_at(Utc::now() + ChronoDuration::hours(1)))
        .await
        .unwrap();
    assert!(check(&engine, bob(), "read", acme_doc(), "acme").await);
}

#[tokio::test]
async fn test_parent_cycle_rejected() {
    let (engine, _) = create_test_engine();
    let (a, b, c) = (Entity::file("/a"), Entity::file("/b"), Entity::file("/c"));

    engine
        .rebac_create(TupleWrite::new(a.clone(), "parent", b.clone()))
        .await
        .unwrap();
    engine
        .rebac_create(TupleWrite::new(b, "parent", c.clone()))
        .await
        .unwrap();
    let err = engine
        .rebac_create(TupleWrite::new(c, "parent", a))
        .await
        .unwrap_err();
    assert!(matches!(err, RebacError::CycleDetected { ref relation, .. } if relation == "parent"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_get_unique_revisions() {
    let (engine, _) = create_test_engine();

    let mut handles = Vec::new();
    for writer in 0..4 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut revisions = Vec::new();
            for i in 0..10 {
                let outcome = engine
                    .rebac_create(
                        TupleWrite::new(
                            Entity::user(&format!("writer-{}", writer)),
                            "direct_viewer",
                            Entity::file(&format!("/w{}/{}", writer, i)),
                        )
                        .in_zone("busy"),
                    )
                    .await
                    .unwrap();
                revisions.push(outcome.revision);
            }
            revisions
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        let revisions = handle.await.unwrap();
        // Each writer sees its own revisions strictly increase.
        assert!(revisions.windows(2).all(|pair| pair[0] < pair[1]));
        all.extend(revisions);
    }
    all.sort_unstable();
    assert_eq!(all, (1..=40).collect::<Vec<u64>>());
    assert_eq!(engine.current_revision("busy"), 40);
    assert_eq!(engine.current_revision("quiet"), 0);
}

#[tokio::test]
async fn test_revoke_is_not_served_from_cache() {
    let (engine, _) = create_test_engine();
    let alice = Entity::user("alice");
    let doc = Entity::file("/secret");

    let written = engine
        .rebac_create(TupleWrite::new(alice.clone(), "direct_viewer", doc.clone()))
        .await
        .unwrap();
    assert!(check(&engine, alice.clone(), "read", doc.clone(), "default").await);
    // Second check is answered from cache.
    assert!(check(&engine, alice.clone(), "read", doc.clone(), "default").await);
    assert!(engine.cache().l1_len() > 0);

    assert!(engine.rebac_delete(written.tuple_id).await.unwrap());
    assert!(!check(&engine, alice, "read", doc, "default").await);
    assert!(!engine.rebac_delete(written.tuple_id).await.unwrap());
}

#[tokio::test]
async fn test_group_owner_scenario() {
    let (engine, _) = create_test_engine();
    let readme = Entity::file("/readme");

    engine
        .rebac_create(TupleWrite::new(Entity::user("alice"), "member-of", Entity::group("eng")))
        .await
        .unwrap();
    engine
        .rebac_create(TupleWrite::new(
            Subject::userset("group", "eng", "member"),
            "direct_owner",
            readme.clone(),
        ))
        .await
        .unwrap();

    assert!(check(&engine, Entity::user("alice"), "read", readme.clone(), "default").await);
    assert!(!check(&engine, Entity::user("bob"), "read", readme.clone(), "default").await);

    let readers = engine.rebac_expand("read", &readme, None).await.unwrap();
    assert_eq!(readers, vec![Entity::user("alice")]);

    let explanation = engine
        .rebac_explain(&Entity::user("alice"), "read", &readme, None)
        .await
        .unwrap();
    assert!(explanation.allowed());
    assert!(matches!(explanation.path.first(), Some(ExplanationStep::Start { .. })));
    assert!(matches!(explanation.path.last(), Some(ExplanationStep::Direct { relation, .. }) if relation == "member-of"));

    let denied = engine
        .rebac_explain(&Entity::user("bob"), "read", &readme, None)
        .await
        .unwrap();
    assert_eq!(denied.outcome, ExplanationOutcome::Denied);
    assert!(denied.path.is_empty());
}

#[tokio::test]
async fn test_batch_check_preserves_order() {
    let (engine, _) = create_test_engine();
    let doc = Entity::file("/doc");
    engine
        .rebac_create(TupleWrite::new(Entity::user("alice"), "direct_editor", doc.clone()))
        .await
        .unwrap();

    let results = engine
        .rebac_check_batch(
            vec![
                CheckItem::new(Entity::user("alice"), "write", doc.clone()),
                CheckItem::new(Entity::user("bob"), "read", doc.clone()),
                CheckItem::new(Entity::user("alice"), "execute", doc.clone()),
                CheckItem::new(Entity::user("alice"), "read", doc),
            ],
            None,
        )
        .await
        .unwrap();
    assert_eq!(results, vec![true, false, false, true]);

    assert!(engine.rebac_check_batch(Vec::new(), None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_public_wildcard_access() {
    let (engine, _) = create_test_engine();
    let page = Entity::file("/public/index.html");
    engine
        .rebac_create(TupleWrite::new(Subject::wildcard(), "direct_viewer", page.clone()))
        .await
        .unwrap();

    assert!(check(&engine, Entity::user("anyone"), "read", page.clone(), "default").await);
    assert!(!check(&engine, Entity::user("anyone"), "write", page, "default").await);
}

#[tokio::test]
async fn test_limit_exceeded_is_not_deny() {
    let repo = Arc::new(InMemoryTupleRepository::new());
    let mut config = EngineConfig::default();
    config.traversal.max_depth = 2;
    let engine = RebacEngine::new(
        repo,
        Arc::new(auth_rebac::NamespaceRegistry::with_defaults()),
        config,
    )
    .unwrap();

    for i in 0..4 {
        engine
            .rebac_create(TupleWrite::new(
                Subject::userset("group", &format!("g{}", i + 1), "member"),
                "member-of",
                Entity::group(&format!("g{}", i)),
            ))
            .await
            .unwrap();
    }
    engine
        .rebac_create(TupleWrite::new(Entity::user("alice"), "member-of", Entity::group("g4")))
        .await
        .unwrap();

    let err = engine
        .rebac_check(CheckRequest::new(Entity::user("alice"), "member", Entity::group("g0")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RebacError::GraphLimitExceeded(GraphLimit::Depth { max_depth: 2 })
    ));

    let explanation = engine
        .rebac_explain(&Entity::user("alice"), "member", &Entity::group("g0"), None)
        .await
        .unwrap();
    assert_eq!(
        explanation.outcome,
        ExplanationOutcome::LimitExceeded(GraphLimit::Depth { max_depth: 2 })
    );
}

#[tokio::test]
async fn test_list_tuples_filters() {
    let (engine, _) = create_test_engine();
    engine.rebac_create(share("shared-editor")).await.unwrap();
    engine
        .rebac_create(TupleWrite::new(Entity::user("carol"), "direct_viewer", acme_doc()).in_zone("acme"))
        .await
        .unwrap();
    engine
        .rebac_create(TupleWrite::new(Entity::user("carol"), "direct_viewer", Entity::file("/other")))
        .await
        .unwrap();

    let on_doc = engine
        .rebac_list_tuples(TupleFilter::new().object(acme_doc()))
        .await
        .unwrap();
    assert_eq!(on_doc.len(), 2);

    let carol_in_acme = engine
        .rebac_list_tuples(TupleFilter::new().subject(Entity::user("carol")).zone("acme"))
        .await
        .unwrap();
    assert_eq!(carol_in_acme.len(), 1);

    let relations: BTreeSet<String> = engine
        .rebac_list_tuples(TupleFilter::new())
        .await
        .unwrap()
        .into_iter()
        .map(|tuple| tuple.relation)
        .collect();
    assert_eq!(
        relations,
        BTreeSet::from(["direct_viewer".to_string(), "shared-editor".to_string()])
    );
    assert!(!engine.rebac_delete(Uuid::new_v4()).await.unwrap());
}
