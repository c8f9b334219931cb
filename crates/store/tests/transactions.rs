//! Transaction semantics: snapshots, conflicts, retries, raw node ops, and
//! provenance maintenance.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use common::{Bridge, Port, commit_one, new_store, new_store_with_attempts};
use zoom_backend::Backend;
use zoom_store::{ObjId, PersistenceOp, ZoomError};
use zoom_types::{ChangeKind, ProvenanceRecord, decode};

#[tokio::test]
async fn test_transaction_reads_see_own_writes() {
    let (_backend, store) = new_store().await;

    let mut tx = store.transaction(None).await.unwrap();
    tx.create(Bridge::new("b1", "first")).await.unwrap();

    let mut seen: Bridge = tx.get(&ObjId::from("b1")).await.unwrap();
    assert_eq!(seen.name, "first");

    seen.name = "second".to_owned();
    tx.update(seen).await.unwrap();
    let seen: Bridge = tx.get(&ObjId::from("b1")).await.unwrap();
    assert_eq!(seen.name, "second");

    tx.commit().await.unwrap();
    let committed: Bridge = store.get(&ObjId::from("b1")).await.unwrap();
    assert_eq!(committed.name, "second");
}

#[tokio::test]
async fn test_close_discards_pending_changes() {
    let (_backend, store) = new_store().await;

    let mut tx = store.transaction(None).await.unwrap();
    tx.create(Bridge::new("b1", "discarded")).await.unwrap();
    tx.close().await;

    assert!(!store.exists::<Bridge>(&ObjId::from("b1")).await.unwrap());
}

#[tokio::test]
async fn test_multi_is_all_or_nothing() {
    let (_backend, store) = new_store().await;
    commit_one(&store, PersistenceOp::create(Bridge::new("b1", "existing"))).await.unwrap();

    let err = store
        .multi(vec![
            PersistenceOp::create(Bridge::new("b9", "new")),
            PersistenceOp::create(Bridge::new("b1", "duplicate")),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, ZoomError::ObjectExists { .. }), "got {err:?}");

    assert!(!store.exists::<Bridge>(&ObjId::from("b9")).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_commits_one_wins() {
    let (_backend, store) = new_store().await;
    commit_one(&store, PersistenceOp::create(Bridge::new("b1", "base"))).await.unwrap();

    let mut tx1 = store.transaction(Some("writer-1".to_owned())).await.unwrap();
    let mut tx2 = store.transaction(Some("writer-2".to_owned())).await.unwrap();

    let mut first: Bridge = tx1.get(&ObjId::from("b1")).await.unwrap();
    let mut second: Bridge = tx2.get(&ObjId::from("b1")).await.unwrap();
    first.name = "from-tx1".to_owned();
    second.name = "from-tx2".to_owned();
    tx1.update(first).await.unwrap();
    tx2.update(second).await.unwrap();

    tx1.commit().await.unwrap();
    let err = tx2.commit().await.unwrap_err();
    assert!(matches!(err, ZoomError::ConcurrentModification), "got {err:?}");

    let winner: Bridge = store.get(&ObjId::from("b1")).await.unwrap();
    assert_eq!(winner.name, "from-tx1");
}

#[tokio::test]
async fn test_read_past_snapshot_bound_aborts() {
    let (_backend, store) = new_store().await;
    commit_one(&store, PersistenceOp::create(Bridge::new("b1", "base"))).await.unwrap();

    let mut tx = store.transaction(None).await.unwrap();

    // Another writer lands after the snapshot was taken.
    let mut racer: Bridge = store.get(&ObjId::from("b1")).await.unwrap();
    racer.name = "racer".to_owned();
    commit_one(&store, PersistenceOp::update(racer)).await.unwrap();

    let err = tx.get::<Bridge>(&ObjId::from("b1")).await.unwrap_err();
    assert!(matches!(err, ZoomError::ConcurrentModification), "got {err:?}");
    tx.close().await;
}

#[tokio::test]
async fn test_try_transaction_retries_until_success() {
    let (_backend, store) = new_store().await;
    commit_one(&store, PersistenceOp::create(Bridge::new("b1", "base"))).await.unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let result = store
        .try_transaction(Some("writer".to_owned()), {
            let store = store.clone();
            let attempts = attempts.clone();
            move |tx| {
                let store = store.clone();
                let attempts = attempts.clone();
                Box::pin(async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    let mut bridge: Bridge = tx.get(&ObjId::from("b1")).await?;
                    if attempt == 0 {
                        // A conflicting writer lands between our snapshot
                        // read and our commit.
                        let mut intruder: Bridge = store.get(&ObjId::from("b1")).await?;
                        intruder.name = "intruder".to_owned();
                        store.multi(vec![PersistenceOp::update(intruder)]).await?;
                    }
                    bridge.name = format!("attempt-{attempt}");
                    tx.update(bridge).await?;
                    Ok(())
                })
            }
        })
        .await;

    result.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let bridge: Bridge = store.get(&ObjId::from("b1")).await.unwrap();
    assert_eq!(bridge.name, "attempt-1");
}

#[tokio::test]
async fn test_try_transaction_exhausts_attempts() {
    let (_backend, store) = new_store_with_attempts(2).await;
    commit_one(&store, PersistenceOp::create(Bridge::new("b1", "base"))).await.unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let err = store
        .try_transaction(None, {
            let store = store.clone();
            let attempts = attempts.clone();
            move |tx| {
                let store = store.clone();
                let attempts = attempts.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let mut bridge: Bridge = tx.get(&ObjId::from("b1")).await?;
                    let mut intruder: Bridge = store.get(&ObjId::from("b1")).await?;
                    intruder.name = format!("intruder-{}", attempts.load(Ordering::SeqCst));
                    store.multi(vec![PersistenceOp::update(intruder)]).await?;
                    bridge.name = "loser".to_owned();
                    tx.update(bridge).await?;
                    Ok(())
                })
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ZoomError::ConcurrentModification), "got {err:?}");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_non_retriable_error_propagates_immediately() {
    let (_backend, store) = new_store().await;

    let attempts = Arc::new(AtomicU32::new(0));
    let err = store
        .try_transaction(None, {
            let attempts = attempts.clone();
            move |tx| {
                let attempts = attempts.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    tx.get::<Bridge>(&ObjId::from("missing")).await?;
                    Ok(())
                })
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ZoomError::NotFound { .. }), "got {err:?}");
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_create_then_delete_cancels() {
    let (_backend, store) = new_store().await;

    let mut tx = store.transaction(None).await.unwrap();
    tx.create(Bridge::new("b1", "fleeting")).await.unwrap();
    tx.delete::<Bridge>(&ObjId::from("b1"), false).await.unwrap();
    tx.commit().await.unwrap();

    assert!(!store.exists::<Bridge>(&ObjId::from("b1")).await.unwrap());
}

#[tokio::test]
async fn test_delete_then_create_rejected() {
    let (_backend, store) = new_store().await;
    commit_one(&store, PersistenceOp::create(Bridge::new("b1", "base"))).await.unwrap();

    let mut tx = store.transaction(None).await.unwrap();
    tx.delete::<Bridge>(&ObjId::from("b1"), false).await.unwrap();
    let err = tx.create(Bridge::new("b1", "reborn")).await.unwrap_err();
    assert!(matches!(err, ZoomError::InternalObjectMapper { .. }), "got {err:?}");
    tx.close().await;
}

#[tokio::test]
async fn test_validator_rejects_update() {
    let (_backend, store) = new_store().await;
    commit_one(&store, PersistenceOp::create(Bridge::new("b1", "base"))).await.unwrap();

    let mut tx = store.transaction(None).await.unwrap();
    let mut bridge: Bridge = tx.get(&ObjId::from("b1")).await.unwrap();
    bridge.name = "renamed".to_owned();
    let err = tx
        .update_validated(bridge, |old: &Bridge, new: &Bridge| {
            if old.name != new.name {
                return Err(ZoomError::ServiceUnavailable {
                    reason: "renames are frozen".to_owned(),
                });
            }
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ZoomError::ServiceUnavailable { .. }));
    tx.close().await;

    let bridge: Bridge = store.get(&ObjId::from("b1")).await.unwrap();
    assert_eq!(bridge.name, "base");
}

#[tokio::test]
async fn test_raw_node_operations() {
    let (backend, store) = new_store().await;

    let mut tx = store.transaction(None).await.unwrap();
    tx.create_node("/midonet/custom", b"v1".to_vec()).unwrap();
    tx.commit().await.unwrap();
    assert_eq!(backend.get("/midonet/custom").await.unwrap().data, b"v1");

    // Creating it again collides.
    let mut tx = store.transaction(None).await.unwrap();
    tx.create_node("/midonet/custom", b"v2".to_vec()).unwrap();
    let err = tx.commit().await.unwrap_err();
    match err {
        ZoomError::StorageNodeExists { path } => assert_eq!(path, "/midonet/custom"),
        other => panic!("expected StorageNodeExists, got {other:?}"),
    }

    // Updating a missing node reports the path.
    let mut tx = store.transaction(None).await.unwrap();
    tx.update_node("/midonet/absent", b"x".to_vec()).unwrap();
    let err = tx.commit().await.unwrap_err();
    match err {
        ZoomError::StorageNodeNotFound { path } => assert_eq!(path, "/midonet/absent"),
        other => panic!("expected StorageNodeNotFound, got {other:?}"),
    }

    // Recursive delete takes descendants with it.
    let mut tx = store.transaction(None).await.unwrap();
    tx.create_node("/midonet/tree", Vec::new()).unwrap();
    tx.create_node("/midonet/tree/a", Vec::new()).unwrap();
    tx.create_node("/midonet/tree/a/b", Vec::new()).unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.transaction(None).await.unwrap();
    tx.delete_node("/midonet/tree").unwrap();
    tx.commit().await.unwrap();
    assert!(backend.stat("/midonet/tree").await.unwrap().is_none());
}

#[tokio::test]
async fn test_provenance_records_owner_and_skips_unchanged() {
    let (backend, store) = new_store().await;
    let prov_path = "/midonet/zoom/1/objects/Bridge/b1";

    let mut tx = store.transaction(Some("agent-1".to_owned())).await.unwrap();
    tx.create(Bridge::new("b1", "v0")).await.unwrap();
    tx.commit().await.unwrap();

    let node = backend.get(prov_path).await.unwrap();
    let record: ProvenanceRecord = decode(&node.data).unwrap();
    assert_eq!(record.owner.as_deref(), Some("agent-1"));
    assert_eq!(record.change, ChangeKind::Create);
    assert_eq!(node.stat.version, 0);

    // First update by the same owner rewrites the record (kind changes).
    let update_as = |owner: &str, name: &str| {
        let store = store.clone();
        let owner = owner.to_owned();
        let name = name.to_owned();
        async move {
            let mut tx = store.transaction(Some(owner)).await.unwrap();
            let mut bridge: Bridge = tx.get(&ObjId::from("b1")).await.unwrap();
            bridge.name = name;
            tx.update(bridge).await.unwrap();
            tx.commit().await.unwrap();
        }
    };

    update_as("agent-1", "v1").await;
    let node = backend.get(prov_path).await.unwrap();
    let record: ProvenanceRecord = decode(&node.data).unwrap();
    assert_eq!(record.change, ChangeKind::Update);
    assert_eq!(record.serial, 0);
    assert_eq!(node.stat.version, 1);

    // A second update by the same owner leaves the sibling untouched.
    update_as("agent-1", "v2").await;
    let node = backend.get(prov_path).await.unwrap();
    assert_eq!(node.stat.version, 1);

    // An ownership handoff advances the serial.
    update_as("agent-2", "v3").await;
    let node = backend.get(prov_path).await.unwrap();
    let record: ProvenanceRecord = decode(&node.data).unwrap();
    assert_eq!(record.owner.as_deref(), Some("agent-2"));
    assert_eq!(record.serial, 1);
    assert_eq!(node.stat.version, 2);
}

#[tokio::test]
async fn test_provenance_deleted_with_object() {
    let (backend, store) = new_store().await;
    commit_one(&store, PersistenceOp::create(Bridge::new("b1", "base"))).await.unwrap();
    assert!(backend.stat("/midonet/zoom/1/objects/Bridge/b1").await.unwrap().is_some());

    commit_one(&store, PersistenceOp::delete::<Bridge>(ObjId::from("b1"))).await.unwrap();
    assert!(backend.stat("/midonet/zoom/1/objects/Bridge/b1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_marker_nodes_are_released() {
    let (backend, store) = new_store().await;
    let markers_dir = "/midonet/zoom/1/zoomlocks";

    let mut tx = store.transaction(None).await.unwrap();
    assert_eq!(backend.children(markers_dir).await.unwrap().len(), 1);
    tx.create(Bridge::new("b1", "base")).await.unwrap();
    tx.commit().await.unwrap();
    assert!(backend.children(markers_dir).await.unwrap().is_empty());

    let tx = store.transaction(None).await.unwrap();
    assert_eq!(backend.children(markers_dir).await.unwrap().len(), 1);
    tx.close().await;
    assert!(backend.children(markers_dir).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_get_many_and_get_all() {
    let (_backend, store) = new_store().await;
    commit_one(&store, PersistenceOp::create(Bridge::new("b1", "one"))).await.unwrap();
    commit_one(&store, PersistenceOp::create(Bridge::new("b2", "two"))).await.unwrap();

    let pair: Vec<Bridge> =
        store.get_many(&[ObjId::from("b1"), ObjId::from("b2")]).await.unwrap();
    assert_eq!(pair.len(), 2);

    let mut all: Vec<Bridge> = store.get_all().await.unwrap();
    all.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].name, "one");

    let ports: Vec<Port> = store.get_all().await.unwrap();
    assert!(ports.is_empty());

    let err = store.get_many::<Bridge>(&[ObjId::from("b1"), ObjId::from("nope")]).await;
    assert!(matches!(err, Err(ZoomError::NotFound { .. })));
}

#[tokio::test]
async fn test_stopped_store_is_unavailable() {
    let (_backend, store) = new_store().await;
    store.stop();

    let err = store.get::<Bridge>(&ObjId::from("b1")).await.unwrap_err();
    assert!(matches!(err, ZoomError::ServiceUnavailable { .. }));
    let err = store.transaction(None).await.err().expect("transaction should fail");
    assert!(matches!(err, ZoomError::ServiceUnavailable { .. }));
    let err = store.observable::<Bridge>(&ObjId::from("b1")).err().expect("observable should fail");
    assert!(matches!(err, ZoomError::ServiceUnavailable { .. }));
}
