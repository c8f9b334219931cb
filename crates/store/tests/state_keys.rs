//! State subsystem: single and multi value keys, observables, namespace
//! switching, and the cached read-through wrapper.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::{Bridge, TEST_NAMESPACE, new_store};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use zoom_store::{CachedStateStorage, ObjId, StateKey, StateStorage};

const WAIT: Duration = Duration::from_secs(5);

fn single(key: &str, value: Option<&str>) -> StateKey {
    StateKey::SingleValue { key: key.to_owned(), value: value.map(str::to_owned) }
}

fn multi(key: &str, values: &[&str]) -> StateKey {
    StateKey::MultiValue {
        key: key.to_owned(),
        values: values.iter().map(|v| (*v).to_owned()).collect::<BTreeSet<_>>(),
    }
}

async fn next_state<S>(stream: &mut S) -> Option<StateKey>
where
    S: futures::Stream<Item = Result<StateKey, zoom_store::ZoomError>> + Unpin,
{
    tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("timed out waiting for state event")
        .map(|item| item.expect("state stream error"))
}

#[tokio::test]
async fn test_single_value_key_is_last_write_wins() {
    let (_backend, store) = new_store().await;
    let state = store.state();
    let id = ObjId::from("b1");

    assert!(state.get_key(TEST_NAMESPACE, "Bridge", &id, "status").await.unwrap().is_empty());

    state.add_value("Bridge", &id, "status", "up").await.unwrap();
    assert_eq!(
        state.get_key(TEST_NAMESPACE, "Bridge", &id, "status").await.unwrap(),
        single("status", Some("up"))
    );

    state.add_value("Bridge", &id, "status", "down").await.unwrap();
    assert_eq!(
        state.get_key(TEST_NAMESPACE, "Bridge", &id, "status").await.unwrap(),
        single("status", Some("down"))
    );

    state.remove_value("Bridge", &id, "status", None).await.unwrap();
    assert!(state.get_key(TEST_NAMESPACE, "Bridge", &id, "status").await.unwrap().is_empty());
    // Removing again is a no-op.
    state.remove_value("Bridge", &id, "status", None).await.unwrap();
}

#[tokio::test]
async fn test_multi_value_key_holds_a_set() {
    let (_backend, store) = new_store().await;
    let state = store.state();
    let id = ObjId::from("b1");

    state.add_value("Bridge", &id, "active_ports", "p1").await.unwrap();
    state.add_value("Bridge", &id, "active_ports", "p2").await.unwrap();
    // Adding an existing value is a no-op.
    state.add_value("Bridge", &id, "active_ports", "p1").await.unwrap();

    assert_eq!(
        state.get_key(TEST_NAMESPACE, "Bridge", &id, "active_ports").await.unwrap(),
        multi("active_ports", &["p1", "p2"])
    );

    state.remove_value("Bridge", &id, "active_ports", Some("p1")).await.unwrap();
    assert_eq!(
        state.get_key(TEST_NAMESPACE, "Bridge", &id, "active_ports").await.unwrap(),
        multi("active_ports", &["p2"])
    );
}

#[tokio::test]
async fn test_unregistered_key_is_rejected() {
    let (_backend, store) = new_store().await;
    let state = store.state();
    let id = ObjId::from("b1");

    assert!(state.add_value("Bridge", &id, "nope", "x").await.is_err());
    assert!(state.get_key(TEST_NAMESPACE, "Bridge", &id, "nope").await.is_err());
}

#[tokio::test]
async fn test_key_observable_emits_current_and_changes() {
    let (_backend, store) = new_store().await;
    let state = store.state();
    let id = ObjId::from("b1");

    state.add_value("Bridge", &id, "status", "up").await.unwrap();

    let mut stream = state.key_observable(TEST_NAMESPACE, "Bridge", &id, "status");
    assert_eq!(next_state(&mut stream).await.unwrap(), single("status", Some("up")));

    state.add_value("Bridge", &id, "status", "down").await.unwrap();
    assert_eq!(next_state(&mut stream).await.unwrap(), single("status", Some("down")));

    state.remove_value("Bridge", &id, "status", None).await.unwrap();
    assert_eq!(next_state(&mut stream).await.unwrap(), single("status", None));

    // The key reappearing is delivered too.
    state.add_value("Bridge", &id, "status", "up").await.unwrap();
    assert_eq!(next_state(&mut stream).await.unwrap(), single("status", Some("up")));
}

#[tokio::test]
async fn test_key_observable_missing_key_yields_empty_set() {
    let (_backend, store) = new_store().await;
    let state = store.state();
    let id = ObjId::from("b1");

    // Materialize the object's state directory via another key.
    state.add_value("Bridge", &id, "active_ports", "p1").await.unwrap();

    let mut stream = state.key_observable(TEST_NAMESPACE, "Bridge", &id, "status");
    assert_eq!(next_state(&mut stream).await.unwrap(), single("status", None));

    state.add_value("Bridge", &id, "status", "up").await.unwrap();
    assert_eq!(next_state(&mut stream).await.unwrap(), single("status", Some("up")));
}

#[tokio::test]
async fn test_key_observable_missing_object_completes() {
    let (_backend, store) = new_store().await;
    let state = store.state();

    let mut stream = state.key_observable(TEST_NAMESPACE, "Bridge", &ObjId::from("ghost"), "status");
    assert!(next_state(&mut stream).await.is_none());

    // An unknown namespace completes as well.
    let mut stream = state.key_observable("elsewhere", "Bridge", &ObjId::from("b1"), "status");
    assert!(next_state(&mut stream).await.is_none());
}

#[tokio::test]
async fn test_multi_value_observable_tracks_membership() {
    let (_backend, store) = new_store().await;
    let state = store.state();
    let id = ObjId::from("b1");

    state.add_value("Bridge", &id, "active_ports", "p1").await.unwrap();

    let mut stream = state.key_observable(TEST_NAMESPACE, "Bridge", &id, "active_ports");
    assert_eq!(next_state(&mut stream).await.unwrap(), multi("active_ports", &["p1"]));

    state.add_value("Bridge", &id, "active_ports", "p2").await.unwrap();
    assert_eq!(next_state(&mut stream).await.unwrap(), multi("active_ports", &["p1", "p2"]));

    state.remove_value("Bridge", &id, "active_ports", Some("p1")).await.unwrap();
    assert_eq!(next_state(&mut stream).await.unwrap(), multi("active_ports", &["p2"]));
}

#[tokio::test]
async fn test_namespace_switching_observable() {
    let (_backend, store) = new_store().await;
    let state = store.state();
    let id = ObjId::from("b1");

    state.add_value("Bridge", &id, "status", "up").await.unwrap();

    let (namespaces, namespace_rx) = tokio::sync::mpsc::channel::<Option<String>>(4);
    let mut stream = state.key_observable_switch(
        ReceiverStream::new(namespace_rx).boxed(),
        "Bridge",
        &id,
        "status",
    );

    // Selecting our namespace attaches to the live key.
    namespaces.send(Some(TEST_NAMESPACE.to_owned())).await.unwrap();
    assert_eq!(next_state(&mut stream).await.unwrap(), single("status", Some("up")));

    // The sentinel unsubscribes without attaching to anything new: further
    // writes must not reach the stream.
    namespaces.send(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    state.add_value("Bridge", &id, "status", "down").await.unwrap();
    let quiet =
        tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
    assert!(quiet.is_err(), "no events expected after the sentinel, got {quiet:?}");

    // Re-selecting the namespace resumes with the current value.
    namespaces.send(Some(TEST_NAMESPACE.to_owned())).await.unwrap();
    assert_eq!(next_state(&mut stream).await.unwrap(), single("status", Some("down")));
}

#[tokio::test]
async fn test_cached_state_storage_reads_through_snapshot() {
    let (_backend, store) = new_store().await;
    let cached = CachedStateStorage::new(store.state());
    let id = ObjId::from("b1");

    cached.add_value("Bridge", &id, "status", "up").await.unwrap();
    assert_eq!(
        cached.get_key(TEST_NAMESPACE, "Bridge", &id, "status").await.unwrap(),
        single("status", Some("up"))
    );

    // A write bypassing the wrapper is invisible to the snapshot map.
    store.state().add_value("Bridge", &id, "status", "down").await.unwrap();
    assert_eq!(
        cached.get_key(TEST_NAMESPACE, "Bridge", &id, "status").await.unwrap(),
        single("status", Some("up"))
    );

    // The observable emits the cached value first, then follows the live
    // stream.
    let mut stream = cached.key_observable(TEST_NAMESPACE, "Bridge", &id, "status");
    assert_eq!(next_state(&mut stream).await.unwrap(), single("status", Some("up")));
    assert_eq!(next_state(&mut stream).await.unwrap(), single("status", Some("down")));

    // Observation refreshed the snapshot.
    assert_eq!(
        cached.get_key(TEST_NAMESPACE, "Bridge", &id, "status").await.unwrap(),
        single("status", Some("down"))
    );
}
