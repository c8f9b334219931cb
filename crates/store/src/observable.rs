//! Observable cache: de-duplicated live streams per object and per class.
//!
//! The first subscription to a key spawns a driver task holding a backend
//! watcher; later subscriptions share its broadcast channel. Entries carry a
//! monotonically assigned reference number so a stale removal can never
//! evict a replacement entry. Watcher interruptions are recovered
//! transparently; subscribers only ever observe them as a counter
//! increment.

use std::collections::{HashSet, VecDeque};
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as DashEntry;
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;
use zoom_backend::{BackendError, NodeEvent};
use zoom_types::error::NotFoundSnafu;
use zoom_types::{ObjId, ZoomError, decode};

use crate::metrics;
use crate::object::Storable;
use crate::store::StoreInner;
use crate::transaction::ObjKey;

const OBSERVABLE_CHANNEL_CAPACITY: usize = 64;
const RECOVERY_DELAY: Duration = Duration::from_millis(50);

/// Process-wide caches keyed by object and by class.
pub(crate) struct ObservableCaches {
    objects: DashMap<ObjKey, Arc<ObjectEntry>>,
    classes: DashMap<&'static str, Arc<ClassEntry>>,
    next_ref: AtomicU64,
}

impl ObservableCaches {
    pub fn new() -> Self {
        Self { objects: DashMap::new(), classes: DashMap::new(), next_ref: AtomicU64::new(0) }
    }

    pub fn clear(&self) {
        self.objects.clear();
        self.classes.clear();
    }

    fn next_refno(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Event fanned out to the subscribers of one object.
#[derive(Clone)]
enum ObsEvent {
    /// The current serialized object state.
    Value(Arc<Vec<u8>>),
    /// The object was deleted; subscriber streams complete.
    Deleted,
    /// The object did not exist at subscription time; terminal error.
    Missing,
}

struct ObjectEntry {
    refno: u64,
    sender: broadcast::Sender<ObsEvent>,
    /// Latest event, replayed to new subscribers.
    last: RwLock<Option<ObsEvent>>,
}

// ---------------------------------------------------------------------------
// Per-object streams
// ---------------------------------------------------------------------------

/// Subscribes to one object, joining the cached upstream if one exists.
pub(crate) fn subscribe_object<T: Storable>(
    inner: &Arc<StoreInner>,
    id: &ObjId,
) -> Result<ObjectObservable<T>, ZoomError> {
    inner.registry.class(T::class_name())?;
    let key = ObjKey { class: T::class_name(), id: id.clone() };
    loop {
        let entry = match inner.observables.objects.entry(key.clone()) {
            DashEntry::Occupied(occupied) => occupied.get().clone(),
            DashEntry::Vacant(vacant) => {
                let entry = Arc::new(ObjectEntry {
                    refno: inner.observables.next_refno(),
                    sender: broadcast::channel(OBSERVABLE_CHANNEL_CAPACITY).0,
                    last: RwLock::new(None),
                });
                vacant.insert(entry.clone());
                spawn_object_driver(inner.clone(), key.clone(), entry.clone());
                entry
            },
        };

        let receiver = entry.sender.subscribe();
        let replay = entry.last.read().clone();
        // The driver may have evicted this entry between lookup and
        // subscribe; a dead non-terminal entry would never emit again.
        let still_cached = inner
            .observables
            .objects
            .get(&key)
            .is_some_and(|current| current.refno == entry.refno);
        if still_cached || matches!(replay, Some(ObsEvent::Deleted | ObsEvent::Missing)) {
            return Ok(ObjectObservable {
                id: id.clone(),
                replay,
                events: BroadcastStream::new(receiver),
                last_value: None,
                entry,
                done: false,
                _marker: PhantomData,
            });
        }
    }
}

/// Live stream of one object's states.
///
/// Emits the current value on subscribe and on every change, completes when
/// the object is deleted, and fails with `NotFound` when the object does
/// not exist.
pub struct ObjectObservable<T> {
    id: ObjId,
    replay: Option<ObsEvent>,
    events: BroadcastStream<ObsEvent>,
    last_value: Option<Arc<Vec<u8>>>,
    entry: Arc<ObjectEntry>,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Storable> Stream for ObjectObservable<T> {
    type Item = Result<T, ZoomError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            let event = if let Some(event) = this.replay.take() {
                Some(event)
            } else {
                match Pin::new(&mut this.events).poll_next(cx) {
                    Poll::Ready(Some(Ok(event))) => Some(event),
                    // Lagged behind the fan-out: resynchronize from the
                    // cached latest state.
                    Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => {
                        this.entry.last.read().clone()
                    },
                    Poll::Ready(None) => {
                        this.done = true;
                        return Poll::Ready(None);
                    },
                    Poll::Pending => return Poll::Pending,
                }
            };
            match event {
                Some(ObsEvent::Value(bytes)) => {
                    // Collapse duplicate states; watcher recovery re-reads
                    // the node and must stay invisible to subscribers.
                    if this.last_value.as_deref() == Some(bytes.as_ref()) {
                        continue;
                    }
                    this.last_value = Some(bytes.clone());
                    return Poll::Ready(Some(match decode::<T>(&bytes) {
                        Ok(value) => Ok(value),
                        Err(err) => {
                            this.done = true;
                            Err(err.into())
                        },
                    }));
                },
                Some(ObsEvent::Deleted) => {
                    this.done = true;
                    return Poll::Ready(None);
                },
                Some(ObsEvent::Missing) => {
                    this.done = true;
                    return Poll::Ready(Some(
                        NotFoundSnafu { class: T::class_name(), id: this.id.clone() }.fail(),
                    ));
                },
                None => continue,
            }
        }
    }
}

fn spawn_object_driver(inner: Arc<StoreInner>, key: ObjKey, entry: Arc<ObjectEntry>) {
    tokio::spawn(async move {
        let path = inner.paths.object(key.class, &key.id);
        let mut first_attempt = true;
        loop {
            if inner.is_closed() {
                evict_object(&inner, &key, entry.refno);
                return;
            }
            match inner.backend.watch_node(&path).await {
                Ok(watch) => {
                    first_attempt = false;
                    if !publish(&entry, ObsEvent::Value(Arc::new(watch.initial.data)))
                        && try_evict_object(&inner, &key, &entry)
                    {
                        return;
                    }
                    let mut events = watch.events;
                    let mut deleted = false;
                    while let Some(event) = events.next().await {
                        match event {
                            NodeEvent::Data(node) => {
                                if !publish(&entry, ObsEvent::Value(Arc::new(node.data)))
                                    && try_evict_object(&inner, &key, &entry)
                                {
                                    return;
                                }
                            },
                            NodeEvent::Deleted => {
                                deleted = true;
                                break;
                            },
                        }
                    }
                    if deleted {
                        publish(&entry, ObsEvent::Deleted);
                        evict_object(&inner, &key, entry.refno);
                        return;
                    }
                    // The watch was interrupted; recover transparently.
                    metrics::record_watcher_recovery();
                    debug!(class = key.class, id = %key.id, "re-creating object watcher");
                },
                Err(BackendError::NoNode { .. }) => {
                    // Absent on first contact is a terminal miss; absent
                    // after an interruption means it was deleted meanwhile.
                    let event = if first_attempt { ObsEvent::Missing } else { ObsEvent::Deleted };
                    publish(&entry, event);
                    evict_object(&inner, &key, entry.refno);
                    return;
                },
                Err(BackendError::Closed) => {
                    evict_object(&inner, &key, entry.refno);
                    return;
                },
                Err(err) => {
                    metrics::record_watcher_recovery();
                    debug!(%err, class = key.class, id = %key.id, "object watcher failed; retrying");
                    tokio::time::sleep(RECOVERY_DELAY).await;
                },
            }
        }
    });
}

/// Stores and fans out an event. Returns false when nobody is subscribed.
fn publish(entry: &ObjectEntry, event: ObsEvent) -> bool {
    *entry.last.write() = Some(event.clone());
    entry.sender.send(event).is_ok()
}

fn evict_object(inner: &StoreInner, key: &ObjKey, refno: u64) {
    inner.observables.objects.remove_if(key, |_, entry| entry.refno == refno);
}

/// Evicts the entry once the last subscriber is gone. Returns false when a
/// subscriber raced in and the driver must keep serving.
fn try_evict_object(inner: &StoreInner, key: &ObjKey, entry: &Arc<ObjectEntry>) -> bool {
    evict_object(inner, key, entry.refno);
    if entry.sender.receiver_count() > 0 {
        if let DashEntry::Vacant(vacant) = inner.observables.objects.entry(key.clone()) {
            vacant.insert(entry.clone());
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Per-class streams
// ---------------------------------------------------------------------------

struct ClassEntry {
    refno: u64,
    /// Fan-out of (emission sequence, id) for objects appearing in the
    /// class directory.
    sender: broadcast::Sender<(u64, ObjId)>,
    members: RwLock<ClassMembers>,
}

#[derive(Default)]
struct ClassMembers {
    /// Live members with the sequence they were emitted at.
    entries: Vec<(u64, ObjId)>,
    last_seq: u64,
}

/// Subscribes to a class, joining the cached directory watcher.
pub(crate) fn subscribe_class<T: Storable>(
    inner: &Arc<StoreInner>,
) -> Result<ClassObservable<T>, ZoomError> {
    inner.registry.class(T::class_name())?;
    let class = T::class_name();
    loop {
        let entry = match inner.observables.classes.entry(class) {
            DashEntry::Occupied(occupied) => occupied.get().clone(),
            DashEntry::Vacant(vacant) => {
                let entry = Arc::new(ClassEntry {
                    refno: inner.observables.next_refno(),
                    sender: broadcast::channel(OBSERVABLE_CHANNEL_CAPACITY).0,
                    members: RwLock::new(ClassMembers::default()),
                });
                vacant.insert(entry.clone());
                spawn_class_driver(inner.clone(), class, entry.clone());
                entry
            },
        };

        let receiver = entry.sender.subscribe();
        let (replay, max_seen) = {
            let members = entry.members.read();
            (members.entries.clone(), members.last_seq)
        };
        let still_cached = inner
            .observables
            .classes
            .get(class)
            .is_some_and(|current| current.refno == entry.refno);
        if still_cached {
            return Ok(ClassObservable {
                inner: inner.clone(),
                entry,
                replay: replay.into(),
                max_seen,
                events: BroadcastStream::new(receiver),
                done: false,
                _marker: PhantomData,
            });
        }
    }
}

/// Live stream of a class's membership: one per-object stream for every
/// object present at subscription time and every object created later.
pub struct ClassObservable<T> {
    inner: Arc<StoreInner>,
    entry: Arc<ClassEntry>,
    replay: VecDeque<(u64, ObjId)>,
    /// Highest emission sequence already handed to this subscriber; guards
    /// against replay/broadcast overlap.
    max_seen: u64,
    events: BroadcastStream<(u64, ObjId)>,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Storable> Stream for ClassObservable<T> {
    type Item = ObjectObservable<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            if let Some((_, id)) = this.replay.pop_front() {
                match subscribe_object::<T>(&this.inner, &id) {
                    Ok(observable) => return Poll::Ready(Some(observable)),
                    Err(_) => {
                        this.done = true;
                        return Poll::Ready(None);
                    },
                }
            }
            match Pin::new(&mut this.events).poll_next(cx) {
                Poll::Ready(Some(Ok((seq, id)))) => {
                    if seq <= this.max_seen {
                        continue;
                    }
                    this.max_seen = seq;
                    match subscribe_object::<T>(&this.inner, &id) {
                        Ok(observable) => return Poll::Ready(Some(observable)),
                        Err(_) => {
                            this.done = true;
                            return Poll::Ready(None);
                        },
                    }
                },
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => {
                    // Queue the members we have not seen yet.
                    let members = this.entry.members.read();
                    for (seq, id) in &members.entries {
                        if *seq > this.max_seen {
                            this.replay.push_back((*seq, id.clone()));
                        }
                    }
                    drop(members);
                    if let Some(max) = this.replay.iter().map(|(seq, _)| *seq).max() {
                        this.max_seen = max;
                    }
                    continue;
                },
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                },
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn spawn_class_driver(inner: Arc<StoreInner>, class: &'static str, entry: Arc<ClassEntry>) {
    tokio::spawn(async move {
        let dir = inner.paths.class_dir(class);
        loop {
            if inner.is_closed() {
                evict_class(&inner, class, entry.refno);
                return;
            }
            match inner.backend.watch_children(&dir).await {
                Ok(watch) => {
                    if !sync_members(&entry, &watch.initial)
                        && try_evict_class(&inner, class, &entry)
                    {
                        return;
                    }
                    let mut events = watch.events;
                    let mut evicted = false;
                    while let Some(listing) = events.next().await {
                        if !sync_members(&entry, &listing) && try_evict_class(&inner, class, &entry)
                        {
                            evicted = true;
                            break;
                        }
                    }
                    if evicted {
                        return;
                    }
                    metrics::record_watcher_recovery();
                    debug!(class, "re-creating class watcher");
                },
                Err(BackendError::Closed) => {
                    evict_class(&inner, class, entry.refno);
                    return;
                },
                Err(err) => {
                    metrics::record_watcher_recovery();
                    debug!(%err, class, "class watcher failed; retrying");
                    tokio::time::sleep(RECOVERY_DELAY).await;
                },
            }
        }
    });
}

/// Applies a directory listing: drops removed members and emits additions.
/// A member deleted and re-created is emitted again under a fresh sequence.
/// Returns false when an emission found no subscribers.
fn sync_members(entry: &ClassEntry, listing: &[String]) -> bool {
    let current: HashSet<&str> = listing.iter().map(String::as_str).collect();
    let mut members = entry.members.write();
    members.entries.retain(|(_, id)| current.contains(id.as_str()));

    let mut subscribed = true;
    for name in listing {
        if !members.entries.iter().any(|(_, id)| id.as_str() == name.as_str()) {
            members.last_seq += 1;
            let seq = members.last_seq;
            let id = ObjId::from(name.as_str());
            members.entries.push((seq, id.clone()));
            if entry.sender.send((seq, id)).is_err() {
                subscribed = false;
            }
        }
    }
    subscribed
}

fn evict_class(inner: &StoreInner, class: &'static str, refno: u64) {
    inner.observables.classes.remove_if(class, |_, entry| entry.refno == refno);
}

fn try_evict_class(inner: &StoreInner, class: &'static str, entry: &Arc<ClassEntry>) -> bool {
    evict_class(inner, class, entry.refno);
    if entry.sender.receiver_count() > 0 {
        if let DashEntry::Vacant(vacant) = inner.observables.classes.entry(class) {
            vacant.insert(entry.clone());
            return false;
        }
    }
    true
}
