//! Event bus
//!
//! Fan-out of [`SyncEvent`]s to any number of subscribers.
//!
//! Status changes are ordered per entry by their store revision: the bus
//! drops a change older than the last one it published for the same entry,
//! and a subscriber never yields an older state after a newer one. A
//! subscriber that falls behind the channel skips the backlog and receives
//! the latest state of every entry that changed since it subscribed.
//!
//! Removals are kept as tombstones so late states of a deleted entry are
//! still rejected. Tombstones older than every live subscription are pruned
//! once more than a fixed number have piled up.

use crate::protocol::{EntryId, StatusChangeEvent, SyncEvent};
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use std::collections::{btree_map, BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

/// Default channel capacity
pub const DEFAULT_CAPACITY: usize = 1024;

/// Removals remembered regardless of subscribers
const DEFAULT_TOMBSTONE_RETAIN: usize = 1024;

/// Broadcast hub for sync events
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
    state: Mutex<BusState>,
    tombstone_retain: usize,
}

#[derive(Default)]
struct BusState {
    /// Last published change per entry; removals stay as tombstones
    latest: HashMap<EntryId, StatusChangeEvent>,
    /// Removal revision of every tombstone in `latest`
    tombstones: BTreeMap<u64, EntryId>,
    /// Live subscriptions per `since` mark
    subscribers: BTreeMap<u64, usize>,
    /// Highest revision published so far
    high_water: u64,
}

impl BusState {
    /// Drop the oldest tombstones beyond `retain` that no live
    /// subscription can still replay
    fn prune_tombstones(&mut self, retain: usize) {
        let floor = self
            .subscribers
            .keys()
            .next()
            .copied()
            .unwrap_or(self.high_water);
        while self.tombstones.len() > retain {
            match self.tombstones.first_key_value() {
                Some((&revision, _)) if revision <= floor => {}
                _ => break,
            }
            if let Some((_, id)) = self.tombstones.pop_first() {
                self.latest.remove(&id);
            }
        }
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        Self::with_tombstone_retain(capacity, DEFAULT_TOMBSTONE_RETAIN)
    }

    pub(crate) fn with_tombstone_retain(capacity: usize, retain: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            tx,
            state: Mutex::new(BusState::default()),
            tombstone_retain: retain,
        })
    }

    /// Publish a status change.
    ///
    /// Returns `false` when a newer state of the entry was already
    /// published, in which case the change is dropped.
    pub fn publish_change(&self, change: StatusChangeEvent) -> bool {
        let mut state = self.state.lock();
        if let Some(previous) = state.latest.get(&change.entry_id) {
            if change.revision <= previous.revision {
                tracing::trace!(
                    entry = %change.entry_id,
                    revision = change.revision,
                    newer = previous.revision,
                    "Dropping stale status change"
                );
                return false;
            }
        }

        state.high_water = state.high_water.max(change.revision);
        if let Some(previous) = state.latest.insert(change.entry_id.clone(), change.clone()) {
            if previous.new_status.is_none() {
                state.tombstones.remove(&previous.revision);
            }
        }
        if change.new_status.is_none() {
            state
                .tombstones
                .insert(change.revision, change.entry_id.clone());
            state.prune_tombstones(self.tombstone_retain);
        }
        // Sent under the lock so channel order matches revision order
        let _ = self.tx.send(SyncEvent::StatusChanged(change));
        true
    }

    /// Publish an event that is not tied to an entry
    pub fn publish(&self, event: SyncEvent) {
        debug_assert!(event.as_status_change().is_none());
        let _state = self.state.lock();
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let mut state = self.state.lock();
        let since = state.high_water;
        *state.subscribers.entry(since).or_insert(0) += 1;
        Subscription {
            rx: self.tx.subscribe(),
            bus: Arc::downgrade(self),
            since,
            seen: HashMap::new(),
            backlog: VecDeque::new(),
        }
    }

    /// Last published state of an entry
    pub fn latest(&self, id: &EntryId) -> Option<StatusChangeEvent> {
        self.state.lock().latest.get(id).cloned()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn release(&self, since: u64) {
        let mut state = self.state.lock();
        if let btree_map::Entry::Occupied(mut slot) = state.subscribers.entry(since) {
            *slot.get_mut() -= 1;
            if *slot.get() == 0 {
                slot.remove();
            }
        }
        state.prune_tombstones(self.tombstone_retain);
    }

    fn changes_since(&self, since: u64) -> Vec<StatusChangeEvent> {
        let state = self.state.lock();
        let mut changes: Vec<StatusChangeEvent> = state
            .latest
            .values()
            .filter(|c| c.revision > since)
            .cloned()
            .collect();
        changes.sort_by_key(|c| c.revision);
        changes
    }
}

/// A subscriber's view of the bus
pub struct Subscription {
    rx: broadcast::Receiver<SyncEvent>,
    bus: Weak<EventBus>,
    /// Bus high-water mark when the subscription was created
    since: u64,
    /// Last revision yielded per entry
    seen: HashMap<EntryId, u64>,
    backlog: VecDeque<SyncEvent>,
}

impl Subscription {
    /// Wait for the next event; `None` once the engine is gone
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(event);
            }
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => self.catch_up(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is ready
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(event);
            }
            match self.rx.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => self.catch_up(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Turn the subscription into a `Stream`
    pub fn into_stream(self) -> impl Stream<Item = SyncEvent> + Send + 'static {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }

    fn accept(&mut self, event: SyncEvent) -> Option<SyncEvent> {
        if let SyncEvent::StatusChanged(change) = &event {
            let last = self.seen.entry(change.entry_id.clone()).or_insert(0);
            if change.revision <= *last {
                return None;
            }
            *last = change.revision;
        }
        Some(event)
    }

    fn catch_up(&mut self, skipped: u64) {
        tracing::warn!(skipped, "Event subscriber lagged, replaying latest entry states");
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        for change in bus.changes_since(self.since) {
            if let Some(event) = self.accept(SyncEvent::StatusChanged(change)) {
                self.backlog.push_back(event);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.release(self.since);
        }
    }
}
