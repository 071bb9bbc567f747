//! Canonical merged state and its subscribers.
//!
//! One mutex guards the whole apply/read/subscribe surface, so a reader never
//! sees half of a batch. Subscribers are called after the lock is released,
//! once per committed batch, with the new immutable view. Deliveries are
//! ordered by version: a view older than one already delivered is skipped.

use crate::health::{OverallHealth, SourceHealth};
use crate::types::*;
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use serde_json::Value;
use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_ALERT_CAPACITY: usize = 100;

/// A stored field with the stamp of its last writer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StampedValue {
    pub value: Value,
    pub observed_at: Stamp,
    pub origin: Origin,
}

impl StampedValue {
    /// Whether an incoming write at `observed_at` from `origin` replaces this one.
    ///
    /// Strictly newer always wins. On equal stamps push beats poll, and a
    /// later push beats an earlier push (the push channel is ordered); poll
    /// never replaces an equal-stamped field.
    pub fn is_superseded_by(&self, observed_at: Stamp, origin: &Origin) -> bool {
        if observed_at != self.observed_at {
            return observed_at > self.observed_at;
        }
        origin.is_push()
    }
}

pub type DomainRecord = BTreeMap<String, StampedValue>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    domains: BTreeMap<String, DomainRecord>,
}

impl Snapshot {
    pub fn get(&self, path: &FieldPath) -> Option<&StampedValue> {
        self.domains.get(&path.domain)?.get(&path.field)
    }

    pub fn value(&self, path: &FieldPath) -> Option<&Value> {
        self.get(path).map(|s| &s.value)
    }

    pub fn domain(&self, domain: &str) -> Option<&DomainRecord> {
        self.domains.get(domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = (&String, &DomainRecord)> {
        self.domains.iter()
    }

    /// Domains whose name starts with `prefix`, e.g. `market:`.
    pub fn domains_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a DomainRecord)> + 'a {
        self.domains
            .iter()
            .filter(move |(name, _)| name.starts_with(prefix))
    }

    pub fn field_count(&self) -> usize {
        self.domains.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn admits(&self, update: &FieldUpdate) -> bool {
        self.get(&update.path)
            .map_or(true, |stored| stored.is_superseded_by(update.observed_at, &update.origin))
    }

    fn write(&mut self, update: FieldUpdate) {
        self.domains.entry(update.path.domain).or_default().insert(
            update.path.field,
            StampedValue {
                value: update.value,
                observed_at: update.observed_at,
                origin: update.origin,
            },
        );
    }
}

/// Everything a subscriber can observe, as one immutable value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncView {
    /// Incremented once per committed batch.
    pub version: u64,
    pub connection: ConnectionState,
    pub snapshot: Snapshot,
    pub sources: BTreeMap<String, SourceHealth>,
    pub alerts: VecDeque<AlertRecord>,
    /// Start of the current session. Anything observed earlier is dropped.
    pub reset_at: Option<Stamp>,
}

impl SyncView {
    pub fn health(&self) -> OverallHealth {
        OverallHealth::compute(self.connection, self.sources.values())
    }

    /// Most recent alerts first.
    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertRecord> {
        self.alerts.iter().rev().take(limit).cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub accepted: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

pub type Subscriber = Arc<dyn Fn(&Arc<SyncView>) + Send + Sync>;

struct StoreInner {
    view: Arc<SyncView>,
    alert_capacity: usize,
    next_alert_id: u64,
    next_token: u64,
    subscribers: Vec<(SubscriptionToken, Subscriber)>,
}

pub struct StateStore {
    inner: Mutex<StoreInner>,
    /// Highest version handed to subscribers. Reentrant so a subscriber may
    /// write back into the store.
    delivered: ReentrantMutex<Cell<u64>>,
}

impl StateStore {
    pub fn new(alert_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                view: Arc::new(SyncView::default()),
                alert_capacity: alert_capacity.max(1),
                next_alert_id: 1,
                next_token: 1,
                subscribers: Vec::new(),
            }),
            delivered: ReentrantMutex::new(Cell::new(0)),
        }
    }

    /// Run `f` against the store as one logical batch. Subscribers are
    /// notified once afterwards if anything changed.
    pub fn batch<R>(&self, f: impl FnOnce(&mut StoreTxn<'_>) -> R) -> R {
        let (result, notify) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let mut txn = StoreTxn {
                view: &mut inner.view,
                alert_capacity: inner.alert_capacity,
                next_alert_id: &mut inner.next_alert_id,
                changed: false,
                outcome: BatchOutcome::default(),
            };
            let result = f(&mut txn);
            let changed = txn.changed;

            let notify = if changed {
                Arc::make_mut(&mut inner.view).version += 1;
                let subscribers: Vec<Subscriber> =
                    inner.subscribers.iter().map(|(_, s)| Arc::clone(s)).collect();
                Some((Arc::clone(&inner.view), subscribers))
            } else {
                None
            };
            (result, notify)
        };

        if let Some((view, subscribers)) = notify {
            self.deliver(&view, subscribers);
        }
        result
    }

    fn deliver(&self, view: &Arc<SyncView>, subscribers: Vec<Subscriber>) {
        let delivered = self.delivered.lock();
        if delivered.get() >= view.version {
            debug!("Skipping notification for superseded version {}", view.version);
            return;
        }
        delivered.set(view.version);
        for subscriber in subscribers {
            // A subscriber that wrote back has already delivered a newer view.
            if delivered.get() > view.version {
                break;
            }
            subscriber(view);
        }
    }

    /// Returns whether the update was accepted.
    pub fn apply(&self, update: FieldUpdate) -> bool {
        self.batch(|txn| txn.apply(update))
    }

    pub fn apply_batch(&self, updates: impl IntoIterator<Item = FieldUpdate>) -> BatchOutcome {
        self.batch(|txn| {
            for update in updates {
                txn.apply(update);
            }
            txn.outcome()
        })
    }

    pub fn set_connection_state(&self, state: ConnectionState) -> bool {
        self.batch(|txn| txn.set_connection_state(state))
    }

    pub fn register_source(&self, health: SourceHealth) {
        self.batch(|txn| txn.register_source(health))
    }

    pub fn push_alert(&self, alert: NewAlert, created_at: Stamp) -> AlertRecord {
        self.batch(|txn| txn.push_alert(alert, created_at))
    }

    pub fn view(&self) -> Arc<SyncView> {
        Arc::clone(&self.inner.lock().view)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().view.snapshot.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().view.connection
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&Arc<SyncView>) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let token = SubscriptionToken(inner.next_token);
        inner.next_token += 1;
        let subscriber: Subscriber = Arc::new(callback);
        inner.subscribers.push((token, subscriber));
        token
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(t, _)| *t != token);
        inner.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Session reset at `at`: empties snapshot and alerts, clears source
    /// history while keeping registrations, and notifies once. Updates
    /// observed before `at` are dropped from then on. The connection mirror
    /// is kept because the transport owns it.
    pub fn reset(&self, at: Stamp) {
        self.batch(|txn| txn.reset(at))
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_CAPACITY)
    }
}

/// Mutable access to the store inside [`StateStore::batch`].
pub struct StoreTxn<'a> {
    view: &'a mut Arc<SyncView>,
    alert_capacity: usize,
    next_alert_id: &'a mut u64,
    changed: bool,
    outcome: BatchOutcome,
}

impl StoreTxn<'_> {
    pub fn view(&self) -> &SyncView {
        &**self.view
    }

    pub fn outcome(&self) -> BatchOutcome {
        self.outcome
    }

    fn view_mut(&mut self) -> &mut SyncView {
        self.changed = true;
        Arc::make_mut(self.view)
    }

    /// Whether `stamp` belongs to a session that has since been reset.
    pub fn predates_reset(&self, stamp: Stamp) -> bool {
        self.view.reset_at.map_or(false, |epoch| stamp < epoch)
    }

    pub fn apply(&mut self, update: FieldUpdate) -> bool {
        if self.predates_reset(update.observed_at) {
            debug!(
                "Dropping update for {} from {} observed before the session reset",
                update.path, update.origin
            );
            self.outcome.dropped += 1;
            return false;
        }
        if !self.view.snapshot.admits(&update) {
            if let Some(stored) = self.view.snapshot.get(&update.path) {
                debug!(
                    "Dropping stale update for {} from {}: {} <= {}",
                    update.path, update.origin, update.observed_at, stored.observed_at
                );
            }
            self.outcome.dropped += 1;
            return false;
        }
        self.view_mut().snapshot.write(update);
        self.outcome.accepted += 1;
        true
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) -> bool {
        if self.view.connection == state {
            return false;
        }
        self.view_mut().connection = state;
        true
    }

    pub fn register_source(&mut self, health: SourceHealth) {
        self.view_mut()
            .sources
            .insert(health.source_id.clone(), health);
    }

    pub fn record_poll_success(&mut self, source_id: &str, requested_at: Stamp, completed_at: Stamp) {
        self.source_mut(source_id).record_success(requested_at, completed_at);
    }

    pub fn record_poll_failure(
        &mut self,
        source_id: &str,
        at: Stamp,
        error: String,
        consecutive_failures: u32,
    ) {
        self.source_mut(source_id)
            .record_failure(at, error, consecutive_failures);
    }

    fn source_mut(&mut self, source_id: &str) -> &mut SourceHealth {
        self.view_mut()
            .sources
            .entry(source_id.to_string())
            .or_insert_with(|| SourceHealth::new(source_id, 0))
    }

    pub fn push_alert(&mut self, alert: NewAlert, created_at: Stamp) -> AlertRecord {
        let record = AlertRecord {
            id: *self.next_alert_id,
            kind: alert.kind,
            severity: alert.severity,
            message: alert.message,
            created_at,
        };
        *self.next_alert_id += 1;

        let capacity = self.alert_capacity;
        let alerts = &mut self.view_mut().alerts;
        while alerts.len() >= capacity {
            alerts.pop_front();
        }
        alerts.push_back(record.clone());
        record
    }

    pub fn reset(&mut self, at: Stamp) {
        let view = self.view_mut();
        view.reset_at = Some(view.reset_at.map_or(at, |epoch| epoch.max(at)));
        view.snapshot = Snapshot::default();
        view.alerts.clear();
        for source in view.sources.values_mut() {
            *source = source.cleared();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(ms: i64) -> Stamp {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn update(field: &str, value: Value, ms: i64, origin: Origin) -> FieldUpdate {
        FieldUpdate::new(FieldPath::new("market:NIFTY", field), value, at(ms), origin)
    }

    fn poll() -> Origin {
        Origin::Poll("market".into())
    }

    #[test]
    fn test_stale_update_is_dropped() {
        let store = StateStore::default();
        assert!(store.apply(update("ltp", json!(105), 1500, Origin::Push)));
        assert!(!store.apply(update("ltp", json!(100), 0, poll())));

        let snap = store.snapshot();
        let stored = snap.get(&FieldPath::new("market:NIFTY", "ltp")).unwrap();
        assert_eq!(stored.value, json!(105));
        assert_eq!(stored.observed_at, at(1500));
        assert_eq!(stored.origin, Origin::Push);
    }

    #[test]
    fn test_tie_prefers_push() {
        let store = StateStore::default();
        assert!(store.apply(update("ltp", json!(1), 10, poll())));
        assert!(store.apply(update("ltp", json!(2), 10, Origin::Push)));
        assert!(!store.apply(update("ltp", json!(3), 10, poll())));
        assert!(store.apply(update("ltp", json!(4), 10, Origin::Push)));
        assert_eq!(
            store.snapshot().value(&FieldPath::new("market:NIFTY", "ltp")),
            Some(&json!(4))
        );
    }

    #[test]
    fn test_fields_are_stamped_independently() {
        let store = StateStore::default();
        store.apply(update("ltp", json!(105), 1500, Origin::Push));
        // Older stamp, but a different field.
        assert!(store.apply(update("volume", json!(9), 0, poll())));
        assert_eq!(store.snapshot().field_count(), 2);
    }

    #[test]
    fn test_batch_notifies_once() {
        let store = StateStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        store.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let outcome = store.apply_batch(vec![
            update("ltp", json!(1), 1, Origin::Push),
            update("bid", json!(2), 1, Origin::Push),
            update("ltp", json!(0), 0, poll()),
        ]);
        assert_eq!(outcome, BatchOutcome { accepted: 2, dropped: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.view().version, 1);
    }

    #[test]
    fn test_all_stale_batch_does_not_notify() {
        let store = StateStore::default();
        store.apply(update("ltp", json!(1), 100, Origin::Push));

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        store.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let outcome = store.apply_batch(vec![update("ltp", json!(0), 50, poll())]);
        assert_eq!(outcome.accepted, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.view().version, 1);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let store = StateStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let token = store.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        store.apply(update("ltp", json!(1), 1, Origin::Push));
        assert!(store.unsubscribe(token));
        assert!(!store.unsubscribe(token));
        store.apply(update("ltp", json!(2), 2, Origin::Push));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_can_read_store() {
        let store = Arc::new(StateStore::default());
        let reader = Arc::clone(&store);
        let versions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&versions);
        store.subscribe(move |view| {
            // Must not deadlock: callbacks run outside the lock.
            assert_eq!(reader.view().version, view.version);
            sink.lock().push(view.version);
        });
        store.apply(update("ltp", json!(1), 1, Origin::Push));
        store.set_connection_state(ConnectionState::Connected);
        assert_eq!(*versions.lock(), vec![1, 2]);
    }

    #[test]
    fn test_snapshot_copy_is_immutable() {
        let store = StateStore::default();
        store.apply(update("ltp", json!(1), 1, Origin::Push));
        let before = store.view();
        store.apply(update("ltp", json!(2), 2, Origin::Push));
        assert_eq!(
            before.snapshot.value(&FieldPath::new("market:NIFTY", "ltp")),
            Some(&json!(1))
        );
    }

    #[test]
    fn test_connection_state_only_notifies_on_change() {
        let store = StateStore::default();
        assert!(store.set_connection_state(ConnectionState::Connecting));
        assert!(!store.set_connection_state(ConnectionState::Connecting));
        assert_eq!(store.connection_state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_alert_ring_evicts_oldest() {
        let store = StateStore::new(3);
        for i in 0..5 {
            store.push_alert(
                NewAlert {
                    kind: "risk_alert".into(),
                    severity: Severity::Critical,
                    message: format!("alert {}", i),
                },
                at(i),
            );
        }
        let view = store.view();
        let ids: Vec<u64> = view.alerts.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(view.recent_alerts(2)[0].message, "alert 4");
    }

    #[test]
    fn test_alerts_ignore_freshness() {
        let store = StateStore::default();
        let alert = |msg: &str| NewAlert {
            kind: "fill_alert".into(),
            severity: Severity::Info,
            message: msg.into(),
        };
        store.push_alert(alert("late"), at(100));
        store.push_alert(alert("early"), at(1));
        assert_eq!(store.view().alerts.len(), 2);
    }

    #[test]
    fn test_notifications_arrive_in_version_order() {
        let store = Arc::new(StateStore::default());
        let writer = Arc::clone(&store);
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&first);
        store.subscribe(move |view| {
            sink.lock().push(view.version);
            if view.version == 1 {
                // Commits version 2 while version 1 is still being delivered.
                writer.reset(at(100));
            }
        });
        let sink = Arc::clone(&second);
        store.subscribe(move |view| sink.lock().push(view.version));

        store.apply(update("ltp", json!(1), 1, Origin::Push));
        assert_eq!(*first.lock(), vec![1, 2]);
        assert_eq!(*second.lock(), vec![2]);
        assert_eq!(store.view().version, 2);
    }

    #[test]
    fn test_concurrent_writers_deliver_increasing_versions() {
        let store = Arc::new(StateStore::default());
        let versions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&versions);
        store.subscribe(move |view| sink.lock().push(view.version));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let field = format!("f{}", w);
                        store.apply(update(&field, json!(i), i64::from(i), Origin::Push));
                        if i % 50 == 0 {
                            store.reset(at(0));
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let versions = versions.lock();
        assert!(versions.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(versions.last().copied(), Some(store.view().version));
    }

    #[test]
    fn test_reset_drops_updates_from_before_it() {
        let store = StateStore::default();
        store.apply(update("ltp", json!(1000), 10, poll()));
        store.reset(at(100));
        assert!(store.snapshot().is_empty());

        // Issued before the reset, landing after it.
        assert!(!store.apply(update("ltp", json!(1000), 50, poll())));
        assert!(!store.apply(update("ltp", json!(1000), 99, Origin::Push)));
        assert!(store.snapshot().is_empty());

        assert!(store.apply(update("ltp", json!(2000), 100, poll())));
        assert_eq!(
            store.snapshot().value(&FieldPath::new("market:NIFTY", "ltp")),
            Some(&json!(2000))
        );

        // An earlier reset stamp never reopens the window.
        store.reset(at(20));
        assert_eq!(store.view().reset_at, Some(at(100)));
    }

    #[test]
    fn test_reset_keeps_registrations_and_connection() {
        let store = StateStore::default();
        store.register_source(SourceHealth::new("market", 2000));
        store.set_connection_state(ConnectionState::Connected);
        store.apply(update("ltp", json!(1), 1, Origin::Push));
        store.batch(|txn| txn.record_poll_failure("market", at(5), "boom".into(), 2));
        store.push_alert(
            NewAlert {
                kind: "risk_alert".into(),
                severity: Severity::Critical,
                message: "x".into(),
            },
            at(1),
        );

        store.reset(at(10));
        let view = store.view();
        assert!(view.snapshot.is_empty());
        assert!(view.alerts.is_empty());
        assert_eq!(view.connection, ConnectionState::Connected);
        let market = &view.sources["market"];
        assert_eq!(market.interval_ms, 2000);
        assert_eq!(market.consecutive_failures, 0);
        assert!(market.last_error.is_none());

        // The previous session's data does not come back.
        assert!(!store.apply(update("ltp", json!(0), 0, poll())));
        assert!(store.apply(update("ltp", json!(2), 10, poll())));
    }
}
