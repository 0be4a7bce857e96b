//! Connection tracker: one shared record per remote session key.
//!
//! Blocks that need a remote session (`ssh_connect` and anything layered on
//! it) `acquire` the session's key and `release` it when done. The tracker
//! never opens anything itself; the transport collaborator owns the real
//! session and reports progress through [`ConnectionTracker::set_status`].
//!
//! ```text
//! ConnectionTracker
//!     │
//!     ├── "deploy@web-1" ──► record #3  Connected  refs=2
//!     ├── "root@db"      ──► record #4  Error      refs=1
//!     └── "ops@bastion"  ──► record #1  Idle       refs=0  (grace window)
//! ```
//!
//! When the reference count returns to zero the record is kept for a grace
//! window so a follow-up block in the same run can pick it up again. After
//! that it is torn down: status goes to `Closed`, subscribers are told, and
//! the record is dropped. Records are identified by a monotonic [`RecordId`],
//! so a fresh record for a reused key is distinguishable from the old one.
//!
//! `release` takes the record handed out by `acquire`. A holder of a record
//! that was closed and replaced releases against the retired record, never
//! against its replacement.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default teardown grace window.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(2000);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("connection {key}: invalid transition {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },

    #[error("connection {0} released more times than acquired")]
    NotHeld(String),
}

/// Lifecycle of a tracked session.
///
/// `Idle → Connecting → Connected → {Error, Closed}`, with `Error → Connecting`
/// on retry. `Closed` is terminal for the record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
    Closed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Closed => "closed",
        }
    }

    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Idle, Connecting | Closed)
                | (Connecting, Connected | Error | Closed)
                | (Connected, Error | Closed)
                | (Error, Connecting | Closed)
        )
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arena id of one record. A key that is torn down and acquired again gets a
/// new id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of a record at the time of the call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub key: String,
    pub id: RecordId,
    pub status: ConnectionStatus,
    pub ref_count: usize,
}

/// Passed to subscribers on every status change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub key: String,
    pub record: RecordId,
    pub status: ConnectionStatus,
    pub previous: ConnectionStatus,
}

type Callback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

struct Entry {
    id: RecordId,
    status: ConnectionStatus,
    ref_count: usize,
    /// Set when `ref_count` hit zero; cleared on re-acquire.
    idle_since: Option<Instant>,
}

impl Entry {
    fn snapshot(&self, key: &str) -> ConnectionRecord {
        ConnectionRecord {
            key: key.to_string(),
            id: self.id,
            status: self.status,
            ref_count: self.ref_count,
        }
    }
}

#[derive(Default)]
struct Records {
    live: HashMap<String, Entry>,
    /// Replaced `Closed` records that still have holders.
    retired: HashMap<RecordId, usize>,
}

impl Records {
    fn release_retired(&mut self, key: &str, id: RecordId) -> Result<ConnectionRecord, TrackerError> {
        let MapEntry::Occupied(mut slot) = self.retired.entry(id) else {
            return Err(TrackerError::UnknownConnection(key.to_string()));
        };
        *slot.get_mut() -= 1;
        let ref_count = *slot.get();
        if ref_count == 0 {
            slot.remove();
        }
        Ok(ConnectionRecord {
            key: key.to_string(),
            id,
            status: ConnectionStatus::Closed,
            ref_count,
        })
    }
}

#[derive(Default)]
struct Subscribers {
    by_key: HashMap<String, Vec<(u64, Callback)>>,
    any: Vec<(u64, Callback)>,
}

struct Inner {
    records: Mutex<Records>,
    subscribers: Mutex<Subscribers>,
    next_record: AtomicU64,
    next_subscriber: AtomicU64,
    grace: Duration,
}

/// Shared-session registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<Inner>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

impl ConnectionTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(Records::default()),
                subscribers: Mutex::new(Subscribers::default()),
                next_record: AtomicU64::new(1),
                next_subscriber: AtomicU64::new(1),
                grace,
            }),
        }
    }

    pub fn grace(&self) -> Duration {
        self.inner.grace
    }

    /// Take a reference to `key`, creating an `Idle` record if none is live.
    ///
    /// A `Closed` record is replaced by a fresh one. A record waiting out its
    /// grace window is revived.
    pub fn acquire(&self, key: &str) -> ConnectionRecord {
        let fresh = || {
            let id = RecordId(self.inner.next_record.fetch_add(1, Ordering::Relaxed));
            debug!(key, record = %id, "connection record created");
            Entry {
                id,
                status: ConnectionStatus::Idle,
                ref_count: 0,
                idle_since: None,
            }
        };

        let mut guard = self.inner.records.lock();
        let records = &mut *guard;
        let entry = match records.live.entry(key.to_string()) {
            MapEntry::Occupied(slot) if slot.get().status != ConnectionStatus::Closed => slot.into_mut(),
            MapEntry::Occupied(mut slot) => {
                let old = slot.insert(fresh());
                if old.ref_count > 0 {
                    records.retired.insert(old.id, old.ref_count);
                }
                slot.into_mut()
            }
            MapEntry::Vacant(slot) => slot.insert(fresh()),
        };
        entry.ref_count += 1;
        entry.idle_since = None;
        entry.snapshot(key)
    }

    /// Drop a reference taken by [`acquire`](Self::acquire).
    ///
    /// The reference is returned to the record it was taken against. At zero
    /// the record is scheduled for teardown after the grace window.
    pub fn release(&self, record: &ConnectionRecord) -> Result<ConnectionRecord, TrackerError> {
        let key = record.key.as_str();
        let snapshot = {
            let mut records = self.inner.records.lock();
            if !records.live.get(key).is_some_and(|e| e.id == record.id) {
                return records.release_retired(key, record.id);
            }
            let Some(entry) = records.live.get_mut(key) else {
                return Err(TrackerError::UnknownConnection(key.to_string()));
            };
            if entry.ref_count == 0 {
                return Err(TrackerError::NotHeld(key.to_string()));
            }
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                entry.idle_since = Some(Instant::now());
            }
            entry.snapshot(key)
        };

        if snapshot.ref_count == 0 {
            self.schedule_teardown(key);
        }
        Ok(snapshot)
    }

    fn schedule_teardown(&self, key: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(key, "no runtime for teardown timer; waiting for reap_expired");
            return;
        };
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let grace = self.inner.grace;
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                ConnectionTracker { inner }.reap_expired();
            }
        });
    }

    /// Tear down every unreferenced record whose grace window has elapsed.
    ///
    /// Returns the keys torn down.
    pub fn reap_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let grace = self.inner.grace;

        let mut expired = Vec::new();
        {
            let mut records = self.inner.records.lock();
            for (key, entry) in records.live.iter_mut() {
                let due = entry.ref_count == 0
                    && entry.idle_since.is_some_and(|since| now.duration_since(since) >= grace);
                if due {
                    let previous = entry.status;
                    entry.status = ConnectionStatus::Closed;
                    expired.push((key.clone(), entry.id, previous));
                }
            }
        }

        let mut torn_down = Vec::with_capacity(expired.len());
        for (key, id, previous) in expired {
            if previous != ConnectionStatus::Closed {
                self.notify(&ConnectionEvent {
                    key: key.clone(),
                    record: id,
                    status: ConnectionStatus::Closed,
                    previous,
                });
            }

            let mut records = self.inner.records.lock();
            if records.live.get(&key).is_some_and(|e| e.id == id) {
                records.live.remove(&key);
                info!(key = %key, record = %id, "connection torn down");
                torn_down.push(key);
            }
        }
        torn_down
    }

    /// Report a transport-level status change for `key`.
    ///
    /// Setting the current status again is a no-op. Subscribers for `key` are
    /// notified first, then `subscribe_any` subscribers, each in registration
    /// order.
    pub fn set_status(&self, key: &str, status: ConnectionStatus) -> Result<(), TrackerError> {
        let event = {
            let mut records = self.inner.records.lock();
            let entry = records
                .live
                .get_mut(key)
                .ok_or_else(|| TrackerError::UnknownConnection(key.to_string()))?;
            let previous = entry.status;
            if previous == status {
                return Ok(());
            }
            if !previous.can_transition_to(status) {
                warn!(key, from = %previous, to = %status, "rejected connection transition");
                return Err(TrackerError::InvalidTransition {
                    key: key.to_string(),
                    from: previous,
                    to: status,
                });
            }
            entry.status = status;
            ConnectionEvent {
                key: key.to_string(),
                record: entry.id,
                status,
                previous,
            }
        };

        debug!(key, from = %event.previous, to = %status, "connection status");
        self.notify(&event);
        Ok(())
    }

    /// Invoke subscribers outside every lock; a panicking callback is logged
    /// and stays registered.
    fn notify(&self, event: &ConnectionEvent) {
        let callbacks: Vec<Callback> = {
            let subs = self.inner.subscribers.lock();
            subs.by_key
                .get(&event.key)
                .into_iter()
                .flatten()
                .chain(subs.any.iter())
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };

        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(key = %event.key, status = %event.status, "connection subscriber panicked");
            }
        }
    }

    /// Watch status changes for one key.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> ConnectionSubscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .by_key
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        ConnectionSubscription {
            inner: Arc::downgrade(&self.inner),
            key: Some(key.to_string()),
            id,
        }
    }

    /// Watch status changes for every key.
    pub fn subscribe_any<F>(&self, callback: F) -> ConnectionSubscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().any.push((id, Arc::new(callback)));
        ConnectionSubscription {
            inner: Arc::downgrade(&self.inner),
            key: None,
            id,
        }
    }

    pub fn get(&self, key: &str) -> Option<ConnectionRecord> {
        self.inner.records.lock().live.get(key).map(|e| e.snapshot(key))
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget all records and subscribers without notifying anyone.
    pub fn reset(&self) {
        let records = std::mem::take(&mut *self.inner.records.lock());
        *self.inner.subscribers.lock() = Subscribers::default();
        debug!(records = records.live.len(), "connection tracker reset");
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("records", &self.len())
            .field("grace", &self.inner.grace)
            .finish()
    }
}

/// Handle returned by [`ConnectionTracker::subscribe`] and
/// [`ConnectionTracker::subscribe_any`].
#[derive(Debug)]
pub struct ConnectionSubscription {
    inner: Weak<Inner>,
    key: Option<String>,
    id: u64,
}

impl ConnectionSubscription {
    /// Idempotent; returns whether this call removed anything.
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut subs = inner.subscribers.lock();
        let list = match &self.key {
            Some(key) => match subs.by_key.get_mut(key) {
                Some(list) => list,
                None => return false,
            },
            None => &mut subs.any,
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        before != list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl Fn(&ConnectionEvent) + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |e| log.lock().push(format!("{tag}:{}:{}", e.key, e.status))
    }

    #[test]
    fn test_acquire_shares_record() {
        let tracker = ConnectionTracker::default();
        let first = tracker.acquire("user@host");
        let second = tracker.acquire("user@host");
        assert_eq!(first.id, second.id);
        assert_eq!(second.ref_count, 2);
        assert_eq!(second.status, ConnectionStatus::Idle);
        assert_eq!(tracker.len(), 1);

        let other = tracker.acquire("root@db");
        assert_ne!(other.id, first.id);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_release_errors() {
        let tracker = ConnectionTracker::default();
        let stranger = ConnectionRecord {
            key: "nobody@nowhere".into(),
            id: RecordId(99),
            status: ConnectionStatus::Idle,
            ref_count: 1,
        };
        assert_eq!(
            tracker.release(&stranger).unwrap_err(),
            TrackerError::UnknownConnection("nobody@nowhere".into())
        );
        let held = tracker.acquire("a@b");
        assert_eq!(tracker.release(&held).unwrap().ref_count, 0);
        assert_eq!(tracker.release(&held).unwrap_err(), TrackerError::NotHeld("a@b".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_after_grace() {
        let tracker = ConnectionTracker::new(Duration::from_millis(500));
        let log = Arc::new(Mutex::new(Vec::new()));
        let _sub = tracker.subscribe_any(recording(&log, "any"));

        let first = tracker.acquire("user@host");
        let second = tracker.acquire("user@host");
        tracker.release(&first).unwrap();
        assert_eq!(tracker.release(&second).unwrap().ref_count, 0);

        // Still inside the grace window.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(tracker.get("user@host").is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(tracker.get("user@host").is_none());
        assert_eq!(*log.lock(), vec!["any:user@host:closed".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_within_grace_keeps_record() {
        let tracker = ConnectionTracker::new(Duration::from_millis(500));
        let first = tracker.acquire("user@host");
        tracker.set_status("user@host", ConnectionStatus::Connecting).unwrap();
        tracker.set_status("user@host", ConnectionStatus::Connected).unwrap();
        tracker.release(&first).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let again = tracker.acquire("user@host");
        assert_eq!(again.id, first.id);
        assert_eq!(again.status, ConnectionStatus::Connected);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tracker.get("user@host").map(|r| r.ref_count), Some(1));
    }

    #[test]
    fn test_reap_without_runtime() {
        let tracker = ConnectionTracker::new(Duration::ZERO);
        let held = tracker.acquire("a@b");
        tracker.release(&held).unwrap();
        assert_eq!(tracker.reap_expired(), vec!["a@b".to_string()]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_state_machine() {
        use ConnectionStatus::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Error));
        assert!(Error.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Closed));
        assert!(!Idle.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        for next in [Idle, Connecting, Connected, Error] {
            assert!(!Closed.can_transition_to(next));
        }
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let tracker = ConnectionTracker::default();
        tracker.acquire("a@b");
        let err = tracker.set_status("a@b", ConnectionStatus::Connected).unwrap_err();
        assert_eq!(
            err,
            TrackerError::InvalidTransition {
                key: "a@b".into(),
                from: ConnectionStatus::Idle,
                to: ConnectionStatus::Connected,
            }
        );
        assert_eq!(tracker.get("a@b").map(|r| r.status), Some(ConnectionStatus::Idle));
    }

    #[test]
    fn test_key_subscribers_before_any() {
        let tracker = ConnectionTracker::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _any = tracker.subscribe_any(recording(&log, "any"));
        let _k1 = tracker.subscribe("a@b", recording(&log, "k1"));
        let _k2 = tracker.subscribe("a@b", recording(&log, "k2"));
        let _other = tracker.subscribe("c@d", recording(&log, "other"));

        tracker.acquire("a@b");
        tracker.set_status("a@b", ConnectionStatus::Connecting).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["k1:a@b:connecting", "k2:a@b:connecting", "any:a@b:connecting"]
        );
    }

    #[test]
    fn test_same_status_is_silent() {
        let tracker = ConnectionTracker::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _any = tracker.subscribe_any(recording(&log, "any"));
        tracker.acquire("a@b");
        tracker.set_status("a@b", ConnectionStatus::Connecting).unwrap();
        tracker.set_status("a@b", ConnectionStatus::Connecting).unwrap();
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let tracker = ConnectionTracker::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _bad = tracker.subscribe("a@b", |_| panic!("subscriber blew up"));
        let _good = tracker.subscribe_any(recording(&log, "any"));

        tracker.acquire("a@b");
        tracker.set_status("a@b", ConnectionStatus::Connecting).unwrap();
        tracker.set_status("a@b", ConnectionStatus::Error).unwrap();
        assert_eq!(*log.lock(), vec!["any:a@b:connecting", "any:a@b:error"]);
    }

    #[test]
    fn test_closed_record_replaced_on_acquire() {
        let tracker = ConnectionTracker::default();
        let first = tracker.acquire("a@b");
        tracker.set_status("a@b", ConnectionStatus::Closed).unwrap();
        assert!(tracker.set_status("a@b", ConnectionStatus::Connecting).is_err());

        let fresh = tracker.acquire("a@b");
        assert_ne!(fresh.id, first.id);
        assert_eq!(fresh.status, ConnectionStatus::Idle);
        assert_eq!(fresh.ref_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_release_does_not_touch_replacement() {
        let tracker = ConnectionTracker::new(Duration::from_millis(100));
        let stale = tracker.acquire("u@h");
        tracker.set_status("u@h", ConnectionStatus::Closed).unwrap();
        let current = tracker.acquire("u@h");
        assert_ne!(current.id, stale.id);

        let released = tracker.release(&stale).unwrap();
        assert_eq!(released.id, stale.id);
        assert_eq!(released.status, ConnectionStatus::Closed);
        assert_eq!(released.ref_count, 0);
        assert_eq!(tracker.get("u@h").map(|r| (r.id, r.ref_count)), Some((current.id, 1)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(tracker.reap_expired().is_empty());
        assert_eq!(tracker.get("u@h").map(|r| r.id), Some(current.id));

        // The retired record is gone once its last holder let go.
        assert_eq!(
            tracker.release(&stale).unwrap_err(),
            TrackerError::UnknownConnection("u@h".into())
        );
        assert_eq!(tracker.release(&current).unwrap().ref_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_shares_one_record() {
        const CALLERS: usize = 32;
        let tracker = ConnectionTracker::default();
        let barrier = Arc::new(tokio::sync::Barrier::new(CALLERS));

        let tasks: Vec<_> = (0..CALLERS)
            .map(|_| {
                let tracker = tracker.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    tracker.acquire("k").id
                })
            })
            .collect();

        let mut ids = std::collections::BTreeSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get("k").map(|r| r.ref_count), Some(CALLERS));
    }

    #[test]
    fn test_unsubscribe() {
        let tracker = ConnectionTracker::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let key_sub = tracker.subscribe("a@b", recording(&log, "key"));
        let any_sub = tracker.subscribe_any(recording(&log, "any"));
        assert!(key_sub.unsubscribe());
        assert!(!key_sub.unsubscribe());
        assert!(any_sub.unsubscribe());

        tracker.acquire("a@b");
        tracker.set_status("a@b", ConnectionStatus::Connecting).unwrap();
        assert!(log.lock().is_empty());
    }
}
