//! Per-user sliding windows of reaction samples.
//!
//! The store exclusively owns the windows. Ingress appends under one
//! exclusive lock; the aggregator takes a snapshot (cloned `Arc`s) and
//! computes with the lock released, so a slow tick never stalls ingress.
//! A window survives its connection so that late-arriving samples still
//! count; the user simply ages out of the active set.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::messages::{EventCounts, ReactionFrame, StateFlags};

/// Samples kept per user (one per second at the client cadence).
pub const WINDOW_SIZE: usize = 3;
/// A user is active while their newest sample is at most this old.
pub const ACTIVE_WINDOW_MS: i64 = WINDOW_SIZE as i64 * 1000;

/// One server-stamped reaction sample. Immutable once stored.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Server clock at message ingress; the only time used for windowing.
    pub received_ms: i64,
    /// Client-declared clock, kept for debugging only.
    pub client_ms: Option<i64>,
    pub states: StateFlags,
    pub events: EventCounts,
    pub video_time: Option<f64>,
    pub session_id: Option<String>,
}

impl Sample {
    pub fn from_frame(frame: ReactionFrame, received_ms: i64) -> Self {
        Self {
            received_ms,
            client_ms: frame.timestamp,
            states: frame.states,
            events: frame.events,
            video_time: frame.video_time,
            session_id: frame.session_id,
        }
    }
}

/// A point-in-time view of the active users, keyed by user id. Sample
/// order within each entry is arrival order.
pub type ActiveSnapshot = HashMap<String, Vec<Arc<Sample>>>;

/// One row of the `/debug/aggregation` view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUserOverview {
    pub user_id: String,
    pub sample_count: usize,
    pub last_arrival_ms: i64,
}

struct UserWindow {
    samples: VecDeque<Arc<Sample>>,
    last_arrival_ms: i64,
}

struct UserMeta {
    experiment_group: String,
    created_ms: i64,
}

#[derive(Default)]
struct StoreInner {
    windows: HashMap<String, UserWindow>,
    users: HashMap<String, UserMeta>,
}

/// Registry of per-user windows plus first-seen user metadata.
pub struct ReactionStore {
    inner: Mutex<StoreInner>,
}

impl ReactionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Register a first-seen user. Returns true when the user was new;
    /// repeated calls with the same id leave the original record alone.
    pub fn ensure_user(&self, user_id: &str, experiment_group: &str, now_ms: i64) -> bool {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.users.contains_key(user_id) {
            return false;
        }
        inner.users.insert(
            user_id.to_string(),
            UserMeta {
                experiment_group: experiment_group.to_string(),
                created_ms: now_ms,
            },
        );
        true
    }

    /// The experiment group recorded for a user at first sight.
    pub fn experiment_group(&self, user_id: &str) -> Option<String> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .users
            .get(user_id)
            .map(|meta| meta.experiment_group.clone())
    }

    /// Append one sample to the user's window, evicting the oldest when
    /// the window is full.
    pub fn append(&self, user_id: &str, sample: Arc<Sample>) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let window = inner
            .windows
            .entry(user_id.to_string())
            .or_insert_with(|| UserWindow {
                samples: VecDeque::with_capacity(WINDOW_SIZE),
                last_arrival_ms: 0,
            });
        window.last_arrival_ms = sample.received_ms;
        window.samples.push_back(sample);
        while window.samples.len() > WINDOW_SIZE {
            window.samples.pop_front();
        }
    }

    /// Users with a non-empty window whose newest sample is at most
    /// [`ACTIVE_WINDOW_MS`] old at `now_ms`. The returned samples are
    /// shared references; nothing here blocks ingress once we return.
    pub fn snapshot_active(&self, now_ms: i64) -> ActiveSnapshot {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .windows
            .iter()
            .filter(|(_, w)| {
                !w.samples.is_empty() && now_ms - w.last_arrival_ms <= ACTIVE_WINDOW_MS
            })
            .map(|(user_id, w)| (user_id.clone(), w.samples.iter().cloned().collect()))
            .collect()
    }

    /// Active-set summary for the debug endpoint.
    pub fn active_overview(&self, now_ms: i64) -> Vec<ActiveUserOverview> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut out: Vec<ActiveUserOverview> = inner
            .windows
            .iter()
            .filter(|(_, w)| {
                !w.samples.is_empty() && now_ms - w.last_arrival_ms <= ACTIVE_WINDOW_MS
            })
            .map(|(user_id, w)| ActiveUserOverview {
                user_id: user_id.clone(),
                sample_count: w.samples.len(),
                last_arrival_ms: w.last_arrival_ms,
            })
            .collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        out
    }

    pub fn user_count(&self) -> usize {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.users.len()
    }
}

impl Default for ReactionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ReactionFrame;

    fn sample_at(ms: i64) -> Arc<Sample> {
        Arc::new(Sample::from_frame(ReactionFrame::default(), ms))
    }

    #[test]
    fn window_holds_at_most_three_samples_oldest_evicted() {
        let store = ReactionStore::new();
        for ms in [1000, 2000, 3000, 4000] {
            store.append("u-1", sample_at(ms));
        }
        let snapshot = store.snapshot_active(4000);
        let window = &snapshot["u-1"];
        assert_eq!(window.len(), WINDOW_SIZE);
        let times: Vec<i64> = window.iter().map(|s| s.received_ms).collect();
        assert_eq!(times, vec![2000, 3000, 4000]);
    }

    #[test]
    fn snapshot_preserves_arrival_order() {
        let store = ReactionStore::new();
        store.append("u-1", sample_at(10));
        store.append("u-1", sample_at(20));
        let snapshot = store.snapshot_active(20);
        let times: Vec<i64> = snapshot["u-1"].iter().map(|s| s.received_ms).collect();
        assert_eq!(times, vec![10, 20]);
    }

    #[test]
    fn activity_boundary_is_inclusive_at_3000_ms() {
        let store = ReactionStore::new();
        store.append("u-1", sample_at(1000));
        assert!(store.snapshot_active(4000).contains_key("u-1"));
        assert!(!store.snapshot_active(4001).contains_key("u-1"));
    }

    #[test]
    fn window_survives_but_user_falls_out_of_active_set() {
        let store = ReactionStore::new();
        store.append("u-1", sample_at(1000));
        assert!(store.snapshot_active(5000).is_empty());
        // A late sample brings the same window straight back.
        store.append("u-1", sample_at(6000));
        let snapshot = store.snapshot_active(6000);
        assert_eq!(snapshot["u-1"].len(), 2);
    }

    #[test]
    fn users_with_empty_windows_are_not_active() {
        let store = ReactionStore::new();
        store.ensure_user("u-1", "control2", 0);
        assert!(store.snapshot_active(0).is_empty());
    }

    #[test]
    fn ensure_user_registers_exactly_once() {
        let store = ReactionStore::new();
        assert!(store.ensure_user("u-1", "experiment", 1));
        assert!(!store.ensure_user("u-1", "control1", 2));
        assert_eq!(store.experiment_group("u-1").as_deref(), Some("experiment"));
        assert_eq!(store.user_count(), 1);
    }
}
