//! Sliding-window nonce cache backing replay rejection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// How long a nonce stays poisoned after first use.
pub const REPLAY_WINDOW_SECONDS: i64 = 300;

/// Upper bound on remembered nonces per signing key. When the bound is hit
/// the oldest entries are evicted early, so a nonce can become acceptable
/// again before the window elapses under extreme request rates; the window
/// is a ceiling, the capacity a floor.
pub const PER_KEY_CAPACITY: usize = 8192;

struct KeyWindow {
    order: VecDeque<(DateTime<Utc>, String)>,
    seen: HashSet<String>,
}

impl KeyWindow {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn evict(&mut self, now: DateTime<Utc>, window: Duration, capacity: usize) {
        while let Some((seen_at, _)) = self.order.front() {
            if now.signed_duration_since(*seen_at) > window || self.order.len() > capacity {
                let (_, nonce) = self.order.pop_front().expect("front checked");
                self.seen.remove(&nonce);
            } else {
                break;
            }
        }
    }
}

/// Bounded per-key LRU of recently seen nonces.
pub struct NonceWindow {
    window: Duration,
    capacity: usize,
    keys: Mutex<HashMap<String, KeyWindow>>,
}

impl Default for NonceWindow {
    fn default() -> Self {
        Self::new(REPLAY_WINDOW_SECONDS, PER_KEY_CAPACITY)
    }
}

impl NonceWindow {
    pub fn new(window_seconds: i64, capacity: usize) -> Self {
        Self {
            window: Duration::seconds(window_seconds),
            capacity,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Record `nonce` for `key_id`. Returns `true` if the nonce is fresh,
    /// `false` if it was already seen inside the window (a replay).
    pub fn observe(&self, key_id: &str, nonce: &str, now: DateTime<Utc>) -> bool {
        let mut keys = self.keys.lock().expect("nonce cache poisoned");
        let entry = keys.entry(key_id.to_string()).or_insert_with(KeyWindow::new);
        entry.evict(now, self.window, self.capacity);
        if entry.seen.contains(nonce) {
            return false;
        }
        entry.seen.insert(nonce.to_string());
        entry.order.push_back((now, nonce.to_string()));
        true
    }

    #[cfg(test)]
    fn len(&self, key_id: &str) -> usize {
        self.keys
            .lock()
            .unwrap()
            .get(key_id)
            .map_or(0, |w| w.order.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_is_fresh_second_is_replay() {
        let cache = NonceWindow::default();
        let now = Utc::now();
        assert!(cache.observe("k1", "n1", now));
        assert!(!cache.observe("k1", "n1", now));
    }

    #[test]
    fn nonces_are_scoped_per_key() {
        let cache = NonceWindow::default();
        let now = Utc::now();
        assert!(cache.observe("k1", "n1", now));
        assert!(cache.observe("k2", "n1", now));
    }

    #[test]
    fn replay_rejected_with_fresh_timestamp_while_cached() {
        let cache = NonceWindow::default();
        let now = Utc::now();
        assert!(cache.observe("k1", "n1", now));
        // Same nonce, later (still in-window) timestamp: still a replay.
        assert!(!cache.observe("k1", "n1", now + Duration::seconds(10)));
    }

    #[test]
    fn nonce_accepted_again_after_window_eviction() {
        let cache = NonceWindow::new(300, 8192);
        let now = Utc::now();
        assert!(cache.observe("k1", "n1", now));
        assert!(cache.observe("k1", "n1", now + Duration::seconds(301)));
    }

    #[test]
    fn capacity_bounds_memory() {
        let cache = NonceWindow::new(300, 4);
        let now = Utc::now();
        for i in 0..20 {
            assert!(cache.observe("k1", &format!("n{i}"), now));
        }
        assert!(cache.len("k1") <= 5);
    }
}
