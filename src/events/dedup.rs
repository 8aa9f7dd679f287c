//! Consumer-side deduplication window.
//!
//! At-least-once delivery means handlers can see the same message twice.
//! Each subscription records `(message_id, order_id)` pairs it has fully
//! processed and short-circuits repeats with an ack. A pair is recorded
//! only after the handler succeeds, so a nacked delivery is still eligible
//! for redelivery. Entries age out after the configured window.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

pub struct DedupStore {
    seen: DashMap<(Uuid, Option<Uuid>), DateTime<Utc>>,
    window: chrono::Duration,
    last_prune: Mutex<DateTime<Utc>>,
}

impl DedupStore {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            last_prune: Mutex::new(Utc::now()),
        }
    }

    /// Whether this pair was already processed inside the window.
    pub fn is_duplicate(&self, message_id: Uuid, order_id: Option<Uuid>, now: DateTime<Utc>) -> bool {
        self.maybe_prune(now);
        match self.seen.get(&(message_id, order_id)) {
            Some(entry) => now - *entry.value() < self.window,
            None => false,
        }
    }

    /// Marks the pair processed. Call only after the handler succeeded.
    pub fn record(&self, message_id: Uuid, order_id: Option<Uuid>, now: DateTime<Utc>) {
        self.seen.insert((message_id, order_id), now);
    }

    /// Drops entries older than the window. Runs at most once per quarter
    /// window so steady-state checks stay cheap.
    fn maybe_prune(&self, now: DateTime<Utc>) {
        let mut last = match self.last_prune.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if now - *last < self.window / 4 {
            return;
        }
        *last = now;
        drop(last);

        let cutoff = now - self.window;
        self.seen.retain(|_, first_seen| *first_seen >= cutoff);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_pair_is_a_duplicate() {
        let store = DedupStore::new(Duration::from_secs(3600));
        let message_id = Uuid::new_v4();
        let order_id = Some(Uuid::new_v4());
        let now = Utc::now();

        assert!(!store.is_duplicate(message_id, order_id, now));
        store.record(message_id, order_id, now);
        assert!(store.is_duplicate(message_id, order_id, now));
    }

    #[test]
    fn unrecorded_pair_stays_fresh_after_failures() {
        // A handler failure never records, so the redelivery is processed.
        let store = DedupStore::new(Duration::from_secs(3600));
        let message_id = Uuid::new_v4();
        let now = Utc::now();

        assert!(!store.is_duplicate(message_id, None, now));
        assert!(!store.is_duplicate(message_id, None, now));
    }

    #[test]
    fn same_message_id_different_order_is_fresh() {
        let store = DedupStore::new(Duration::from_secs(3600));
        let message_id = Uuid::new_v4();
        let now = Utc::now();

        store.record(message_id, Some(Uuid::new_v4()), now);
        assert!(!store.is_duplicate(message_id, Some(Uuid::new_v4()), now));
    }

    #[test]
    fn duplicate_outside_window_is_fresh_again() {
        let store = DedupStore::new(Duration::from_secs(60));
        let message_id = Uuid::new_v4();
        let now = Utc::now();

        store.record(message_id, None, now);
        assert!(store.is_duplicate(message_id, None, now + chrono::Duration::seconds(30)));
        assert!(!store.is_duplicate(message_id, None, now + chrono::Duration::seconds(90)));
    }

    #[test]
    fn prune_evicts_aged_entries() {
        let store = DedupStore::new(Duration::from_secs(60));
        let now = Utc::now();

        for _ in 0..10 {
            store.record(Uuid::new_v4(), None, now);
        }
        assert_eq!(store.len(), 10);

        // A much later check triggers the prune pass.
        store.is_duplicate(Uuid::new_v4(), None, now + chrono::Duration::seconds(300));
        assert_eq!(store.len(), 0);
    }
}
