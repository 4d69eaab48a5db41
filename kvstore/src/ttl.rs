//! TTL countdown queue
//!
//! Expiry schedule ordered by deadline. Superseded entries are never removed
//! eagerly: when popped, an entry is checked against the store and dropped if
//! the key has since moved to another version, payload or TTL generation.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
    time::Duration,
};

use tokio::time::Instant;
use tracing::{debug, info};

use crate::value::{Publication, Value};

/// One scheduled expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlCountdownEntry {
    pub expiry: Instant,
    pub key: String,
    pub version: u64,
    pub originator_id: String,
    pub ttl_version: u64,
    pub hash: u64,
}

impl TtlCountdownEntry {
    /// Whether `current` is still the value this entry was scheduled for.
    fn matches(&self, current: &Value) -> bool {
        current.version == self.version
            && current.ttl_version == self.ttl_version
            && current.originator_id == self.originator_id
            && current.content_hash() == self.hash
    }
}

impl Ord for TtlCountdownEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expiry
            .cmp(&other.expiry)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.ttl_version.cmp(&other.ttl_version))
            .then_with(|| self.originator_id.cmp(&other.originator_id))
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for TtlCountdownEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TtlCountdownQueue {
    queue: BinaryHeap<Reverse<TtlCountdownEntry>>,
    // Deadline of the live generation per key, for remaining-ttl reporting.
    deadlines: HashMap<String, Instant>,
}

impl TtlCountdownQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule expiry of `value` under `key`. Infinite TTLs are not queued.
    pub fn schedule(&mut self, key: &str, value: &Value, now: Instant) -> Option<Instant> {
        let Some(ttl) = value.ttl.as_duration() else {
            self.deadlines.remove(key);
            return None;
        };

        let expiry = now + ttl;
        self.queue.push(Reverse(TtlCountdownEntry {
            expiry,
            key: key.to_string(),
            version: value.version,
            originator_id: value.originator_id.clone(),
            ttl_version: value.ttl_version,
            hash: value.content_hash(),
        }));
        self.deadlines.insert(key.to_string(), expiry);
        Some(expiry)
    }

    /// Drop the deadline of a key deleted by other means. Its queue entries
    /// die lazily.
    pub fn forget(&mut self, key: &str) {
        self.deadlines.remove(key);
    }

    /// Soonest queued deadline, or `None` when nothing is scheduled.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse(entry)| entry.expiry)
    }

    /// Time left for the live generation of `key`; `None` if it never
    /// expires.
    pub fn remaining(&self, key: &str, now: Instant) -> Option<Duration> {
        self.deadlines
            .get(key)
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Pop every entry due at `now`. Live entries purge their key from
    /// `key_vals`; the returned publication holds a tombstone per purged key.
    /// Dead entries at the head are discarded afterwards so that
    /// [`next_expiry`](Self::next_expiry) points at a live deadline.
    pub fn expire(&mut self, key_vals: &mut HashMap<String, Value>, now: Instant) -> Publication {
        let mut expired = Publication::new();

        while let Some(Reverse(head)) = self.queue.peek() {
            let live = key_vals.get(&head.key).is_some_and(|v| head.matches(v));
            if head.expiry > now && live {
                break;
            }

            let Some(Reverse(entry)) = self.queue.pop() else {
                break;
            };
            if !live {
                debug!(key = %entry.key, version = entry.version, "Discarding stale ttl entry");
                continue;
            }

            if let Some(value) = key_vals.remove(&entry.key) {
                info!(
                    event = "KEY_EXPIRE",
                    key = %entry.key,
                    version = value.version,
                    originator = %value.originator_id,
                    ttl_version = value.ttl_version,
                    "Key expired"
                );
                self.deadlines.remove(&entry.key);
                expired.insert(entry.key, value.to_tombstone());
            }
        }

        expired
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
