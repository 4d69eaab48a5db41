//! Loop-owned store state
//!
//! Everything the event loop mutates lives in [`KvStoreState`]: the key-value
//! map, the TTL schedule, the peer table and the counters. It is owned by the
//! loop and handed by `&mut` to each handler, never shared.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Duration,
};

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    merge::merge_key_values,
    peers::PeerSyncManager,
    ttl::TtlCountdownQueue,
    value::{Publication, Ttl, Value},
};

/// Where a batch of key-values came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    LocalSet,
    PeerPublication,
    FullSync,
}

impl UpdateSource {
    fn as_str(&self) -> &'static str {
        match self {
            UpdateSource::LocalSet => "set",
            UpdateSource::PeerPublication => "publication",
            UpdateSource::FullSync => "full_sync",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStoreCounters {
    pub num_keys: usize,
    pub num_peers: usize,
    pub updates_admitted: u64,
    pub ttl_refreshes: u64,
    pub updates_rejected: u64,
    pub malformed_values: u64,
    pub keys_expired: u64,
    pub full_sync_success: u64,
    pub full_sync_failure: u64,
    pub publications_received: u64,
    pub commands_processed: u64,
    /// Number of keys under each configured prefix marker.
    pub marker_key_counts: BTreeMap<String, usize>,
}

pub struct KvStoreState {
    node_id: String,
    key_vals: HashMap<String, Value>,
    ttl_queue: TtlCountdownQueue,
    peers: PeerSyncManager,
    counters: KvStoreCounters,
    counter_key_markers: Vec<String>,
}

impl KvStoreState {
    pub fn new(node_id: String, peers: PeerSyncManager, counter_key_markers: Vec<String>) -> Self {
        Self {
            node_id,
            key_vals: HashMap::new(),
            ttl_queue: TtlCountdownQueue::new(),
            peers,
            counters: KvStoreCounters::default(),
            counter_key_markers,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn peers(&self) -> &PeerSyncManager {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerSyncManager {
        &mut self.peers
    }

    pub fn len(&self) -> usize {
        self.key_vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty()
    }

    /// Run the merge, schedule expiry of every admitted entry, and return the
    /// admitted delta. Scheduling always happens before the caller gets a
    /// chance to publish.
    pub fn merge_publication(
        &mut self,
        source: UpdateSource,
        publication: Publication,
        now: Instant,
    ) -> Publication {
        let outcome = merge_key_values(&mut self.key_vals, publication);

        for (key, value) in &outcome.publication.key_vals {
            if value.is_tombstone() {
                self.ttl_queue.forget(key);
            } else {
                self.ttl_queue.schedule(key, value, now);
            }
        }

        let admitted = (outcome.inserted + outcome.replaced + outcome.deleted) as u64;
        self.counters.updates_admitted += admitted;
        self.counters.ttl_refreshes += outcome.refreshed as u64;
        self.counters.updates_rejected += outcome.rejected as u64;
        self.counters.malformed_values += outcome.malformed as u64;

        let source = source.as_str();
        counter!("kvstore_updates_admitted_total", "source" => source).increment(admitted);
        counter!("kvstore_ttl_refreshes_total", "source" => source)
            .increment(outcome.refreshed as u64);
        counter!("kvstore_updates_rejected_total", "source" => source)
            .increment(outcome.rejected as u64);
        if outcome.malformed > 0 {
            counter!("kvstore_malformed_values_total", "source" => source)
                .increment(outcome.malformed as u64);
        }
        gauge!("kvstore_num_keys").set(self.key_vals.len() as f64);

        outcome.publication
    }

    /// Purge every key whose TTL has run out and return the deletions.
    pub fn expire_keys(&mut self, now: Instant) -> Publication {
        let expired = self.ttl_queue.expire(&mut self.key_vals, now);
        if !expired.is_empty() {
            self.counters.keys_expired += expired.len() as u64;
            counter!("kvstore_keys_expired_total").increment(expired.len() as u64);
            gauge!("kvstore_num_keys").set(self.key_vals.len() as f64);
        }
        expired
    }

    pub fn next_ttl_expiry(&self) -> Option<Instant> {
        self.ttl_queue.next_expiry()
    }

    /// Copy of a stored value as it should leave this node: a finite TTL is
    /// replaced by the time left, floored at one millisecond.
    fn export(&self, key: &str, value: &Value, now: Instant) -> Value {
        let mut exported = value.clone();
        if !value.ttl.is_infinite() {
            if let Some(remaining) = self.ttl_queue.remaining(key, now) {
                exported.ttl = Ttl::Millis((remaining.as_millis() as u64).max(1));
            }
        }
        exported
    }

    /// Rewrite the TTLs of an outgoing publication to the time left.
    pub fn export_publication(&self, publication: &Publication, now: Instant) -> Publication {
        publication
            .key_vals
            .iter()
            .map(|(key, value)| (key.clone(), self.export(key, value, now)))
            .collect()
    }

    pub fn get_key_vals(&self, keys: &BTreeSet<String>, now: Instant) -> Publication {
        keys.iter()
            .filter_map(|key| {
                self.key_vals
                    .get(key)
                    .map(|value| (key.clone(), self.export(key, value, now)))
            })
            .collect()
    }

    pub fn dump_all_with_prefix(&self, prefix: &str, now: Instant) -> Publication {
        self.key_vals
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), self.export(key, value, now)))
            .collect()
    }

    pub fn dump_hash_with_prefix(&self, prefix: &str) -> BTreeMap<String, u64> {
        self.key_vals
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| {
                (
                    key.clone(),
                    value.hash.unwrap_or_else(|| value.content_hash()),
                )
            })
            .collect()
    }

    /// Local entries the caller is missing or holds a different version of.
    pub fn dump_difference(&self, hashes: &BTreeMap<String, u64>, now: Instant) -> Publication {
        let difference: Publication = self
            .key_vals
            .iter()
            .filter(|(key, value)| {
                let local = value.hash.unwrap_or_else(|| value.content_hash());
                hashes.get(*key) != Some(&local)
            })
            .map(|(key, value)| (key.clone(), self.export(key, value, now)))
            .collect();
        debug!(
            requested = hashes.len(),
            differing = difference.len(),
            "Computed dump difference"
        );
        difference
    }

    pub fn record_command(&mut self, name: &'static str) {
        self.counters.commands_processed += 1;
        counter!("kvstore_commands_total", "command" => name).increment(1);
    }

    pub fn record_publication_received(&mut self) {
        self.counters.publications_received += 1;
        counter!("kvstore_publications_received_total").increment(1);
    }

    pub fn record_sync_success(&mut self, latency: Duration) {
        self.counters.full_sync_success += 1;
        counter!("kvstore_full_sync_total", "result" => "success").increment(1);
        histogram!("kvstore_full_sync_latency_seconds").record(latency.as_secs_f64());
    }

    pub fn record_sync_failure(&mut self) {
        self.counters.full_sync_failure += 1;
        counter!("kvstore_full_sync_total", "result" => "failure").increment(1);
    }

    pub fn counters(&self) -> KvStoreCounters {
        let mut snapshot = self.counters.clone();
        snapshot.num_keys = self.key_vals.len();
        snapshot.num_peers = self.peers.len();
        snapshot.marker_key_counts = self
            .counter_key_markers
            .iter()
            .map(|marker| {
                let count = self
                    .key_vals
                    .keys()
                    .filter(|key| key.starts_with(marker.as_str()))
                    .count();
                (marker.clone(), count)
            })
            .collect();
        snapshot
    }
}
