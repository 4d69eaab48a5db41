//! Merge engine
//!
//! Deterministic last-writer-wins merge of incoming key-values into the
//! local map. Every key is decided on its own, so a batch can be applied in
//! any order and replaying it is a no-op. Pure: no I/O and no clock.

use std::{cmp::Ordering, collections::HashMap};

use tracing::{debug, warn};

use crate::value::{Publication, Value};

/// Outcome of comparing one incoming value against the local entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Key absent locally.
    Insert,
    /// Incoming wins the `(version, originator, payload)` order.
    Replace,
    /// Same value, higher `ttl_version`: only the TTL changes.
    RefreshTtl,
    /// Tombstone at least as new as the local entry.
    Delete,
    /// Loses the order, or is a duplicate.
    Stale,
    /// Zero TTL or a hash that does not match the content.
    Malformed,
}

/// Result of one merge call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Admitted entries, each carrying the final stored value (or the
    /// tombstone for deletions).
    pub publication: Publication,
    pub inserted: usize,
    pub replaced: usize,
    pub refreshed: usize,
    pub deleted: usize,
    pub rejected: usize,
    pub malformed: usize,
}

impl MergeOutcome {
    pub fn admitted(&self) -> usize {
        self.publication.len()
    }
}

/// Decide what to do with `incoming` given the current local entry.
pub fn decide(current: Option<&Value>, incoming: &Value) -> MergeDecision {
    if !incoming.ttl.is_valid() || !incoming.has_consistent_hash() {
        return MergeDecision::Malformed;
    }

    let Some(current) = current else {
        // Nothing to delete for an unknown key.
        return if incoming.is_tombstone() {
            MergeDecision::Stale
        } else {
            MergeDecision::Insert
        };
    };

    match incoming.cmp_origin(current) {
        Ordering::Greater if incoming.is_tombstone() => MergeDecision::Delete,
        Ordering::Greater => MergeDecision::Replace,
        Ordering::Less => MergeDecision::Stale,
        Ordering::Equal => {
            if incoming.is_tombstone() {
                if incoming.ttl_version >= current.ttl_version {
                    MergeDecision::Delete
                } else {
                    MergeDecision::Stale
                }
            } else if incoming.value == current.value {
                if incoming.ttl_version > current.ttl_version {
                    MergeDecision::RefreshTtl
                } else {
                    MergeDecision::Stale
                }
            } else if incoming.value > current.value {
                // Same envelope, different payload: keep the order total.
                MergeDecision::Replace
            } else {
                MergeDecision::Stale
            }
        }
    }
}

/// Merge `update` into `key_vals` and return what changed.
pub fn merge_key_values<I>(key_vals: &mut HashMap<String, Value>, update: I) -> MergeOutcome
where
    I: IntoIterator<Item = (String, Value)>,
{
    let mut outcome = MergeOutcome::default();

    for (key, mut incoming) in update {
        let decision = decide(key_vals.get(&key), &incoming);
        match decision {
            MergeDecision::Insert | MergeDecision::Replace => {
                if incoming.hash.is_none() {
                    incoming.hash = Some(incoming.content_hash());
                }
                if decision == MergeDecision::Insert {
                    outcome.inserted += 1;
                } else {
                    outcome.replaced += 1;
                }
                key_vals.insert(key.clone(), incoming.clone());
                outcome.publication.insert(key, incoming);
            }
            MergeDecision::RefreshTtl => {
                if let Some(current) = key_vals.get_mut(&key) {
                    current.ttl = incoming.ttl;
                    current.ttl_version = incoming.ttl_version;
                    outcome.refreshed += 1;
                    outcome.publication.insert(key, current.clone());
                }
            }
            MergeDecision::Delete => {
                if incoming.hash.is_none() {
                    incoming.hash = Some(incoming.content_hash());
                }
                key_vals.remove(&key);
                outcome.deleted += 1;
                outcome.publication.insert(key, incoming);
            }
            MergeDecision::Stale => {
                outcome.rejected += 1;
            }
            MergeDecision::Malformed => {
                warn!(
                    key = %key,
                    version = incoming.version,
                    originator = %incoming.originator_id,
                    "Skipping malformed value (invalid ttl or hash mismatch)"
                );
                outcome.malformed += 1;
            }
        }
    }

    if !outcome.publication.is_empty() {
        debug!(
            admitted = outcome.admitted(),
            rejected = outcome.rejected,
            malformed = outcome.malformed,
            "Merged key-values"
        );
    }

    outcome
}
