//! Replicated value envelope
//!
//! A [`Value`] is the unit of replication: an opaque payload wrapped in the
//! version/originator envelope that orders competing writes, plus the TTL
//! fields that drive expiry. A [`Publication`] is a batch of key-values as
//! exchanged between stores.

use std::{cmp::Ordering, collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

/// Relative lifetime of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ttl {
    Infinite,
    Millis(u64),
}

impl Ttl {
    pub fn from_duration(duration: Duration) -> Self {
        Ttl::Millis(duration.as_millis().min(u64::MAX as u128) as u64)
    }

    /// A finite TTL of zero can never be admitted.
    pub fn is_valid(&self) -> bool {
        !matches!(self, Ttl::Millis(0))
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Ttl::Infinite => None,
            Ttl::Millis(ms) => Some(Duration::from_millis(*ms)),
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Ttl::Infinite)
    }
}

/// Versioned value stored under a key.
///
/// `(version, originator_id)` totally orders competing values for one key.
/// `ttl_version` only matters as a refresh signal for an otherwise unchanged
/// value. A value whose payload is `None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub version: u64,
    pub originator_id: String,
    pub value: Option<Vec<u8>>,
    pub ttl: Ttl,
    pub ttl_version: u64,
    pub hash: Option<u64>,
}

impl Value {
    pub fn new(
        version: u64,
        originator_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        ttl: Ttl,
    ) -> Self {
        let mut value = Self {
            version,
            originator_id: originator_id.into(),
            value: Some(payload.into()),
            ttl,
            ttl_version: 0,
            hash: None,
        };
        value.hash = Some(value.content_hash());
        value
    }

    /// Deletion marker for a key, keeping the envelope of the deleted value.
    pub fn tombstone(version: u64, originator_id: impl Into<String>, ttl_version: u64) -> Self {
        let mut value = Self {
            version,
            originator_id: originator_id.into(),
            value: None,
            ttl: Ttl::Infinite,
            ttl_version,
            hash: None,
        };
        value.hash = Some(value.content_hash());
        value
    }

    pub fn with_ttl_version(mut self, ttl_version: u64) -> Self {
        self.ttl_version = ttl_version;
        self
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Tombstone carrying this value's envelope.
    pub fn to_tombstone(&self) -> Self {
        Self::tombstone(self.version, self.originator_id.clone(), self.ttl_version)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Digest over version, originator and payload. TTL fields are excluded
    /// so a refresh never changes the hash.
    pub fn compute_hash(version: u64, originator_id: &str, payload: Option<&[u8]>) -> u64 {
        let mut hasher = Xxh3::new();
        hasher.update(&version.to_le_bytes());
        hasher.update(&(originator_id.len() as u64).to_le_bytes());
        hasher.update(originator_id.as_bytes());
        match payload {
            Some(bytes) => {
                hasher.update(&[1]);
                hasher.update(bytes);
            }
            None => hasher.update(&[0]),
        }
        hasher.digest()
    }

    pub fn content_hash(&self) -> u64 {
        Self::compute_hash(self.version, &self.originator_id, self.value.as_deref())
    }

    /// False when the carried hash disagrees with the content.
    pub fn has_consistent_hash(&self) -> bool {
        self.hash.map_or(true, |hash| hash == self.content_hash())
    }

    /// Order by version first, originator id second.
    pub fn cmp_origin(&self, other: &Value) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.originator_id.cmp(&other.originator_id))
    }
}

/// Batch of key-values: the result of a merge, a dump, or a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub key_vals: BTreeMap<String, Value>,
}

impl Publication {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_key_vals(key_vals: BTreeMap<String, Value>) -> Self {
        Self { key_vals }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.key_vals.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.key_vals.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.key_vals.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.key_vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.key_vals.keys()
    }
}

impl FromIterator<(String, Value)> for Publication {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            key_vals: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Publication {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.key_vals.into_iter()
    }
}
