//! Gossip-replicated key-value store for a link-state routing control plane
//!
//! Every node runs one store holding versioned, opaque values and keeps it
//! converged with its peers:
//! - Last-writer-wins merge ordered by `(version, originator)`
//! - Push gossip of every admitted delta, with periodic full-sync pull as the
//!   anti-entropy backstop
//! - Per-peer exponential backoff with jitter for failed syncs
//! - TTL expiry that deletes a key and gossips the deletion
//!
//! All state is owned by a single event loop; clients reach it through
//! [`KvStoreHandle`] in process or [`KvStoreClient`] over TCP.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod merge;
pub mod peers;
pub mod protocol;
pub mod server;
pub mod state;
mod transport;
pub mod ttl;
pub mod value;
pub mod watchdog;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use client::{KvStoreApi, KvStoreClient, KvStoreHandle};
pub use config::KvStoreConfig;
pub use error::{KvStoreError, Result};
pub use merge::{merge_key_values, MergeDecision, MergeOutcome};
pub use peers::{PeerInfo, PeerSpec, PeerSyncState};
pub use protocol::{Request, Response};
pub use server::{BoundAddrs, KvStore, RunningKvStore};
pub use state::KvStoreCounters;
pub use value::{Publication, Ttl, Value};
pub use watchdog::{HeartbeatRegistry, LivenessMonitor, NoopMonitor};
