//! Peer synchronization manager
//!
//! Tracks the peer table and decides who to pull a full dump from next. Each
//! peer is `Synced` (eligible), `AwaitingResponse` (one request in flight) or
//! `Backoff` (last attempt failed, retry blocked until its interval elapses).
//! No I/O happens here: the event loop sends the requests this module hands
//! out and reports back what happened.

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use rand::{seq::IndexedRandom, Rng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffConfig, ExponentialBackoff};

/// Network endpoints of a peer store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    /// Command endpoint, used for full-sync requests.
    pub cmd_addr: SocketAddr,
    /// Publication endpoint, subscribed to for pushed deltas.
    pub pub_addr: SocketAddr,
}

impl PeerSpec {
    pub fn new(cmd_addr: SocketAddr, pub_addr: SocketAddr) -> Self {
        Self { cmd_addr, pub_addr }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerSyncState {
    Synced,
    AwaitingResponse,
    Backoff,
}

/// Snapshot of one peer as reported by DUMP_PEERS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub spec: PeerSpec,
    pub state: PeerSyncState,
    pub backoff_ms: u64,
    pub consecutive_failures: u32,
    pub synced_once: bool,
    pub last_sync_latency_ms: Option<u64>,
}

/// A full-sync request the caller must send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub peer: String,
    pub spec: PeerSpec,
    pub request_id: u64,
}

/// What a sync response meant for the peer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Answer to the outstanding request; backoff is reset.
    Completed { latency: Duration },
    /// Answer to a request that already timed out or was superseded.
    Late,
    /// The peer was removed in the meantime.
    UnknownPeer,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    request_id: u64,
    sent_at: Instant,
    deadline: Instant,
}

#[derive(Debug)]
struct PeerEntry {
    spec: PeerSpec,
    backoff: ExponentialBackoff,
    in_flight: Option<InFlight>,
    synced_once: bool,
    last_sync_latency: Option<Duration>,
}

impl PeerEntry {
    fn new(spec: PeerSpec, config: BackoffConfig) -> Self {
        Self {
            spec,
            backoff: ExponentialBackoff::new(config),
            in_flight: None,
            synced_once: false,
            last_sync_latency: None,
        }
    }

    fn is_eligible(&self, now: Instant) -> bool {
        self.in_flight.is_none() && self.backoff.should_retry(now)
    }

    /// Never synced, or the last attempt failed.
    fn needs_sync(&self) -> bool {
        !self.synced_once || self.backoff.consecutive_failures() > 0
    }

    fn state(&self, now: Instant) -> PeerSyncState {
        if self.in_flight.is_some() {
            PeerSyncState::AwaitingResponse
        } else if self.backoff.is_backing_off(now) {
            PeerSyncState::Backoff
        } else {
            PeerSyncState::Synced
        }
    }
}

pub struct PeerSyncManager {
    peers: BTreeMap<String, PeerEntry>,
    backoff_config: BackoffConfig,
    sync_timeout: Duration,
    next_request_id: u64,
}

impl PeerSyncManager {
    pub fn new(backoff_config: BackoffConfig, sync_timeout: Duration) -> Self {
        Self {
            peers: BTreeMap::new(),
            backoff_config,
            sync_timeout,
            next_request_id: 1,
        }
    }

    /// Add or update a peer. Returns false if the peer was already known with
    /// the same endpoints. A changed endpoint restarts the peer from scratch.
    pub fn add_peer(&mut self, name: &str, spec: PeerSpec) -> bool {
        if let Some(existing) = self.peers.get(name) {
            if existing.spec == spec {
                debug!(peer = %name, "Peer already known");
                return false;
            }
            info!(peer = %name, cmd_addr = %spec.cmd_addr, "Updating peer endpoints");
        } else {
            info!(
                peer = %name,
                cmd_addr = %spec.cmd_addr,
                pub_addr = %spec.pub_addr,
                "Adding peer"
            );
        }
        self.peers
            .insert(name.to_string(), PeerEntry::new(spec, self.backoff_config));
        true
    }

    /// Remove a peer. Any in-flight request for it is forgotten.
    pub fn remove_peer(&mut self, name: &str) -> Option<PeerSpec> {
        let removed = self.peers.remove(name).map(|entry| entry.spec);
        if removed.is_some() {
            info!(peer = %name, "Removed peer");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<PeerSpec> {
        self.peers.get(name).map(|entry| entry.spec)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Choose one eligible peer for the periodic tick, mark it
    /// `AwaitingResponse` and return the request to send. Peers that still
    /// need a sync are preferred over peers that have already completed one.
    pub fn pick_sync_candidate<R: Rng>(&mut self, now: Instant, rng: &mut R) -> Option<SyncRequest> {
        self.pick(now, rng, true)
    }

    /// Like [`pick_sync_candidate`](Self::pick_sync_candidate), restricted to
    /// peers that still need a sync. Used between periodic ticks.
    pub fn pick_unsynced_candidate<R: Rng>(
        &mut self,
        now: Instant,
        rng: &mut R,
    ) -> Option<SyncRequest> {
        self.pick(now, rng, false)
    }

    fn pick<R: Rng>(&mut self, now: Instant, rng: &mut R, allow_synced: bool) -> Option<SyncRequest> {
        let eligible: Vec<&String> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.is_eligible(now))
            .map(|(name, _)| name)
            .collect();
        let preferred: Vec<&String> = eligible
            .iter()
            .copied()
            .filter(|name| self.peers.get(*name).is_some_and(PeerEntry::needs_sync))
            .collect();

        let pool = if preferred.is_empty() && allow_synced {
            &eligible
        } else {
            &preferred
        };
        let name = (*pool.choose(rng)?).clone();

        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        let entry = self.peers.get_mut(&name)?;
        entry.in_flight = Some(InFlight {
            request_id,
            sent_at: now,
            deadline: now + self.sync_timeout,
        });
        debug!(peer = %name, request_id, "Requesting full sync");

        Some(SyncRequest {
            peer: name,
            spec: entry.spec,
            request_id,
        })
    }

    /// Record a full-sync response. The key-values should be merged unless
    /// the outcome is `UnknownPeer`.
    pub fn on_sync_response(&mut self, name: &str, request_id: u64, now: Instant) -> SyncOutcome {
        let Some(entry) = self.peers.get_mut(name) else {
            debug!(peer = %name, request_id, "Dropping sync response from removed peer");
            return SyncOutcome::UnknownPeer;
        };

        match entry.in_flight {
            Some(in_flight) if in_flight.request_id == request_id => {
                let latency = now.saturating_duration_since(in_flight.sent_at);
                entry.in_flight = None;
                entry.backoff.on_success();
                entry.synced_once = true;
                entry.last_sync_latency = Some(latency);
                info!(
                    peer = %name,
                    latency_ms = latency.as_millis() as u64,
                    "Full sync completed"
                );
                SyncOutcome::Completed { latency }
            }
            _ => {
                debug!(peer = %name, request_id, "Late sync response");
                SyncOutcome::Late
            }
        }
    }

    /// Record a failed request. Returns false when `request_id` is not the
    /// peer's outstanding request (already timed out or peer removed).
    pub fn on_sync_failure(&mut self, name: &str, request_id: u64, now: Instant) -> bool {
        let Some(entry) = self.peers.get_mut(name) else {
            return false;
        };
        if !entry
            .in_flight
            .is_some_and(|in_flight| in_flight.request_id == request_id)
        {
            return false;
        }
        entry.in_flight = None;
        let interval = entry.backoff.on_failure(now);
        warn!(
            peer = %name,
            request_id,
            backoff_ms = interval.as_millis() as u64,
            failures = entry.backoff.consecutive_failures(),
            "Full sync failed, backing off"
        );
        true
    }

    /// Fail every request whose deadline has passed. Returns the affected
    /// peers.
    pub fn expire_timeouts(&mut self, now: Instant) -> Vec<String> {
        let timed_out: Vec<(String, u64)> = self
            .peers
            .iter()
            .filter_map(|(name, entry)| {
                entry
                    .in_flight
                    .filter(|in_flight| in_flight.deadline <= now)
                    .map(|in_flight| (name.clone(), in_flight.request_id))
            })
            .collect();

        timed_out
            .into_iter()
            .filter_map(|(name, request_id)| {
                warn!(peer = %name, request_id, "Full sync request timed out");
                self.on_sync_failure(&name, request_id, now).then_some(name)
            })
            .collect()
    }

    /// Earliest moment the driver has work to do outside its periodic tick:
    /// a request deadline, or a peer that still needs a sync becoming
    /// eligible.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.peers
            .values()
            .filter_map(|entry| match entry.in_flight {
                Some(in_flight) => Some(in_flight.deadline),
                None if entry.needs_sync() => {
                    Some(entry.backoff.retry_at().map_or(now, |at| at.max(now)))
                }
                None => None,
            })
            .min()
    }

    pub fn dump(&self, now: Instant) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|(name, entry)| PeerInfo {
                name: name.clone(),
                spec: entry.spec,
                state: entry.state(now),
                backoff_ms: entry.backoff.current_interval().as_millis() as u64,
                consecutive_failures: entry.backoff.consecutive_failures(),
                synced_once: entry.synced_once,
                last_sync_latency_ms: entry.last_sync_latency.map(|d| d.as_millis() as u64),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn spec(port: u16) -> PeerSpec {
        PeerSpec::new(
            SocketAddr::from(([127, 0, 0, 1], port)),
            SocketAddr::from(([127, 0, 0, 1], port + 1)),
        )
    }

    fn manager() -> PeerSyncManager {
        PeerSyncManager::new(
            BackoffConfig {
                floor: Duration::from_millis(100),
                ceiling: Duration::from_millis(800),
                growth_factor: 2.0,
            },
            Duration::from_secs(1),
        )
    }

    fn state_of(manager: &PeerSyncManager, name: &str, now: Instant) -> PeerSyncState {
        manager
            .dump(now)
            .into_iter()
            .find(|info| info.name == name)
            .map(|info| info.state)
            .unwrap()
    }

    #[test]
    fn test_new_peer_is_immediate_candidate() {
        let mut peers = manager();
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();
        assert!(peers.add_peer("p1", spec(1000)));
        assert!(!peers.add_peer("p1", spec(1000)));
        assert_eq!(peers.next_wakeup(now), Some(now));

        let request = peers.pick_sync_candidate(now, &mut rng).unwrap();
        assert_eq!(request.peer, "p1");
        assert_eq!(request.spec, spec(1000));
        assert_eq!(state_of(&peers, "p1", now), PeerSyncState::AwaitingResponse);
    }

    #[test]
    fn test_awaiting_peer_not_requested_twice() {
        let mut peers = manager();
        let mut rng = StdRng::seed_from_u64(2);
        let now = Instant::now();
        peers.add_peer("p1", spec(1000));
        assert!(peers.pick_sync_candidate(now, &mut rng).is_some());
        assert!(peers.pick_sync_candidate(now, &mut rng).is_none());
        assert_eq!(peers.next_wakeup(now), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_response_completes_sync() {
        let mut peers = manager();
        let mut rng = StdRng::seed_from_u64(3);
        let now = Instant::now();
        peers.add_peer("p1", spec(1000));
        let request = peers.pick_sync_candidate(now, &mut rng).unwrap();

        let later = now + Duration::from_millis(30);
        assert_eq!(
            peers.on_sync_response("p1", request.request_id, later),
            SyncOutcome::Completed {
                latency: Duration::from_millis(30)
            }
        );
        let info = &peers.dump(later)[0];
        assert_eq!(info.state, PeerSyncState::Synced);
        assert!(info.synced_once);
        assert_eq!(info.last_sync_latency_ms, Some(30));
        // Synced peers do not force an early wakeup
        assert_eq!(peers.next_wakeup(later), None);
    }

    #[test]
    fn test_timeout_backs_off_and_late_response_does_not_reset() {
        let mut peers = manager();
        let mut rng = StdRng::seed_from_u64(4);
        let now = Instant::now();
        peers.add_peer("p1", spec(1000));
        let request = peers.pick_sync_candidate(now, &mut rng).unwrap();

        assert!(peers.expire_timeouts(now + Duration::from_millis(999)).is_empty());
        let deadline = now + Duration::from_secs(1);
        assert_eq!(peers.expire_timeouts(deadline), vec!["p1".to_string()]);
        assert_eq!(state_of(&peers, "p1", deadline), PeerSyncState::Backoff);

        let late = peers.on_sync_response("p1", request.request_id, deadline);
        assert_eq!(late, SyncOutcome::Late);
        let info = &peers.dump(deadline)[0];
        assert_eq!(info.consecutive_failures, 1);
        assert!(!info.synced_once);
        assert_eq!(
            peers.next_wakeup(deadline),
            Some(deadline + Duration::from_millis(100))
        );
    }

    #[test]
    fn test_backoff_grows_to_ceiling_and_resets() {
        let mut peers = manager();
        let mut rng = StdRng::seed_from_u64(5);
        let mut now = Instant::now();
        peers.add_peer("p1", spec(1000));

        let mut intervals = Vec::new();
        for _ in 0..6 {
            let request = peers.pick_sync_candidate(now, &mut rng).unwrap();
            assert!(peers.on_sync_failure("p1", request.request_id, now));
            let info = &peers.dump(now)[0];
            intervals.push(info.backoff_ms);
            assert!(peers.pick_sync_candidate(now, &mut rng).is_none());
            now += Duration::from_millis(info.backoff_ms);
        }
        assert_eq!(intervals, vec![100, 200, 400, 800, 800, 800]);

        let request = peers.pick_sync_candidate(now, &mut rng).unwrap();
        peers.on_sync_response("p1", request.request_id, now);
        let info = &peers.dump(now)[0];
        assert_eq!(info.backoff_ms, 100);
        assert_eq!(info.consecutive_failures, 0);
    }

    #[test]
    fn test_stale_failure_ignored() {
        let mut peers = manager();
        let mut rng = StdRng::seed_from_u64(6);
        let now = Instant::now();
        peers.add_peer("p1", spec(1000));
        let request = peers.pick_sync_candidate(now, &mut rng).unwrap();
        assert!(!peers.on_sync_failure("p1", request.request_id + 1, now));
        assert!(!peers.on_sync_failure("p2", request.request_id, now));
        assert_eq!(state_of(&peers, "p1", now), PeerSyncState::AwaitingResponse);
    }

    #[test]
    fn test_removed_peer_response_dropped() {
        let mut peers = manager();
        let mut rng = StdRng::seed_from_u64(7);
        let now = Instant::now();
        peers.add_peer("p1", spec(1000));
        let request = peers.pick_sync_candidate(now, &mut rng).unwrap();
        assert_eq!(peers.remove_peer("p1"), Some(spec(1000)));
        assert_eq!(peers.remove_peer("p1"), None);
        assert_eq!(
            peers.on_sync_response("p1", request.request_id, now),
            SyncOutcome::UnknownPeer
        );
        assert!(peers.expire_timeouts(now + Duration::from_secs(5)).is_empty());
        assert!(peers.is_empty());
    }

    #[test]
    fn test_unsynced_peers_preferred() {
        let mut peers = manager();
        let mut rng = StdRng::seed_from_u64(8);
        let now = Instant::now();
        peers.add_peer("old", spec(1000));
        let request = peers.pick_sync_candidate(now, &mut rng).unwrap();
        peers.on_sync_response("old", request.request_id, now);

        peers.add_peer("new", spec(2000));
        for _ in 0..10 {
            let request = peers.pick_sync_candidate(now, &mut rng).unwrap();
            assert_eq!(request.peer, "new");
            peers.on_sync_response("new", request.request_id, now);
            // Both synced now, reopen "new" by re-adding with new endpoints
            peers.add_peer("new", spec(2000 + 2 * (request.request_id as u16)));
        }
    }

    #[test]
    fn test_synced_peers_remain_periodic_candidates() {
        let mut peers = manager();
        let mut rng = StdRng::seed_from_u64(9);
        let now = Instant::now();
        peers.add_peer("p1", spec(1000));
        let request = peers.pick_sync_candidate(now, &mut rng).unwrap();
        peers.on_sync_response("p1", request.request_id, now);

        let again = peers.pick_sync_candidate(now, &mut rng).unwrap();
        assert_eq!(again.peer, "p1");
        assert!(again.request_id > request.request_id);
    }

    #[test]
    fn test_unsynced_pick_skips_synced_peers() {
        let mut peers = manager();
        let mut rng = StdRng::seed_from_u64(11);
        let now = Instant::now();
        peers.add_peer("p1", spec(1000));
        let request = peers.pick_unsynced_candidate(now, &mut rng).unwrap();
        assert_eq!(request.peer, "p1");
        peers.on_sync_response("p1", request.request_id, now);
        assert!(peers.pick_unsynced_candidate(now, &mut rng).is_none());
        assert!(peers.pick_sync_candidate(now, &mut rng).is_some());
    }

    #[test]
    fn test_updated_endpoints_restart_peer() {
        let mut peers = manager();
        let mut rng = StdRng::seed_from_u64(10);
        let now = Instant::now();
        peers.add_peer("p1", spec(1000));
        let request = peers.pick_sync_candidate(now, &mut rng).unwrap();
        assert!(peers.add_peer("p1", spec(3000)));
        assert_eq!(peers.spec("p1"), Some(spec(3000)));
        assert_eq!(state_of(&peers, "p1", now), PeerSyncState::Synced);
        assert_eq!(
            peers.on_sync_response("p1", request.request_id, now),
            SyncOutcome::Late
        );
    }
}
