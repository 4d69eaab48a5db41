//! KvStore event loop
//!
//! One `select!` loop owns [`KvStoreState`] and processes a single event to
//! completion before looking at the next one: client commands, peer
//! publications, full-sync responses and the TTL, sync, monitor and
//! heartbeat timers. Network tasks only talk to it through channels.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use metrics::gauge;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{interval, interval_at, Instant, MissedTickBehavior},
};
use tracing as log;
use tracing::instrument;

use crate::{
    backoff::add_jitter,
    config::KvStoreConfig,
    error::{KvStoreError, Result},
    peers::{PeerSpec, PeerSyncManager, SyncOutcome, SyncRequest},
    protocol::{Request, Response},
    state::{KvStoreState, UpdateSource},
    transport,
    value::Publication,
    watchdog::LivenessMonitor,
};

/// A request plus the channel its response goes back on.
#[derive(Debug)]
pub struct Command {
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

/// Send `request` to the loop and wait for its response.
pub(crate) async fn submit(commands: &mpsc::Sender<Command>, request: Request) -> Result<Response> {
    let (reply, response) = oneshot::channel();
    commands
        .send(Command { request, reply })
        .await
        .map_err(|_| KvStoreError::Shutdown)?;
    response.await.map_err(|_| KvStoreError::Shutdown)
}

/// Input produced by the per-peer network tasks.
#[derive(Debug)]
pub enum LoopEvent {
    PeerPublication {
        peer: String,
        publication: Publication,
    },
    SyncResponse {
        peer: String,
        request_id: u64,
        result: std::result::Result<Publication, String>,
    },
}

pub(crate) struct EventLoop {
    state: KvStoreState,
    config: KvStoreConfig,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<LoopEvent>,
    event_tx: mpsc::Sender<LoopEvent>,
    publications: broadcast::Sender<Publication>,
    monitor: Arc<dyn LivenessMonitor>,
    rng: StdRng,
    next_periodic_sync: Instant,
    // Track per-peer subscription tasks and in-flight sync requests
    subscriptions: HashMap<String, JoinHandle<()>>,
    sync_tasks: HashMap<u64, JoinHandle<()>>,
}

impl EventLoop {
    pub(crate) fn new(
        config: KvStoreConfig,
        commands: mpsc::Receiver<Command>,
        publications: broadcast::Sender<Publication>,
        monitor: Arc<dyn LivenessMonitor>,
    ) -> Self {
        let peers = PeerSyncManager::new(config.backoff_config(), config.sync_timeout);
        let state = KvStoreState::new(
            config.node_id.clone(),
            peers,
            config.counter_key_markers.clone(),
        );
        let (event_tx, events) = mpsc::channel(config.publication_queue_size);
        Self {
            state,
            commands,
            events,
            event_tx,
            publications,
            monitor,
            rng: StdRng::from_os_rng(),
            next_periodic_sync: Instant::now() + config.db_sync_interval,
            subscriptions: HashMap::new(),
            sync_tasks: HashMap::new(),
            config,
        }
    }

    #[instrument(fields(node = %self.config.node_id), skip_all)]
    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let loop_name = format!("kvstore:{}", self.config.node_id);
        self.monitor.register_loop(&loop_name);
        log::info!("KvStore event loop started");

        let initial_peers = std::mem::take(&mut self.config.peers);
        if !initial_peers.is_empty() {
            self.add_peers(initial_peers);
        }
        self.next_periodic_sync = Instant::now() + self.jittered_sync_interval();

        let monitor_period = self.config.monitor_submit_interval;
        let mut monitor_timer = interval_at(Instant::now() + monitor_period, monitor_period);
        monitor_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_timer = interval(self.config.heartbeat_interval);
        heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.monitor.heartbeat(&loop_name);

            let now = Instant::now();
            let ttl_deadline = self.state.next_ttl_expiry();
            let sync_deadline = self.next_sync_deadline(now);

            tokio::select! {
                _ = shutdown.changed() => {
                    log::info!("KvStore event loop shutting down");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        log::info!("All command senders dropped, stopping");
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = sleep_until_opt(ttl_deadline) => self.on_ttl_expiry(),
                _ = tokio::time::sleep_until(sync_deadline) => self.on_sync_timer(),
                _ = monitor_timer.tick() => self.submit_counters(),
                _ = heartbeat_timer.tick() => {}
            }
        }

        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
        for (_, task) in self.sync_tasks.drain() {
            task.abort();
        }
        self.monitor.deregister_loop(&loop_name);
        log::info!("KvStore event loop stopped");
    }

    fn jittered_sync_interval(&mut self) -> std::time::Duration {
        add_jitter(
            self.config.db_sync_interval,
            self.config.sync_jitter_pct,
            &mut self.rng,
        )
    }

    fn next_sync_deadline(&self, now: Instant) -> Instant {
        match self.state.peers().next_wakeup(now) {
            Some(wakeup) => wakeup.min(self.next_periodic_sync),
            None => self.next_periodic_sync,
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        let Command { request, reply } = command;
        let name = request.name();
        self.state.record_command(name);
        log::trace!(command = name, "Processing command");

        let response = self.dispatch(request);
        if reply.send(response).is_err() {
            log::debug!(command = name, "Caller went away before the reply");
        }
    }

    fn dispatch(&mut self, request: Request) -> Response {
        let now = Instant::now();
        match request {
            Request::Get { keys } => Response::KeyVals(self.state.get_key_vals(&keys, now)),
            Request::Set { key_vals } => {
                let admitted = self.state.merge_publication(
                    UpdateSource::LocalSet,
                    Publication::from_key_vals(key_vals),
                    now,
                );
                self.publish(&admitted, now);
                Response::Ack
            }
            Request::DumpAll { prefix } => {
                Response::KeyVals(self.state.dump_all_with_prefix(&prefix, now))
            }
            Request::DumpHash { prefix } => {
                Response::Hashes(self.state.dump_hash_with_prefix(&prefix))
            }
            Request::DumpDifference { hashes } => {
                Response::KeyVals(self.state.dump_difference(&hashes, now))
            }
            Request::AddPeers { peers } => {
                if peers.contains_key(self.state.node_id()) {
                    return Response::Error(format!(
                        "cannot add {} as a peer of itself",
                        self.state.node_id()
                    ));
                }
                self.add_peers(peers);
                Response::Ack
            }
            Request::DelPeers { names } => {
                for name in names {
                    self.del_peer(&name);
                }
                Response::Ack
            }
            Request::DumpPeers => Response::Peers(self.state.peers().dump(now)),
            Request::Counters => Response::Counters(self.state.counters()),
            Request::PeerSync { requester } => {
                let dump = self.state.dump_all_with_prefix("", now);
                log::debug!(requester = %requester, keys = dump.len(), "Serving full sync");
                Response::KeyVals(dump)
            }
        }
    }

    fn add_peers(&mut self, peers: BTreeMap<String, PeerSpec>) {
        for (name, spec) in peers {
            if !self.state.peers_mut().add_peer(&name, spec) {
                continue;
            }
            if let Some(previous) = self.subscriptions.remove(&name) {
                previous.abort();
            }
            let task = transport::spawn_peer_subscription(
                name.clone(),
                spec.pub_addr,
                self.event_tx.clone(),
                self.config.backoff_config(),
                self.config.sync_jitter_pct,
            );
            self.subscriptions.insert(name, task);
        }
        gauge!("kvstore_num_peers").set(self.state.peers().len() as f64);
    }

    fn del_peer(&mut self, name: &str) {
        // Unknown peers are a no-op
        if self.state.peers_mut().remove_peer(name).is_none() {
            return;
        }
        if let Some(task) = self.subscriptions.remove(name) {
            task.abort();
        }
        gauge!("kvstore_num_peers").set(self.state.peers().len() as f64);
    }

    // ------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------

    fn handle_event(&mut self, event: LoopEvent) {
        let now = Instant::now();
        match event {
            LoopEvent::PeerPublication { peer, publication } => {
                if !self.state.peers().contains(&peer) {
                    log::debug!(peer = %peer, "Dropping publication from removed peer");
                    return;
                }
                self.state.record_publication_received();
                log::trace!(peer = %peer, keys = publication.len(), "Received peer publication");
                let admitted =
                    self.state
                        .merge_publication(UpdateSource::PeerPublication, publication, now);
                self.publish(&admitted, now);
            }
            LoopEvent::SyncResponse {
                peer,
                request_id,
                result,
            } => {
                self.sync_tasks.remove(&request_id);
                match result {
                    Ok(publication) => self.on_sync_response(&peer, request_id, publication, now),
                    Err(error) => {
                        if self.state.peers_mut().on_sync_failure(&peer, request_id, now) {
                            self.state.record_sync_failure();
                        }
                        log::debug!(peer = %peer, request_id, error = %error, "Full sync request failed");
                    }
                }
            }
        }
    }

    fn on_sync_response(&mut self, peer: &str, request_id: u64, dump: Publication, now: Instant) {
        match self.state.peers_mut().on_sync_response(peer, request_id, now) {
            SyncOutcome::UnknownPeer => return,
            SyncOutcome::Completed { latency } => self.state.record_sync_success(latency),
            SyncOutcome::Late => {
                log::info!(peer = %peer, request_id, "Merging late full sync response");
            }
        }

        let received = dump.len();
        let admitted = self
            .state
            .merge_publication(UpdateSource::FullSync, dump, now);
        log::info!(
            peer = %peer,
            received,
            admitted = admitted.len(),
            "Merged full sync from peer"
        );
        self.publish(&admitted, now);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn on_ttl_expiry(&mut self) {
        let now = Instant::now();
        let expired = self.state.expire_keys(now);
        self.publish(&expired, now);
    }

    fn on_sync_timer(&mut self) {
        let now = Instant::now();
        for peer in self.state.peers_mut().expire_timeouts(now) {
            log::debug!(peer = %peer, "Full sync timed out");
            self.state.record_sync_failure();
        }

        let request = if now >= self.next_periodic_sync {
            self.next_periodic_sync = now + self.jittered_sync_interval();
            self.state.peers_mut().pick_sync_candidate(now, &mut self.rng)
        } else {
            self.state
                .peers_mut()
                .pick_unsynced_candidate(now, &mut self.rng)
        };

        if let Some(request) = request {
            self.start_sync(request);
        }
    }

    fn start_sync(&mut self, request: SyncRequest) {
        let request_id = request.request_id;
        // The transport waits past the loop's own deadline so that a late
        // answer can still be merged.
        let task = transport::spawn_sync_request(
            request,
            self.config.node_id.clone(),
            self.config.sync_timeout * 2,
            self.event_tx.clone(),
        );
        self.sync_tasks.insert(request_id, task);
    }

    fn submit_counters(&mut self) {
        self.subscriptions.retain(|peer, task| {
            if task.is_finished() {
                log::warn!(peer = %peer, "Peer subscription task exited");
                false
            } else {
                true
            }
        });
        self.sync_tasks.retain(|_, task| !task.is_finished());

        let counters = self.state.counters();
        gauge!("kvstore_num_keys").set(counters.num_keys as f64);
        gauge!("kvstore_num_peers").set(counters.num_peers as f64);
        for (marker, count) in &counters.marker_key_counts {
            gauge!("kvstore_marker_keys", "marker" => marker.clone()).set(*count as f64);
        }
        log::info!(
            keys = counters.num_keys,
            peers = counters.num_peers,
            admitted = counters.updates_admitted,
            rejected = counters.updates_rejected,
            expired = counters.keys_expired,
            sync_success = counters.full_sync_success,
            sync_failure = counters.full_sync_failure,
            markers = ?counters.marker_key_counts,
            "KvStore counters"
        );
    }

    /// Fan an admitted delta out to every subscriber.
    fn publish(&self, delta: &Publication, now: Instant) {
        if delta.is_empty() {
            return;
        }
        let outgoing = self.state.export_publication(delta, now);
        match self.publications.send(outgoing) {
            Ok(receivers) => log::trace!(keys = delta.len(), receivers, "Published delta"),
            Err(_) => log::trace!(keys = delta.len(), "No publication subscribers"),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
