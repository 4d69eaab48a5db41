//! Network tasks around the event loop.
//!
//! Listeners accept command and publication connections, per-peer tasks keep
//! a subscription to each peer's publication endpoint, and one short-lived
//! task carries each full-sync request. None of them touch store state: they
//! exchange [`Command`]s, [`LoopEvent`]s and [`Publication`]s with the loop.

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use futures::StreamExt;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, broadcast::error::RecvError, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing as log;
use tracing::{info_span, Instrument};

use crate::{
    backoff::{add_jitter, BackoffConfig, ExponentialBackoff},
    client::{KvStoreApi, KvStoreClient},
    error::KvStoreError,
    event_loop::{submit, Command, LoopEvent},
    peers::SyncRequest,
    protocol::{self, Request, Response},
    value::Publication,
};

// ============================================================================
// Command endpoint
// ============================================================================

/// Accept command connections until shutdown.
pub(crate) async fn serve_commands(
    listener: TcpListener,
    endpoint: &'static str,
    commands: mpsc::Sender<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!(endpoint, addr = ?listener.local_addr().ok(), "Command listener started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let commands = commands.clone();
                    let shutdown = shutdown.clone();
                    let span = info_span!("command_conn", endpoint, %remote);
                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_command_connection(stream, commands, shutdown).await {
                                log::debug!(error = %e, "Command connection closed with error");
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => log::warn!(endpoint, error = %e, "Failed to accept command connection"),
            },
        }
    }
    log::info!(endpoint, "Command listener stopped");
}

async fn handle_command_connection(
    stream: TcpStream,
    commands: mpsc::Sender<Command>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut conn = protocol::framed(stream);
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            frame = conn.next() => match frame {
                Some(frame) => frame.context("failed to read command frame")?,
                None => return Ok(()),
            },
        };

        let response = match protocol::decode::<Request>(&frame) {
            Ok(request) => submit(&commands, request).await?,
            Err(e) => {
                log::warn!(error = %e, len = frame.len(), "Rejecting malformed request");
                Response::Error(format!("malformed request: {}", e))
            }
        };
        protocol::send(&mut conn, &response)
            .await
            .context("failed to write response")?;
    }
}

// ============================================================================
// Publication endpoint
// ============================================================================

/// Accept subscribers and stream every published delta to them.
pub(crate) async fn serve_publications(
    listener: TcpListener,
    endpoint: &'static str,
    publications: broadcast::Sender<Publication>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!(endpoint, addr = ?listener.local_addr().ok(), "Publication listener started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    // Subscribe before spawning so nothing published after
                    // accept is missed.
                    let updates = publications.subscribe();
                    let shutdown = shutdown.clone();
                    let span = info_span!("subscriber", endpoint, %remote);
                    tokio::spawn(
                        async move {
                            log::debug!("Subscriber connected");
                            if let Err(e) = stream_publications(stream, updates, shutdown).await {
                                log::debug!(error = %e, "Subscriber dropped");
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => log::warn!(endpoint, error = %e, "Failed to accept subscriber"),
            },
        }
    }
    log::info!(endpoint, "Publication listener stopped");
}

async fn stream_publications(
    stream: TcpStream,
    mut updates: broadcast::Receiver<Publication>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut conn = protocol::framed(stream);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            update = updates.recv() => match update {
                Ok(publication) => protocol::send(&mut conn, &publication)
                    .await
                    .context("failed to write publication")?,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!(skipped, "Subscriber lagging, publications dropped");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            // Subscribers never send; this only notices a hang-up.
            incoming = conn.next() => if !matches!(incoming, Some(Ok(_))) {
                return Ok(());
            },
        }
    }
}

// ============================================================================
// Peer subscription
// ============================================================================

/// Keep a subscription to `pub_addr` open and forward every publication to
/// the loop, reconnecting with backoff whenever it drops.
pub(crate) fn spawn_peer_subscription(
    peer: String,
    pub_addr: SocketAddr,
    events: mpsc::Sender<LoopEvent>,
    backoff: BackoffConfig,
    jitter_pct: u8,
) -> JoinHandle<()> {
    let span = info_span!("peer_subscription", peer = %peer, %pub_addr);
    tokio::spawn(
        async move {
            let mut backoff = ExponentialBackoff::new(backoff);
            let mut rng = StdRng::from_os_rng();
            loop {
                match subscribe_once(&peer, pub_addr, &events, &mut backoff).await {
                    Ok(true) => log::info!("Peer publication stream closed"),
                    Ok(false) => return,
                    Err(e) => log::warn!(error = %e, "Peer subscription failed"),
                }
                let delay = add_jitter(backoff.on_failure(Instant::now()), jitter_pct, &mut rng);
                log::debug!(
                    delay_ms = delay.as_millis() as u64,
                    failures = backoff.consecutive_failures(),
                    "Reconnecting to peer"
                );
                tokio::time::sleep(delay).await;
            }
        }
        .instrument(span),
    )
}

/// One connection's worth of subscription. Returns `Ok(false)` once the
/// loop is gone, `Ok(true)` when the peer closed the stream.
async fn subscribe_once(
    peer: &str,
    pub_addr: SocketAddr,
    events: &mpsc::Sender<LoopEvent>,
    backoff: &mut ExponentialBackoff,
) -> anyhow::Result<bool> {
    let mut stream = KvStoreClient::subscribe(pub_addr)
        .await
        .with_context(|| format!("failed to subscribe to {}", pub_addr))?;
    backoff.on_success();
    log::info!("Subscribed to peer publications");

    while let Some(item) = stream.next().await {
        match item {
            Ok(publication) => {
                let event = LoopEvent::PeerPublication {
                    peer: peer.to_string(),
                    publication,
                };
                if events.send(event).await.is_err() {
                    return Ok(false);
                }
            }
            Err(KvStoreError::Codec(e)) => {
                log::warn!(error = %e, "Skipping undecodable publication");
            }
            Err(e) => return Err(e).context("publication stream failed"),
        }
    }
    Ok(true)
}

// ============================================================================
// Full sync
// ============================================================================

/// Send one full-sync request and report the outcome to the loop.
pub(crate) fn spawn_sync_request(
    request: SyncRequest,
    requester: String,
    timeout: Duration,
    events: mpsc::Sender<LoopEvent>,
) -> JoinHandle<()> {
    let span = info_span!(
        "full_sync",
        peer = %request.peer,
        request_id = request.request_id,
        cmd_addr = %request.spec.cmd_addr
    );
    tokio::spawn(
        async move {
            let result = match tokio::time::timeout(
                timeout,
                fetch_full_dump(request.spec.cmd_addr, requester),
            )
            .await
            {
                Ok(Ok(dump)) => Ok(dump),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(_) => Err(format!("no response within {:?}", timeout)),
            };
            if let Err(error) = &result {
                log::debug!(error = %error, "Full sync request failed");
            }
            let event = LoopEvent::SyncResponse {
                peer: request.peer,
                request_id: request.request_id,
                result,
            };
            if events.send(event).await.is_err() {
                log::debug!("Event loop gone, dropping sync result");
            }
        }
        .instrument(span),
    )
}

async fn fetch_full_dump(cmd_addr: SocketAddr, requester: String) -> anyhow::Result<Publication> {
    let client = KvStoreClient::connect(cmd_addr)
        .await
        .with_context(|| format!("failed to connect to {}", cmd_addr))?;
    let dump = client
        .request(Request::PeerSync { requester })
        .await?
        .into_key_vals()?;
    Ok(dump)
}
