//! Single store behaviour through its public surfaces.

use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::broadcast, time::Instant};

use super::test_utils::{
    closed_addr, eventually, init_test_logging, silent_listener, start_node, test_config, value,
};
use crate::{
    client::{KvStoreApi, KvStoreClient},
    error::KvStoreError,
    protocol::{self, Request, Response},
    server::KvStore,
    value::{Publication, Ttl, Value},
    watchdog::{HeartbeatRegistry, LivenessMonitor},
    PeerSpec,
};

async fn next_publication_with<F>(
    updates: &mut broadcast::Receiver<Publication>,
    timeout: Duration,
    mut matches: F,
) -> Option<Publication>
where
    F: FnMut(&Publication) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match updates.recv().await {
                Ok(publication) if matches(&publication) => return Some(publication),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test]
async fn test_set_get_and_ttl_expiry() {
    init_test_logging();
    let node = start_node("n1").await;
    let handle = node.handle();
    let mut updates = handle.subscribe();

    let written = Value::new(1, "n1", b"x".to_vec(), Ttl::Millis(400));
    handle.set_key("A", written.clone()).await.unwrap();

    let stored = handle.get_key_vals(vec!["A".to_string()]).await.unwrap();
    let got = stored.get("A").unwrap();
    assert_eq!(got.version, 1);
    assert_eq!(got.value.as_deref(), Some(b"x".as_slice()));
    assert!(matches!(got.ttl, Ttl::Millis(ms) if ms <= 400));

    let admitted = next_publication_with(&mut updates, Duration::from_secs(1), |p| {
        p.get("A").is_some_and(|v| !v.is_tombstone())
    })
    .await;
    assert!(admitted.is_some());

    let deleted = next_publication_with(&mut updates, Duration::from_secs(3), |p| {
        p.get("A").is_some_and(Value::is_tombstone)
    })
    .await
    .expect("expected a delete publication for A");
    assert_eq!(deleted.get("A").map(|v| v.version), Some(1));

    let after = handle.get_key_vals(vec!["A".to_string()]).await.unwrap();
    assert!(after.is_empty());
    assert_eq!(handle.counters().await.unwrap().keys_expired, 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_stale_set_is_accepted_and_ignored() {
    init_test_logging();
    let node = start_node("n1").await;
    let handle = node.handle();

    handle.set_key("A", value(2, "n1", "new")).await.unwrap();
    handle.set_key("A", value(1, "n1", "old")).await.unwrap();

    let stored = handle.get_key_vals(vec!["A".to_string()]).await.unwrap();
    assert_eq!(stored.get("A"), Some(&value(2, "n1", "new")));
    let counters = handle.counters().await.unwrap();
    assert_eq!(counters.updates_admitted, 1);
    assert_eq!(counters.updates_rejected, 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_dump_difference_over_tcp() {
    init_test_logging();
    let node = start_node("n1").await;
    let client = KvStoreClient::connect(node.addrs().local_cmd).await.unwrap();

    for (key, payload) in [("adj:a", "1"), ("adj:b", "2"), ("prefix:c", "3")] {
        client.set_key(key, value(1, "n1", payload)).await.unwrap();
    }

    let adj = client.dump_all_with_prefix("adj:").await.unwrap();
    assert_eq!(adj.keys().collect::<Vec<_>>(), vec!["adj:a", "adj:b"]);
    assert_eq!(client.dump_all_with_prefix("").await.unwrap().len(), 3);

    let mut hashes = client.dump_hash_with_prefix("").await.unwrap();
    assert_eq!(hashes.len(), 3);
    hashes.remove("adj:b");

    let diff = client.dump_difference(hashes).await.unwrap();
    assert_eq!(diff.len(), 1);
    assert_eq!(diff.get("adj:b"), Some(&value(1, "n1", "2")));

    node.shutdown().await;
}

#[tokio::test]
async fn test_in_process_stream_sees_admitted_deltas_only() {
    init_test_logging();
    let node = start_node("n1").await;
    let handle = node.handle();
    let mut stream = handle.publications();

    handle.set_key("A", value(2, "n1", "new")).await.unwrap();
    // Stale, produces no publication
    handle.set_key("A", value(1, "n1", "old")).await.unwrap();
    handle.set_key("B", value(1, "n1", "b")).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.get("A"), Some(&value(2, "n1", "new")));
    let second = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second.keys().collect::<Vec<_>>(), vec!["B"]);

    node.shutdown().await;
}

#[tokio::test]
async fn test_undecodable_peer_publication_is_skipped() {
    init_test_logging();
    let node = start_node("n1").await;
    let handle = node.handle();

    // Stand-in peer whose publication endpoint we drive by hand
    let (peer_pub, peer_pub_addr) = silent_listener().await;
    handle
        .add_peer("n2", PeerSpec::new(closed_addr().await, peer_pub_addr))
        .await
        .unwrap();

    let (stream, _) = tokio::time::timeout(Duration::from_secs(2), peer_pub.accept())
        .await
        .unwrap()
        .unwrap();
    let mut conn = protocol::framed(stream);
    conn.send(bytes::Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef, 0x00]))
        .await
        .unwrap();
    let publication: Publication = [("K".to_string(), value(3, "n2", "after-garbage"))]
        .into_iter()
        .collect();
    protocol::send(&mut conn, &publication).await.unwrap();

    let merged = eventually(Duration::from_secs(3), || {
        let handle = handle.clone();
        async move {
            handle
                .get_key_vals(vec!["K".to_string()])
                .await
                .is_ok_and(|got| got.get("K") == Some(&value(3, "n2", "after-garbage")))
        }
    })
    .await;
    assert!(merged);
    assert!(handle.counters().await.unwrap().publications_received >= 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_tcp_subscriber_receives_deltas() {
    init_test_logging();
    let node = start_node("n1").await;
    let client = KvStoreClient::connect(node.addrs().global_cmd).await.unwrap();
    let mut stream = KvStoreClient::subscribe(node.addrs().global_pub).await.unwrap();

    // The listener subscribes when it accepts, so keep writing newer
    // versions until one makes it through.
    let mut received = None;
    for version in 1..=50 {
        client
            .set_key("K", value(version, "n1", "payload"))
            .await
            .unwrap();
        if let Ok(Some(item)) = tokio::time::timeout(Duration::from_millis(100), stream.next()).await {
            received = Some(item.unwrap());
            break;
        }
    }

    let publication = received.expect("no publication received");
    let delta = publication.get("K").unwrap();
    assert_eq!(delta.originator_id, "n1");
    assert_eq!(delta.value.as_deref(), Some(b"payload".as_slice()));

    node.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_gets_error_response() {
    init_test_logging();
    let node = start_node("n1").await;
    let stream = TcpStream::connect(node.addrs().local_cmd).await.unwrap();
    let mut conn = protocol::framed(stream);

    conn.send(bytes::Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef, 0x00]))
        .await
        .unwrap();
    let response: Response = protocol::recv(&mut conn).await.unwrap().unwrap();
    assert!(matches!(response, Response::Error(_)));

    // The connection stays usable
    protocol::send(&mut conn, &Request::DumpPeers).await.unwrap();
    let response: Response = protocol::recv(&mut conn).await.unwrap().unwrap();
    assert_eq!(response, Response::Peers(vec![]));

    node.shutdown().await;
}

#[tokio::test]
async fn test_peer_add_and_delete() {
    init_test_logging();
    let node = start_node("n1").await;
    let handle = node.handle();
    let spec = PeerSpec::new(closed_addr().await, closed_addr().await);

    handle.add_peer("n2", spec).await.unwrap();
    let peers = handle.dump_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "n2");
    assert_eq!(peers[0].spec, spec);

    // Unknown peers are a no-op
    handle
        .del_peers(vec!["n2".to_string(), "n9".to_string()])
        .await
        .unwrap();
    assert!(handle.dump_peers().await.unwrap().is_empty());

    let err = handle.add_peer("n1", spec).await.unwrap_err();
    assert!(matches!(err, KvStoreError::Remote(_)));

    node.shutdown().await;
}

#[tokio::test]
async fn test_unresponsive_peer_backs_off() {
    init_test_logging();
    let node = start_node("n1").await;
    let handle = node.handle();
    // Accepts connections but never answers
    let (_silent, silent_addr) = silent_listener().await;
    handle
        .add_peer("silent", PeerSpec::new(silent_addr, silent_addr))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(8);
    let mut observed = Vec::new();
    loop {
        let peers = handle.dump_peers().await.unwrap();
        observed.push(peers[0].backoff_ms);
        if peers[0].consecutive_failures >= 3 {
            break;
        }
        assert!(Instant::now() < deadline, "peer never backed off: {:?}", peers);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(observed.windows(2).all(|w| w[0] <= w[1]));
    assert!(observed.iter().all(|ms| *ms <= 400));
    assert!(handle.counters().await.unwrap().full_sync_failure >= 3);

    node.shutdown().await;
}

#[tokio::test]
async fn test_bind_failure_is_fatal() {
    init_test_logging();
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config("n1");
    config.local_cmd_addr = taken.local_addr().unwrap();

    let result = KvStore::bind(config).await;
    assert!(matches!(result, Err(KvStoreError::Bind { .. })));

    let result = KvStore::bind(test_config("n1").with_sync_jitter_pct(120)).await;
    assert!(matches!(result, Err(KvStoreError::Config(_))));
}

#[tokio::test]
async fn test_loop_heartbeats_to_monitor() {
    init_test_logging();
    let registry = Arc::new(HeartbeatRegistry::new());
    let monitor: Arc<dyn LivenessMonitor> = registry.clone();
    let node = KvStore::bind(test_config("n1"))
        .await
        .unwrap()
        .with_monitor(monitor)
        .start();

    let ticking = eventually(Duration::from_secs(3), || {
        let beats = registry.beats("kvstore:n1");
        async move { beats.is_some_and(|count| count >= 2) }
    })
    .await;
    assert!(ticking);

    node.shutdown().await;
    assert!(!registry.is_registered("kvstore:n1"));
}
