//! Multi-node convergence scenarios.

use std::time::Duration;

use super::test_utils::{eventually, init_test_logging, start_node, test_config, value};
use crate::{
    client::{KvStoreApi, KvStoreHandle},
    peers::PeerSyncState,
    server::KvStore,
    value::Value,
};

async fn get(handle: &KvStoreHandle, key: &str) -> Option<Value> {
    handle
        .get_key_vals(vec![key.to_string()])
        .await
        .ok()
        .and_then(|publication| publication.get(key).cloned())
}

async fn wait_for_value(handle: &KvStoreHandle, key: &str, expected: &Value) -> bool {
    eventually(Duration::from_secs(5), || {
        let handle = handle.clone();
        let key = key.to_string();
        let expected = expected.clone();
        async move { get(&handle, &key).await.as_ref() == Some(&expected) }
    })
    .await
}

#[tokio::test]
async fn test_concurrent_writes_converge_on_higher_originator() {
    init_test_logging();
    let n1 = start_node("n1").await;
    let n2 = start_node("n2").await;
    let (h1, h2) = (n1.handle(), n2.handle());

    h1.add_peer("n2", n2.addrs().peer_spec()).await.unwrap();
    h2.add_peer("n1", n1.addrs().peer_spec()).await.unwrap();

    h1.set_key("K", value(1, "n1", "from-n1")).await.unwrap();
    h2.set_key("K", value(1, "n2", "from-n2")).await.unwrap();

    let winner = value(1, "n2", "from-n2");
    assert!(wait_for_value(&h1, "K", &winner).await);
    assert!(wait_for_value(&h2, "K", &winner).await);

    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test]
async fn test_full_sync_pulls_existing_keys() {
    init_test_logging();
    let n1 = start_node("n1").await;
    let h1 = n1.handle();
    for i in 0..20 {
        h1.set_key(&format!("prefix:{}", i), value(1, "n1", "p"))
            .await
            .unwrap();
    }

    // n2 learns about n1 from its startup config
    let config = test_config("n2").with_peer("n1", n1.addrs().peer_spec());
    let n2 = KvStore::bind(config).await.unwrap().start();
    let h2 = n2.handle();

    let synced = eventually(Duration::from_secs(5), || {
        let h2 = h2.clone();
        async move {
            h2.dump_all_with_prefix("prefix:")
                .await
                .is_ok_and(|dump| dump.len() == 20)
        }
    })
    .await;
    assert!(synced);

    let synced_peer = eventually(Duration::from_secs(5), || {
        let h2 = h2.clone();
        async move {
            h2.dump_peers().await.is_ok_and(|peers| {
                peers.len() == 1
                    && peers[0].synced_once
                    && peers[0].last_sync_latency_ms.is_some()
                    && peers[0].state != PeerSyncState::Backoff
            })
        }
    })
    .await;
    assert!(synced_peer);

    let counters = h2.counters().await.unwrap();
    assert!(counters.full_sync_success >= 1);
    assert_eq!(counters.marker_key_counts["prefix:"], 20);

    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test]
async fn test_updates_relay_across_chain() {
    init_test_logging();
    let n1 = start_node("n1").await;
    let n2 = start_node("n2").await;
    let n3 = start_node("n3").await;

    // n3 only hears from n2, which only hears from n1
    n2.handle()
        .add_peer("n1", n1.addrs().peer_spec())
        .await
        .unwrap();
    n3.handle()
        .add_peer("n2", n2.addrs().peer_spec())
        .await
        .unwrap();

    let written = value(7, "n1", "adjacency");
    n1.handle().set_key("adj:n1", written.clone()).await.unwrap();
    assert!(wait_for_value(&n3.handle(), "adj:n1", &written).await);

    // A newer version overrides everywhere
    let newer = value(8, "n1", "adjacency-2");
    n1.handle().set_key("adj:n1", newer.clone()).await.unwrap();
    assert!(wait_for_value(&n3.handle(), "adj:n1", &newer).await);

    n1.shutdown().await;
    n2.shutdown().await;
    n3.shutdown().await;
}

#[tokio::test]
async fn test_expired_key_disappears_from_peers() {
    init_test_logging();
    let n1 = start_node("n1").await;
    let n2 = start_node("n2").await;
    let (h1, h2) = (n1.handle(), n2.handle());
    h2.add_peer("n1", n1.addrs().peer_spec()).await.unwrap();

    let short_lived = Value::new(1, "n1", b"x".to_vec(), crate::value::Ttl::Millis(1500));
    h1.set_key("A", short_lived).await.unwrap();

    let replicated = eventually(Duration::from_secs(3), || {
        let h2 = h2.clone();
        async move { get(&h2, "A").await.is_some() }
    })
    .await;
    assert!(replicated);

    let gone = eventually(Duration::from_secs(5), || {
        let (h1, h2) = (h1.clone(), h2.clone());
        async move { get(&h1, "A").await.is_none() && get(&h2, "A").await.is_none() }
    })
    .await;
    assert!(gone);

    // Full syncs after expiry do not bring it back
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(get(&h2, "A").await.is_none());
    assert!(get(&h1, "A").await.is_none());

    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test]
async fn test_removed_peer_stops_feeding_updates() {
    init_test_logging();
    let n1 = start_node("n1").await;
    let n2 = start_node("n2").await;
    let (h1, h2) = (n1.handle(), n2.handle());
    h2.add_peer("n1", n1.addrs().peer_spec()).await.unwrap();

    let first = value(1, "n1", "before");
    h1.set_key("K", first.clone()).await.unwrap();
    assert!(wait_for_value(&h2, "K", &first).await);

    h2.del_peers(vec!["n1".to_string()]).await.unwrap();
    assert!(h2.dump_peers().await.unwrap().is_empty());

    h1.set_key("K", value(2, "n1", "after")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(get(&h2, "K").await, Some(first));

    n1.shutdown().await;
    n2.shutdown().await;
}
