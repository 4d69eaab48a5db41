//! Store façade
//!
//! [`KvStoreApi`] is the surface on-node services use: reads, writes, dumps
//! and peer management. [`KvStoreHandle`] talks to a store in the same
//! process over channels; [`KvStoreClient`] speaks the command protocol over
//! TCP. Both can subscribe to published deltas.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, Mutex},
};
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    error::{KvStoreError, Result},
    event_loop::{submit, Command},
    peers::{PeerInfo, PeerSpec},
    protocol::{self, FramedConnection, Request, Response},
    state::KvStoreCounters,
    value::{Publication, Value},
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait KvStoreApi: Send + Sync {
    /// Send one command and return the raw response.
    async fn request(&self, request: Request) -> Result<Response>;

    async fn get_key_vals(&self, keys: Vec<String>) -> Result<Publication> {
        let keys: BTreeSet<String> = keys.into_iter().collect();
        self.request(Request::Get { keys }).await?.into_key_vals()
    }

    async fn set_key_vals(&self, key_vals: BTreeMap<String, Value>) -> Result<()> {
        self.request(Request::Set { key_vals }).await?.into_ack()
    }

    async fn set_key(&self, key: &str, value: Value) -> Result<()> {
        let mut key_vals = BTreeMap::new();
        key_vals.insert(key.to_string(), value);
        self.set_key_vals(key_vals).await
    }

    /// Every key starting with `prefix`; empty returns the whole store.
    async fn dump_all_with_prefix(&self, prefix: &str) -> Result<Publication> {
        let prefix = prefix.to_string();
        self.request(Request::DumpAll { prefix })
            .await?
            .into_key_vals()
    }

    async fn dump_hash_with_prefix(&self, prefix: &str) -> Result<BTreeMap<String, u64>> {
        let prefix = prefix.to_string();
        self.request(Request::DumpHash { prefix }).await?.into_hashes()
    }

    async fn dump_difference(&self, hashes: BTreeMap<String, u64>) -> Result<Publication> {
        self.request(Request::DumpDifference { hashes })
            .await?
            .into_key_vals()
    }

    async fn add_peers(&self, peers: BTreeMap<String, PeerSpec>) -> Result<()> {
        self.request(Request::AddPeers { peers }).await?.into_ack()
    }

    async fn add_peer(&self, name: &str, spec: PeerSpec) -> Result<()> {
        let mut peers = BTreeMap::new();
        peers.insert(name.to_string(), spec);
        self.add_peers(peers).await
    }

    async fn del_peers(&self, names: Vec<String>) -> Result<()> {
        let names = names.into_iter().collect();
        self.request(Request::DelPeers { names }).await?.into_ack()
    }

    async fn dump_peers(&self) -> Result<Vec<PeerInfo>> {
        self.request(Request::DumpPeers).await?.into_peers()
    }

    async fn counters(&self) -> Result<KvStoreCounters> {
        self.request(Request::Counters).await?.into_counters()
    }
}

/// In-process handle to a running store.
#[derive(Clone)]
pub struct KvStoreHandle {
    commands: mpsc::Sender<Command>,
    publications: broadcast::Sender<Publication>,
}

impl KvStoreHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        publications: broadcast::Sender<Publication>,
    ) -> Self {
        Self {
            commands,
            publications,
        }
    }

    /// Receiver for every delta published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Publication> {
        self.publications.subscribe()
    }

    pub fn publications(&self) -> BroadcastStream<Publication> {
        BroadcastStream::new(self.subscribe())
    }
}

#[async_trait]
impl KvStoreApi for KvStoreHandle {
    async fn request(&self, request: Request) -> Result<Response> {
        submit(&self.commands, request).await
    }
}

/// Command-protocol client over one TCP connection. Requests on the same
/// client are serialized. After a [`KvStoreError::Timeout`] the connection
/// may still deliver the stale response, so the client should be dropped.
pub struct KvStoreClient {
    addr: SocketAddr,
    conn: Mutex<FramedConnection>,
    timeout: Duration,
}

impl KvStoreClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            addr,
            conn: Mutex::new(protocol::framed(stream)),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stream of publications from a store's publication endpoint. An
    /// undecodable frame yields a `Codec` error and the stream goes on; the
    /// stream ends when the connection does.
    pub async fn subscribe(pub_addr: SocketAddr) -> Result<BoxStream<'static, Result<Publication>>> {
        let stream = TcpStream::connect(pub_addr).await?;
        let conn = protocol::framed(stream);
        Ok(conn
            .map(|frame| {
                frame
                    .map_err(KvStoreError::from)
                    .and_then(|frame| protocol::decode::<Publication>(&frame))
            })
            .boxed())
    }

    async fn round_trip(&self, request: &Request) -> Result<Response> {
        let mut conn = self.conn.lock().await;
        protocol::send(&mut conn, request).await?;
        protocol::recv(&mut conn)
            .await?
            .ok_or(KvStoreError::ConnectionClosed)
    }
}

#[async_trait]
impl KvStoreApi for KvStoreClient {
    async fn request(&self, request: Request) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.round_trip(&request))
            .await
            .map_err(|_| KvStoreError::Timeout(self.timeout))?
    }
}
