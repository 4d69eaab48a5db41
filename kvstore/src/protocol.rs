//! Wire protocol
//!
//! Commands are a closed sum type dispatched by pattern match; each variant
//! carries only what its command needs. On the wire every message is one
//! length-delimited frame holding a bincode-encoded [`Request`], [`Response`]
//! or [`Publication`].

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{
    error::{KvStoreError, Result},
    peers::{PeerInfo, PeerSpec},
    state::KvStoreCounters,
    value::{Publication, Value},
};

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub type FramedConnection = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Values for the given keys; absent keys are omitted.
    Get { keys: BTreeSet<String> },
    /// Merge the key-values into the store. Rejected values are ignored.
    Set { key_vals: BTreeMap<String, Value> },
    /// Every key starting with `prefix`; an empty prefix matches all.
    DumpAll { prefix: String },
    DumpHash { prefix: String },
    /// Keys whose local hash differs from `hashes`, or that `hashes` lacks.
    DumpDifference { hashes: BTreeMap<String, u64> },
    AddPeers { peers: BTreeMap<String, PeerSpec> },
    DelPeers { names: BTreeSet<String> },
    DumpPeers,
    Counters,
    /// Full dump requested by a peer's sync driver.
    PeerSync { requester: String },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Get { .. } => "GET",
            Request::Set { .. } => "SET",
            Request::DumpAll { .. } => "DUMP_ALL",
            Request::DumpHash { .. } => "DUMP_HASH",
            Request::DumpDifference { .. } => "DUMP_DIFFERENCE",
            Request::AddPeers { .. } => "ADD_PEERS",
            Request::DelPeers { .. } => "DEL_PEERS",
            Request::DumpPeers => "DUMP_PEERS",
            Request::Counters => "COUNTERS",
            Request::PeerSync { .. } => "PEER_SYNC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ack,
    KeyVals(Publication),
    Hashes(BTreeMap<String, u64>),
    Peers(Vec<PeerInfo>),
    Counters(KvStoreCounters),
    /// Malformed or undecodable request.
    Error(String),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ack => "Ack",
            Response::KeyVals(_) => "KeyVals",
            Response::Hashes(_) => "Hashes",
            Response::Peers(_) => "Peers",
            Response::Counters(_) => "Counters",
            Response::Error(_) => "Error",
        }
    }

    fn unexpected<T>(self, expected: &'static str) -> Result<T> {
        match self {
            Response::Error(message) => Err(KvStoreError::Remote(message)),
            other => Err(KvStoreError::UnexpectedResponse {
                expected,
                got: other.kind(),
            }),
        }
    }

    pub fn into_ack(self) -> Result<()> {
        match self {
            Response::Ack => Ok(()),
            other => other.unexpected("Ack"),
        }
    }

    pub fn into_key_vals(self) -> Result<Publication> {
        match self {
            Response::KeyVals(publication) => Ok(publication),
            other => other.unexpected("KeyVals"),
        }
    }

    pub fn into_hashes(self) -> Result<BTreeMap<String, u64>> {
        match self {
            Response::Hashes(hashes) => Ok(hashes),
            other => other.unexpected("Hashes"),
        }
    }

    pub fn into_peers(self) -> Result<Vec<PeerInfo>> {
        match self {
            Response::Peers(peers) => Ok(peers),
            other => other.unexpected("Peers"),
        }
    }

    pub fn into_counters(self) -> Result<KvStoreCounters> {
        match self {
            Response::Counters(counters) => Ok(counters),
            other => other.unexpected("Counters"),
        }
    }
}

pub fn framed(stream: TcpStream) -> FramedConnection {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_framed(stream)
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(message)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(frame)?)
}

pub async fn send<T: Serialize>(conn: &mut FramedConnection, message: &T) -> Result<()> {
    conn.send(encode(message)?).await?;
    Ok(())
}

/// Next decoded message, or `None` once the peer closed the connection.
pub async fn recv<T: DeserializeOwned>(conn: &mut FramedConnection) -> Result<Option<T>> {
    match conn.next().await {
        None => Ok(None),
        Some(frame) => decode(&frame?).map(Some),
    }
}
