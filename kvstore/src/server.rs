//! KvStore startup and shutdown.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing as log;

use crate::{
    client::KvStoreHandle,
    config::KvStoreConfig,
    error::{KvStoreError, Result},
    event_loop::EventLoop,
    peers::PeerSpec,
    transport,
    watchdog::{LivenessMonitor, NoopMonitor},
};

/// Addresses actually bound, with OS-assigned ports resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddrs {
    pub local_cmd: SocketAddr,
    pub global_cmd: SocketAddr,
    pub local_pub: SocketAddr,
    pub global_pub: SocketAddr,
}

impl BoundAddrs {
    /// Endpoints other stores should use to peer with this one.
    pub fn peer_spec(&self) -> PeerSpec {
        PeerSpec::new(self.global_cmd, self.global_pub)
    }
}

struct Listeners {
    local_cmd: TcpListener,
    global_cmd: TcpListener,
    local_pub: TcpListener,
    global_pub: TcpListener,
}

/// A validated, bound store that has not started yet.
pub struct KvStore {
    config: KvStoreConfig,
    listeners: Listeners,
    addrs: BoundAddrs,
    monitor: Arc<dyn LivenessMonitor>,
}

async fn bind(addr: SocketAddr) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| KvStoreError::Bind { addr, source })?;
    let bound = listener
        .local_addr()
        .map_err(|source| KvStoreError::Bind { addr, source })?;
    Ok((listener, bound))
}

impl KvStore {
    /// Validate `config` and bind all four endpoints. Any failure here is
    /// fatal: the store cannot run without its sockets.
    pub async fn bind(config: KvStoreConfig) -> Result<Self> {
        config.validate()?;

        let (local_cmd, local_cmd_addr) = bind(config.local_cmd_addr).await?;
        let (global_cmd, global_cmd_addr) = bind(config.global_cmd_addr).await?;
        let (local_pub, local_pub_addr) = bind(config.local_pub_addr).await?;
        let (global_pub, global_pub_addr) = bind(config.global_pub_addr).await?;

        let addrs = BoundAddrs {
            local_cmd: local_cmd_addr,
            global_cmd: global_cmd_addr,
            local_pub: local_pub_addr,
            global_pub: global_pub_addr,
        };
        log::info!(
            node = %config.node_id,
            local_cmd = %addrs.local_cmd,
            global_cmd = %addrs.global_cmd,
            local_pub = %addrs.local_pub,
            global_pub = %addrs.global_pub,
            "KvStore bound"
        );

        Ok(Self {
            config,
            listeners: Listeners {
                local_cmd,
                global_cmd,
                local_pub,
                global_pub,
            },
            addrs,
            monitor: Arc::new(NoopMonitor),
        })
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn LivenessMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn addrs(&self) -> BoundAddrs {
        self.addrs
    }

    /// Spawn the event loop and the listeners.
    pub fn start(self) -> RunningKvStore {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::channel(self.config.command_queue_size);
        let (publication_tx, _) = broadcast::channel(self.config.publication_queue_size);

        let handle = KvStoreHandle::new(command_tx.clone(), publication_tx.clone());
        let event_loop = EventLoop::new(
            self.config,
            command_rx,
            publication_tx.clone(),
            self.monitor,
        );

        let Listeners {
            local_cmd,
            global_cmd,
            local_pub,
            global_pub,
        } = self.listeners;

        let tasks = vec![
            tokio::spawn(event_loop.run(shutdown_rx.clone())),
            tokio::spawn(transport::serve_commands(
                local_cmd,
                "local",
                command_tx.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(transport::serve_commands(
                global_cmd,
                "global",
                command_tx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(transport::serve_publications(
                local_pub,
                "local",
                publication_tx.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(transport::serve_publications(
                global_pub,
                "global",
                publication_tx,
                shutdown_rx,
            )),
        ];

        RunningKvStore {
            handle,
            addrs: self.addrs,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

pub struct RunningKvStore {
    handle: KvStoreHandle,
    addrs: BoundAddrs,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningKvStore {
    pub fn handle(&self) -> KvStoreHandle {
        self.handle.clone()
    }

    pub fn addrs(&self) -> BoundAddrs {
        self.addrs
    }

    /// Stop the loop and the listeners and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                log::warn!(error = %e, "KvStore task ended abnormally");
            }
        }
    }
}
