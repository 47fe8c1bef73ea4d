use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use archivist_types::{DiscoveryKey, PeerId};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SwarmConfig;
use crate::connection::{ConnectionDriver, Direction, PeerConnection};
use crate::discovery::{Discovery, Joined, Membership};
use crate::error::{SwarmError, SwarmResult};
use crate::wire::{WireCodec, WireMessage, WIRE_VERSION};

const CONNECTION_BACKLOG: usize = 64;

struct Topics {
    local_addr: SocketAddr,
    bootstrap: Vec<SocketAddr>,
    hello_timeout: Duration,
    joined: Mutex<HashMap<DiscoveryKey, mpsc::Sender<PeerConnection>>>,
}

impl Topics {
    fn sender(&self, key: &DiscoveryKey) -> Option<mpsc::Sender<PeerConnection>> {
        self.joined.lock().expect("topics lock poisoned").get(key).cloned()
    }
}

/// Discovery over plain TCP.
///
/// Listens for inbound peers on the configured address and, whenever an
/// archive joins, dials every bootstrap peer. A connection opens with a
/// `Hello` naming the discovery key; the acceptor answers `HelloAck` if it
/// has joined that key and `Reject` otherwise. What flows after the
/// handshake belongs to the replication protocol and is drained here.
pub struct TcpSwarm {
    topics: Arc<Topics>,
    accept_task: JoinHandle<()>,
}

impl TcpSwarm {
    pub async fn bind(config: &SwarmConfig) -> SwarmResult<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let topics = Arc::new(Topics {
            local_addr,
            bootstrap: config.bootstrap.clone(),
            hello_timeout: config.handshake_timeout(),
            joined: Mutex::new(HashMap::new()),
        });
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&topics)));
        info!(addr = %local_addr, bootstrap = topics.bootstrap.len(), "swarm listening");
        Ok(Self {
            topics,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.topics.local_addr
    }
}

impl Drop for TcpSwarm {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl std::fmt::Debug for TcpSwarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSwarm")
            .field("local_addr", &self.topics.local_addr)
            .finish()
    }
}

#[async_trait]
impl Discovery for TcpSwarm {
    async fn join(&self, key: DiscoveryKey) -> SwarmResult<Joined> {
        let (tx, rx) = mpsc::channel(CONNECTION_BACKLOG);
        {
            let mut joined = self.topics.joined.lock().expect("topics lock poisoned");
            if joined.contains_key(&key) {
                return Err(SwarmError::Join {
                    key,
                    reason: "already joined".into(),
                });
            }
            joined.insert(key, tx);
        }

        for addr in self.topics.bootstrap.iter().copied() {
            if addr == self.topics.local_addr {
                continue;
            }
            tokio::spawn(dial(Arc::clone(&self.topics), addr, key));
        }

        Ok(Joined {
            membership: Box::new(TcpMembership {
                key,
                topics: Arc::clone(&self.topics),
            }),
            connections: rx,
        })
    }
}

struct TcpMembership {
    key: DiscoveryKey,
    topics: Arc<Topics>,
}

#[async_trait]
impl Membership for TcpMembership {
    fn discovery_key(&self) -> DiscoveryKey {
        self.key
    }

    async fn leave(&self) -> SwarmResult<()> {
        self.topics
            .joined
            .lock()
            .expect("topics lock poisoned")
            .remove(&self.key);
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, topics: Arc<Topics>) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                tokio::spawn(accept(Arc::clone(&topics), socket, addr));
            }
            Err(e) => {
                warn!(error = %e, "failed to accept peer connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept(topics: Arc<Topics>, mut socket: TcpStream, addr: SocketAddr) {
    let hello = match tokio::time::timeout(topics.hello_timeout, WireCodec::read(&mut socket)).await
    {
        Ok(Ok(Some(msg))) => msg,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!(peer = %addr, error = %e, "bad hello");
            return;
        }
        Err(_) => {
            debug!(peer = %addr, "no hello before deadline");
            return;
        }
    };

    let WireMessage::Hello {
        version,
        discovery_key,
    } = hello
    else {
        debug!(peer = %addr, "expected hello");
        return;
    };
    if version != WIRE_VERSION {
        reject(&mut socket, format!("unsupported version {version}")).await;
        return;
    }
    let Some(sender) = topics.sender(&discovery_key) else {
        reject(&mut socket, "archive not hosted".into()).await;
        return;
    };

    let (conn, driver) = PeerConnection::pair(PeerId::from(addr), Direction::Inbound);
    if sender.send(conn).await.is_err() {
        return;
    }
    run_acceptor(socket, driver).await;
}

async fn reject(socket: &mut TcpStream, reason: String) {
    if let Err(e) = WireCodec::write(socket, &WireMessage::Reject { reason }).await {
        debug!(error = %e, "failed to send reject");
    }
}

async fn dial(topics: Arc<Topics>, addr: SocketAddr, key: DiscoveryKey) {
    let mut socket = match TcpStream::connect(addr).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(peer = %addr, error = %e, "failed to dial bootstrap peer");
            return;
        }
    };
    let hello = WireMessage::Hello {
        version: WIRE_VERSION,
        discovery_key: key,
    };
    if let Err(e) = WireCodec::write(&mut socket, &hello).await {
        warn!(peer = %addr, error = %e, "failed to send hello");
        return;
    }

    let Some(sender) = topics.sender(&key) else {
        return;
    };
    let (conn, driver) = PeerConnection::pair(PeerId::from(addr), Direction::Outbound);
    if sender.send(conn).await.is_err() {
        return;
    }
    run_dialer(socket, driver).await;
}

async fn run_acceptor(mut socket: TcpStream, mut driver: ConnectionDriver) {
    let ack = WireMessage::HelloAck {
        version: WIRE_VERSION,
    };
    if let Err(e) = WireCodec::write(&mut socket, &ack).await {
        driver.error(e.to_string()).await;
        return;
    }
    if !driver.handshake().await {
        return;
    }
    drain(socket, &mut driver).await;
}

async fn run_dialer(mut socket: TcpStream, mut driver: ConnectionDriver) {
    let reply = tokio::select! {
        reply = WireCodec::read(&mut socket) => reply,
        _ = driver.destroyed() => return,
    };
    match reply {
        Ok(Some(WireMessage::HelloAck { .. })) => {
            if !driver.handshake().await {
                return;
            }
        }
        Ok(Some(WireMessage::Reject { reason })) => {
            driver.error(format!("rejected: {reason}")).await;
            return;
        }
        Ok(Some(other)) => {
            driver.error(format!("unexpected {other:?}")).await;
            return;
        }
        Ok(None) => {
            driver.close().await;
            return;
        }
        Err(e) => {
            driver.error(e.to_string()).await;
            return;
        }
    }
    drain(socket, &mut driver).await;
}

/// Read until the peer hangs up or the replicator destroys the stream.
async fn drain(mut socket: TcpStream, driver: &mut ConnectionDriver) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            read = socket.read(&mut buf) => match read {
                Ok(0) => {
                    driver.close().await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    driver.error(e.to_string()).await;
                    return;
                }
            },
            reason = driver.destroyed() => {
                debug!(peer = %driver.peer(), reason = ?reason, "closing peer socket");
                return;
            }
        }
    }
}
