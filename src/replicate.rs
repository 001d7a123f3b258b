//! Peer replication coordinator.
//!
//! Gives a mutating client command all-or-nothing visibility across the
//! cluster: connect to every configured peer, lock them all with
//! `SYNC_ON`, propagate the mutation, then commit with `SYNC_OFF` or
//! unwind with `SYNC_ABORT`.  The whole handshake runs while this node's
//! exclusive store lock is held, so a node sustains at most one in-flight
//! mutating transaction regardless of worker count.
//!
//! Not a quorum protocol: one unreachable or disagreeing peer aborts the
//! write.  The local node is both coordinator and commit participant
//! without sending itself network messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::errors::BoardError;
use crate::store::BulletinStore;
use crate::Node;

/// Artificial delay inside store reads when debug mode is on.
pub(crate) const READ_DELAY: Duration = Duration::from_secs(3);
/// Artificial delay inside store writes when debug mode is on.
pub(crate) const WRITE_DELAY: Duration = Duration::from_secs(6);

/// How long to wait for every peer's acknowledgment line.
///
/// In debug mode peers sleep inside their writes, so the wait is padded
/// by twice the write delay.
pub(crate) fn ack_timeout(debug: bool) -> Duration {
    let base = Duration::from_secs(1);
    if debug {
        base + WRITE_DELAY * 2
    } else {
        base
    }
}

/// A configured replication peer.  Stateless between transactions; a
/// connection lives only for the duration of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub host: String,
    pub port: u16,
}

impl Peer {
    /// Parse a `host:port` peer address from configuration.
    pub fn parse(addr: &str) -> anyhow::Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("peer address '{addr}' is missing a port"))?;
        if host.is_empty() {
            anyhow::bail!("peer address '{addr}' is missing a host");
        }
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow::anyhow!("peer address '{addr}' has an invalid port"))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The mutation a transaction carries to every peer and, last, to the
/// local store.
#[derive(Debug, Clone)]
pub enum Mutation {
    Append { user: String, message: String },
    Replace { id: u32, user: String, message: String },
}

impl Mutation {
    /// Render the internal wire command propagating this mutation.
    fn wire_line(&self) -> String {
        match self {
            Mutation::Append { user, message } => format!("SYNC_WRITE {user}/{message}"),
            Mutation::Replace { id, user, message } => {
                format!("SYNC_REPLACE {id}/{user}/{message}")
            }
        }
    }
}

/// Run one replicated commit: lock the cluster, propagate `mutation`,
/// apply it locally, and release or unwind.
///
/// Returns the new or replaced id.  `NotFound` reports an unknown id on
/// replace; any other error means nothing was committed anywhere.
pub async fn commit(node: &Arc<Node>, mutation: Mutation) -> Result<u32, BoardError> {
    // The exclusive lock covers the whole peer round-trip.
    let mut store = Arc::clone(&node.store).write_owned().await;

    let mut peers = match connect_all(&node.peers).await {
        Ok(peers) => peers,
        Err(err) => return Err(BoardError::Replication(format!("peer connect: {err}"))),
    };

    let wait = ack_timeout(node.config.debug);
    let outcome = propagate(&mut peers, &mut store, &mutation, wait, node.config.debug).await;

    // An unknown id on replace is a normal outcome, not a failed
    // transaction: nothing was applied and there is nothing to unwind.
    let failed = matches!(&outcome, Err(err) if !matches!(err, BoardError::NotFound(_)));
    let epilogue = if failed { "SYNC_ABORT" } else { "SYNC_OFF" };
    if let Err(err) = broadcast(&mut peers, epilogue, wait).await {
        warn!("{epilogue} broadcast incomplete: {err}");
    }

    // Dropping the connections disconnects every peer; the lock releases
    // when `store` goes out of scope.
    outcome
}

/// Steps 2-4 of the handshake: cluster lock, mutation broadcast, local
/// apply.  Any error short-circuits to the caller's abort branch.
async fn propagate(
    peers: &mut [PeerLink],
    store: &mut BulletinStore,
    mutation: &Mutation,
    wait: Duration,
    debug: bool,
) -> Result<u32, BoardError> {
    broadcast(peers, "SYNC_ON", wait).await?;
    broadcast(peers, &mutation.wire_line(), wait).await?;

    if debug {
        tokio::time::sleep(WRITE_DELAY).await;
    }

    match mutation {
        Mutation::Append { user, message } => Ok(store.append(user, message)?),
        Mutation::Replace { id, user, message } => store
            .replace(*id, user, message)
            .ok_or(BoardError::NotFound(*id)),
    }
}

/// Send `line` to every peer, then collect one `ACK`/`NACK` verdict per
/// peer under a shared deadline.
///
/// Anything else a peer says first (greeting banner, farewell) is
/// filtered out and does not count toward the tally.  A timeout, a
/// disconnect, or a single `NACK` fails the broadcast.
async fn broadcast(
    peers: &mut [PeerLink],
    line: &str,
    wait: Duration,
) -> Result<(), BoardError> {
    for peer in peers.iter_mut() {
        debug!(peer = %peer.addr, "-> {line}");
        peer.send(line)
            .await
            .map_err(|err| BoardError::Replication(format!("send to {}: {err}", peer.addr)))?;
    }

    let deadline = Instant::now() + wait;
    for peer in peers.iter_mut() {
        match timeout_at(deadline, peer.read_verdict()).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return Err(BoardError::Replication(format!(
                    "peer {} refused the transaction",
                    peer.addr
                )))
            }
            Ok(Err(err)) => {
                return Err(BoardError::Replication(format!(
                    "peer {}: {err}",
                    peer.addr
                )))
            }
            Err(_) => {
                return Err(BoardError::Replication(format!(
                    "peer {} timed out",
                    peer.addr
                )))
            }
        }
    }
    Ok(())
}

/// One live peer connection, line-oriented in both directions.
struct PeerLink {
    addr: String,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl PeerLink {
    async fn send(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await
    }

    /// Read lines until one is a verdict: `true` for `ACK`, `false` for
    /// `NACK`.  Non-verdict lines are skipped.
    async fn read_verdict(&mut self) -> std::io::Result<bool> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line == "ACK" => return Ok(true),
                Some(line) if line == "NACK" => return Ok(false),
                Some(line) => debug!(peer = %self.addr, "<- {line} (ignored)"),
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ))
                }
            }
        }
    }
}

/// Connect to every configured peer with a fresh stream.  Any single
/// failure fails the whole transaction before any peer is locked.
async fn connect_all(peers: &[Peer]) -> std::io::Result<Vec<PeerLink>> {
    let mut links = Vec::with_capacity(peers.len());
    for peer in peers {
        let stream = TcpStream::connect((peer.host.as_str(), peer.port)).await?;
        let (read, writer) = stream.into_split();
        links.push(PeerLink {
            addr: peer.addr(),
            lines: BufReader::new(read).lines(),
            writer,
        });
    }
    Ok(links)
}
