//! Listener, admission queue, worker pool, and server lifecycle.
//!
//! Two listening ports (bulletin and sync) are multiplexed by one accept
//! loop feeding a bounded admission queue.  A fixed pool of long-lived
//! worker tasks pops connections and runs each session to completion, so
//! the pool size caps concurrency.  When the queue is full the accept
//! loop stalls instead of dropping connections.
//!
//! Lifecycle: [`start`] builds the node and brings everything up,
//! [`Server::reload`] tears down and starts again from a new config, and
//! [`Server::stop`] shuts down by pushing one sentinel per worker and
//! joining them all.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::replicate::Peer;
use crate::session;
use crate::store::BulletinStore;
use crate::Node;

/// One entry in the admission queue.
enum Admission {
    /// An accepted connection waiting for a worker.
    Conn(TcpStream),
    /// Shutdown sentinel; each worker consumes exactly one.
    Shutdown,
}

/// A running bulletin board server.
pub struct Server {
    node: Arc<Node>,
    queue: mpsc::Sender<Admission>,
    accept: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    bulletin_addr: SocketAddr,
    sync_addr: SocketAddr,
}

/// Open the store, bind both ports, and launch the accept loop plus the
/// worker pool.
pub async fn start(config: Config) -> anyhow::Result<Server> {
    let board = BulletinStore::open(&config.store.path)?;

    let peers = config
        .cluster
        .peers
        .iter()
        .map(|addr| Peer::parse(addr))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if !peers.is_empty() {
        info!("replicating every mutation to {} peer(s)", peers.len());
    }

    let bulletin = TcpListener::bind((config.server.host.as_str(), config.server.bbport)).await?;
    let sync = TcpListener::bind((config.server.host.as_str(), config.server.syncport)).await?;
    let bulletin_addr = bulletin.local_addr()?;
    let sync_addr = sync.local_addr()?;

    let node = Arc::new(Node {
        store: Arc::new(RwLock::new(board)),
        peers,
        config,
    });

    let (queue, rx) = mpsc::channel::<Admission>(node.config.pool.queue_depth);
    let rx = Arc::new(Mutex::new(rx));

    let mut workers = Vec::with_capacity(node.config.pool.workers);
    for id in 0..node.config.pool.workers {
        workers.push(tokio::spawn(worker_loop(
            id,
            Arc::clone(&rx),
            Arc::clone(&node),
        )));
    }

    let (shutdown, shutdown_rx) = watch::channel(false);
    let accept = tokio::spawn(accept_loop(bulletin, sync, queue.clone(), shutdown_rx));

    info!(
        "bulletin board listening on {bulletin_addr}, sync on {sync_addr}, {} workers",
        node.config.pool.workers
    );

    Ok(Server {
        node,
        queue,
        accept,
        workers,
        shutdown,
        bulletin_addr,
        sync_addr,
    })
}

impl Server {
    /// Address of the bulletin protocol listener.
    pub fn bulletin_addr(&self) -> SocketAddr {
        self.bulletin_addr
    }

    /// Address of the synchronization listener.
    pub fn sync_addr(&self) -> SocketAddr {
        self.sync_addr
    }

    /// Tear everything down and start again from `config`.
    pub async fn reload(self, config: Config) -> anyhow::Result<Server> {
        info!("reloading server");
        self.stop().await?;
        start(config).await
    }

    /// Graceful shutdown: stop accepting, push one sentinel per worker,
    /// join everything, flush the store.
    ///
    /// Workers finish their in-flight session before they see the
    /// sentinel, so live sessions run to completion.
    pub async fn stop(self) -> anyhow::Result<()> {
        info!("stopping server");
        let _ = self.shutdown.send(true);
        for _ in 0..self.workers.len() {
            let _ = self.queue.send(Admission::Shutdown).await;
        }

        let _ = self.accept.await;
        for worker in self.workers {
            let _ = worker.await;
        }

        self.node.store.write().await.flush()?;
        info!("server stopped");
        Ok(())
    }
}

/// Accept loop: multiplex both listeners, push every accepted connection
/// into the admission queue.  `send` blocks while the queue is full --
/// that stall is the backpressure contract.
async fn accept_loop(
    bulletin: TcpListener,
    sync: TcpListener,
    queue: mpsc::Sender<Admission>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = bulletin.accept() => accepted,
            accepted = sync.accept() => accepted,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted connection");
                if queue.send(Admission::Conn(stream)).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("accept failed: {err}"),
        }
    }
    debug!("accept loop terminated");
}

/// Worker: pop one connection, run its session to completion, close it,
/// repeat until the shutdown sentinel arrives.
async fn worker_loop(id: usize, rx: Arc<Mutex<mpsc::Receiver<Admission>>>, node: Arc<Node>) {
    loop {
        // Release the receiver before servicing, so other workers can
        // keep popping while this one is busy.
        let admission = { rx.lock().await.recv().await };

        match admission {
            Some(Admission::Conn(stream)) => {
                debug!(worker = id, "servicing connection");
                if let Err(err) = session::run(&node, stream).await {
                    warn!(worker = id, "session error: {err}");
                }
                // The connection closes when the stream drops here.
            }
            Some(Admission::Shutdown) | None => break,
        }
    }
    debug!(worker = id, "worker terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedWriteHalf;

    fn test_config(dir: &tempfile::TempDir, workers: usize, peers: Vec<String>) -> Config {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.bbport = 0;
        config.server.syncport = 0;
        config.store.path = dir
            .path()
            .join("board.db")
            .to_string_lossy()
            .into_owned();
        config.pool.workers = workers;
        config.cluster.peers = peers;
        config
    }

    struct Client {
        lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        write: OwnedWriteHalf,
    }

    async fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        Client {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.write.write_all(line.as_bytes()).await.unwrap();
            self.write.write_all(b"\n").await.unwrap();
        }

        async fn expect(&mut self, wanted: &str) {
            let line = self.lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, wanted);
        }
    }

    #[tokio::test]
    async fn end_to_end_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let server = start(test_config(&dir, 4, Vec::new())).await.unwrap();

        let mut c = connect(server.bulletin_addr()).await;
        c.expect("Welcome to bulletin board.").await;
        c.send("USER alice").await;
        c.expect("1.0 Hello alice, Welcome to Bulletin Board").await;
        c.send("WRITE over tcp").await;
        c.expect("3.0 WROTE 1").await;
        c.send("READ 1").await;
        c.expect("2.0 MESSAGE 1 alice/over tcp").await;
        c.send("QUIT").await;
        c.expect("4.0 BYE alice").await;

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn sync_port_serves_the_same_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let server = start(test_config(&dir, 2, Vec::new())).await.unwrap();

        let mut c = connect(server.sync_addr()).await;
        c.expect("Welcome to bulletin board.").await;
        c.send("SYNC_ON").await;
        c.expect("ACK").await;
        c.send("SYNC_WRITE peer/from the sync port").await;
        c.expect("ACK").await;
        c.send("SYNC_OFF").await;
        c.expect("ACK").await;
        c.send("QUIT").await;
        c.expect("4.0 BYE noname").await;

        let mut reader = connect(server.bulletin_addr()).await;
        reader.expect("Welcome to bulletin board.").await;
        reader.send("READ 1").await;
        reader.expect("2.0 MESSAGE 1 peer/from the sync port").await;
        reader.send("QUIT").await;
        reader.expect("4.0 BYE noname").await;

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pool_size_caps_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let server = start(test_config(&dir, 1, Vec::new())).await.unwrap();

        let mut first = connect(server.bulletin_addr()).await;
        first.expect("Welcome to bulletin board.").await;

        // The single worker is occupied: the second connection is
        // accepted and queued, but no session greets it yet.
        let mut second = connect(server.bulletin_addr()).await;
        let premature = tokio::time::timeout(
            Duration::from_millis(200),
            second.lines.next_line(),
        )
        .await;
        assert!(premature.is_err(), "second session started early");

        first.send("QUIT").await;
        first.expect("4.0 BYE noname").await;

        // Worker freed: the queued connection gets its greeting.
        second.expect("Welcome to bulletin board.").await;
        second.send("QUIT").await;
        second.expect("4.0 BYE noname").await;

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn two_nodes_replicate_writes() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let node_b = start(test_config(&dir_b, 2, Vec::new())).await.unwrap();
        let peer = format!("127.0.0.1:{}", node_b.sync_addr().port());
        let node_a = start(test_config(&dir_a, 2, vec![peer])).await.unwrap();

        let mut c = connect(node_a.bulletin_addr()).await;
        c.expect("Welcome to bulletin board.").await;
        c.send("USER alice").await;
        c.expect("1.0 Hello alice, Welcome to Bulletin Board").await;
        c.send("WRITE spread the word").await;
        c.expect("3.0 WROTE 1").await;
        c.send("QUIT").await;
        c.expect("4.0 BYE alice").await;

        // The record is visible on the peer after the commit.
        let mut b = connect(node_b.bulletin_addr()).await;
        b.expect("Welcome to bulletin board.").await;
        b.send("READ 1").await;
        b.expect("2.0 MESSAGE 1 alice/spread the word").await;
        b.send("QUIT").await;
        b.expect("4.0 BYE noname").await;

        node_a.stop().await.unwrap();
        node_b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn reload_picks_up_a_new_store() {
        let dir = tempfile::tempdir().unwrap();
        let server = start(test_config(&dir, 2, Vec::new())).await.unwrap();

        let mut c = connect(server.bulletin_addr()).await;
        c.expect("Welcome to bulletin board.").await;
        c.send("USER bob").await;
        c.expect("1.0 Hello bob, Welcome to Bulletin Board").await;
        c.send("WRITE survives reload").await;
        c.expect("3.0 WROTE 1").await;
        c.send("QUIT").await;
        c.expect("4.0 BYE bob").await;

        let server = server.reload(test_config(&dir, 2, Vec::new())).await.unwrap();

        // Same backing file: the record is still there after reopen.
        let mut c = connect(server.bulletin_addr()).await;
        c.expect("Welcome to bulletin board.").await;
        c.send("READ 1").await;
        c.expect("2.0 MESSAGE 1 bob/survives reload").await;
        c.send("QUIT").await;
        c.expect("4.0 BYE noname").await;

        server.stop().await.unwrap();
    }
}
