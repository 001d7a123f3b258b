//! Per-connection protocol session.
//!
//! Each accepted connection gets one [`run`] call on a worker: greet,
//! read lines, dispatch parsed requests, render replies.  Client verbs
//! (`USER`, `READ`, `WRITE`, `REPLACE`, `QUIT`) and internal peer verbs
//! (`SYNC_*`) are serviced by the same handler; a connection becomes a
//! replication target simply by sending `SYNC_ON`.
//!
//! While a synchronization transaction is open, the session parks the
//! store's exclusive write guard in its own state so the lock spans the
//! peer coordinator's entire round-trip.  The guard is released by
//! `SYNC_OFF`/`SYNC_ABORT` or, as a backstop, when the session ends.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, warn};

use crate::errors::BoardError;
use crate::proto::{self, ParseError, Request};
use crate::replicate::{self, Mutation};
use crate::store::{self, BulletinStore};
use crate::Node;

/// Reserved placeholder meaning "no user registered yet".
const NONAME: &str = "noname";

const GREETING: &str = "Welcome to bulletin board.";
const ARGS_ERROR: &str = "2.2 ERROR Invalid command arguments";
const INVALID_MESSAGE: &str = "2.2 ERROR Invalid message";
const WRITE_ERROR: &str = "3.2 ERROR WRITE system error";

/// What the session loop should do after a handled line.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Per-connection state.  Created on accept, destroyed on disconnect,
/// never shared across connections.
struct Session {
    /// Registered user name; `None` renders as the `noname` placeholder.
    user: Option<String>,
    /// Exclusive store guard held on behalf of an open synchronization
    /// transaction on this connection.
    txn: Option<OwnedRwLockWriteGuard<BulletinStore>>,
}

impl Session {
    fn new() -> Self {
        Self {
            user: None,
            txn: None,
        }
    }

    fn display_user(&self) -> &str {
        self.user.as_deref().unwrap_or(NONAME)
    }
}

/// Service one connection to completion.
///
/// Reads protocol lines until `QUIT`, `SYNC_ABORT`, end-of-stream, or a
/// transport failure.  Transport failures terminate only this session.
pub async fn run<S>(node: &Arc<Node>, stream: S) -> Result<(), BoardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    send_line(&mut write, GREETING).await?;

    let mut session = Session::new();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => return Err(BoardError::Transport(err)),
        };

        if session.handle_line(node, &line, &mut write).await? == Flow::Close {
            break;
        }
    }

    // A transaction guard still parked here (peer died mid-handshake)
    // is released by the drop below.
    drop(session);
    Ok(())
}

impl Session {
    async fn handle_line<W>(
        &mut self,
        node: &Arc<Node>,
        line: &str,
        w: &mut W,
    ) -> Result<Flow, BoardError>
    where
        W: AsyncWrite + Unpin,
    {
        let request = match proto::parse(line) {
            Ok(request) => request,
            Err(err) => return self.reject(err, w).await,
        };

        match request {
            Request::User(name) => self.cmd_user(name, w).await,
            Request::Read(raw) => self.cmd_read(node, raw, w).await,
            Request::Write(message) => self.cmd_write(node, message, w).await,
            Request::Replace { id, message } => self.cmd_replace(node, id, message, w).await,
            Request::Quit => {
                send_line(w, &format!("4.0 BYE {}", self.display_user())).await?;
                Ok(Flow::Close)
            }
            Request::SyncOn => self.cmd_sync_on(node, w).await,
            Request::SyncOff => self.cmd_sync_off(w).await,
            Request::SyncAbort => self.cmd_sync_abort(w).await,
            Request::SyncWrite { user, message } => {
                self.cmd_sync_write(node, user, message, w).await
            }
            Request::SyncReplace { id, user, message } => {
                self.cmd_sync_replace(node, id, user, message, w).await
            }
        }
    }

    /// Render the reply sequence for an unparseable line.  Internal
    /// verbs additionally answer `NACK`; the session always continues.
    async fn reject<W>(&mut self, err: ParseError, w: &mut W) -> Result<Flow, BoardError>
    where
        W: AsyncWrite + Unpin,
    {
        match err {
            ParseError::UnknownVerb { .. } if err.is_sync() => {
                send_line(w, INVALID_MESSAGE).await?;
                send_line(w, "NACK").await?;
                send_line(w, ARGS_ERROR).await?;
            }
            ParseError::UnknownVerb { .. } => {
                send_line(w, INVALID_MESSAGE).await?;
            }
            ParseError::BadArity { .. } if err.is_sync() => {
                if self.txn.is_none() {
                    send_line(w, WRITE_ERROR).await?;
                }
                send_line(w, "NACK").await?;
                send_line(w, ARGS_ERROR).await?;
            }
            ParseError::BadArity { .. } => {
                send_line(w, ARGS_ERROR).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn cmd_user<W>(&mut self, name: String, w: &mut W) -> Result<Flow, BoardError>
    where
        W: AsyncWrite + Unpin,
    {
        if name.contains('/') || name == NONAME {
            send_line(w, "2.2 ERROR USER Invalid username").await?;
        } else if self.user.is_some() {
            send_line(w, "2.2 ERROR USER Already registered").await?;
        } else {
            let name = store::clip(&name, store::USER_MAX).to_string();
            send_line(w, &format!("1.0 Hello {name}, Welcome to Bulletin Board")).await?;
            self.user = Some(name);
        }
        Ok(Flow::Continue)
    }

    async fn cmd_read<W>(
        &mut self,
        node: &Arc<Node>,
        raw: String,
        w: &mut W,
    ) -> Result<Flow, BoardError>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(id) = parse_id(&raw) else {
            send_line(w, ARGS_ERROR).await?;
            return Ok(Flow::Continue);
        };

        let found = {
            let board = node.store.read().await;
            if node.config.debug {
                debug!(id, "reading record slowly");
                tokio::time::sleep(replicate::READ_DELAY).await;
            }
            board.read(id)
        };

        match found {
            Some(rec) => {
                send_line(w, &format!("2.0 MESSAGE {id} {}/{}", rec.user, rec.message)).await?
            }
            None => send_line(w, &format!("2.1 UNKNOWN {raw} No such message")).await?,
        }
        Ok(Flow::Continue)
    }

    async fn cmd_write<W>(
        &mut self,
        node: &Arc<Node>,
        message: String,
        w: &mut W,
    ) -> Result<Flow, BoardError>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(user) = self.user.clone() else {
            send_line(w, WRITE_ERROR).await?;
            return Ok(Flow::Continue);
        };

        match replicate::commit(node, Mutation::Append { user, message }).await {
            Ok(id) => send_line(w, &format!("3.0 WROTE {id}")).await?,
            Err(err) => {
                warn!("write failed: {err}");
                send_line(w, WRITE_ERROR).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn cmd_replace<W>(
        &mut self,
        node: &Arc<Node>,
        raw: String,
        message: String,
        w: &mut W,
    ) -> Result<Flow, BoardError>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(id) = parse_id(&raw) else {
            send_line(w, ARGS_ERROR).await?;
            return Ok(Flow::Continue);
        };
        let Some(user) = self.user.clone() else {
            send_line(w, WRITE_ERROR).await?;
            return Ok(Flow::Continue);
        };

        match replicate::commit(node, Mutation::Replace { id, user, message }).await {
            Ok(id) => send_line(w, &format!("3.0 WROTE {id}")).await?,
            Err(BoardError::NotFound(_)) => {
                send_line(w, &format!("3.1 UNKNOWN {raw}")).await?
            }
            Err(err) => {
                warn!("replace failed: {err}");
                send_line(w, WRITE_ERROR).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn cmd_sync_on<W>(&mut self, node: &Arc<Node>, w: &mut W) -> Result<Flow, BoardError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.txn.is_some() {
            // Transactions do not nest on one connection.
            send_line(w, WRITE_ERROR).await?;
            send_line(w, "NACK").await?;
            send_line(w, ARGS_ERROR).await?;
            return Ok(Flow::Continue);
        }

        debug!("sync on: acquiring exclusive store lock");
        let guard = Arc::clone(&node.store).write_owned().await;
        self.txn = Some(guard);
        send_line(w, "ACK").await?;
        Ok(Flow::Continue)
    }

    async fn cmd_sync_off<W>(&mut self, w: &mut W) -> Result<Flow, BoardError>
    where
        W: AsyncWrite + Unpin,
    {
        match self.txn.take() {
            Some(guard) => {
                debug!("sync off: committing and releasing exclusive store lock");
                drop(guard);
                send_line(w, "ACK").await?;
            }
            None => {
                send_line(w, WRITE_ERROR).await?;
                send_line(w, "NACK").await?;
                send_line(w, ARGS_ERROR).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn cmd_sync_abort<W>(&mut self, w: &mut W) -> Result<Flow, BoardError>
    where
        W: AsyncWrite + Unpin,
    {
        match self.txn.take() {
            Some(mut guard) => {
                debug!("sync abort: reverting last mutation");
                guard.revert();
                drop(guard);
                send_line(w, "ACK").await?;
                send_line(w, &format!("4.0 BYE {}", self.display_user())).await?;
            }
            None => {
                send_line(w, WRITE_ERROR).await?;
                send_line(w, "NACK").await?;
            }
        }
        // Abort always ends the session, accepted or not.
        Ok(Flow::Close)
    }

    async fn cmd_sync_write<W>(
        &mut self,
        node: &Arc<Node>,
        user: String,
        message: String,
        w: &mut W,
    ) -> Result<Flow, BoardError>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(guard) = self.txn.as_mut() else {
            send_line(w, WRITE_ERROR).await?;
            send_line(w, "NACK").await?;
            send_line(w, ARGS_ERROR).await?;
            return Ok(Flow::Continue);
        };

        if node.config.debug {
            tokio::time::sleep(replicate::WRITE_DELAY).await;
        }
        match guard.append(&user, &message) {
            Ok(id) => {
                debug!(id, "applied replicated append");
                send_line(w, "ACK").await?;
            }
            Err(err) => {
                warn!("replicated append failed: {err}");
                send_line(w, "NACK").await?;
                send_line(w, ARGS_ERROR).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn cmd_sync_replace<W>(
        &mut self,
        node: &Arc<Node>,
        raw: String,
        user: String,
        message: String,
        w: &mut W,
    ) -> Result<Flow, BoardError>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(guard) = self.txn.as_mut() else {
            send_line(w, WRITE_ERROR).await?;
            send_line(w, "NACK").await?;
            send_line(w, ARGS_ERROR).await?;
            return Ok(Flow::Continue);
        };

        let Some(id) = parse_id(&raw) else {
            send_line(w, "NACK").await?;
            send_line(w, ARGS_ERROR).await?;
            return Ok(Flow::Continue);
        };

        if node.config.debug {
            tokio::time::sleep(replicate::WRITE_DELAY).await;
        }
        match guard.replace(id, &user, &message) {
            Some(id) => {
                debug!(id, "applied replicated replace");
                send_line(w, "ACK").await?;
            }
            None => {
                send_line(w, "NACK").await?;
                send_line(w, ARGS_ERROR).await?;
            }
        }
        Ok(Flow::Continue)
    }
}

/// Parse a record id: a non-negative integer, nothing trailing.
fn parse_id(raw: &str) -> Option<u32> {
    raw.parse::<u32>().ok()
}

async fn send_line<W>(w: &mut W, line: &str) -> Result<(), BoardError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(line.as_bytes())
        .await
        .map_err(BoardError::Transport)?;
    w.write_all(b"\n").await.map_err(BoardError::Transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
    use tokio::sync::RwLock;
    use tokio::task::JoinHandle;

    struct Client {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        write: WriteHalf<DuplexStream>,
        handle: JoinHandle<Result<(), BoardError>>,
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

        async fn close(mut self) {
            self.write.shutdown().await.unwrap();
            self.handle.await.unwrap().unwrap();
        }
    }

    fn make_node(dir: &tempfile::TempDir) -> Arc<Node> {
        let board = BulletinStore::open(dir.path().join("board.db")).unwrap();
        Arc::new(Node {
            config: Config::default(),
            store: Arc::new(RwLock::new(board)),
            peers: Vec::new(),
        })
    }

    async fn connect(node: &Arc<Node>) -> Client {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let node = Arc::clone(node);
        let handle = tokio::spawn(async move { run(&node, server_end).await });

        let (read, write) = tokio::io::split(client_end);
        let mut client = Client {
            lines: BufReader::new(read).lines(),
            write,
            handle,
        };
        client.expect(GREETING).await;
        client
    }

    #[tokio::test]
    async fn user_registration_and_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let node = make_node(&dir);
        let mut c = connect(&node).await;

        c.send("USER bad/name").await;
        c.expect("2.2 ERROR USER Invalid username").await;
        c.send("USER noname").await;
        c.expect("2.2 ERROR USER Invalid username").await;

        c.send("USER alice").await;
        c.expect("1.0 Hello alice, Welcome to Bulletin Board").await;
        c.send("USER again").await;
        c.expect("2.2 ERROR USER Already registered").await;

        c.send("QUIT").await;
        c.expect("4.0 BYE alice").await;
        c.close().await;
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let node = make_node(&dir);
        let mut c = connect(&node).await;

        c.send("USER bob").await;
        c.expect("1.0 Hello bob, Welcome to Bulletin Board").await;

        c.send("WRITE hello board").await;
        c.expect("3.0 WROTE 1").await;
        c.send("READ 1").await;
        c.expect("2.0 MESSAGE 1 bob/hello board").await;

        c.send("READ 2").await;
        c.expect("2.1 UNKNOWN 2 No such message").await;
        c.send("READ 0").await;
        c.expect("2.1 UNKNOWN 0 No such message").await;

        c.send("QUIT").await;
        c.expect("4.0 BYE bob").await;
        c.close().await;
    }

    #[tokio::test]
    async fn write_requires_registration() {
        let dir = tempfile::tempdir().unwrap();
        let node = make_node(&dir);
        let mut c = connect(&node).await;

        c.send("WRITE sneaky").await;
        c.expect("3.2 ERROR WRITE system error").await;
        assert!(node.store.read().await.is_empty());

        c.send("QUIT").await;
        c.expect("4.0 BYE noname").await;
        c.close().await;
    }

    #[tokio::test]
    async fn replace_unknown_id_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let node = make_node(&dir);
        let mut c = connect(&node).await;

        c.send("USER bob").await;
        c.expect("1.0 Hello bob, Welcome to Bulletin Board").await;

        c.send("REPLACE 9/nothing there").await;
        c.expect("3.1 UNKNOWN 9").await;
        assert!(node.store.read().await.is_empty());

        c.send("WRITE original").await;
        c.expect("3.0 WROTE 1").await;
        c.send("REPLACE 1/updated").await;
        c.expect("3.0 WROTE 1").await;
        c.send("READ 1").await;
        c.expect("2.0 MESSAGE 1 bob/updated").await;

        c.send("QUIT").await;
        c.expect("4.0 BYE bob").await;
        c.close().await;
    }

    #[tokio::test]
    async fn malformed_lines_keep_the_session_alive() {
        let dir = tempfile::tempdir().unwrap();
        let node = make_node(&dir);
        let mut c = connect(&node).await;

        c.send("FROB 1").await;
        c.expect("2.2 ERROR Invalid message").await;

        c.send("READ one").await;
        c.expect("2.2 ERROR Invalid command arguments").await;

        c.send("WRITE a/b").await;
        c.expect("2.2 ERROR Invalid command arguments").await;

        c.send("SYNC_FROB").await;
        c.expect("2.2 ERROR Invalid message").await;
        c.expect("NACK").await;
        c.expect("2.2 ERROR Invalid command arguments").await;

        c.send("QUIT").await;
        c.expect("4.0 BYE noname").await;
        c.close().await;
    }

    #[tokio::test]
    async fn sync_transaction_commits_on_off() {
        let dir = tempfile::tempdir().unwrap();
        let node = make_node(&dir);
        let mut c = connect(&node).await;

        c.send("SYNC_ON").await;
        c.expect("ACK").await;
        c.send("SYNC_WRITE carol/replicated text").await;
        c.expect("ACK").await;
        c.send("SYNC_OFF").await;
        c.expect("ACK").await;

        let rec = node.store.read().await.read(1).unwrap();
        assert_eq!(rec.user, "carol");
        assert_eq!(rec.message, "replicated text");

        c.send("QUIT").await;
        c.expect("4.0 BYE noname").await;
        c.close().await;
    }

    #[tokio::test]
    async fn sync_abort_reverts_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let node = make_node(&dir);
        let mut c = connect(&node).await;

        c.send("SYNC_ON").await;
        c.expect("ACK").await;
        c.send("SYNC_WRITE carol/doomed").await;
        c.expect("ACK").await;
        c.send("SYNC_ABORT").await;
        c.expect("ACK").await;
        c.expect("4.0 BYE noname").await;

        c.handle.await.unwrap().unwrap();
        assert!(node.store.read().await.is_empty());
    }

    #[tokio::test]
    async fn sync_replace_reverts_to_pre_image_on_abort() {
        let dir = tempfile::tempdir().unwrap();
        let node = make_node(&dir);
        node.store.write().await.append("bob", "original").unwrap();

        let mut c = connect(&node).await;
        c.send("SYNC_ON").await;
        c.expect("ACK").await;
        c.send("SYNC_REPLACE 1/mallory/tampered").await;
        c.expect("ACK").await;
        c.send("SYNC_ABORT").await;
        c.expect("ACK").await;
        c.expect("4.0 BYE noname").await;
        c.handle.await.unwrap().unwrap();

        let rec = node.store.read().await.read(1).unwrap();
        assert_eq!(rec.user, "bob");
        assert_eq!(rec.message, "original");
    }

    #[tokio::test]
    async fn sync_state_violations_are_nacked() {
        let dir = tempfile::tempdir().unwrap();
        let node = make_node(&dir);
        let mut c = connect(&node).await;

        c.send("SYNC_OFF").await;
        c.expect("3.2 ERROR WRITE system error").await;
        c.expect("NACK").await;
        c.expect("2.2 ERROR Invalid command arguments").await;

        c.send("SYNC_WRITE bob/too early").await;
        c.expect("3.2 ERROR WRITE system error").await;
        c.expect("NACK").await;
        c.expect("2.2 ERROR Invalid command arguments").await;

        c.send("SYNC_ON").await;
        c.expect("ACK").await;
        c.send("SYNC_ON").await;
        c.expect("3.2 ERROR WRITE system error").await;
        c.expect("NACK").await;
        c.expect("2.2 ERROR Invalid command arguments").await;

        c.send("SYNC_OFF").await;
        c.expect("ACK").await;
        c.send("QUIT").await;
        c.expect("4.0 BYE noname").await;
        c.close().await;
    }

    #[tokio::test]
    async fn sync_replace_unknown_id_is_nacked() {
        let dir = tempfile::tempdir().unwrap();
        let node = make_node(&dir);
        let mut c = connect(&node).await;

        c.send("SYNC_ON").await;
        c.expect("ACK").await;
        c.send("SYNC_REPLACE 7/bob/ghost").await;
        c.expect("NACK").await;
        c.expect("2.2 ERROR Invalid command arguments").await;
        c.send("SYNC_OFF").await;
        c.expect("ACK").await;

        c.send("QUIT").await;
        c.expect("4.0 BYE noname").await;
        c.close().await;
    }

    #[tokio::test]
    async fn long_user_name_is_clipped_at_registration() {
        let dir = tempfile::tempdir().unwrap();
        let node = make_node(&dir);
        let mut c = connect(&node).await;

        let long = "x".repeat(store::USER_MAX + 5);
        c.send(&format!("USER {long}")).await;
        let clipped = "x".repeat(store::USER_MAX);
        c.expect(&format!("1.0 Hello {clipped}, Welcome to Bulletin Board"))
            .await;

        c.send("QUIT").await;
        c.expect(&format!("4.0 BYE {clipped}")).await;
        c.close().await;
    }
}
