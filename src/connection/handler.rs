//! Per-connection state machine and I/O driver.
//!
//! Each accepted socket gets one task running the loop here:
//! read → decode → dispatch → encode reply → flush. TCP is a byte
//! stream, so a `BytesMut` accumulates partial frames and pipelined
//! batches alike.
//!
//! A connection is always in one of three modes:
//!
//! - **Normal**: request/reply.
//! - **Subscribed**: entered on the first SUBSCRIBE; only
//!   (UN)SUBSCRIBE / PING / QUIT are accepted, and `message` frames
//!   pushed by publishers arrive through the connection's outbox.
//! - **ReplicaLeader**: entered after a successful PSYNC; the outbox
//!   carries the replication feed and the only frames read back are
//!   `REPLCONF ACK`s.
//!
//! The outbox is a bounded channel drained by the same `select!` loop
//! that reads the socket, so pushes interleave cleanly with replies.

use crate::commands::{CommandHandler, CommandOutcome};
use crate::protocol::{ParseError, RespParser, RespValue};
use crate::server::ServerContext;
use bytes::{Bytes, BytesMut};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

/// Upper bound for buffered, still-unparsed input.
const MAX_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity.
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Outbox depth per connection; overflowing it marks the connection
/// as too slow (pub/sub) or lagging (replica feed).
pub const OUTBOX_CAPACITY: usize = 1024;

/// The connection's dispatch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Normal,
    Subscribed,
    ReplicaLeader,
}

/// Per-connection state visible to command handlers.
pub struct Session {
    pub id: u64,
    pub mode: SessionMode,
    pub subscriptions: HashSet<Bytes>,
    /// Pre-encoded frames pushed by pub/sub or the replication feed.
    pub outbox_tx: mpsc::Sender<Bytes>,
    /// Fired by the hub when this connection must be closed.
    pub kill: Arc<Notify>,
    /// CLIENT SETNAME.
    pub name: Option<Bytes>,
}

impl Session {
    pub fn new(id: u64, outbox_tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            mode: SessionMode::Normal,
            subscriptions: HashSet::new(),
            outbox_tx,
            kill: Arc::new(Notify::new()),
            name: None,
        }
    }

    /// A detached session for unit tests; its outbox has no reader.
    pub fn for_tests(id: u64) -> Self {
        let (tx, _rx) = mpsc::channel(OUTBOX_CAPACITY);
        Self::new(id, tx)
    }

    pub fn is_subscribed(&self) -> bool {
        self.mode == SessionMode::Subscribed
    }

    pub fn enter_subscribed(&mut self) {
        if self.mode == SessionMode::Normal {
            self.mode = SessionMode::Subscribed;
        }
    }

    pub fn leave_subscribed(&mut self) {
        if self.mode == SessionMode::Subscribed {
            self.mode = SessionMode::Normal;
        }
    }

    pub fn enter_replica_stream(&mut self) {
        self.mode = SessionMode::ReplicaLeader;
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Parse(#[from] ParseError),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("input buffer limit exceeded")]
    BufferFull,

    #[error("connection closed by server")]
    Killed,

    #[error("client sent QUIT")]
    Quit,
}

/// Drives one client connection to completion.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    parser: RespParser,
    handler: CommandHandler,
    ctx: Arc<ServerContext>,
    session: Session,
    outbox_rx: mpsc::Receiver<Bytes>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        handler: CommandHandler,
        ctx: Arc<ServerContext>,
    ) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let session = Session::new(ctx.next_conn_id(), outbox_tx);
        ctx.stats.client_connected();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: RespParser::new(),
            handler,
            ctx,
            session,
            outbox_rx,
        }
    }

    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, conn = self.session.id, "client connected");

        let result = self.main_loop().await;
        match &result {
            Ok(()) | Err(ConnectionError::Quit) | Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, "client disconnected")
            }
            Err(ConnectionError::Io(err))
                if err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "connection reset by client")
            }
            Err(err) => warn!(client = %self.addr, error = %err, "connection error"),
        }

        // Teardown: no dangling subscriptions or replica feeds.
        self.ctx.pubsub.unsubscribe_all(self.session.id);
        self.ctx.repl.remove_replica(self.session.id);
        self.ctx.stats.client_disconnected();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            self.drain_parsed_frames().await?;

            if self.buffer.len() >= MAX_BUFFER_SIZE {
                return Err(ConnectionError::BufferFull);
            }
            if self.buffer.capacity() - self.buffer.len() < 1024 {
                self.buffer.reserve(INITIAL_BUFFER_SIZE);
            }

            tokio::select! {
                read = self.stream.get_mut().read_buf(&mut self.buffer) => {
                    let n = read?;
                    if n == 0 {
                        if self.buffer.is_empty() {
                            return Err(ConnectionError::ClientDisconnected);
                        }
                        return Err(ConnectionError::UnexpectedEof);
                    }
                    trace!(client = %self.addr, bytes = n, "read data");
                }
                pushed = self.outbox_rx.recv() => {
                    match pushed {
                        Some(frame) => self.write_bytes(&frame).await?,
                        None => return Err(ConnectionError::Killed),
                    }
                }
                _ = self.session.kill.notified() => {
                    debug!(client = %self.addr, "killed by server");
                    return Err(ConnectionError::Killed);
                }
            }
        }
    }

    /// Processes every complete frame currently buffered.
    async fn drain_parsed_frames(&mut self) -> Result<(), ConnectionError> {
        loop {
            if self.buffer.is_empty() {
                return Ok(());
            }
            let (frame, consumed) = match self.parser.parse(&self.buffer) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => return Ok(()),
                Err(err) => {
                    // Best-effort error reply, then fail the connection.
                    let reply = RespValue::error(format!("ERR Protocol error: {}", err));
                    let _ = self.write_bytes(&reply.serialize()).await;
                    return Err(err.into());
                }
            };
            let raw = self.buffer.split_to(consumed).freeze();

            if self.session.mode == SessionMode::ReplicaLeader {
                // Inbound traffic from an attached replica is ACKs
                // only; everything else is noise we drop.
                let _ = self
                    .handler
                    .execute(frame, raw, &mut self.session)
                    .await;
                continue;
            }

            match self.handler.execute(frame, raw, &mut self.session).await {
                CommandOutcome::Reply(reply) => {
                    self.write_bytes(&reply.serialize()).await?;
                }
                CommandOutcome::MultiReply(replies) => {
                    let mut out = Vec::new();
                    for reply in replies {
                        reply.serialize_into(&mut out);
                    }
                    self.write_bytes(&out).await?;
                }
                CommandOutcome::NoReply => {}
                CommandOutcome::StartReplicaStream { preamble } => {
                    self.write_bytes(&preamble).await?;
                    info!(client = %self.addr, conn = self.session.id, "replica stream started");
                }
                CommandOutcome::Quit(reply) => {
                    self.write_bytes(&reply.serialize()).await?;
                    return Err(ConnectionError::Quit);
                }
            }
        }
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Entry point used by the accept loop.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: CommandHandler,
    ctx: Arc<ServerContext>,
) {
    let connection = ConnectionHandler::new(stream, addr, handler, ctx);
    let _ = connection.run().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Server, ServerConfig};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn spawn_server() -> std::net::SocketAddr {
        let config = ServerConfig {
            port: 0,
            dir: std::env::temp_dir(),
            dbfilename: format!("coolcache-conn-test-{}.rdb", rand::random::<u64>()),
            replicaof: None,
        };
        let server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    async fn read_reply(client: &mut TcpStream) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn ping_pong() {
        let addr = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn set_then_get() {
        let addr = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n")
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n")
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, b"$3\r\nbar\r\n");
    }

    #[tokio::test]
    async fn pipelined_commands_all_answered() {
        let addr = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(
                b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n\
                  *3\r\n$3\r\nSET\r\n$2\r\nk2\r\n$2\r\nv2\r\n\
                  *2\r\n$3\r\nGET\r\n$2\r\nk1\r\n",
            )
            .await
            .unwrap();

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while collected.len() < b"+OK\r\n+OK\r\n$2\r\nv1\r\n".len()
            && tokio::time::Instant::now() < deadline
        {
            let mut buf = vec![0u8; 256];
            match tokio::time::timeout(Duration::from_millis(200), client.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => collected.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        assert_eq!(collected, b"+OK\r\n+OK\r\n$2\r\nv1\r\n");
    }

    #[tokio::test]
    async fn inline_commands_accepted() {
        let addr = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"PING\r\n").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn subscribe_then_publish_delivers() {
        let addr = spawn_server().await;

        let mut subscriber = TcpStream::connect(addr).await.unwrap();
        subscriber
            .write_all(b"*2\r\n$9\r\nSUBSCRIBE\r\n$2\r\nch\r\n")
            .await
            .unwrap();
        assert_eq!(
            read_reply(&mut subscriber).await,
            b"*3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n"
        );

        let mut publisher = TcpStream::connect(addr).await.unwrap();
        publisher
            .write_all(b"*3\r\n$7\r\nPUBLISH\r\n$2\r\nch\r\n$2\r\nhi\r\n")
            .await
            .unwrap();
        assert_eq!(read_reply(&mut publisher).await, b":1\r\n");

        assert_eq!(
            read_reply(&mut subscriber).await,
            b"*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$2\r\nhi\r\n"
        );
    }

    #[tokio::test]
    async fn subscriber_mode_rejects_writes() {
        let addr = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*2\r\n$9\r\nSUBSCRIBE\r\n$2\r\nch\r\n")
            .await
            .unwrap();
        let _ = read_reply(&mut client).await;

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .await
            .unwrap();
        let reply = read_reply(&mut client).await;
        assert!(reply.starts_with(b"-ERR Can't execute 'set'"));
    }

    #[tokio::test]
    async fn quit_closes_connection() {
        let addr = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n$4\r\nQUIT\r\n").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"+OK\r\n");

        // Server closes: next read returns EOF.
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("server did not close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn expired_key_scenario() {
        let addr = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*5\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n$2\r\nPX\r\n$3\r\n100\r\n")
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n")
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, b"$3\r\nbar\r\n");

        tokio::time::sleep(Duration::from_millis(150)).await;
        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n")
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, b"$-1\r\n");

        client.write_all(b"*1\r\n$6\r\nDBSIZE\r\n").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b":0\r\n");
    }
}
