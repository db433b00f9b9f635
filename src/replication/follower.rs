//! Follower-side replication: handshake, snapshot ingest, and the
//! silent apply loop.
//!
//! A server started with `--replicaof host port` opens one outbound
//! connection to its leader and walks the PSYNC handshake:
//!
//! ```text
//! PING                        -> +PONG
//! REPLCONF listening-port <p> -> +OK
//! REPLCONF capa psync2        -> +OK
//! PSYNC ? -1                  -> +FULLRESYNC <replid> <offset>
//!                                $<len>\r\n<rdb bytes>   (no CRLF)
//! ```
//!
//! After loading the dump it decodes RESP frames forever, applying
//! each as a local write without emitting replies. The only frames it
//! answers are `REPLCONF GETACK *`, with `REPLCONF ACK <offset>`
//! counting the bytes processed before the GETACK itself. If the link
//! drops, the follower reconnects and full-resyncs from scratch.

use crate::commands::CommandHandler;
use crate::persistence::rdb;
use crate::protocol::{encode_command_str, ParseError, RespParser, RespValue};
use crate::storage::StorageEngine;
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("replication protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Rdb(#[from] rdb::RdbError),
}

/// Where the leader lives and what we tell it about ourselves.
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    pub leader_host: String,
    pub leader_port: u16,
    pub listening_port: u16,
}

/// Spawns the follower task. It reconnects with a fixed backoff for
/// the life of the process; each reconnect discards local state via a
/// fresh full resync.
pub fn spawn(
    config: FollowerConfig,
    engine: Arc<StorageEngine>,
    handler: CommandHandler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match run_once(&config, &engine, &handler).await {
                Ok(()) => info!("replication link closed cleanly"),
                Err(err) => warn!(error = %err, "replication link failed"),
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            info!(
                leader = %format!("{}:{}", config.leader_host, config.leader_port),
                "reconnecting to leader"
            );
        }
    })
}

async fn run_once(
    config: &FollowerConfig,
    engine: &Arc<StorageEngine>,
    handler: &CommandHandler,
) -> Result<(), ReplicationError> {
    let address = format!("{}:{}", config.leader_host, config.leader_port);
    let stream = TcpStream::connect(&address).await?;
    info!(leader = %address, "connected to leader");
    let mut link = Link::new(stream);

    // Handshake.
    link.send(&encode_command_str(&["PING"])).await?;
    link.expect_simple("PONG").await?;

    let port = config.listening_port.to_string();
    link.send(&encode_command_str(&[
        "REPLCONF",
        "listening-port",
        &port,
    ]))
    .await?;
    link.expect_simple("OK").await?;

    link.send(&encode_command_str(&["REPLCONF", "capa", "psync2"]))
        .await?;
    link.expect_simple("OK").await?;

    link.send(&encode_command_str(&["PSYNC", "?", "-1"])).await?;
    let (frame, _) = link.read_frame().await?;
    let mut offset = match frame {
        RespValue::SimpleString(line) if line.starts_with("FULLRESYNC") => {
            let mut parts = line.split_whitespace();
            let _keyword = parts.next();
            let replid = parts
                .next()
                .ok_or_else(|| ReplicationError::Protocol("FULLRESYNC missing id".into()))?;
            let offset: u64 = parts
                .next()
                .and_then(|o| o.parse().ok())
                .ok_or_else(|| ReplicationError::Protocol("FULLRESYNC missing offset".into()))?;
            info!(replid, offset, "full resync granted");
            offset
        }
        other => {
            return Err(ReplicationError::Protocol(format!(
                "expected FULLRESYNC, got {:?}",
                other
            )))
        }
    };

    // Snapshot transfer, then swap it in wholesale.
    let payload = link.read_rdb_payload().await?;
    let entries = rdb::parse(&payload)?;
    let loaded = entries.len();
    engine.load(entries);
    handler.set_follower_offset(offset);
    info!(keys = loaded, "loaded leader snapshot");

    // Command stream: apply writes silently, answer only GETACK.
    loop {
        let (frame, consumed) = link.read_frame().await?;

        if is_getack(&frame) {
            let ack = encode_command_str(&["REPLCONF", "ACK", &offset.to_string()]);
            link.send(&ack).await?;
            debug!(offset, "acknowledged leader");
        } else {
            handler.apply_replicated(frame).await;
        }

        offset += consumed as u64;
        handler.set_follower_offset(offset);
    }
}

fn is_getack(frame: &RespValue) -> bool {
    let args = match frame.as_array() {
        Some(args) => args,
        None => return false,
    };
    let word = |index: usize, expected: &str| {
        args.get(index)
            .and_then(|a| a.as_str())
            .map(|s| s.eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    };
    word(0, "REPLCONF") && word(1, "GETACK")
}

/// Buffered framing over the leader connection.
struct Link {
    stream: TcpStream,
    buf: BytesMut,
    parser: RespParser,
}

impl Link {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(16 * 1024),
            parser: RespParser::new(),
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), ReplicationError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn fill(&mut self) -> Result<(), ReplicationError> {
        let n = self.stream.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(ReplicationError::Protocol(
                "connection closed by leader".into(),
            ));
        }
        Ok(())
    }

    /// Reads one complete RESP frame, returning its wire length so the
    /// caller can advance its replication offset.
    async fn read_frame(&mut self) -> Result<(RespValue, usize), ReplicationError> {
        loop {
            if !self.buf.is_empty() {
                if let Some((frame, consumed)) = self.parser.parse(&self.buf)? {
                    self.buf.advance(consumed);
                    return Ok((frame, consumed));
                }
            }
            self.fill().await?;
        }
    }

    async fn expect_simple(&mut self, expected: &str) -> Result<(), ReplicationError> {
        let (frame, _) = self.read_frame().await?;
        match frame {
            RespValue::SimpleString(s) if s.eq_ignore_ascii_case(expected) => Ok(()),
            other => Err(ReplicationError::Protocol(format!(
                "expected +{}, got {:?}",
                expected, other
            ))),
        }
    }

    /// Reads the `$<len>\r\n<bytes>` snapshot framing. Unlike a bulk
    /// string there is no trailing CRLF.
    async fn read_rdb_payload(&mut self) -> Result<Bytes, ReplicationError> {
        let header_end = loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                break pos;
            }
            self.fill().await?;
        };

        let header = self.buf.split_to(header_end + 2);
        if header.first() != Some(&b'$') {
            return Err(ReplicationError::Protocol(
                "expected $ before RDB payload".into(),
            ));
        }
        let len: usize = std::str::from_utf8(&header[1..header.len() - 2])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ReplicationError::Protocol("bad RDB length".into()))?;

        while self.buf.len() < len {
            self.fill().await?;
        }
        Ok(self.buf.split_to(len).freeze())
    }
}
