//! # CoolCache
//!
//! An in-memory key-value server speaking a subset of the Redis wire
//! protocol: strings, lists, sets, hashes, sorted sets and streams,
//! optional key expiry, publish/subscribe, leader → follower
//! replication, and RDB snapshot persistence with scheduled background
//! saves.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            CoolCache                             │
//! │                                                                  │
//! │  ┌──────────┐   ┌─────────────┐   ┌────────────┐   ┌──────────┐  │
//! │  │ Listener │──>│ Connection  │──>│  Command   │──>│ Storage  │  │
//! │  │ (server) │   │    Loop     │   │ Dispatcher │   │  Engine  │  │
//! │  └──────────┘   └──────┬──────┘   └─────┬──────┘   └────┬─────┘  │
//! │                        │                │               │        │
//! │                 ┌──────┴─────┐   ┌──────┴──────┐  ┌─────┴─────┐  │
//! │                 │ PubSub Hub │   │ Replication │  │ Snapshot  │  │
//! │                 │ (fan-out)  │   │ (log+feeds) │  │ Manager   │  │
//! │                 └────────────┘   └─────────────┘  └───────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Control flow: the connection loop reads bytes, the RESP parser cuts
//! frames, the dispatcher runs a handler against the keyspace, the
//! stream engine or the pub/sub hub; successful writes are appended to
//! the replication log and counted toward the auto-save schedule.
//!
//! ## Concurrency contract
//!
//! - One `RwLock` guards the keyspace; every write command is applied
//!   atomically.
//! - A server-wide write mutex spans execute-plus-propagate, so the
//!   replication log order equals the commit order.
//! - BGSAVE captures a structural clone under the read lock and
//!   serializes it off the command path.
//! - Blocked XREADs park on a wakeup fired by XADD; pub/sub delivery
//!   rides bounded per-connection outboxes.
//!
//! ## Module overview
//!
//! - [`protocol`]: RESP frame types and the incremental parser
//! - [`storage`]: the typed keyspace with TTL, streams, the sweeper
//! - [`commands`]: dispatch table and command handlers
//! - [`connection`]: per-connection state machine and I/O driver
//! - [`pubsub`]: channel → subscriber fan-out
//! - [`persistence`]: RDB codec, CRC64, LZF, snapshot scheduling
//! - [`replication`]: leader log and follower client
//! - [`server`]: shared context, startup, accept loop

pub mod commands;
pub mod connection;
pub mod persistence;
pub mod protocol;
pub mod pubsub;
pub mod replication;
pub mod server;
pub mod storage;

pub use commands::CommandHandler;
pub use connection::handle_connection;
pub use protocol::{ParseError, RespParser, RespValue};
pub use server::{Server, ServerConfig, ServerStats};
pub use storage::{start_expiry_sweeper, StorageEngine};

/// The default port (same as Redis).
pub const DEFAULT_PORT: u16 = 6379;

/// Crate version, reported by INFO.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
