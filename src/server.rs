//! Server wiring: shared state, startup, and the accept loop.
//!
//! [`ServerContext`] is the bundle every connection task shares: the
//! keyspace, the pub/sub hub, replication state, the snapshot manager
//! and the mutable settings. One context exists per process, inside an
//! `Arc`.
//!
//! The `write_order` mutex is the serialization point the concurrency
//! contract hangs off: a write command executes and appends to the
//! replication log while holding it, so the replication stream order
//! equals the commit order.

use crate::commands::CommandHandler;
use crate::connection::handle_connection;
use crate::persistence::{self, SavePoint, SnapshotManager};
use crate::pubsub::PubSubHub;
use crate::replication::{follower, FollowerConfig, ReplicationState};
use crate::storage::{start_expiry_sweeper, StorageEngine};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Whether this process leads or follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower { host: String, port: u16 },
}

/// Process-wide counters shaped around what INFO reports: client
/// traffic plus replication activity.
#[derive(Debug, Default)]
pub struct ServerStats {
    connections_received: AtomicU64,
    connected_clients: AtomicU64,
    commands_processed: AtomicU64,
    write_commands: AtomicU64,
    full_syncs: AtomicU64,
}

impl ServerStats {
    pub fn client_connected(&self) {
        self.connections_received.fetch_add(1, Ordering::Relaxed);
        self.connected_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.connected_clients.fetch_sub(1, Ordering::Relaxed);
    }

    /// Counts a dispatched command, splitting out writes so INFO can
    /// report the write share of the workload.
    pub fn command_processed(&self, is_write: bool) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
        if is_write {
            self.write_commands.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counts a FULLRESYNC granted to a replica.
    pub fn full_sync_performed(&self) {
        self.full_syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_received(&self) -> u64 {
        self.connections_received.load(Ordering::Relaxed)
    }

    pub fn connected_clients(&self) -> u64 {
        self.connected_clients.load(Ordering::Relaxed)
    }

    pub fn commands_processed(&self) -> u64 {
        self.commands_processed.load(Ordering::Relaxed)
    }

    pub fn write_commands(&self) -> u64 {
        self.write_commands.load(Ordering::Relaxed)
    }

    pub fn full_syncs(&self) -> u64 {
        self.full_syncs.load(Ordering::Relaxed)
    }
}

/// Settings mutable at runtime through CONFIG SET.
#[derive(Debug, Clone)]
pub struct Settings {
    pub dir: PathBuf,
    pub dbfilename: String,
    pub save_points: Vec<SavePoint>,
}

impl Settings {
    pub fn rdb_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }
}

/// Everything a connection needs, shared process-wide.
pub struct ServerContext {
    pub engine: Arc<StorageEngine>,
    pub pubsub: Arc<PubSubHub>,
    pub repl: Arc<ReplicationState>,
    pub snapshots: Arc<SnapshotManager>,
    pub settings: RwLock<Settings>,
    pub role: Role,
    pub port: u16,
    pub stats: ServerStats,
    pub start_time: Instant,

    /// Spans handler-execute plus replication-append for every write.
    pub write_order: Mutex<()>,

    /// This server's own replication offset when running as follower.
    pub follower_offset: AtomicU64,

    next_conn_id: AtomicU64,
}

impl ServerContext {
    pub fn new(port: u16, role: Role, settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::new(StorageEngine::new()),
            pubsub: Arc::new(PubSubHub::new()),
            repl: Arc::new(ReplicationState::new()),
            snapshots: Arc::new(SnapshotManager::new()),
            settings: RwLock::new(settings),
            role,
            port,
            stats: ServerStats::default(),
            start_time: Instant::now(),
            write_order: Mutex::new(()),
            follower_offset: AtomicU64::new(0),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self.role, Role::Follower { .. })
    }

    pub fn rdb_path(&self) -> PathBuf {
        self.settings.read().unwrap().rdb_path()
    }
}

/// Startup parameters from the CLI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub dir: PathBuf,
    pub dbfilename: String,
    pub replicaof: Option<(String, u16)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 6379,
            dir: PathBuf::from("./"),
            dbfilename: "dump.rdb".to_string(),
            replicaof: None,
        }
    }
}

/// A bound server, ready to run.
pub struct Server {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
}

impl Server {
    /// Binds the listener and loads the snapshot from disk. A corrupt
    /// snapshot or an unavailable port is a startup failure.
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Server> {
        let role = match &config.replicaof {
            Some((host, port)) => Role::Follower {
                host: host.clone(),
                port: *port,
            },
            None => Role::Leader,
        };
        let settings = Settings {
            dir: config.dir.clone(),
            dbfilename: config.dbfilename.clone(),
            save_points: persistence::default_save_points(),
        };
        let ctx = ServerContext::new(config.port, role, settings);

        let rdb_path = ctx.rdb_path();
        match persistence::load_file(&rdb_path) {
            Ok(Some(entries)) => {
                info!(path = %rdb_path.display(), keys = entries.len(), "loaded snapshot");
                ctx.engine.load(entries);
            }
            Ok(None) => debug!(path = %rdb_path.display(), "no snapshot on disk, starting empty"),
            Err(err) => {
                error!(path = %rdb_path.display(), error = %err, "snapshot is corrupt");
                anyhow::bail!("cannot load RDB file {}: {}", rdb_path.display(), err);
            }
        }

        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        info!(port = config.port, "listening");
        Ok(Server { ctx, listener })
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts the background tasks and serves connections forever.
    pub async fn run(self) -> anyhow::Result<()> {
        let ctx = self.ctx;

        let _sweeper = start_expiry_sweeper(Arc::clone(&ctx.engine));
        tokio::spawn(autosave_loop(Arc::clone(&ctx)));

        if let Role::Follower { host, port } = ctx.role.clone() {
            let handler = CommandHandler::new(Arc::clone(&ctx));
            follower::spawn(
                FollowerConfig {
                    leader_host: host,
                    leader_port: port,
                    listening_port: ctx.port,
                },
                Arc::clone(&ctx.engine),
                handler,
            );
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let handler = CommandHandler::new(Arc::clone(&ctx));
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        handle_connection(stream, addr, handler, ctx).await;
                    });
                }
                Err(err) => error!(error = %err, "accept failed"),
            }
        }
    }
}

/// The 1 s auto-save tick: kicks off a BGSAVE whenever a schedule
/// point's `(seconds, changes)` condition holds.
async fn autosave_loop(ctx: Arc<ServerContext>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let (points, path) = {
            let settings = ctx.settings.read().unwrap();
            (settings.save_points.clone(), settings.rdb_path())
        };
        if points.is_empty() {
            continue;
        }

        let changes = ctx.engine.changes();
        if ctx.snapshots.autosave_due(&points, changes) && !ctx.snapshots.save_in_progress() {
            info!(changes, "auto-save triggered");
            if let Err(err) = ctx.snapshots.bgsave(&ctx.engine, path) {
                debug!(error = %err, "auto-save skipped");
            }
        }
    }
}
