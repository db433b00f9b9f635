//! Leader-side replication state.
//!
//! The leader owns a replication id (40 hex chars fixed at startup),
//! a byte offset, a bounded backlog of recent stream bytes, and the
//! registry of attached replicas. Every write command's raw RESP frame
//! is appended here after the write commits; the append order IS the
//! commit order, guaranteed by the server-wide write mutex around
//! execute-plus-propagate.
//!
//! Each replica is fed through a bounded channel drained by its
//! connection task. A replica that stops draining falls behind the
//! channel, gets dropped from the registry, and must resync.

use bytes::Bytes;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Default backlog window: 1 MiB of recent replication bytes.
pub const DEFAULT_BACKLOG_CAPACITY: usize = 1024 * 1024;

struct ReplicaHandle {
    conn_id: u64,
    tx: mpsc::Sender<Bytes>,
    /// Closes the replica's connection when the feed drops it.
    kill: Arc<Notify>,
    ack_offset: u64,
}

struct Backlog {
    bytes: VecDeque<u8>,
    /// Replication offset of `bytes[0]`.
    start_offset: u64,
    capacity: usize,
}

impl Backlog {
    fn push(&mut self, frame: &[u8]) {
        self.bytes.extend(frame.iter().copied());
        while self.bytes.len() > self.capacity {
            self.bytes.pop_front();
            self.start_offset += 1;
        }
    }

    /// The stream suffix starting at `offset`, if still buffered.
    fn suffix_from(&self, offset: u64, end_offset: u64) -> Option<Bytes> {
        if offset < self.start_offset || offset > end_offset {
            return None;
        }
        let skip = (offset - self.start_offset) as usize;
        Some(Bytes::from(
            self.bytes.iter().skip(skip).copied().collect::<Vec<u8>>(),
        ))
    }
}

/// Shared leader replication state.
pub struct ReplicationState {
    replication_id: String,
    offset: AtomicU64,
    inner: Mutex<Inner>,
}

struct Inner {
    backlog: Backlog,
    replicas: Vec<ReplicaHandle>,
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationState {
    pub fn new() -> Self {
        Self::with_backlog_capacity(DEFAULT_BACKLOG_CAPACITY)
    }

    pub fn with_backlog_capacity(capacity: usize) -> Self {
        Self {
            replication_id: generate_replication_id(),
            offset: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                backlog: Backlog {
                    bytes: VecDeque::new(),
                    start_offset: 0,
                    capacity,
                },
                replicas: Vec::new(),
            }),
        }
    }

    /// The 40-hex-char id reported in FULLRESYNC and INFO.
    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    /// Bytes of write stream produced so far.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    pub fn replica_count(&self) -> usize {
        self.inner.lock().unwrap().replicas.len()
    }

    /// Registers a replica's feed channel after a successful PSYNC.
    pub fn register_replica(&self, conn_id: u64, tx: mpsc::Sender<Bytes>, kill: Arc<Notify>) {
        let mut inner = self.inner.lock().unwrap();
        inner.replicas.retain(|r| r.conn_id != conn_id);
        inner.replicas.push(ReplicaHandle {
            conn_id,
            tx,
            kill,
            ack_offset: 0,
        });
        info!(conn = conn_id, total = inner.replicas.len(), "replica attached");
    }

    pub fn remove_replica(&self, conn_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.replicas.len();
        inner.replicas.retain(|r| r.conn_id != conn_id);
        if inner.replicas.len() != before {
            info!(conn = conn_id, "replica detached");
        }
    }

    /// Records a `REPLCONF ACK <offset>` from a replica connection.
    pub fn record_ack(&self, conn_id: u64, offset: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(replica) = inner.replicas.iter_mut().find(|r| r.conn_id == conn_id) {
            replica.ack_offset = offset;
        }
    }

    /// How many replicas have acknowledged at least `offset`.
    pub fn acked_replicas(&self, offset: u64) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .replicas
            .iter()
            .filter(|r| r.ack_offset >= offset)
            .count()
    }

    /// Appends a committed write frame to the stream: advances the
    /// offset, extends the backlog, and feeds every attached replica.
    /// Replicas whose outbox is full or gone are dropped.
    pub fn propagate(&self, frame: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.backlog.push(frame);
        let new_offset = self
            .offset
            .fetch_add(frame.len() as u64, Ordering::SeqCst)
            + frame.len() as u64;

        let payload = Bytes::copy_from_slice(frame);
        inner.replicas.retain(|replica| {
            match replica.tx.try_send(payload.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Fell out of the feed window: it must resync.
                    warn!(
                        conn = replica.conn_id,
                        "replica feed overflow, disconnecting"
                    );
                    replica.kill.notify_one();
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(conn = replica.conn_id, "replica feed closed");
                    false
                }
            }
        });
        debug!(offset = new_offset, bytes = frame.len(), "propagated write");
    }

    /// Attempts a partial resync: the requested id must match ours and
    /// the offset must still be inside the backlog window. Returns the
    /// stream suffix to replay, or `None` to force a full resync.
    pub fn partial_sync(&self, replid: &str, offset: u64) -> Option<Bytes> {
        if replid != self.replication_id {
            return None;
        }
        let end = self.offset();
        let inner = self.inner.lock().unwrap();
        inner.backlog.suffix_from(offset, end)
    }
}

fn generate_replication_id() -> String {
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| char::from_digit(rng.gen_range(0..16u32), 16).unwrap())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_id_shape() {
        let state = ReplicationState::new();
        assert_eq!(state.replication_id().len(), 40);
        assert!(state
            .replication_id()
            .chars()
            .all(|c| c.is_ascii_hexdigit()));

        // Two instances should essentially never collide.
        assert_ne!(
            ReplicationState::new().replication_id(),
            state.replication_id()
        );
    }

    #[test]
    fn propagate_advances_offset() {
        let state = ReplicationState::new();
        assert_eq!(state.offset(), 0);
        state.propagate(b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(state.offset(), 14);
        state.propagate(b"xyz");
        assert_eq!(state.offset(), 17);
    }

    #[tokio::test]
    async fn propagate_feeds_replicas() {
        let state = ReplicationState::new();
        let (tx, mut rx) = mpsc::channel(8);
        state.register_replica(1, tx, Arc::new(Notify::new()));
        assert_eq!(state.replica_count(), 1);

        state.propagate(b"frame-one");
        state.propagate(b"frame-two");
        assert_eq!(rx.recv().await.unwrap(), Bytes::from("frame-one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from("frame-two"));
    }

    #[tokio::test]
    async fn overflowing_replica_is_dropped() {
        let state = ReplicationState::new();
        let (tx, _rx) = mpsc::channel(1);
        state.register_replica(1, tx, Arc::new(Notify::new()));

        state.propagate(b"a");
        state.propagate(b"b"); // outbox full: replica dropped
        assert_eq!(state.replica_count(), 0);
    }

    #[test]
    fn ack_tracking() {
        let state = ReplicationState::new();
        let (tx, _rx) = mpsc::channel(8);
        state.register_replica(7, tx, Arc::new(Notify::new()));

        state.record_ack(7, 100);
        assert_eq!(state.acked_replicas(50), 1);
        assert_eq!(state.acked_replicas(150), 0);
    }

    #[test]
    fn partial_sync_inside_window() {
        let state = ReplicationState::new();
        state.propagate(b"hello ");
        state.propagate(b"world");

        let replid = state.replication_id().to_string();
        assert_eq!(
            state.partial_sync(&replid, 0).unwrap(),
            Bytes::from("hello world")
        );
        assert_eq!(
            state.partial_sync(&replid, 6).unwrap(),
            Bytes::from("world")
        );
        assert_eq!(
            state.partial_sync(&replid, 11).unwrap(),
            Bytes::from("")
        );

        // Wrong id or out-of-range offset falls back to full resync.
        assert!(state.partial_sync("0000", 0).is_none());
        assert!(state.partial_sync(&replid, 999).is_none());
    }

    #[test]
    fn backlog_evicts_old_bytes() {
        let state = ReplicationState::with_backlog_capacity(8);
        state.propagate(b"0123456789"); // 10 bytes into an 8-byte window

        let replid = state.replication_id().to_string();
        assert!(state.partial_sync(&replid, 0).is_none());
        assert_eq!(
            state.partial_sync(&replid, 2).unwrap(),
            Bytes::from("23456789")
        );
    }
}
