//! The typed keyspace.
//!
//! One map from key to [`Entry`] holds every datatype the server
//! supports; a single `RwLock` guards it. Each operation takes the
//! lock for its whole critical section, so every write is atomic and
//! readers observe either the pre- or post-state of a concurrent
//! write, never a torn intermediate. The map clones cheaply (values
//! are refcounted `Bytes`), which is what BGSAVE's point-in-time view
//! relies on.
//!
//! Expiry is lazy-first: a read that touches an expired entry removes
//! it and reports the key as absent. The background sweeper in
//! [`super::expiry`] reclaims entries nobody touches.

use crate::storage::stream::{IdSpec, Stream, StreamEntry, StreamError, StreamId};
use crate::storage::value::{HashValue, ScoreBound, SortedSet, Value};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Notify;

/// Milliseconds since the unix epoch.
///
/// Expiry timestamps use wall-clock milliseconds (not `Instant`) so
/// they survive RDB round-trips and replication unchanged.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Errors surfaced by keyspace operations. The `Display` strings are
/// the exact RESP error payloads clients receive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR value is not a valid float")]
    NotFloat,

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("ERR index out of range")]
    OutOfRange,

    #[error("{0}")]
    Stream(#[from] StreamError),
}

/// A keyspace record: a value plus its optional expiry time.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    /// Unix-epoch milliseconds; `None` means the key never expires.
    pub expires_at: Option<u64>,
}

impl Entry {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    pub fn with_expiry(value: Value, expires_at: Option<u64>) -> Self {
        Self { value, expires_at }
    }

    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Options for the SET command.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Absolute expiry in unix ms (from EX / PX).
    pub expires_at: Option<u64>,
    /// KEEPTTL: retain the previous expiry on overwrite.
    pub keep_ttl: bool,
    /// NX: only create.
    pub if_absent: bool,
    /// XX: only overwrite.
    pub if_present: bool,
}

/// Modifiers for ZADD.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZaddOptions {
    pub nx: bool,
    pub xx: bool,
    pub gt: bool,
    pub lt: bool,
    pub ch: bool,
    pub incr: bool,
}

/// The result of a ZADD: a count, or the new score under INCR
/// (`None` when a condition blocked the update).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZaddOutcome {
    Count(i64),
    Incr(Option<f64>),
}

/// Counters reported by INFO.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    pub keys: usize,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
    pub expired: u64,
}

/// What one expiry sampling round observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Volatile entries examined this round.
    pub sampled: usize,
    /// Entries that were expired and got removed.
    pub removed: usize,
}

/// The shared keyspace. Wrap in an `Arc` and hand a clone to every
/// connection task.
pub struct StorageEngine {
    data: RwLock<HashMap<Bytes, Entry>>,

    /// Write commands applied since the last completed save.
    change_counter: AtomicU64,

    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,

    /// Wakes every blocked XREAD on any XADD; waiters re-check their
    /// own streams.
    xadd_notify: Arc<Notify>,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("keys", &self.data.read().unwrap().len())
            .field("changes", &self.change_counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            change_counter: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
            xadd_notify: Arc::new(Notify::new()),
        }
    }

    // ========================================================================
    // Change counter & stats
    // ========================================================================

    /// Records one successful write command (consulted by auto-save).
    pub fn mark_write(&self) {
        self.change_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn changes(&self) -> u64 {
        self.change_counter.load(Ordering::Relaxed)
    }

    /// Subtracts the changes captured by a completed save, leaving
    /// writes that raced the save still pending.
    pub fn subtract_changes(&self, saved: u64) {
        let mut current = self.change_counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(saved);
            match self.change_counter.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.dbsize(),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    /// Runs `f` on the live (non-expired) entry for `key` under the
    /// read lock. Expired entries are purged and report as absent.
    fn with_live<R>(&self, key: &[u8], f: impl FnOnce(&Entry) -> R) -> Option<R> {
        {
            let data = self.data.read().unwrap();
            match data.get(key) {
                Some(entry) if !entry.is_expired(now_ms()) => return Some(f(entry)),
                Some(_) => {}
                None => return None,
            }
        }
        self.purge_expired(key);
        None
    }

    /// Removes `key` if its entry has expired.
    fn purge_expired(&self, key: &[u8]) {
        let mut data = self.data.write().unwrap();
        if let Some(entry) = data.get(key) {
            if entry.is_expired(now_ms()) {
                data.remove(key);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drops an expired entry under an already-held write lock so the
    /// caller sees the key as absent.
    fn evict_if_expired(&self, data: &mut HashMap<Bytes, Entry>, key: &[u8], now: u64) {
        if let Some(entry) = data.get(key) {
            if entry.is_expired(now) {
                data.remove(key);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ========================================================================
    // Generic key commands
    // ========================================================================

    /// Deletes keys; returns how many existed.
    pub fn del(&self, keys: &[Bytes]) -> u64 {
        self.del_count.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        let mut deleted = 0;
        for key in keys {
            self.evict_if_expired(&mut data, key, now);
            if data.remove(key).is_some() {
                deleted += 1;
            }
        }
        deleted
    }

    /// Counts how many of the given keys exist (with repetition).
    pub fn exists(&self, keys: &[Bytes]) -> u64 {
        keys.iter()
            .filter(|key| self.with_live(key, |_| ()).is_some())
            .count() as u64
    }

    /// The TYPE of a key: `string`, `list`, ... or `none`.
    pub fn key_type(&self, key: &[u8]) -> &'static str {
        self.with_live(key, |entry| entry.value.type_name())
            .unwrap_or("none")
    }

    /// All live keys matching a glob pattern.
    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        let glob = GlobPattern::new(pattern);
        let now = now_ms();
        let data = self.data.read().unwrap();
        data.iter()
            .filter(|(key, entry)| !entry.is_expired(now) && glob.matches(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Sets an absolute expiry on an existing key. Returns `false` if
    /// the key does not exist.
    pub fn expire_at(&self, key: &[u8], at_ms: u64) -> bool {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);
        match data.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(at_ms);
                true
            }
            None => false,
        }
    }

    /// Remaining lifetime in milliseconds: `-2` if the key is absent,
    /// `-1` if it has no expiry.
    pub fn pttl(&self, key: &[u8]) -> i64 {
        self.with_live(key, |entry| match entry.expires_at {
            Some(at) => at.saturating_sub(now_ms()) as i64,
            None => -1,
        })
        .unwrap_or(-2)
    }

    /// The number of live keys. Scans the map, so expired-but-unswept
    /// entries are not counted.
    pub fn dbsize(&self) -> usize {
        let now = now_ms();
        let data = self.data.read().unwrap();
        data.values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn flush_all(&self) {
        let mut data = self.data.write().unwrap();
        data.clear();
    }

    /// Removes every expired entry in one pass (FLUSH-scale cleanup;
    /// the background sweeper prefers [`Self::sweep_expired_sample`]).
    pub fn cleanup_expired(&self) -> u64 {
        let now = now_ms();
        let mut data = self.data.write().unwrap();
        let before = data.len();
        data.retain(|_, entry| !entry.is_expired(now));
        let removed = (before - data.len()) as u64;
        if removed > 0 {
            self.expired_count.fetch_add(removed, Ordering::Relaxed);
        }
        removed
    }

    /// Examines up to `limit` volatile entries (those carrying an
    /// expiry) and removes the dead ones. The ratio of removed to
    /// sampled tells the sweeper whether the keyspace is still dirty
    /// enough to warrant another round this cycle.
    pub fn sweep_expired_sample(&self, limit: usize) -> SweepOutcome {
        let now = now_ms();
        let mut data = self.data.write().unwrap();

        let mut sampled = 0;
        let mut dead: Vec<Bytes> = Vec::new();
        for (key, entry) in data.iter() {
            if entry.expires_at.is_none() {
                continue;
            }
            sampled += 1;
            if entry.is_expired(now) {
                dead.push(key.clone());
            }
            if sampled >= limit {
                break;
            }
        }
        for key in &dead {
            data.remove(key);
        }
        if !dead.is_empty() {
            self.expired_count
                .fetch_add(dead.len() as u64, Ordering::Relaxed);
        }

        SweepOutcome {
            sampled,
            removed: dead.len(),
        }
    }

    // ========================================================================
    // String commands
    // ========================================================================

    /// SET with its modifiers. Returns `false` when NX/XX skipped the
    /// write.
    pub fn set(&self, key: Bytes, value: Bytes, opts: SetOptions) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, &key, now);

        let existing = data.get(&key);
        if opts.if_absent && existing.is_some() {
            return false;
        }
        if opts.if_present && existing.is_none() {
            return false;
        }

        let expires_at = if opts.keep_ttl {
            existing.and_then(|e| e.expires_at)
        } else {
            opts.expires_at
        };

        data.insert(key, Entry::with_expiry(Value::Str(value), expires_at));
        true
    }

    /// GET: `None` if absent or expired.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.with_live(key, |entry| match &entry.value {
            Value::Str(s) => Ok(s.clone()),
            _ => Err(StoreError::WrongType),
        })
        .transpose()
    }

    /// INCR / DECR / INCRBY / DECRBY. Creates the key at 0 if absent.
    pub fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64, StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        let current = match data.get(key) {
            Some(entry) => match &entry.value {
                Value::Str(s) => std::str::from_utf8(s)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or(StoreError::NotInteger)?,
                _ => return Err(StoreError::WrongType),
            },
            None => 0,
        };

        let next = current.checked_add(delta).ok_or(StoreError::NotInteger)?;
        let text = Bytes::from(next.to_string());
        match data.get_mut(key) {
            Some(entry) => entry.value = Value::Str(text),
            None => {
                data.insert(Bytes::copy_from_slice(key), Entry::new(Value::Str(text)));
            }
        }
        Ok(next)
    }

    /// APPEND: returns the new string length.
    pub fn append(&self, key: &[u8], suffix: &[u8]) -> Result<usize, StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        match data.get_mut(key) {
            Some(entry) => match &entry.value {
                Value::Str(s) => {
                    let mut combined = Vec::with_capacity(s.len() + suffix.len());
                    combined.extend_from_slice(s);
                    combined.extend_from_slice(suffix);
                    let len = combined.len();
                    entry.value = Value::Str(Bytes::from(combined));
                    Ok(len)
                }
                _ => Err(StoreError::WrongType),
            },
            None => {
                data.insert(
                    Bytes::copy_from_slice(key),
                    Entry::new(Value::Str(Bytes::copy_from_slice(suffix))),
                );
                Ok(suffix.len())
            }
        }
    }

    /// STRLEN: 0 for a missing key.
    pub fn strlen(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::Str(s) => Ok(s.len()),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(0))
    }

    /// MSET: unconditional multi-key set.
    pub fn mset(&self, pairs: Vec<(Bytes, Bytes)>) {
        self.set_count.fetch_add(pairs.len() as u64, Ordering::Relaxed);
        let mut data = self.data.write().unwrap();
        for (key, value) in pairs {
            data.insert(key, Entry::new(Value::Str(value)));
        }
    }

    /// MGET: per-key values; wrong-typed keys report as nil.
    pub fn mget(&self, keys: &[Bytes]) -> Vec<Option<Bytes>> {
        keys.iter()
            .map(|key| {
                self.with_live(key, |entry| match &entry.value {
                    Value::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .flatten()
            })
            .collect()
    }

    // ========================================================================
    // List commands
    // ========================================================================

    /// LPUSH / RPUSH / LPUSHX / RPUSHX. Returns the new length, or 0
    /// when `require_existing` is set and the key is absent.
    pub fn push(
        &self,
        key: &[u8],
        values: Vec<Bytes>,
        front: bool,
        require_existing: bool,
    ) -> Result<usize, StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        if require_existing && !data.contains_key(key) {
            return Ok(0);
        }

        let entry = data
            .entry(Bytes::copy_from_slice(key))
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
        match &mut entry.value {
            Value::List(list) => {
                for value in values {
                    if front {
                        list.push_front(value);
                    } else {
                        list.push_back(value);
                    }
                }
                Ok(list.len())
            }
            _ => Err(StoreError::WrongType),
        }
    }

    /// LPOP / RPOP. Removes the key once the list empties.
    pub fn pop(&self, key: &[u8], front: bool) -> Result<Option<Bytes>, StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        let (popped, now_empty) = match data.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::List(list) => {
                    let value = if front {
                        list.pop_front()
                    } else {
                        list.pop_back()
                    };
                    (value, list.is_empty())
                }
                _ => return Err(StoreError::WrongType),
            },
            None => return Ok(None),
        };
        if now_empty {
            data.remove(key);
        }
        Ok(popped)
    }

    pub fn llen(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::List(list) => Ok(list.len()),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(0))
    }

    pub fn lindex(&self, key: &[u8], index: i64) -> Result<Option<Bytes>, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::List(list) => {
                let len = list.len() as i64;
                let idx = if index < 0 { len + index } else { index };
                if idx < 0 || idx >= len {
                    Ok(None)
                } else {
                    Ok(list.get(idx as usize).cloned())
                }
            }
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(None))
    }

    /// LRANGE with inclusive, clamped, negative-aware indices.
    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Bytes>, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::List(list) => {
                let len = list.len() as i64;
                let mut start = if start < 0 { len + start } else { start };
                let mut stop = if stop < 0 { len + stop } else { stop };
                if start < 0 {
                    start = 0;
                }
                if stop >= len {
                    stop = len - 1;
                }
                if start > stop || start >= len {
                    return Ok(Vec::new());
                }
                Ok(list
                    .iter()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .cloned()
                    .collect())
            }
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(Vec::new()))
    }

    pub fn lset(&self, key: &[u8], index: i64, value: Bytes) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        match data.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::List(list) => {
                    let len = list.len() as i64;
                    let idx = if index < 0 { len + index } else { index };
                    if idx < 0 || idx >= len {
                        return Err(StoreError::OutOfRange);
                    }
                    list[idx as usize] = value;
                    Ok(())
                }
                _ => Err(StoreError::WrongType),
            },
            None => Err(StoreError::NoSuchKey),
        }
    }

    /// LINSERT: new length, `-1` if the pivot is missing, `0` if the
    /// key is missing.
    pub fn linsert(
        &self,
        key: &[u8],
        before: bool,
        pivot: &[u8],
        value: Bytes,
    ) -> Result<i64, StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        match data.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::List(list) => {
                    match list.iter().position(|v| v.as_ref() == pivot) {
                        Some(pos) => {
                            let at = if before { pos } else { pos + 1 };
                            list.insert(at, value);
                            Ok(list.len() as i64)
                        }
                        None => Ok(-1),
                    }
                }
                _ => Err(StoreError::WrongType),
            },
            None => Ok(0),
        }
    }

    // ========================================================================
    // Set commands
    // ========================================================================

    pub fn sadd(&self, key: &[u8], members: Vec<Bytes>) -> Result<usize, StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        let entry = data
            .entry(Bytes::copy_from_slice(key))
            .or_insert_with(|| Entry::new(Value::Set(HashSet::new())));
        match &mut entry.value {
            Value::Set(set) => Ok(members.into_iter().filter(|m| set.insert(m.clone())).count()),
            _ => Err(StoreError::WrongType),
        }
    }

    pub fn srem(&self, key: &[u8], members: &[Bytes]) -> Result<usize, StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        let (removed, now_empty) = match data.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::Set(set) => {
                    let removed = members.iter().filter(|m| set.remove(m.as_ref())).count();
                    (removed, set.is_empty())
                }
                _ => return Err(StoreError::WrongType),
            },
            None => return Ok(0),
        };
        if now_empty {
            data.remove(key);
        }
        Ok(removed)
    }

    pub fn smembers(&self, key: &[u8]) -> Result<Vec<Bytes>, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::Set(set) => Ok(set.iter().cloned().collect()),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(Vec::new()))
    }

    pub fn sismember(&self, key: &[u8], member: &[u8]) -> Result<bool, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::Set(set) => Ok(set.contains(member)),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(false))
    }

    pub fn scard(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::Set(set) => Ok(set.len()),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(0))
    }

    /// SPOP: removes and returns an arbitrary member.
    pub fn spop(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        let (member, now_empty) = match data.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::Set(set) => {
                    let member = set.iter().next().cloned();
                    if let Some(ref m) = member {
                        set.remove(m);
                    }
                    (member, set.is_empty())
                }
                _ => return Err(StoreError::WrongType),
            },
            None => return Ok(None),
        };
        if now_empty {
            data.remove(key);
        }
        Ok(member)
    }

    /// SUNION / SINTER / SDIFF over the given keys. Missing keys are
    /// empty sets.
    pub fn set_combine(&self, keys: &[Bytes], op: SetOp) -> Result<Vec<Bytes>, StoreError> {
        let mut result: Option<HashSet<Bytes>> = None;
        for key in keys {
            let members: HashSet<Bytes> = self
                .with_live(key, |entry| match &entry.value {
                    Value::Set(set) => Ok(set.clone()),
                    _ => Err(StoreError::WrongType),
                })
                .unwrap_or(Ok(HashSet::new()))?;

            result = Some(match result {
                None => members,
                Some(acc) => match op {
                    SetOp::Union => acc.union(&members).cloned().collect(),
                    SetOp::Intersect => acc.intersection(&members).cloned().collect(),
                    SetOp::Diff => acc.difference(&members).cloned().collect(),
                },
            });
        }
        Ok(result.unwrap_or_default().into_iter().collect())
    }

    // ========================================================================
    // Hash commands
    // ========================================================================

    /// HSET: returns the number of newly created fields.
    pub fn hset(&self, key: &[u8], pairs: Vec<(Bytes, Bytes)>) -> Result<usize, StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        let entry = data
            .entry(Bytes::copy_from_slice(key))
            .or_insert_with(|| Entry::new(Value::Hash(HashValue::new())));
        match &mut entry.value {
            Value::Hash(hash) => Ok(pairs
                .into_iter()
                .filter(|(field, value)| hash.set(field.clone(), value.clone()))
                .count()),
            _ => Err(StoreError::WrongType),
        }
    }

    pub fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::Hash(hash) => Ok(hash.get(field).cloned()),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(None))
    }

    pub fn hgetall(&self, key: &[u8]) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::Hash(hash) => Ok(hash.iter().cloned().collect()),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(Vec::new()))
    }

    pub fn hdel(&self, key: &[u8], fields: &[Bytes]) -> Result<usize, StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        let (removed, now_empty) = match data.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::Hash(hash) => {
                    let removed = fields.iter().filter(|f| hash.remove(f.as_ref())).count();
                    (removed, hash.is_empty())
                }
                _ => return Err(StoreError::WrongType),
            },
            None => return Ok(0),
        };
        if now_empty {
            data.remove(key);
        }
        Ok(removed)
    }

    pub fn hlen(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::Hash(hash) => Ok(hash.len()),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(0))
    }

    pub fn hexists(&self, key: &[u8], field: &[u8]) -> Result<bool, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::Hash(hash) => Ok(hash.contains(field)),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(false))
    }

    pub fn hkeys(&self, key: &[u8]) -> Result<Vec<Bytes>, StoreError> {
        self.hgetall(key)
            .map(|pairs| pairs.into_iter().map(|(f, _)| f).collect())
    }

    pub fn hvals(&self, key: &[u8]) -> Result<Vec<Bytes>, StoreError> {
        self.hgetall(key)
            .map(|pairs| pairs.into_iter().map(|(_, v)| v).collect())
    }

    // ========================================================================
    // Sorted-set commands
    // ========================================================================

    pub fn zadd(
        &self,
        key: &[u8],
        opts: ZaddOptions,
        pairs: Vec<(f64, Bytes)>,
    ) -> Result<ZaddOutcome, StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        // XX against a missing key touches nothing.
        if opts.xx && !data.contains_key(key) {
            return Ok(if opts.incr {
                ZaddOutcome::Incr(None)
            } else {
                ZaddOutcome::Count(0)
            });
        }

        let entry = data
            .entry(Bytes::copy_from_slice(key))
            .or_insert_with(|| Entry::new(Value::SortedSet(SortedSet::new())));
        let zset = match &mut entry.value {
            Value::SortedSet(zset) => zset,
            _ => return Err(StoreError::WrongType),
        };

        if opts.incr {
            // INCR operates on a single pair.
            let (delta, member) = pairs.into_iter().next().ok_or(StoreError::NotFloat)?;
            let old = zset.score(&member);
            if opts.nx && old.is_some() {
                return Ok(ZaddOutcome::Incr(None));
            }
            if opts.xx && old.is_none() {
                return Ok(ZaddOutcome::Incr(None));
            }
            let next = old.unwrap_or(0.0) + delta;
            if let Some(old) = old {
                if (opts.gt && next <= old) || (opts.lt && next >= old) {
                    return Ok(ZaddOutcome::Incr(None));
                }
            }
            zset.insert(member, next);
            return Ok(ZaddOutcome::Incr(Some(next)));
        }

        let mut added = 0i64;
        let mut changed = 0i64;
        for (score, member) in pairs {
            match zset.score(&member) {
                Some(old) => {
                    if opts.nx || (opts.gt && score <= old) || (opts.lt && score >= old) {
                        continue;
                    }
                    if score != old {
                        zset.insert(member, score);
                        changed += 1;
                    }
                }
                None => {
                    if opts.xx {
                        continue;
                    }
                    zset.insert(member, score);
                    added += 1;
                }
            }
        }
        let now_empty = zset.is_empty();
        if now_empty {
            data.remove(key);
        }
        Ok(ZaddOutcome::Count(if opts.ch { added + changed } else { added }))
    }

    pub fn zrem(&self, key: &[u8], members: &[Bytes]) -> Result<usize, StoreError> {
        let mut data = self.data.write().unwrap();
        let now = now_ms();
        self.evict_if_expired(&mut data, key, now);

        let (removed, now_empty) = match data.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::SortedSet(zset) => {
                    let removed = members.iter().filter(|m| zset.remove(m.as_ref())).count();
                    (removed, zset.is_empty())
                }
                _ => return Err(StoreError::WrongType),
            },
            None => return Ok(0),
        };
        if now_empty {
            data.remove(key);
        }
        Ok(removed)
    }

    pub fn zrange(
        &self,
        key: &[u8],
        start: i64,
        stop: i64,
    ) -> Result<Vec<(Bytes, f64)>, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::SortedSet(zset) => Ok(zset.range_by_index(start, stop)),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(Vec::new()))
    }

    pub fn zrangebyscore(
        &self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<Vec<(Bytes, f64)>, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::SortedSet(zset) => Ok(zset.range_by_score(min, max)),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(Vec::new()))
    }

    pub fn zrank(&self, key: &[u8], member: &[u8], reverse: bool) -> Result<Option<usize>, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::SortedSet(zset) => Ok(zset.rank(member).map(|rank| {
                if reverse {
                    zset.len() - 1 - rank
                } else {
                    rank
                }
            })),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(None))
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::SortedSet(zset) => Ok(zset.score(member)),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(None))
    }

    pub fn zcard(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::SortedSet(zset) => Ok(zset.len()),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(0))
    }

    pub fn zcount(
        &self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<usize, StoreError> {
        self.zrangebyscore(key, min, max).map(|v| v.len())
    }

    // ========================================================================
    // Stream commands
    // ========================================================================

    /// XADD: resolves the id spec, appends, and wakes blocked XREADs.
    pub fn xadd(
        &self,
        key: &[u8],
        spec: IdSpec,
        fields: Vec<(Bytes, Bytes)>,
    ) -> Result<StreamId, StoreError> {
        let id = {
            let mut data = self.data.write().unwrap();
            let now = now_ms();
            self.evict_if_expired(&mut data, key, now);

            let entry = data
                .entry(Bytes::copy_from_slice(key))
                .or_insert_with(|| Entry::new(Value::Stream(Stream::new())));
            let result = match &mut entry.value {
                Value::Stream(stream) => {
                    let id = stream.resolve_id(spec, now);
                    stream.append(id, fields).map_err(StoreError::from)
                }
                _ => Err(StoreError::WrongType),
            };
            let created_empty = matches!(&entry.value, Value::Stream(s) if s.is_empty());
            match result {
                Ok(id) => id,
                Err(err) => {
                    // A rejected first append must not leave the key behind.
                    if created_empty {
                        data.remove(key);
                    }
                    return Err(err);
                }
            }
        };

        // Wake blocked XREADs (outside the data lock).
        self.xadd_notify.notify_waiters();
        Ok(id)
    }

    pub fn xrange(
        &self,
        key: &[u8],
        start: StreamId,
        end: StreamId,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::Stream(stream) => Ok(stream.range(start, end).to_vec()),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(Vec::new()))
    }

    /// Entries with id strictly greater than `after`, for XREAD.
    pub fn xread_after(
        &self,
        key: &[u8],
        after: StreamId,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::Stream(stream) => Ok(stream.entries_after(after).to_vec()),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(Vec::new()))
    }

    pub fn xlen(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::Stream(stream) => Ok(stream.len()),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(0))
    }

    /// The stream's last id, for XREAD's `$` form. `0-0` if absent.
    pub fn stream_last_id(&self, key: &[u8]) -> Result<StreamId, StoreError> {
        self.with_live(key, |entry| match &entry.value {
            Value::Stream(stream) => Ok(stream.last_id()),
            _ => Err(StoreError::WrongType),
        })
        .unwrap_or(Ok(StreamId::ZERO))
    }

    /// The wakeup handle blocked XREADs park on. Fired by every XADD;
    /// a woken waiter re-checks the streams it cares about.
    pub fn xadd_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.xadd_notify)
    }

    /// Live keys carrying an expiry, for INFO's keyspace section.
    pub fn expires_count(&self) -> usize {
        let now = now_ms();
        let data = self.data.read().unwrap();
        data.values()
            .filter(|e| e.expires_at.is_some() && !e.is_expired(now))
            .count()
    }

    // ========================================================================
    // Snapshot support
    // ========================================================================

    /// A point-in-time clone of the live keyspace, taken atomically
    /// under the read lock. `Bytes` payloads are refcounted so this is
    /// structure-sized, not data-sized.
    pub fn snapshot(&self) -> Vec<(Bytes, Entry)> {
        let now = now_ms();
        let data = self.data.read().unwrap();
        data.iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Replaces the whole keyspace (startup load, full resync).
    pub fn load(&self, entries: Vec<(Bytes, Entry)>) {
        let mut data = self.data.write().unwrap();
        data.clear();
        for (key, entry) in entries {
            data.insert(key, entry);
        }
    }
}

/// Which SUNION / SINTER / SDIFF combination to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Union,
    Intersect,
    Diff,
}

/// Glob matcher over raw key bytes: `*`, `?`, `[...]` (with ranges and
/// `^` negation) and backslash escapes.
pub(crate) struct GlobPattern {
    pattern: Vec<u8>,
}

impl GlobPattern {
    pub fn new(pattern: &[u8]) -> Self {
        Self {
            pattern: pattern.to_vec(),
        }
    }

    pub fn matches(&self, text: &[u8]) -> bool {
        Self::matches_at(&self.pattern, text)
    }

    fn matches_at(pattern: &[u8], text: &[u8]) -> bool {
        if pattern.is_empty() {
            return text.is_empty();
        }

        match pattern[0] {
            b'*' => {
                for i in 0..=text.len() {
                    if Self::matches_at(&pattern[1..], &text[i..]) {
                        return true;
                    }
                }
                false
            }
            b'?' => !text.is_empty() && Self::matches_at(&pattern[1..], &text[1..]),
            b'[' => {
                if text.is_empty() {
                    return false;
                }
                let mut i = 1;
                let negate = pattern.get(1) == Some(&b'^');
                if negate {
                    i += 1;
                }
                let mut matched = false;
                while i < pattern.len() && pattern[i] != b']' {
                    if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
                        if text[0] >= pattern[i] && text[0] <= pattern[i + 2] {
                            matched = true;
                        }
                        i += 3;
                    } else {
                        if pattern[i] == text[0] {
                            matched = true;
                        }
                        i += 1;
                    }
                }
                if i >= pattern.len() {
                    return false; // unterminated class
                }
                if negate {
                    matched = !matched;
                }
                matched && Self::matches_at(&pattern[i + 1..], &text[1..])
            }
            b'\\' => {
                pattern.len() > 1
                    && !text.is_empty()
                    && pattern[1] == text[0]
                    && Self::matches_at(&pattern[2..], &text[1..])
            }
            c => !text.is_empty() && c == text[0] && Self::matches_at(&pattern[1..], &text[1..]),
        }
    }
}
