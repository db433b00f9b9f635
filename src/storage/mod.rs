//! The typed keyspace and its supporting pieces.
//!
//! - [`engine`]: the shared key → entry map behind a single lock, with
//!   lazy expiry, the change counter and all typed accessors
//! - [`value`]: the `Value` union (string / list / set / hash / sorted
//!   set / stream) and sorted-set internals
//! - [`stream`]: stream ids, entries and the append/range log
//! - [`expiry`]: the background sweeper for untouched expired keys
//!
//! The engine is designed to sit in an `Arc` shared by every
//! connection task, the snapshot manager and the replication layer.

pub mod engine;
pub mod expiry;
pub mod stream;
pub mod value;

pub use engine::{
    now_ms, Entry, SetOp, SetOptions, StorageEngine, StorageStats, StoreError, SweepOutcome,
    ZaddOptions, ZaddOutcome,
};
pub use expiry::{start_expiry_sweeper, ExpiryCycle, ExpirySweeper};
pub use stream::{IdSpec, Stream, StreamEntry, StreamError, StreamId};
pub use value::{format_score, HashValue, ScoreBound, SortedSet, Value};
