//! Leader → follower replication.
//!
//! - [`leader`]: the replication log the leader keeps: id, offset,
//!   backlog ring, attached replica registry
//! - [`follower`]: the outbound client a replica runs against its
//!   leader (handshake, snapshot ingest, silent apply loop)
//!
//! Commands received over the replication link bypass client reply
//! emission but still validate arity and types like any other write.

pub mod follower;
pub mod leader;

pub use follower::{FollowerConfig, ReplicationError};
pub use leader::{ReplicationState, DEFAULT_BACKLOG_CAPACITY};
