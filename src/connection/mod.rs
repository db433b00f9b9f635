//! Client connection handling.
//!
//! One task per accepted socket, each owning a [`handler::Session`]
//! that tracks the connection's mode (normal, subscribed, or feeding a
//! replica), its subscriptions and its push outbox. The loop multiplexes
//! socket reads with outbox pushes so pub/sub messages and the
//! replication feed share the same write path as ordinary replies.

pub mod handler;

pub use handler::{
    handle_connection, ConnectionError, ConnectionHandler, Session, SessionMode, OUTBOX_CAPACITY,
};
