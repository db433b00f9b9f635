//! RESP protocol implementation.
//!
//! CoolCache speaks the Redis wire protocol on every socket: client
//! connections, the replication link between leader and follower, and
//! pub/sub pushes all move the frames defined here.
//!
//! - [`types`] defines the `RespValue` frame enum and its serialization
//! - [`parser`] is the incremental decoder used by the connection loop

pub mod parser;
pub mod types;

pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::{encode_command, encode_command_str, RespValue};
