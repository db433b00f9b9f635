//! The command table: name → arity bounds and write classification.
//!
//! Arity bounds count arguments after the command name; `max_args` of
//! `None` means unbounded. `is_write` decides which commands go
//! through the write-ordering mutex and get appended to the
//! replication log after success.

/// Static metadata for one command.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub min_args: usize,
    pub max_args: Option<usize>,
    pub is_write: bool,
}

const fn spec(min_args: usize, max_args: Option<usize>, is_write: bool) -> CommandSpec {
    CommandSpec {
        min_args,
        max_args,
        is_write,
    }
}

/// Looks up a command by its uppercased name.
pub fn lookup(name: &str) -> Option<CommandSpec> {
    let spec = match name {
        // Connection / server
        "PING" => spec(0, Some(1), false),
        "ECHO" => spec(1, Some(1), false),
        "QUIT" => spec(0, Some(0), false),
        "COMMAND" => spec(0, None, false),
        "CLIENT" => spec(1, None, false),
        "SELECT" => spec(1, Some(1), false),
        "INFO" => spec(0, Some(1), false),
        "CONFIG" => spec(1, None, false),
        "DBSIZE" => spec(0, Some(0), false),
        "FLUSHALL" => spec(0, Some(0), true),
        "DEBUG" => spec(1, None, false),

        // Keyspace
        "TYPE" => spec(1, Some(1), false),
        "EXISTS" => spec(1, None, false),
        "KEYS" => spec(1, Some(1), false),
        "DEL" => spec(1, None, true),
        "EXPIRE" => spec(2, Some(2), true),
        "PEXPIRE" => spec(2, Some(2), true),
        "TTL" => spec(1, Some(1), false),
        "PTTL" => spec(1, Some(1), false),

        // Persistence
        "SAVE" => spec(0, Some(0), false),
        "BGSAVE" => spec(0, Some(0), false),
        "LASTSAVE" => spec(0, Some(0), false),

        // Strings
        "GET" => spec(1, Some(1), false),
        "SET" => spec(2, None, true),
        "INCR" => spec(1, Some(1), true),
        "DECR" => spec(1, Some(1), true),
        "INCRBY" => spec(2, Some(2), true),
        "DECRBY" => spec(2, Some(2), true),
        "APPEND" => spec(2, Some(2), true),
        "STRLEN" => spec(1, Some(1), false),
        "MSET" => spec(2, None, true),
        "MGET" => spec(1, None, false),

        // Lists
        "LPUSH" => spec(2, None, true),
        "RPUSH" => spec(2, None, true),
        "LPUSHX" => spec(2, None, true),
        "RPUSHX" => spec(2, None, true),
        "LPOP" => spec(1, Some(1), true),
        "RPOP" => spec(1, Some(1), true),
        "LRANGE" => spec(3, Some(3), false),
        "LLEN" => spec(1, Some(1), false),
        "LINDEX" => spec(2, Some(2), false),
        "LSET" => spec(3, Some(3), true),
        "LINSERT" => spec(4, Some(4), true),

        // Sets
        "SADD" => spec(2, None, true),
        "SREM" => spec(2, None, true),
        "SMEMBERS" => spec(1, Some(1), false),
        "SISMEMBER" => spec(2, Some(2), false),
        "SCARD" => spec(1, Some(1), false),
        "SPOP" => spec(1, Some(1), true),
        "SUNION" => spec(1, None, false),
        "SINTER" => spec(1, None, false),
        "SDIFF" => spec(1, None, false),

        // Hashes
        "HSET" => spec(3, None, true),
        "HGET" => spec(2, Some(2), false),
        "HGETALL" => spec(1, Some(1), false),
        "HDEL" => spec(2, None, true),
        "HLEN" => spec(1, Some(1), false),
        "HEXISTS" => spec(2, Some(2), false),
        "HKEYS" => spec(1, Some(1), false),
        "HVALS" => spec(1, Some(1), false),

        // Sorted sets
        "ZADD" => spec(3, None, true),
        "ZRANGE" => spec(3, Some(4), false),
        "ZRANGEBYSCORE" => spec(3, Some(3), false),
        "ZRANK" => spec(2, Some(2), false),
        "ZREVRANK" => spec(2, Some(2), false),
        "ZSCORE" => spec(2, Some(2), false),
        "ZREM" => spec(2, None, true),
        "ZCARD" => spec(1, Some(1), false),
        "ZCOUNT" => spec(3, Some(3), false),

        // Streams
        "XADD" => spec(4, None, true),
        "XRANGE" => spec(3, Some(3), false),
        "XREAD" => spec(3, None, false),
        "XLEN" => spec(1, Some(1), false),

        // Pub/sub
        "SUBSCRIBE" => spec(1, None, false),
        "UNSUBSCRIBE" => spec(0, None, false),
        "PUBLISH" => spec(2, Some(2), false),

        // Replication
        "REPLCONF" => spec(0, None, false),
        "PSYNC" => spec(2, Some(2), false),
        "WAIT" => spec(2, Some(2), false),

        _ => return None,
    };
    Some(spec)
}

/// Number of known commands, for `COMMAND COUNT`.
pub const COMMAND_COUNT: usize = 79;
