//! Command execution: decoded frames in, replies (and replication
//! records) out.
//!
//! `execute` validates the frame shape, the command name and its
//! arity against the [`super::table`], applies the subscribed-state
//! restriction, then dispatches. Write commands run under the
//! server-wide write mutex and, on success, append their RESP frame to
//! the replication log, so the log order is the commit order.
//!
//! Two commands rewrite the record they propagate instead of using the
//! client's raw bytes: XADD (the resolved id replaces `*`, otherwise
//! each replica would pick its own) and SPOP (propagated as SREM of
//! the member actually popped, since set iteration order differs per
//! process).

use crate::commands::table;
use crate::connection::Session;
use crate::persistence::{self, rdb};
use crate::protocol::{encode_command, RespValue};
use crate::pubsub::SubscriberHandle;
use crate::server::{Role, ServerContext};
use crate::storage::{
    format_score, now_ms, IdSpec, ScoreBound, SetOp, SetOptions, StreamEntry, StreamId,
    ZaddOptions, ZaddOutcome,
};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What the connection loop should do with a finished command.
pub enum CommandOutcome {
    /// Send one reply frame.
    Reply(RespValue),
    /// Send several frames (SUBSCRIBE emits one per channel).
    MultiReply(Vec<RespValue>),
    /// Send nothing (REPLCONF ACK bookkeeping).
    NoReply,
    /// Write this preamble, then switch the connection into
    /// replica-feed mode (successful PSYNC).
    StartReplicaStream { preamble: Bytes },
    /// Send the reply, then close the connection.
    Quit(RespValue),
}

/// What to append to the replication log after a successful write.
enum Propagation {
    /// The client's frame, byte for byte.
    Raw,
    /// A rewritten record (XADD with its resolved id, SPOP as SREM).
    Frame(Vec<u8>),
    /// Nothing changed; nothing to replicate.
    Skip,
}

/// Executes commands against the shared server state.
#[derive(Clone)]
pub struct CommandHandler {
    ctx: Arc<ServerContext>,
}

impl CommandHandler {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    /// Runs one client command. `raw` is the frame exactly as it
    /// arrived, kept for the replication log.
    pub async fn execute(
        &self,
        frame: RespValue,
        raw: Bytes,
        session: &mut Session,
    ) -> CommandOutcome {
        let argv = match argv_from(frame) {
            Some(argv) if !argv.is_empty() => argv,
            _ => return CommandOutcome::Reply(RespValue::error("ERR invalid command format")),
        };
        let name = match text(&argv[0]) {
            Some(name) => name.to_uppercase(),
            None => return CommandOutcome::Reply(RespValue::error("ERR invalid command name")),
        };

        let spec = match table::lookup(&name) {
            Some(spec) => spec,
            None => {
                return CommandOutcome::Reply(RespValue::error(format!(
                    "ERR unknown command '{}'",
                    name.to_lowercase()
                )))
            }
        };

        self.ctx.stats.command_processed(spec.is_write);

        let arg_count = argv.len() - 1;
        if arg_count < spec.min_args || spec.max_args.map(|max| arg_count > max).unwrap_or(false) {
            return CommandOutcome::Reply(wrong_args(&name));
        }

        if session.is_subscribed()
            && !matches!(name.as_str(), "SUBSCRIBE" | "UNSUBSCRIBE" | "PING" | "QUIT")
        {
            return CommandOutcome::Reply(RespValue::error(format!(
                "ERR Can't execute '{}': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT are allowed in this context",
                name.to_lowercase()
            )));
        }

        if spec.is_write {
            // Execute and propagate under one lock: replication order
            // is commit order.
            let reply = {
                let _guard = self.ctx.write_order.lock().unwrap();
                let (reply, propagation) = self.dispatch_write(&name, &argv);
                if !reply.is_error() {
                    self.ctx.engine.mark_write();
                    match propagation {
                        Propagation::Raw => self.ctx.repl.propagate(&raw),
                        Propagation::Frame(frame) => self.ctx.repl.propagate(&frame),
                        Propagation::Skip => {}
                    }
                }
                reply
            };
            return CommandOutcome::Reply(reply);
        }

        self.dispatch_read(&name, &argv, session).await
    }

    /// Applies one frame received over the replication link: writes
    /// only, no replies, no re-propagation.
    pub async fn apply_replicated(&self, frame: RespValue) {
        let argv = match argv_from(frame) {
            Some(argv) if !argv.is_empty() => argv,
            _ => return,
        };
        let name = match text(&argv[0]) {
            Some(name) => name.to_uppercase(),
            None => return,
        };
        let spec = match table::lookup(&name) {
            Some(spec) => spec,
            None => {
                debug!(command = %name, "ignoring unknown replicated command");
                return;
            }
        };
        if !spec.is_write {
            return; // PINGs and the like carry no state
        }

        let _guard = self.ctx.write_order.lock().unwrap();
        let (reply, _) = self.dispatch_write(&name, &argv);
        if reply.is_error() {
            debug!(command = %name, reply = %reply, "replicated write failed");
        } else {
            self.ctx.engine.mark_write();
        }
    }

    /// Mirrors the follower's ingest offset for INFO.
    pub fn set_follower_offset(&self, offset: u64) {
        self.ctx.follower_offset.store(offset, Ordering::Relaxed);
    }

    // ========================================================================
    // Write commands
    // ========================================================================

    fn dispatch_write(&self, name: &str, argv: &[Bytes]) -> (RespValue, Propagation) {
        let args = &argv[1..];
        match name {
            "SET" => self.cmd_set(args),
            "INCR" => raw(self.incr_reply(&args[0], 1)),
            "DECR" => raw(self.incr_reply(&args[0], -1)),
            "INCRBY" => match int_arg(&args[1]) {
                Some(delta) => raw(self.incr_reply(&args[0], delta)),
                None => skip(not_integer()),
            },
            "DECRBY" => match int_arg(&args[1]) {
                Some(delta) => raw(self.incr_reply(&args[0], -delta)),
                None => skip(not_integer()),
            },
            "APPEND" => raw(
                self.ctx
                    .engine
                    .append(&args[0], &args[1])
                    .map(|len| RespValue::integer(len as i64))
                    .unwrap_or_else(store_err),
            ),
            "MSET" => self.cmd_mset(args),
            "DEL" => raw(RespValue::integer(self.ctx.engine.del(args) as i64)),
            "EXPIRE" => self.cmd_expire(args, 1000),
            "PEXPIRE" => self.cmd_expire(args, 1),
            "FLUSHALL" => {
                self.ctx.engine.flush_all();
                raw(RespValue::ok())
            }
            "LPUSH" => self.cmd_push(args, true, false),
            "RPUSH" => self.cmd_push(args, false, false),
            "LPUSHX" => self.cmd_push(args, true, true),
            "RPUSHX" => self.cmd_push(args, false, true),
            "LPOP" => self.cmd_pop(args, true),
            "RPOP" => self.cmd_pop(args, false),
            "LSET" => self.cmd_lset(args),
            "LINSERT" => self.cmd_linsert(args),
            "SADD" => raw(
                self.ctx
                    .engine
                    .sadd(&args[0], args[1..].to_vec())
                    .map(|n| RespValue::integer(n as i64))
                    .unwrap_or_else(store_err),
            ),
            "SREM" => raw(
                self.ctx
                    .engine
                    .srem(&args[0], &args[1..])
                    .map(|n| RespValue::integer(n as i64))
                    .unwrap_or_else(store_err),
            ),
            "SPOP" => self.cmd_spop(args),
            "HSET" => self.cmd_hset(args),
            "HDEL" => raw(
                self.ctx
                    .engine
                    .hdel(&args[0], &args[1..])
                    .map(|n| RespValue::integer(n as i64))
                    .unwrap_or_else(store_err),
            ),
            "ZADD" => self.cmd_zadd(args),
            "ZREM" => raw(
                self.ctx
                    .engine
                    .zrem(&args[0], &args[1..])
                    .map(|n| RespValue::integer(n as i64))
                    .unwrap_or_else(store_err),
            ),
            "XADD" => self.cmd_xadd(args),
            _ => skip(RespValue::error("ERR unknown write command")),
        }
    }

    fn incr_reply(&self, key: &[u8], delta: i64) -> RespValue {
        self.ctx
            .engine
            .incr_by(key, delta)
            .map(RespValue::integer)
            .unwrap_or_else(store_err)
    }

    fn cmd_set(&self, args: &[Bytes]) -> (RespValue, Propagation) {
        let key = args[0].clone();
        let value = args[1].clone();

        let mut opts = SetOptions::default();
        let mut have_expiry = false;
        let mut i = 2;
        while i < args.len() {
            let opt = match text(&args[i]) {
                Some(opt) => opt.to_uppercase(),
                None => return skip(syntax_error()),
            };
            match opt.as_str() {
                "EX" | "PX" => {
                    if have_expiry || opts.keep_ttl {
                        return skip(syntax_error());
                    }
                    i += 1;
                    let amount = match args.get(i).and_then(|a| int_arg(a)) {
                        Some(n) if n > 0 => n as u64,
                        _ => {
                            return skip(RespValue::error(
                                "ERR invalid expire time in 'set' command",
                            ))
                        }
                    };
                    let unit_ms = if opt == "EX" { 1000 } else { 1 };
                    opts.expires_at = Some(now_ms() + amount * unit_ms);
                    have_expiry = true;
                }
                "KEEPTTL" => {
                    if have_expiry {
                        return skip(syntax_error());
                    }
                    opts.keep_ttl = true;
                }
                "NX" => {
                    if opts.if_present {
                        return skip(syntax_error());
                    }
                    opts.if_absent = true;
                }
                "XX" => {
                    if opts.if_absent {
                        return skip(syntax_error());
                    }
                    opts.if_present = true;
                }
                _ => return skip(syntax_error()),
            }
            i += 1;
        }

        if self.ctx.engine.set(key, value, opts) {
            raw(RespValue::ok())
        } else {
            // NX/XX condition failed: no state change to replicate.
            skip(RespValue::Null)
        }
    }

    fn cmd_mset(&self, args: &[Bytes]) -> (RespValue, Propagation) {
        if args.len() % 2 != 0 {
            return skip(wrong_args("MSET"));
        }
        let pairs = args
            .chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        self.ctx.engine.mset(pairs);
        raw(RespValue::ok())
    }

    fn cmd_expire(&self, args: &[Bytes], unit_ms: u64) -> (RespValue, Propagation) {
        let amount = match int_arg(&args[1]) {
            Some(n) => n,
            None => return skip(not_integer()),
        };
        let at = if amount <= 0 {
            // Non-positive TTL: the key dies now.
            now_ms().saturating_sub(1)
        } else {
            now_ms() + amount as u64 * unit_ms
        };
        if self.ctx.engine.expire_at(&args[0], at) {
            raw(RespValue::integer(1))
        } else {
            skip(RespValue::integer(0))
        }
    }

    fn cmd_push(&self, args: &[Bytes], front: bool, require_existing: bool) -> (RespValue, Propagation) {
        match self
            .ctx
            .engine
            .push(&args[0], args[1..].to_vec(), front, require_existing)
        {
            Ok(0) if require_existing => skip(RespValue::integer(0)),
            Ok(len) => raw(RespValue::integer(len as i64)),
            Err(err) => skip(store_err(err)),
        }
    }

    fn cmd_pop(&self, args: &[Bytes], front: bool) -> (RespValue, Propagation) {
        match self.ctx.engine.pop(&args[0], front) {
            Ok(Some(value)) => raw(RespValue::BulkString(value)),
            Ok(None) => skip(RespValue::Null),
            Err(err) => skip(store_err(err)),
        }
    }

    fn cmd_lset(&self, args: &[Bytes]) -> (RespValue, Propagation) {
        let index = match int_arg(&args[1]) {
            Some(index) => index,
            None => return skip(not_integer()),
        };
        match self.ctx.engine.lset(&args[0], index, args[2].clone()) {
            Ok(()) => raw(RespValue::ok()),
            Err(err) => skip(store_err(err)),
        }
    }

    fn cmd_linsert(&self, args: &[Bytes]) -> (RespValue, Propagation) {
        let before = match text(&args[1]).map(|s| s.to_uppercase()) {
            Some(s) if s == "BEFORE" => true,
            Some(s) if s == "AFTER" => false,
            _ => return skip(syntax_error()),
        };
        match self
            .ctx
            .engine
            .linsert(&args[0], before, &args[2], args[3].clone())
        {
            Ok(len) => raw(RespValue::integer(len)),
            Err(err) => skip(store_err(err)),
        }
    }

    fn cmd_spop(&self, args: &[Bytes]) -> (RespValue, Propagation) {
        match self.ctx.engine.spop(&args[0]) {
            Ok(Some(member)) => {
                // Iteration order is process-local, so replicate the
                // concrete member, not the SPOP.
                let record = encode_command(&[
                    Bytes::from_static(b"SREM"),
                    args[0].clone(),
                    member.clone(),
                ]);
                (RespValue::BulkString(member), Propagation::Frame(record))
            }
            Ok(None) => skip(RespValue::Null),
            Err(err) => skip(store_err(err)),
        }
    }

    fn cmd_hset(&self, args: &[Bytes]) -> (RespValue, Propagation) {
        if (args.len() - 1) % 2 != 0 {
            return skip(wrong_args("HSET"));
        }
        let pairs = args[1..]
            .chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        match self.ctx.engine.hset(&args[0], pairs) {
            Ok(created) => raw(RespValue::integer(created as i64)),
            Err(err) => skip(store_err(err)),
        }
    }

    fn cmd_zadd(&self, args: &[Bytes]) -> (RespValue, Propagation) {
        let key = &args[0];
        let mut opts = ZaddOptions::default();
        let mut i = 1;
        while i < args.len() {
            match text(&args[i]).map(|s| s.to_uppercase()).as_deref() {
                Some("NX") => opts.nx = true,
                Some("XX") => opts.xx = true,
                Some("GT") => opts.gt = true,
                Some("LT") => opts.lt = true,
                Some("CH") => opts.ch = true,
                Some("INCR") => opts.incr = true,
                _ => break,
            }
            i += 1;
        }

        if opts.nx && opts.xx {
            return skip(RespValue::error(
                "ERR XX and NX options at the same time are not compatible",
            ));
        }
        if (opts.gt && opts.lt) || (opts.nx && (opts.gt || opts.lt)) {
            return skip(RespValue::error(
                "ERR GT, LT, and/or NX options at the same time are not compatible",
            ));
        }

        let rest = &args[i..];
        if rest.is_empty() || rest.len() % 2 != 0 {
            return skip(syntax_error());
        }
        let mut pairs = Vec::with_capacity(rest.len() / 2);
        for pair in rest.chunks(2) {
            let score = match float_arg(&pair[0]) {
                Some(score) if !score.is_nan() => score,
                _ => return skip(not_float()),
            };
            pairs.push((score, pair[1].clone()));
        }
        if opts.incr && pairs.len() != 1 {
            return skip(RespValue::error(
                "ERR INCR option supports a single increment-element pair",
            ));
        }

        match self.ctx.engine.zadd(key, opts, pairs) {
            Ok(ZaddOutcome::Count(n)) => raw(RespValue::integer(n)),
            Ok(ZaddOutcome::Incr(Some(score))) => {
                raw(RespValue::bulk_string(format_score(score)))
            }
            Ok(ZaddOutcome::Incr(None)) => skip(RespValue::Null),
            Err(err) => skip(store_err(err)),
        }
    }

    fn cmd_xadd(&self, args: &[Bytes]) -> (RespValue, Propagation) {
        let key = &args[0];
        let spec = match text(&args[1]).and_then(|s| IdSpec::parse(s).ok()) {
            Some(spec) => spec,
            None => {
                return skip(RespValue::error(
                    "ERR Invalid stream ID specified as stream command argument",
                ))
            }
        };

        let rest = &args[2..];
        if rest.is_empty() || rest.len() % 2 != 0 {
            return skip(wrong_args("XADD"));
        }
        let fields: Vec<(Bytes, Bytes)> = rest
            .chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        match self.ctx.engine.xadd(key, spec, fields.clone()) {
            Ok(id) => {
                // Replicate the resolved id: `*` must not re-resolve
                // against the replica's clock.
                let mut record = vec![
                    Bytes::from_static(b"XADD"),
                    key.clone(),
                    Bytes::from(id.to_string()),
                ];
                for (field, value) in fields {
                    record.push(field);
                    record.push(value);
                }
                (
                    RespValue::bulk_string(id.to_string()),
                    Propagation::Frame(encode_command(&record)),
                )
            }
            Err(err) => skip(store_err(err)),
        }
    }

    // ========================================================================
    // Read / control commands
    // ========================================================================

    async fn dispatch_read(
        &self,
        name: &str,
        argv: &[Bytes],
        session: &mut Session,
    ) -> CommandOutcome {
        let args = &argv[1..];
        let reply = match name {
            "PING" => match args.first() {
                Some(message) => RespValue::BulkString(message.clone()),
                None => RespValue::pong(),
            },
            "ECHO" => RespValue::BulkString(args[0].clone()),
            "QUIT" => return CommandOutcome::Quit(RespValue::ok()),
            "COMMAND" => self.cmd_command(args),
            "CLIENT" => self.cmd_client(args, session),
            "SELECT" => match text(&args[0]).and_then(|s| s.parse::<i64>().ok()) {
                Some(0) => RespValue::ok(),
                Some(_) => RespValue::error("ERR DB index is out of range"),
                None => not_integer(),
            },
            "INFO" => self.cmd_info(args),
            "CONFIG" => self.cmd_config(args),
            "DBSIZE" => RespValue::integer(self.ctx.engine.dbsize() as i64),
            "DEBUG" => return self.cmd_debug(args).await,
            "TYPE" => RespValue::simple_string(self.ctx.engine.key_type(&args[0])),
            "EXISTS" => RespValue::integer(self.ctx.engine.exists(args) as i64),
            "KEYS" => bulk_array(self.ctx.engine.keys(&args[0])),
            "TTL" => match self.ctx.engine.pttl(&args[0]) {
                ms if ms < 0 => RespValue::integer(ms),
                ms => RespValue::integer((ms + 999) / 1000),
            },
            "PTTL" => RespValue::integer(self.ctx.engine.pttl(&args[0])),
            "SAVE" => self.cmd_save(),
            "BGSAVE" => self.cmd_bgsave(),
            "LASTSAVE" => RespValue::integer(self.ctx.snapshots.lastsave() as i64),
            "GET" => match self.ctx.engine.get(&args[0]) {
                Ok(Some(value)) => RespValue::BulkString(value),
                Ok(None) => RespValue::Null,
                Err(err) => store_err(err),
            },
            "STRLEN" => self
                .ctx
                .engine
                .strlen(&args[0])
                .map(|len| RespValue::integer(len as i64))
                .unwrap_or_else(store_err),
            "MGET" => RespValue::array(
                self.ctx
                    .engine
                    .mget(args)
                    .into_iter()
                    .map(|v| v.map(RespValue::BulkString).unwrap_or(RespValue::Null))
                    .collect(),
            ),
            "LRANGE" => self.cmd_lrange(args),
            "LLEN" => self
                .ctx
                .engine
                .llen(&args[0])
                .map(|len| RespValue::integer(len as i64))
                .unwrap_or_else(store_err),
            "LINDEX" => match int_arg(&args[1]) {
                Some(index) => match self.ctx.engine.lindex(&args[0], index) {
                    Ok(Some(value)) => RespValue::BulkString(value),
                    Ok(None) => RespValue::Null,
                    Err(err) => store_err(err),
                },
                None => not_integer(),
            },
            "SMEMBERS" => self
                .ctx
                .engine
                .smembers(&args[0])
                .map(bulk_array)
                .unwrap_or_else(store_err),
            "SISMEMBER" => self
                .ctx
                .engine
                .sismember(&args[0], &args[1])
                .map(|found| RespValue::integer(found as i64))
                .unwrap_or_else(store_err),
            "SCARD" => self
                .ctx
                .engine
                .scard(&args[0])
                .map(|n| RespValue::integer(n as i64))
                .unwrap_or_else(store_err),
            "SUNION" => self.cmd_set_combine(args, SetOp::Union),
            "SINTER" => self.cmd_set_combine(args, SetOp::Intersect),
            "SDIFF" => self.cmd_set_combine(args, SetOp::Diff),
            "HGET" => match self.ctx.engine.hget(&args[0], &args[1]) {
                Ok(Some(value)) => RespValue::BulkString(value),
                Ok(None) => RespValue::Null,
                Err(err) => store_err(err),
            },
            "HGETALL" => self
                .ctx
                .engine
                .hgetall(&args[0])
                .map(|pairs| {
                    bulk_array(pairs.into_iter().flat_map(|(f, v)| [f, v]).collect())
                })
                .unwrap_or_else(store_err),
            "HLEN" => self
                .ctx
                .engine
                .hlen(&args[0])
                .map(|n| RespValue::integer(n as i64))
                .unwrap_or_else(store_err),
            "HEXISTS" => self
                .ctx
                .engine
                .hexists(&args[0], &args[1])
                .map(|found| RespValue::integer(found as i64))
                .unwrap_or_else(store_err),
            "HKEYS" => self
                .ctx
                .engine
                .hkeys(&args[0])
                .map(bulk_array)
                .unwrap_or_else(store_err),
            "HVALS" => self
                .ctx
                .engine
                .hvals(&args[0])
                .map(bulk_array)
                .unwrap_or_else(store_err),
            "ZRANGE" => self.cmd_zrange(args),
            "ZRANGEBYSCORE" => self.cmd_zrangebyscore(args),
            "ZRANK" => self.cmd_zrank(args, false),
            "ZREVRANK" => self.cmd_zrank(args, true),
            "ZSCORE" => match self.ctx.engine.zscore(&args[0], &args[1]) {
                Ok(Some(score)) => RespValue::bulk_string(format_score(score)),
                Ok(None) => RespValue::Null,
                Err(err) => store_err(err),
            },
            "ZCARD" => self
                .ctx
                .engine
                .zcard(&args[0])
                .map(|n| RespValue::integer(n as i64))
                .unwrap_or_else(store_err),
            "ZCOUNT" => self.cmd_zcount(args),
            "XRANGE" => self.cmd_xrange(args),
            "XLEN" => self
                .ctx
                .engine
                .xlen(&args[0])
                .map(|n| RespValue::integer(n as i64))
                .unwrap_or_else(store_err),
            "XREAD" => return CommandOutcome::Reply(self.cmd_xread(args).await),
            "SUBSCRIBE" => return self.cmd_subscribe(args, session),
            "UNSUBSCRIBE" => return self.cmd_unsubscribe(args, session),
            "PUBLISH" => {
                RespValue::integer(self.ctx.pubsub.publish(&args[0], args[1].clone()) as i64)
            }
            "REPLCONF" => return self.cmd_replconf(args, session),
            "PSYNC" => return self.cmd_psync(args, session),
            "WAIT" => RespValue::integer(0),
            _ => RespValue::error(format!("ERR unknown command '{}'", name.to_lowercase())),
        };
        CommandOutcome::Reply(reply)
    }

    fn cmd_command(&self, args: &[Bytes]) -> RespValue {
        match args.first().and_then(|a| text(a)).map(|s| s.to_uppercase()) {
            Some(sub) if sub == "COUNT" => RespValue::integer(table::COMMAND_COUNT as i64),
            _ => RespValue::array(Vec::new()),
        }
    }

    fn cmd_client(&self, args: &[Bytes], session: &mut Session) -> RespValue {
        match text(&args[0]).map(|s| s.to_uppercase()).as_deref() {
            Some("ID") => RespValue::integer(session.id as i64),
            Some("SETNAME") => match args.get(1) {
                Some(name) => {
                    session.name = Some(name.clone());
                    RespValue::ok()
                }
                None => wrong_args("CLIENT|SETNAME"),
            },
            Some("GETNAME") => RespValue::BulkString(
                session.name.clone().unwrap_or_else(Bytes::new),
            ),
            // SETINFO and friends from newer clients: accept quietly.
            _ => RespValue::ok(),
        }
    }

    fn cmd_lrange(&self, args: &[Bytes]) -> RespValue {
        let (start, stop) = match (int_arg(&args[1]), int_arg(&args[2])) {
            (Some(start), Some(stop)) => (start, stop),
            _ => return not_integer(),
        };
        self.ctx
            .engine
            .lrange(&args[0], start, stop)
            .map(bulk_array)
            .unwrap_or_else(store_err)
    }

    fn cmd_set_combine(&self, args: &[Bytes], op: SetOp) -> RespValue {
        self.ctx
            .engine
            .set_combine(args, op)
            .map(bulk_array)
            .unwrap_or_else(store_err)
    }

    fn cmd_zrange(&self, args: &[Bytes]) -> RespValue {
        let (start, stop) = match (int_arg(&args[1]), int_arg(&args[2])) {
            (Some(start), Some(stop)) => (start, stop),
            _ => return not_integer(),
        };
        let with_scores = match args.get(3) {
            Some(flag) => match text(flag).map(|s| s.to_uppercase()).as_deref() {
                Some("WITHSCORES") => true,
                _ => return syntax_error(),
            },
            None => false,
        };
        match self.ctx.engine.zrange(&args[0], start, stop) {
            Ok(members) => zset_reply(members, with_scores),
            Err(err) => store_err(err),
        }
    }

    fn cmd_zrangebyscore(&self, args: &[Bytes]) -> RespValue {
        let bounds = (
            text(&args[1]).and_then(ScoreBound::parse),
            text(&args[2]).and_then(ScoreBound::parse),
        );
        let (min, max) = match bounds {
            (Some(min), Some(max)) => (min, max),
            _ => return RespValue::error("ERR min or max is not a float"),
        };
        match self.ctx.engine.zrangebyscore(&args[0], min, max) {
            Ok(members) => zset_reply(members, false),
            Err(err) => store_err(err),
        }
    }

    fn cmd_zrank(&self, args: &[Bytes], reverse: bool) -> RespValue {
        match self.ctx.engine.zrank(&args[0], &args[1], reverse) {
            Ok(Some(rank)) => RespValue::integer(rank as i64),
            Ok(None) => RespValue::Null,
            Err(err) => store_err(err),
        }
    }

    fn cmd_zcount(&self, args: &[Bytes]) -> RespValue {
        let bounds = (
            text(&args[1]).and_then(ScoreBound::parse),
            text(&args[2]).and_then(ScoreBound::parse),
        );
        let (min, max) = match bounds {
            (Some(min), Some(max)) => (min, max),
            _ => return RespValue::error("ERR min or max is not a float"),
        };
        self.ctx
            .engine
            .zcount(&args[0], min, max)
            .map(|n| RespValue::integer(n as i64))
            .unwrap_or_else(store_err)
    }

    fn cmd_xrange(&self, args: &[Bytes]) -> RespValue {
        let bounds = (
            text(&args[1]).and_then(|s| StreamId::parse_range_start(s).ok()),
            text(&args[2]).and_then(|s| StreamId::parse_range_end(s).ok()),
        );
        let (start, end) = match bounds {
            (Some(start), Some(end)) => (start, end),
            _ => {
                return RespValue::error(
                    "ERR Invalid stream ID specified as stream command argument",
                )
            }
        };
        match self.ctx.engine.xrange(&args[0], start, end) {
            Ok(entries) => entries_reply(&entries),
            Err(err) => store_err(err),
        }
    }

    /// XREAD [BLOCK ms] STREAMS key... id...
    ///
    /// When BLOCK is present and nothing is ready, the task parks on
    /// the engine's XADD wakeup and re-checks until data arrives or
    /// the timeout lapses. The entries become the reply to this very
    /// call.
    async fn cmd_xread(&self, args: &[Bytes]) -> RespValue {
        let mut i = 0;
        let mut block_ms: Option<u64> = None;
        if text(&args[0]).map(|s| s.eq_ignore_ascii_case("BLOCK")) == Some(true) {
            block_ms = match args.get(1).and_then(|a| int_arg(a)) {
                Some(ms) if ms >= 0 => Some(ms as u64),
                _ => return RespValue::error("ERR timeout is not an integer or out of range"),
            };
            i = 2;
        }

        match args.get(i).and_then(|a| text(a)) {
            Some(s) if s.eq_ignore_ascii_case("STREAMS") => {}
            _ => return syntax_error(),
        }
        let rest = &args[i + 1..];
        if rest.is_empty() || rest.len() % 2 != 0 {
            return RespValue::error(
                "ERR Unbalanced XREAD list of streams: for each stream key an ID or '$' must be specified",
            );
        }

        let count = rest.len() / 2;
        let keys = &rest[..count];
        let mut after = Vec::with_capacity(count);
        for (key, id_arg) in keys.iter().zip(&rest[count..]) {
            let id = match text(id_arg) {
                Some("$") => match self.ctx.engine.stream_last_id(key) {
                    Ok(id) => id,
                    Err(err) => return store_err(err),
                },
                Some(s) => match StreamId::parse(s) {
                    Ok(id) => id,
                    Err(err) => return store_err(err.into()),
                },
                None => {
                    return RespValue::error(
                        "ERR Invalid stream ID specified as stream command argument",
                    )
                }
            };
            after.push(id);
        }

        let deadline = block_ms.and_then(|ms| {
            if ms == 0 {
                None // BLOCK 0: wait forever
            } else {
                Some(tokio::time::Instant::now() + Duration::from_millis(ms))
            }
        });

        loop {
            // Arm the wakeup before checking, so an XADD racing the
            // check cannot be missed.
            let notify = self.ctx.engine.xadd_notify();
            let notified = notify.notified();

            let mut found = Vec::new();
            for (key, after_id) in keys.iter().zip(&after) {
                match self.ctx.engine.xread_after(key, *after_id) {
                    Ok(entries) if !entries.is_empty() => {
                        found.push((key.clone(), entries));
                    }
                    Ok(_) => {}
                    Err(err) => return store_err(err),
                }
            }
            if !found.is_empty() {
                return RespValue::array(
                    found
                        .into_iter()
                        .map(|(key, entries)| {
                            RespValue::array(vec![
                                RespValue::BulkString(key),
                                entries_reply(&entries),
                            ])
                        })
                        .collect(),
                );
            }

            if block_ms.is_none() {
                return RespValue::NullArray;
            }
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => return RespValue::NullArray,
                    }
                }
                None => notified.await,
            }
        }
    }

    fn cmd_subscribe(&self, args: &[Bytes], session: &mut Session) -> CommandOutcome {
        let mut replies = Vec::with_capacity(args.len());
        for channel in args {
            session.subscriptions.insert(channel.clone());
            self.ctx.pubsub.subscribe(
                session.id,
                channel.clone(),
                SubscriberHandle {
                    tx: session.outbox_tx.clone(),
                    kill: Arc::clone(&session.kill),
                },
            );
            replies.push(RespValue::array(vec![
                RespValue::bulk_string("subscribe"),
                RespValue::BulkString(channel.clone()),
                RespValue::integer(session.subscriptions.len() as i64),
            ]));
        }
        session.enter_subscribed();
        CommandOutcome::MultiReply(replies)
    }

    fn cmd_unsubscribe(&self, args: &[Bytes], session: &mut Session) -> CommandOutcome {
        let channels: Vec<Bytes> = if args.is_empty() {
            session.subscriptions.iter().cloned().collect()
        } else {
            args.to_vec()
        };

        let mut replies = Vec::new();
        if channels.is_empty() {
            replies.push(RespValue::array(vec![
                RespValue::bulk_string("unsubscribe"),
                RespValue::Null,
                RespValue::integer(0),
            ]));
        }
        for channel in channels {
            self.ctx.pubsub.unsubscribe(session.id, &channel);
            session.subscriptions.remove(&channel);
            replies.push(RespValue::array(vec![
                RespValue::bulk_string("unsubscribe"),
                RespValue::BulkString(channel),
                RespValue::integer(session.subscriptions.len() as i64),
            ]));
        }
        if session.subscriptions.is_empty() {
            session.leave_subscribed();
        }
        CommandOutcome::MultiReply(replies)
    }

    fn cmd_replconf(&self, args: &[Bytes], session: &mut Session) -> CommandOutcome {
        match args.first().and_then(|a| text(a)).map(|s| s.to_uppercase()).as_deref() {
            Some("ACK") => {
                if let Some(offset) = args.get(1).and_then(|a| text(a)).and_then(|s| s.parse().ok())
                {
                    self.ctx.repl.record_ack(session.id, offset);
                }
                CommandOutcome::NoReply
            }
            Some("GETACK") => {
                let offset = if self.ctx.is_follower() {
                    self.ctx.follower_offset.load(Ordering::Relaxed)
                } else {
                    self.ctx.repl.offset()
                };
                CommandOutcome::Reply(RespValue::array(vec![
                    RespValue::bulk_string("REPLCONF"),
                    RespValue::bulk_string("ACK"),
                    RespValue::bulk_string(offset.to_string()),
                ]))
            }
            // listening-port / capa and anything else from the
            // handshake succeed quietly.
            _ => CommandOutcome::Reply(RespValue::ok()),
        }
    }

    /// PSYNC: try a partial resync against the backlog, otherwise
    /// serialize the keyspace and grant a FULLRESYNC. Registration and
    /// snapshot capture happen under the write lock so no committed
    /// write can fall between the snapshot and the feed.
    fn cmd_psync(&self, args: &[Bytes], session: &mut Session) -> CommandOutcome {
        let requested_id = text(&args[0]).unwrap_or("?");
        let requested_offset = text(&args[1]).and_then(|s| s.parse::<u64>().ok());

        let _guard = self.ctx.write_order.lock().unwrap();

        if let Some(offset) = requested_offset {
            if let Some(suffix) = self.ctx.repl.partial_sync(requested_id, offset) {
                self.ctx
                    .repl
                    .register_replica(session.id, session.outbox_tx.clone(), Arc::clone(&session.kill));
                session.enter_replica_stream();
                let mut preamble =
                    format!("+CONTINUE {}\r\n", self.ctx.repl.replication_id()).into_bytes();
                preamble.extend_from_slice(&suffix);
                return CommandOutcome::StartReplicaStream {
                    preamble: Bytes::from(preamble),
                };
            }
        }

        let offset = self.ctx.repl.offset();
        let dump = rdb::serialize(&self.ctx.engine.snapshot());
        self.ctx.stats.full_sync_performed();
        let mut preamble = format!(
            "+FULLRESYNC {} {}\r\n${}\r\n",
            self.ctx.repl.replication_id(),
            offset,
            dump.len()
        )
        .into_bytes();
        preamble.extend_from_slice(&dump);

        self.ctx
            .repl
            .register_replica(session.id, session.outbox_tx.clone(), Arc::clone(&session.kill));
        session.enter_replica_stream();
        CommandOutcome::StartReplicaStream {
            preamble: Bytes::from(preamble),
        }
    }

    fn cmd_save(&self) -> RespValue {
        // SAVE is synchronous and blocks writes for its duration.
        let _guard = self.ctx.write_order.lock().unwrap();
        let path = self.ctx.rdb_path();
        match self.ctx.snapshots.save(&self.ctx.engine, &path) {
            Ok(()) => RespValue::ok(),
            Err(err) => RespValue::error(err.to_string()),
        }
    }

    fn cmd_bgsave(&self) -> RespValue {
        let path = self.ctx.rdb_path();
        match self.ctx.snapshots.bgsave(&self.ctx.engine, path) {
            Ok(()) => RespValue::simple_string("Background saving started"),
            Err(err) => RespValue::error(err.to_string()),
        }
    }

    async fn cmd_debug(&self, args: &[Bytes]) -> CommandOutcome {
        let reply = match text(&args[0]).map(|s| s.to_uppercase()).as_deref() {
            Some("SLEEP") => {
                let seconds = args
                    .get(1)
                    .and_then(|a| float_arg(a))
                    .filter(|s| *s >= 0.0)
                    .unwrap_or(0.0);
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                RespValue::ok()
            }
            Some("SET-ACTIVE-EXPIRE") | Some("JMAP") | Some("QUICKLIST-PACKED-THRESHOLD") => {
                RespValue::ok()
            }
            _ => RespValue::error("ERR DEBUG subcommand not supported"),
        };
        CommandOutcome::Reply(reply)
    }

    fn cmd_info(&self, args: &[Bytes]) -> RespValue {
        let filter = args
            .first()
            .and_then(|a| text(a))
            .map(|s| s.to_lowercase());
        let wants = |section: &str| match &filter {
            Some(filter) => filter == section,
            None => true,
        };

        let mut out = String::new();
        if wants("server") {
            out.push_str("# Server\r\n");
            out.push_str(&format!("coolcache_version:{}\r\n", crate::VERSION));
            out.push_str(&format!("tcp_port:{}\r\n", self.ctx.port));
            out.push_str(&format!(
                "uptime_in_seconds:{}\r\n",
                self.ctx.start_time.elapsed().as_secs()
            ));
            out.push_str("\r\n");
        }
        if wants("clients") {
            out.push_str("# Clients\r\n");
            out.push_str(&format!(
                "connected_clients:{}\r\n",
                self.ctx.stats.connected_clients()
            ));
            out.push_str("\r\n");
        }
        if wants("stats") {
            let storage = self.ctx.engine.stats();
            out.push_str("# Stats\r\n");
            out.push_str(&format!(
                "total_connections_received:{}\r\n",
                self.ctx.stats.connections_received()
            ));
            out.push_str(&format!(
                "total_commands_processed:{}\r\n",
                self.ctx.stats.commands_processed()
            ));
            out.push_str(&format!(
                "write_commands:{}\r\n",
                self.ctx.stats.write_commands()
            ));
            out.push_str(&format!("sync_full:{}\r\n", self.ctx.stats.full_syncs()));
            out.push_str(&format!("expired_keys:{}\r\n", storage.expired));
            out.push_str("\r\n");
        }
        if wants("replication") {
            out.push_str("# Replication\r\n");
            match &self.ctx.role {
                Role::Leader => {
                    out.push_str("role:master\r\n");
                    out.push_str(&format!(
                        "connected_slaves:{}\r\n",
                        self.ctx.repl.replica_count()
                    ));
                    out.push_str(&format!(
                        "master_replid:{}\r\n",
                        self.ctx.repl.replication_id()
                    ));
                    out.push_str(&format!(
                        "master_repl_offset:{}\r\n",
                        self.ctx.repl.offset()
                    ));
                }
                Role::Follower { host, port } => {
                    out.push_str("role:slave\r\n");
                    out.push_str(&format!("master_host:{}\r\n", host));
                    out.push_str(&format!("master_port:{}\r\n", port));
                    out.push_str("connected_slaves:0\r\n");
                    out.push_str(&format!(
                        "master_replid:{}\r\n",
                        self.ctx.repl.replication_id()
                    ));
                    out.push_str(&format!(
                        "master_repl_offset:{}\r\n",
                        self.ctx.follower_offset.load(Ordering::Relaxed)
                    ));
                }
            }
            out.push_str("\r\n");
        }
        if wants("keyspace") {
            out.push_str("# Keyspace\r\n");
            let keys = self.ctx.engine.dbsize();
            if keys > 0 {
                out.push_str(&format!(
                    "db0:keys={},expires={},avg_ttl=0\r\n",
                    keys,
                    self.ctx.engine.expires_count()
                ));
            }
            out.push_str("\r\n");
        }

        if out.is_empty() {
            RespValue::error("ERR unknown INFO section")
        } else {
            RespValue::bulk_string(out)
        }
    }

    fn cmd_config(&self, args: &[Bytes]) -> RespValue {
        match text(&args[0]).map(|s| s.to_uppercase()).as_deref() {
            Some("GET") => {
                if args.len() < 2 {
                    return wrong_args("CONFIG|GET");
                }
                let settings = self.ctx.settings.read().unwrap();
                let mut reply = Vec::new();
                for param in &args[1..] {
                    match text(param).map(|s| s.to_lowercase()).as_deref() {
                        Some("dir") => {
                            reply.push(Bytes::from_static(b"dir"));
                            reply.push(Bytes::from(settings.dir.display().to_string()));
                        }
                        Some("dbfilename") => {
                            reply.push(Bytes::from_static(b"dbfilename"));
                            reply.push(Bytes::from(settings.dbfilename.clone()));
                        }
                        Some("save") => {
                            reply.push(Bytes::from_static(b"save"));
                            reply.push(Bytes::from(persistence::format_save_points(
                                &settings.save_points,
                            )));
                        }
                        _ => {} // unknown parameters are omitted
                    }
                }
                bulk_array(reply)
            }
            Some("SET") => {
                if args.len() < 3 || args.len() % 2 != 1 {
                    return wrong_args("CONFIG|SET");
                }
                let mut settings = self.ctx.settings.write().unwrap();
                for pair in args[1..].chunks(2) {
                    let value = match text(&pair[1]) {
                        Some(value) => value.to_string(),
                        None => return syntax_error(),
                    };
                    match text(&pair[0]).map(|s| s.to_lowercase()).as_deref() {
                        Some("dir") => settings.dir = PathBuf::from(&value),
                        Some("dbfilename") => settings.dbfilename = value,
                        Some("save") => match persistence::parse_save_points(&value) {
                            Some(points) => settings.save_points = points,
                            None => return RespValue::error("ERR Invalid save parameters"),
                        },
                        _ => {
                            return RespValue::error(format!(
                                "ERR Unknown option or number of arguments for CONFIG SET - '{}'",
                                text(&pair[0]).unwrap_or("?")
                            ))
                        }
                    }
                }
                RespValue::ok()
            }
            Some(other) => RespValue::error(format!(
                "ERR Unknown CONFIG subcommand or wrong number of arguments for '{}'",
                other.to_lowercase()
            )),
            None => syntax_error(),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn raw(reply: RespValue) -> (RespValue, Propagation) {
    (reply, Propagation::Raw)
}

fn skip(reply: RespValue) -> (RespValue, Propagation) {
    (reply, Propagation::Skip)
}

/// Pulls an argv of byte strings out of a decoded command frame.
fn argv_from(frame: RespValue) -> Option<Vec<Bytes>> {
    let items = match frame {
        RespValue::Array(items) => items,
        _ => return None,
    };
    let mut argv = Vec::with_capacity(items.len());
    for item in items {
        match item {
            RespValue::BulkString(bytes) => argv.push(bytes),
            RespValue::SimpleString(s) => argv.push(Bytes::from(s)),
            RespValue::Integer(n) => argv.push(Bytes::from(n.to_string())),
            _ => return None,
        }
    }
    Some(argv)
}

fn text(arg: &Bytes) -> Option<&str> {
    std::str::from_utf8(arg).ok()
}

fn int_arg(arg: &Bytes) -> Option<i64> {
    text(arg).and_then(|s| s.parse().ok())
}

fn float_arg(arg: &Bytes) -> Option<f64> {
    text(arg).and_then(|s| s.parse().ok())
}

fn wrong_args(name: &str) -> RespValue {
    RespValue::error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_lowercase()
    ))
}

fn syntax_error() -> RespValue {
    RespValue::error("ERR syntax error")
}

fn not_integer() -> RespValue {
    RespValue::error("ERR value is not an integer or out of range")
}

fn not_float() -> RespValue {
    RespValue::error("ERR value is not a valid float")
}

fn store_err(err: crate::storage::StoreError) -> RespValue {
    RespValue::Error(err.to_string())
}

fn bulk_array(items: Vec<Bytes>) -> RespValue {
    RespValue::array(items.into_iter().map(RespValue::BulkString).collect())
}

fn zset_reply(members: Vec<(Bytes, f64)>, with_scores: bool) -> RespValue {
    let mut out = Vec::with_capacity(members.len() * if with_scores { 2 } else { 1 });
    for (member, score) in members {
        out.push(RespValue::BulkString(member));
        if with_scores {
            out.push(RespValue::bulk_string(format_score(score)));
        }
    }
    RespValue::Array(out)
}

/// `[id, [field, value, ...]]` per entry, the XRANGE/XREAD shape.
fn entries_reply(entries: &[StreamEntry]) -> RespValue {
    RespValue::array(
        entries
            .iter()
            .map(|entry| {
                let fields = entry
                    .fields
                    .iter()
                    .flat_map(|(f, v)| {
                        [
                            RespValue::BulkString(f.clone()),
                            RespValue::BulkString(v.clone()),
                        ]
                    })
                    .collect();
                RespValue::array(vec![
                    RespValue::bulk_string(entry.id.to_string()),
                    RespValue::Array(fields),
                ])
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Role, ServerContext, Settings};

    fn test_ctx() -> Arc<ServerContext> {
        ServerContext::new(
            0,
            Role::Leader,
            Settings {
                dir: std::env::temp_dir(),
                dbfilename: format!("coolcache-test-{}.rdb", std::process::id()),
                save_points: Vec::new(),
            },
        )
    }

    fn command(parts: &[&str]) -> (RespValue, Bytes) {
        let frame = RespValue::array(
            parts
                .iter()
                .map(|p| RespValue::bulk_string(p.to_string()))
                .collect(),
        );
        let raw = Bytes::from(frame.serialize());
        (frame, raw)
    }

    async fn run(handler: &CommandHandler, session: &mut Session, parts: &[&str]) -> RespValue {
        let (frame, raw) = command(parts);
        match handler.execute(frame, raw, session).await {
            CommandOutcome::Reply(reply) => reply,
            CommandOutcome::Quit(reply) => reply,
            CommandOutcome::MultiReply(mut replies) => replies.remove(0),
            _ => panic!("unexpected outcome"),
        }
    }

    fn setup() -> (CommandHandler, Session) {
        let ctx = test_ctx();
        let handler = CommandHandler::new(Arc::clone(&ctx));
        let session = Session::for_tests(1);
        (handler, session)
    }

    #[tokio::test]
    async fn ping_and_echo() {
        let (handler, mut session) = setup();
        assert_eq!(run(&handler, &mut session, &["PING"]).await, RespValue::pong());
        assert_eq!(
            run(&handler, &mut session, &["ECHO", "hey"]).await,
            RespValue::bulk_string("hey")
        );
    }

    #[tokio::test]
    async fn unknown_command_and_arity() {
        let (handler, mut session) = setup();
        let reply = run(&handler, &mut session, &["NOPE"]).await;
        assert!(matches!(reply, RespValue::Error(e) if e.contains("unknown command")));

        let reply = run(&handler, &mut session, &["GET"]).await;
        assert!(
            matches!(reply, RespValue::Error(e) if e.contains("wrong number of arguments for 'get'"))
        );
    }

    #[tokio::test]
    async fn set_get_roundtrip_and_options() {
        let (handler, mut session) = setup();
        assert_eq!(
            run(&handler, &mut session, &["SET", "foo", "bar"]).await,
            RespValue::ok()
        );
        assert_eq!(
            run(&handler, &mut session, &["GET", "foo"]).await,
            RespValue::bulk_string("bar")
        );

        // NX refuses to overwrite.
        assert_eq!(
            run(&handler, &mut session, &["SET", "foo", "baz", "NX"]).await,
            RespValue::Null
        );
        // XX against a missing key refuses too.
        assert_eq!(
            run(&handler, &mut session, &["SET", "nope", "x", "XX"]).await,
            RespValue::Null
        );
        // Conflicting options are a syntax error.
        let reply = run(&handler, &mut session, &["SET", "k", "v", "NX", "XX"]).await;
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn set_with_px_expires() {
        let (handler, mut session) = setup();
        run(&handler, &mut session, &["SET", "t", "v", "PX", "40"]).await;
        assert_eq!(
            run(&handler, &mut session, &["GET", "t"]).await,
            RespValue::bulk_string("v")
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(run(&handler, &mut session, &["GET", "t"]).await, RespValue::Null);
        assert_eq!(
            run(&handler, &mut session, &["DBSIZE"]).await,
            RespValue::integer(0)
        );
    }

    #[tokio::test]
    async fn writes_feed_replication_log() {
        let (handler, mut session) = setup();
        let before = handler.ctx.repl.offset();
        run(&handler, &mut session, &["SET", "a", "1"]).await;
        let (_, raw) = command(&["SET", "a", "1"]);
        assert_eq!(handler.ctx.repl.offset(), before + raw.len() as u64);
        assert_eq!(handler.ctx.engine.changes(), 1);

        // Reads do not advance the log.
        run(&handler, &mut session, &["GET", "a"]).await;
        assert_eq!(handler.ctx.repl.offset(), before + raw.len() as u64);
    }

    #[tokio::test]
    async fn failed_writes_are_not_replicated() {
        let (handler, mut session) = setup();
        run(&handler, &mut session, &["LPUSH", "L", "x"]).await;
        let offset = handler.ctx.repl.offset();

        let reply = run(&handler, &mut session, &["INCR", "L"]).await;
        assert!(reply.is_error());
        assert_eq!(handler.ctx.repl.offset(), offset);
    }

    #[tokio::test]
    async fn list_scenario() {
        let (handler, mut session) = setup();
        assert_eq!(
            run(&handler, &mut session, &["RPUSH", "L", "a", "b", "c"]).await,
            RespValue::integer(3)
        );
        assert_eq!(
            run(&handler, &mut session, &["LRANGE", "L", "0", "-1"]).await,
            RespValue::array(vec![
                RespValue::bulk_string("a"),
                RespValue::bulk_string("b"),
                RespValue::bulk_string("c"),
            ])
        );
        assert_eq!(
            run(&handler, &mut session, &["LPOP", "L"]).await,
            RespValue::bulk_string("a")
        );
        assert_eq!(
            run(&handler, &mut session, &["LLEN", "L"]).await,
            RespValue::integer(2)
        );
    }

    #[tokio::test]
    async fn hash_and_type_commands() {
        let (handler, mut session) = setup();
        assert_eq!(
            run(&handler, &mut session, &["HSET", "h", "f1", "v1", "f2", "v2"]).await,
            RespValue::integer(2)
        );
        assert_eq!(
            run(&handler, &mut session, &["HGET", "h", "f1"]).await,
            RespValue::bulk_string("v1")
        );
        assert_eq!(
            run(&handler, &mut session, &["TYPE", "h"]).await,
            RespValue::simple_string("hash")
        );
        assert_eq!(
            run(&handler, &mut session, &["TYPE", "none"]).await,
            RespValue::simple_string("none")
        );

        let reply = run(&handler, &mut session, &["GET", "h"]).await;
        assert!(matches!(reply, RespValue::Error(e) if e.starts_with("WRONGTYPE")));
    }

    #[tokio::test]
    async fn zadd_zrange_withscores() {
        let (handler, mut session) = setup();
        run(
            &handler,
            &mut session,
            &["ZADD", "z", "2", "b", "1", "a", "3", "c"],
        )
        .await;
        assert_eq!(
            run(&handler, &mut session, &["ZRANGE", "z", "0", "-1", "WITHSCORES"]).await,
            RespValue::array(vec![
                RespValue::bulk_string("a"),
                RespValue::bulk_string("1"),
                RespValue::bulk_string("b"),
                RespValue::bulk_string("2"),
                RespValue::bulk_string("c"),
                RespValue::bulk_string("3"),
            ])
        );
        assert_eq!(
            run(&handler, &mut session, &["ZSCORE", "z", "b"]).await,
            RespValue::bulk_string("2")
        );
        assert_eq!(
            run(&handler, &mut session, &["ZRANK", "z", "c"]).await,
            RespValue::integer(2)
        );
    }

    #[tokio::test]
    async fn stream_scenario() {
        let (handler, mut session) = setup();
        assert_eq!(
            run(&handler, &mut session, &["XADD", "s", "1-1", "f", "v"]).await,
            RespValue::bulk_string("1-1")
        );
        assert_eq!(
            run(&handler, &mut session, &["XADD", "s", "1-2", "f", "v"]).await,
            RespValue::bulk_string("1-2")
        );

        let reply = run(&handler, &mut session, &["XADD", "s", "1-1", "f", "v"]).await;
        assert!(
            matches!(reply, RespValue::Error(e) if e.contains("equal or smaller than the target stream top item"))
        );

        let reply = run(&handler, &mut session, &["XRANGE", "s", "-", "+"]).await;
        match reply {
            RespValue::Array(entries) => assert_eq!(entries.len(), 2),
            other => panic!("unexpected XRANGE reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn xread_nonblocking_and_dollar() {
        let (handler, mut session) = setup();
        run(&handler, &mut session, &["XADD", "s", "1-1", "f", "v"]).await;

        let reply = run(&handler, &mut session, &["XREAD", "STREAMS", "s", "0-0"]).await;
        match reply {
            RespValue::Array(streams) => assert_eq!(streams.len(), 1),
            other => panic!("unexpected XREAD reply: {:?}", other),
        }

        // Nothing after the last id: nil array.
        assert_eq!(
            run(&handler, &mut session, &["XREAD", "STREAMS", "s", "$"]).await,
            RespValue::NullArray
        );
    }

    #[tokio::test]
    async fn xread_block_wakes_on_xadd() {
        let (handler, _session) = setup();
        let writer = handler.clone();

        let reader = tokio::spawn(async move {
            let ctx = handler;
            let mut session = Session::for_tests(2);
            run(
                &ctx,
                &mut session,
                &["XREAD", "BLOCK", "0", "STREAMS", "s", "$"],
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut writer_session = Session::for_tests(3);
        run(&writer, &mut writer_session, &["XADD", "s", "5-1", "f", "v"]).await;

        let reply = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("XREAD never woke")
            .unwrap();
        match reply {
            RespValue::Array(streams) => assert_eq!(streams.len(), 1),
            other => panic!("unexpected blocked XREAD reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn xread_block_times_out() {
        let (handler, mut session) = setup();
        let reply = run(
            &handler,
            &mut session,
            &["XREAD", "BLOCK", "60", "STREAMS", "nothing", "0-0"],
        )
        .await;
        assert_eq!(reply, RespValue::NullArray);
    }

    #[tokio::test]
    async fn subscribe_gates_commands() {
        let (handler, mut session) = setup();
        let (frame, raw) = command(&["SUBSCRIBE", "ch"]);
        match handler.execute(frame, raw, &mut session).await {
            CommandOutcome::MultiReply(replies) => {
                assert_eq!(replies.len(), 1);
                assert_eq!(
                    replies[0],
                    RespValue::array(vec![
                        RespValue::bulk_string("subscribe"),
                        RespValue::bulk_string("ch"),
                        RespValue::integer(1),
                    ])
                );
            }
            _ => panic!("expected MultiReply"),
        }
        assert!(session.is_subscribed());

        // Non-pubsub commands are refused in subscribed mode.
        let reply = run(&handler, &mut session, &["GET", "x"]).await;
        assert!(matches!(reply, RespValue::Error(e) if e.contains("only (P)SUBSCRIBE")));
        // PING still works.
        assert_eq!(run(&handler, &mut session, &["PING"]).await, RespValue::pong());

        // Unsubscribing from everything leaves subscribed mode.
        let (frame, raw) = command(&["UNSUBSCRIBE"]);
        handler.execute(frame, raw, &mut session).await;
        assert!(!session.is_subscribed());
        assert_eq!(
            run(&handler, &mut session, &["GET", "x"]).await,
            RespValue::Null
        );
    }

    #[tokio::test]
    async fn publish_counts_subscribers() {
        let (handler, mut session) = setup();
        assert_eq!(
            run(&handler, &mut session, &["PUBLISH", "ch", "hi"]).await,
            RespValue::integer(0)
        );
    }

    #[tokio::test]
    async fn config_get_set() {
        let (handler, mut session) = setup();
        run(
            &handler,
            &mut session,
            &["CONFIG", "SET", "dbfilename", "other.rdb"],
        )
        .await;
        let reply = run(&handler, &mut session, &["CONFIG", "GET", "dbfilename"]).await;
        assert_eq!(
            reply,
            RespValue::array(vec![
                RespValue::bulk_string("dbfilename"),
                RespValue::bulk_string("other.rdb"),
            ])
        );

        run(&handler, &mut session, &["CONFIG", "SET", "save", "60 5"]).await;
        let reply = run(&handler, &mut session, &["CONFIG", "GET", "save"]).await;
        assert_eq!(
            reply,
            RespValue::array(vec![
                RespValue::bulk_string("save"),
                RespValue::bulk_string("60 5"),
            ])
        );
    }

    #[tokio::test]
    async fn info_has_replication_section() {
        let (handler, mut session) = setup();
        let reply = run(&handler, &mut session, &["INFO", "replication"]).await;
        match reply {
            RespValue::BulkString(body) => {
                let body = String::from_utf8_lossy(&body);
                assert!(body.contains("role:master"));
                assert!(body.contains("master_repl_offset:0"));
                assert!(body.contains("connected_slaves:0"));
            }
            other => panic!("unexpected INFO reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn expire_and_ttl() {
        let (handler, mut session) = setup();
        run(&handler, &mut session, &["SET", "k", "v"]).await;
        assert_eq!(
            run(&handler, &mut session, &["TTL", "k"]).await,
            RespValue::integer(-1)
        );
        assert_eq!(
            run(&handler, &mut session, &["EXPIRE", "k", "100"]).await,
            RespValue::integer(1)
        );
        assert_eq!(
            run(&handler, &mut session, &["TTL", "k"]).await,
            RespValue::integer(100)
        );
        assert_eq!(
            run(&handler, &mut session, &["TTL", "missing"]).await,
            RespValue::integer(-2)
        );
    }

    #[tokio::test]
    async fn wait_is_a_stub() {
        let (handler, mut session) = setup();
        assert_eq!(
            run(&handler, &mut session, &["WAIT", "1", "100"]).await,
            RespValue::integer(0)
        );
    }

    #[tokio::test]
    async fn replicated_writes_apply_silently() {
        let (handler, _session) = setup();
        let (frame, _) = command(&["SET", "from-leader", "1"]);
        handler.apply_replicated(frame).await;
        assert_eq!(
            handler.ctx.engine.get(b"from-leader").unwrap(),
            Some(Bytes::from("1"))
        );
        // Writes applied from the link do not re-propagate.
        assert_eq!(handler.ctx.repl.offset(), 0);

        // Reads over the link are ignored.
        let (frame, _) = command(&["GET", "from-leader"]);
        handler.apply_replicated(frame).await;
    }

    #[tokio::test]
    async fn spop_replicates_as_srem() {
        let (handler, mut session) = setup();
        run(&handler, &mut session, &["SADD", "s", "only"]).await;
        let offset_before = handler.ctx.repl.offset();

        let reply = run(&handler, &mut session, &["SPOP", "s"]).await;
        assert_eq!(reply, RespValue::bulk_string("only"));

        let srem_record = crate::protocol::encode_command_str(&["SREM", "s", "only"]);
        assert_eq!(
            handler.ctx.repl.offset(),
            offset_before + srem_record.len() as u64
        );
    }

    #[tokio::test]
    async fn quit_closes() {
        let (handler, mut session) = setup();
        let (frame, raw) = command(&["QUIT"]);
        assert!(matches!(
            handler.execute(frame, raw, &mut session).await,
            CommandOutcome::Quit(_)
        ));
    }
}
