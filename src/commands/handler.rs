//! Command parsing and dispatch.
//!
//! [`CommandHandler::build_transaction`] validates arity and arguments, then builds the
//! [`Transaction`] over the keys the command touches. Nothing is scheduled on a shard
//! until the resulting [`Invocation`] runs, so a malformed command never has side
//! effects.

use crate::commands::collections::{self, ListEnd};
use crate::commands::generic::{self, ExpireAt, ScanOptions, SortOptions, TtlUnit};
use crate::commands::server;
use crate::commands::strings::{self, SetCondition, SetOptions};
use crate::engine::{ScanCursor, ShardSet, Transaction, TxDebugInfo};
use crate::error::{EngineError, EngineResult};
use crate::reply::Reply;
use crate::storage::{GlobPattern, ScanFilter, ValueType};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace};

/// Default SCAN COUNT.
const DEFAULT_SCAN_COUNT: usize = 10;

/// A validated command.
#[derive(Debug, Clone)]
pub enum Command {
    Del { keys: Vec<Bytes> },
    Exists { keys: Vec<Bytes> },
    Ttl { key: Bytes, unit: TtlUnit },
    Expire { key: Bytes, when: ExpireAt },
    Persist { key: Bytes },
    Rename { src: Bytes, dst: Bytes },
    Type { key: Bytes },
    Keys { pattern: GlobPattern },
    Scan(ScanOptions),
    Sort { key: Bytes, opts: SortOptions },
    Set { key: Bytes, value: Bytes, opts: SetOptions },
    Get { key: Bytes },
    MSet { keys: Vec<Bytes>, values: Vec<Bytes> },
    MGet { keys: Vec<Bytes> },
    Push { key: Bytes, values: Vec<Bytes>, end: ListEnd },
    LRange { key: Bytes, start: i64, stop: i64 },
    Cardinality { key: Bytes, ty: ValueType },
    SAdd { key: Bytes, members: Vec<Bytes> },
    ZAdd { key: Bytes, pairs: Vec<(f64, Bytes)> },
    DbSize,
    Flush,
    Ping(Option<Bytes>),
}

impl Command {
    /// Name used for logging and as the transaction label.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Del { .. } => "del",
            Command::Exists { .. } => "exists",
            Command::Ttl { unit: TtlUnit::Seconds, .. } => "ttl",
            Command::Ttl { unit: TtlUnit::Millis, .. } => "pttl",
            Command::Expire { .. } => "expire",
            Command::Persist { .. } => "persist",
            Command::Rename { .. } => "rename",
            Command::Type { .. } => "type",
            Command::Keys { .. } => "keys",
            Command::Scan(_) => "scan",
            Command::Sort { .. } => "sort",
            Command::Set { .. } => "set",
            Command::Get { .. } => "get",
            Command::MSet { .. } => "mset",
            Command::MGet { .. } => "mget",
            Command::Push { end: ListEnd::Head, .. } => "lpush",
            Command::Push { end: ListEnd::Tail, .. } => "rpush",
            Command::LRange { .. } => "lrange",
            Command::Cardinality { .. } => "cardinality",
            Command::SAdd { .. } => "sadd",
            Command::ZAdd { .. } => "zadd",
            Command::DbSize => "dbsize",
            Command::Flush => "flushdb",
            Command::Ping(_) => "ping",
        }
    }

    /// Keys the command declares up front, in argument order.
    pub fn keys(&self) -> Vec<Bytes> {
        match self {
            Command::Del { keys }
            | Command::Exists { keys }
            | Command::MSet { keys, .. }
            | Command::MGet { keys } => keys.clone(),
            Command::Ttl { key, .. }
            | Command::Expire { key, .. }
            | Command::Persist { key }
            | Command::Type { key }
            | Command::Sort { key, .. }
            | Command::Set { key, .. }
            | Command::Get { key }
            | Command::Push { key, .. }
            | Command::LRange { key, .. }
            | Command::Cardinality { key, .. }
            | Command::SAdd { key, .. }
            | Command::ZAdd { key, .. } => vec![key.clone()],
            Command::Rename { src, dst } => vec![src.clone(), dst.clone()],
            Command::Keys { .. }
            | Command::Scan(_)
            | Command::DbSize
            | Command::Flush
            | Command::Ping(_) => Vec::new(),
        }
    }

    /// Parses `args` (without the command name) for command `name`.
    pub fn parse(name: &str, args: &[Bytes], shards: &ShardSet) -> EngineResult<Command> {
        let upper = name.to_ascii_uppercase();
        let arity = || EngineError::WrongArity(name.to_ascii_lowercase());

        let command = match upper.as_str() {
            "DEL" | "EXISTS" => {
                if args.is_empty() {
                    return Err(arity());
                }
                let keys = args.to_vec();
                if upper == "DEL" {
                    Command::Del { keys }
                } else {
                    Command::Exists { keys }
                }
            }
            "TTL" | "PTTL" => {
                let [key] = args else { return Err(arity()) };
                let unit = if upper == "TTL" {
                    TtlUnit::Seconds
                } else {
                    TtlUnit::Millis
                };
                Command::Ttl {
                    key: key.clone(),
                    unit,
                }
            }
            "EXPIRE" | "PEXPIRE" | "EXPIREAT" | "PEXPIREAT" => {
                let [key, when] = args else { return Err(arity()) };
                let amount = parse_i64(when)?;
                let in_millis = |n: i64| {
                    n.checked_mul(1000).ok_or_else(|| {
                        EngineError::invalid(format!(
                            "invalid expire time in '{}' command",
                            name.to_ascii_lowercase()
                        ))
                    })
                };
                let when = match upper.as_str() {
                    "EXPIRE" => ExpireAt::Relative(in_millis(amount)?),
                    "PEXPIRE" => ExpireAt::Relative(amount),
                    "EXPIREAT" => ExpireAt::Absolute(in_millis(amount)?),
                    _ => ExpireAt::Absolute(amount),
                };
                Command::Expire {
                    key: key.clone(),
                    when,
                }
            }
            "PERSIST" => {
                let [key] = args else { return Err(arity()) };
                Command::Persist { key: key.clone() }
            }
            "RENAME" => {
                let [src, dst] = args else { return Err(arity()) };
                Command::Rename {
                    src: src.clone(),
                    dst: dst.clone(),
                }
            }
            "TYPE" => {
                let [key] = args else { return Err(arity()) };
                Command::Type { key: key.clone() }
            }
            "KEYS" => {
                let [pattern] = args else { return Err(arity()) };
                Command::Keys {
                    pattern: GlobPattern::new(pattern.clone()),
                }
            }
            "SCAN" => {
                let Some((cursor, options)) = args.split_first() else {
                    return Err(arity());
                };
                Command::Scan(parse_scan(cursor, options, shards)?)
            }
            "SORT" => {
                let Some((key, options)) = args.split_first() else {
                    return Err(arity());
                };
                Command::Sort {
                    key: key.clone(),
                    opts: parse_sort(options)?,
                }
            }
            "SET" => {
                if args.len() < 2 {
                    return Err(arity());
                }
                Command::Set {
                    key: args[0].clone(),
                    value: args[1].clone(),
                    opts: parse_set(&args[2..])?,
                }
            }
            "GET" => {
                let [key] = args else { return Err(arity()) };
                Command::Get { key: key.clone() }
            }
            "MSET" => {
                if args.is_empty() || args.len() % 2 != 0 {
                    return Err(arity());
                }
                let (keys, values) = args
                    .chunks_exact(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .unzip();
                Command::MSet { keys, values }
            }
            "MGET" => {
                if args.is_empty() {
                    return Err(arity());
                }
                Command::MGet {
                    keys: args.to_vec(),
                }
            }
            "LPUSH" | "RPUSH" => {
                if args.len() < 2 {
                    return Err(arity());
                }
                let end = if upper == "LPUSH" {
                    ListEnd::Head
                } else {
                    ListEnd::Tail
                };
                Command::Push {
                    key: args[0].clone(),
                    values: args[1..].to_vec(),
                    end,
                }
            }
            "LRANGE" => {
                let [key, start, stop] = args else { return Err(arity()) };
                Command::LRange {
                    key: key.clone(),
                    start: parse_i64(start)?,
                    stop: parse_i64(stop)?,
                }
            }
            "LLEN" | "SCARD" | "ZCARD" => {
                let [key] = args else { return Err(arity()) };
                let ty = match upper.as_str() {
                    "LLEN" => ValueType::List,
                    "SCARD" => ValueType::Set,
                    _ => ValueType::ZSet,
                };
                Command::Cardinality {
                    key: key.clone(),
                    ty,
                }
            }
            "SADD" => {
                if args.len() < 2 {
                    return Err(arity());
                }
                Command::SAdd {
                    key: args[0].clone(),
                    members: args[1..].to_vec(),
                }
            }
            "ZADD" => {
                if args.len() < 3 || (args.len() - 1) % 2 != 0 {
                    return Err(arity());
                }
                let pairs = args[1..]
                    .chunks_exact(2)
                    .map(|pair| -> EngineResult<(f64, Bytes)> {
                        Ok((parse_f64(&pair[0])?, pair[1].clone()))
                    })
                    .collect::<EngineResult<_>>()?;
                Command::ZAdd {
                    key: args[0].clone(),
                    pairs,
                }
            }
            "DBSIZE" | "FLUSHDB" | "FLUSHALL" => {
                if !args.is_empty() {
                    return Err(arity());
                }
                if upper == "DBSIZE" {
                    Command::DbSize
                } else {
                    Command::Flush
                }
            }
            "PING" => match args {
                [] => Command::Ping(None),
                [message] => Command::Ping(Some(message.clone())),
                _ => return Err(arity()),
            },
            _ => return Err(EngineError::UnknownCommand(name.to_string())),
        };

        Ok(command)
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

fn parse_i64(arg: &Bytes) -> EngineResult<i64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(EngineError::not_an_integer)
}

fn parse_f64(arg: &Bytes) -> EngineResult<f64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|n| !n.is_nan())
        .ok_or_else(|| EngineError::invalid("value is not a valid float"))
}

fn option_name(arg: &Bytes) -> String {
    String::from_utf8_lossy(arg).to_ascii_uppercase()
}

/// SCAN cursor [MATCH pattern] [COUNT count] [TYPE type]
fn parse_scan(cursor: &Bytes, options: &[Bytes], shards: &ShardSet) -> EngineResult<ScanOptions> {
    let raw = std::str::from_utf8(cursor)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| EngineError::invalid("invalid cursor"))?;
    let cursor = ScanCursor::decode(raw, shards.size(), shards.slots_per_shard())?;

    let mut count = DEFAULT_SCAN_COUNT;
    let mut filter = ScanFilter::default();
    let mut iter = options.iter();
    while let Some(option) = iter.next() {
        let value = iter.next().ok_or_else(EngineError::syntax)?;
        match option_name(option).as_str() {
            "COUNT" => {
                count = match parse_i64(value)? {
                    n if n >= 1 => n as usize,
                    _ => return Err(EngineError::syntax()),
                };
            }
            "MATCH" => {
                let pattern = GlobPattern::new(value.clone());
                filter.pattern = (!pattern.is_match_all()).then_some(pattern);
            }
            "TYPE" => {
                let name = String::from_utf8_lossy(value);
                let ty = ValueType::parse(&name)
                    .ok_or_else(|| EngineError::invalid(format!("unknown type name '{}'", name)))?;
                filter.value_type = Some(ty);
            }
            _ => return Err(EngineError::syntax()),
        }
    }

    Ok(ScanOptions {
        cursor,
        count,
        filter,
    })
}

/// SORT key [BY pattern] [LIMIT offset count] [ASC|DESC] [ALPHA]
fn parse_sort(options: &[Bytes]) -> EngineResult<SortOptions> {
    let mut opts = SortOptions::default();
    let mut iter = options.iter();
    while let Some(option) = iter.next() {
        match option_name(option).as_str() {
            "BY" => {
                opts.by = Some(iter.next().ok_or_else(EngineError::syntax)?.clone());
            }
            "LIMIT" => {
                let (Some(offset), Some(count)) = (iter.next(), iter.next()) else {
                    return Err(EngineError::syntax());
                };
                opts.limit = Some((parse_i64(offset)?, parse_i64(count)?));
            }
            "ALPHA" => opts.alpha = true,
            "ASC" => opts.desc = false,
            "DESC" => opts.desc = true,
            _ => return Err(EngineError::syntax()),
        }
    }
    Ok(opts)
}

/// SET key value [EX seconds | PX milliseconds | EXAT unix | PXAT unix-ms | KEEPTTL] [NX|XX]
fn parse_set(options: &[Bytes]) -> EngineResult<SetOptions> {
    let mut opts = SetOptions::default();
    let invalid_expire = || EngineError::invalid("invalid expire time in 'set' command");

    let mut iter = options.iter();
    while let Some(option) = iter.next() {
        let name = option_name(option);
        match name.as_str() {
            "EX" | "PX" | "EXAT" | "PXAT" => {
                if opts.expire.is_some() || opts.keep_ttl {
                    return Err(EngineError::syntax());
                }
                let amount = parse_i64(iter.next().ok_or_else(EngineError::syntax)?)?;
                if amount <= 0 {
                    return Err(invalid_expire());
                }
                let millis = |n: i64| n.checked_mul(1000).ok_or_else(invalid_expire);
                opts.expire = Some(match name.as_str() {
                    "EX" => ExpireAt::Relative(millis(amount)?),
                    "PX" => ExpireAt::Relative(amount),
                    "EXAT" => ExpireAt::Absolute(millis(amount)?),
                    _ => ExpireAt::Absolute(amount),
                });
            }
            "KEEPTTL" => {
                if opts.expire.is_some() {
                    return Err(EngineError::syntax());
                }
                opts.keep_ttl = true;
            }
            "NX" | "XX" => {
                let condition = if name == "NX" {
                    SetCondition::IfMissing
                } else {
                    SetCondition::IfExists
                };
                if opts.condition != SetCondition::Always && opts.condition != condition {
                    return Err(EngineError::syntax());
                }
                opts.condition = condition;
            }
            _ => return Err(EngineError::syntax()),
        }
    }
    Ok(opts)
}

// ============================================================================
// Invocation
// ============================================================================

/// A validated command bound to its transaction, ready to run.
#[derive(Debug)]
pub struct Invocation {
    command: Command,
    tx: Transaction,
}

impl Invocation {
    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Runs the command to completion. Errors become error replies.
    pub async fn run(self) -> (Reply, TxDebugInfo) {
        let Invocation { command, mut tx } = self;
        let name = command.name();

        let reply = match dispatch(command, &mut tx).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(command = name, error = %e, "Command failed");
                Reply::from(e)
            }
        };
        (reply, tx.debug_info())
    }
}

fn optional_bulk(value: Option<Bytes>) -> Reply {
    value.map_or(Reply::Nil, Reply::Bulk)
}

async fn dispatch(command: Command, tx: &mut Transaction) -> EngineResult<Reply> {
    let reply = match command {
        Command::Del { .. } => Reply::integer(generic::del(tx).await?),
        Command::Exists { .. } => Reply::integer(generic::exists(tx).await?),
        Command::Ttl { unit, .. } => Reply::integer(generic::ttl(tx, unit).await?),
        Command::Expire { when, .. } => Reply::integer(generic::expire(tx, when).await?),
        Command::Persist { .. } => Reply::integer(generic::persist(tx).await?),
        Command::Rename { src, dst } => {
            generic::rename(tx, src, dst).await?;
            Reply::ok()
        }
        Command::Type { .. } => Reply::status(generic::key_type(tx).await?),
        Command::Keys { pattern } => Reply::bulk_array(generic::keys(tx, pattern).await?),
        Command::Scan(opts) => {
            let (cursor, keys) = generic::scan(tx, opts).await?;
            Reply::Array(vec![
                Reply::bulk(cursor.to_string()),
                Reply::bulk_array(keys),
            ])
        }
        Command::Sort { key, opts } => Reply::bulk_array(generic::sort(tx, key, opts).await?),
        Command::Set { value, opts, .. } => {
            if strings::set(tx, value, opts).await? {
                Reply::ok()
            } else {
                Reply::Nil
            }
        }
        Command::Get { .. } => optional_bulk(strings::get(tx).await?),
        Command::MSet { values, .. } => {
            strings::mset(tx, values).await?;
            Reply::ok()
        }
        Command::MGet { .. } => Reply::Array(
            strings::mget(tx)
                .await?
                .into_iter()
                .map(optional_bulk)
                .collect(),
        ),
        Command::Push { values, end, .. } => {
            Reply::integer(collections::push(tx, values, end).await?)
        }
        Command::LRange { start, stop, .. } => {
            Reply::bulk_array(collections::lrange(tx, start, stop).await?)
        }
        Command::Cardinality { ty, .. } => Reply::integer(collections::cardinality(tx, ty).await?),
        Command::SAdd { members, .. } => Reply::integer(collections::sadd(tx, members).await?),
        Command::ZAdd { pairs, .. } => Reply::integer(collections::zadd(tx, pairs).await?),
        Command::DbSize => Reply::integer(server::dbsize(tx).await?),
        Command::Flush => {
            server::flush(tx).await?;
            Reply::ok()
        }
        Command::Ping(None) => Reply::status("PONG"),
        Command::Ping(Some(message)) => Reply::Bulk(message),
    };
    Ok(reply)
}

// ============================================================================
// CommandHandler
// ============================================================================

/// Entry point for executing commands against a [`ShardSet`].
///
/// One handler serves one client: it remembers the debug info of the last command it
/// ran. Handlers are cheap to create; many can share one shard set.
pub struct CommandHandler {
    shards: Arc<ShardSet>,
    last_debug: Option<TxDebugInfo>,
}

impl CommandHandler {
    pub fn new(shards: Arc<ShardSet>) -> Self {
        Self {
            shards,
            last_debug: None,
        }
    }

    pub fn shard_set(&self) -> &Arc<ShardSet> {
        &self.shards
    }

    /// Debug info of the last completed command, if any.
    pub fn last_debug_info(&self) -> Option<TxDebugInfo> {
        self.last_debug
    }

    /// Validates a command and builds its transaction. No hop is scheduled.
    pub fn build_transaction(&self, name: &str, args: &[Bytes]) -> EngineResult<Invocation> {
        let command = Command::parse(name, args, &self.shards)?;
        let tx = Transaction::new(Arc::clone(&self.shards), command.name(), command.keys());
        trace!(command = command.name(), shards = tx.unique_shard_cnt(), "Transaction built");
        Ok(Invocation { command, tx })
    }

    /// Executes `argv` (command name first) and returns the reply.
    pub async fn execute(&mut self, argv: Vec<Bytes>) -> Reply {
        let Some((name, args)) = argv.split_first() else {
            return Reply::error("ERR empty command");
        };
        let name = String::from_utf8_lossy(name);

        match self.build_transaction(&name, args) {
            Ok(invocation) => {
                let (reply, info) = invocation.run().await;
                self.last_debug = Some(info);
                reply
            }
            Err(e) => {
                self.last_debug = Some(TxDebugInfo::default());
                Reply::from(e)
            }
        }
    }
}
