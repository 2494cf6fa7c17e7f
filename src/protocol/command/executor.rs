use super::{keyspace, server, set, sorted_set, Command};
use crate::error::{Error, Result};
use crate::protocol::resp::RespValue;
use crate::store::Shard;
use once_cell::sync::Lazy;
use std::collections::HashMap;

pub type Handler = fn(&mut Shard, &[String]) -> Result<RespValue>;

/// Accepted argument counts, not counting the verb
#[derive(Debug, Clone, Copy)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(want) => n == want,
            Arity::AtLeast(min) => n >= min,
            Arity::Between(min, max) => (min..=max).contains(&n),
        }
    }
}

pub struct CommandSpec {
    pub name: &'static str,
    pub usage: &'static str,
    pub summary: &'static str,
    pub arity: Arity,
    /// Each argument is a key and the reply is the sum of per-key integers
    pub sums_over_keys: bool,
    handler: Handler,
}

const fn spec(
    name: &'static str,
    usage: &'static str,
    summary: &'static str,
    arity: Arity,
    handler: Handler,
) -> CommandSpec {
    CommandSpec {
        name,
        usage,
        summary,
        arity,
        sums_over_keys: false,
        handler,
    }
}

const fn summing(mut spec: CommandSpec) -> CommandSpec {
    spec.sums_over_keys = true;
    spec
}

/// Every verb the server understands, in HELP order
pub(super) static TABLE: &[CommandSpec] = &[
    spec("GET", "GET key", "Get the value of a key", Arity::Exact(1), keyspace::get),
    spec(
        "SET",
        "SET key value [EX seconds|PX milliseconds]",
        "Set the value of a key",
        Arity::AtLeast(2),
        keyspace::set,
    ),
    summing(spec("DEL", "DEL key [key ...]", "Delete keys", Arity::AtLeast(1), keyspace::del)),
    summing(spec(
        "EXISTS",
        "EXISTS key [key ...]",
        "Count how many keys exist",
        Arity::AtLeast(1),
        keyspace::exists,
    )),
    spec("TTL", "TTL key", "Get the time to live for a key", Arity::Exact(1), keyspace::ttl),
    spec(
        "EXPIRE",
        "EXPIRE key seconds",
        "Set a timeout on a key",
        Arity::Exact(2),
        keyspace::expire,
    ),
    spec(
        "SADD",
        "SADD key member [member ...]",
        "Add members to a set",
        Arity::AtLeast(2),
        set::sadd,
    ),
    spec(
        "SREM",
        "SREM key member [member ...]",
        "Remove members from a set",
        Arity::AtLeast(2),
        set::srem,
    ),
    spec("SMEMBERS", "SMEMBERS key", "List the members of a set", Arity::Exact(1), set::smembers),
    spec(
        "SISMEMBER",
        "SISMEMBER key member",
        "Check set membership",
        Arity::Exact(2),
        set::sismember,
    ),
    spec("SCARD", "SCARD key", "Count the members of a set", Arity::Exact(1), set::scard),
    spec(
        "ZADD",
        "ZADD key score member [score member ...]",
        "Add or rescore sorted set members",
        Arity::AtLeast(3),
        sorted_set::zadd,
    ),
    spec(
        "ZREM",
        "ZREM key member [member ...]",
        "Remove sorted set members",
        Arity::AtLeast(2),
        sorted_set::zrem,
    ),
    spec(
        "ZSCORE",
        "ZSCORE key member",
        "Get the score of a member",
        Arity::Exact(2),
        sorted_set::zscore,
    ),
    spec(
        "ZRANK",
        "ZRANK key member",
        "Get the zero-based rank of a member",
        Arity::Exact(2),
        sorted_set::zrank,
    ),
    spec("ZCARD", "ZCARD key", "Count sorted set members", Arity::Exact(1), sorted_set::zcard),
    spec(
        "ZRANGE",
        "ZRANGE key start stop [WITHSCORES]",
        "Members by rank",
        Arity::Between(3, 4),
        sorted_set::zrange,
    ),
    spec(
        "ZRANGEBYSCORE",
        "ZRANGEBYSCORE key min max [WITHSCORES]",
        "Members by score",
        Arity::Between(3, 4),
        sorted_set::zrangebyscore,
    ),
    spec("PING", "PING [message]", "Ping the server", Arity::Between(0, 1), server::ping),
    spec("HELP", "HELP", "Show this help message", Arity::Exact(0), server::help),
];

static COMMANDS: Lazy<HashMap<&'static str, &'static CommandSpec>> =
    Lazy::new(|| TABLE.iter().map(|spec| (spec.name, spec)).collect());

/// Find the table entry for an uppercase verb
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.get(name).copied()
}

/// Executes parsed commands against one shard
///
/// Owned by exactly one worker thread.
pub struct CommandExecutor {
    shard: Shard,
    commands_processed: u64,
}

impl CommandExecutor {
    pub fn new(shard: Shard) -> Self {
        Self {
            shard,
            commands_processed: 0,
        }
    }

    pub fn shard_mut(&mut self) -> &mut Shard {
        &mut self.shard
    }

    pub fn commands_processed(&self) -> u64 {
        self.commands_processed
    }

    /// Execute a command and return its reply
    pub fn execute(&mut self, cmd: &Command) -> RespValue {
        self.commands_processed += 1;

        let Some(spec) = lookup(&cmd.name) else {
            return Error::UnknownCommand(cmd.name.clone()).to_resp();
        };
        if !spec.arity.accepts(cmd.args.len()) {
            return Error::WrongArity(spec.name.to_ascii_lowercase()).to_resp();
        }

        match (spec.handler)(&mut self.shard, &cmd.args) {
            Ok(reply) => reply,
            Err(e) => e.to_resp(),
        }
    }
}

/// Parse an integer argument
pub(super) fn parse_int(arg: &str) -> Result<i64> {
    arg.parse::<i64>().map_err(|_| Error::NotInteger)
}

/// Parse a score; accepts `inf`, `+inf` and `-inf`, rejects NaN
pub(super) fn parse_score(arg: &str) -> Result<f64> {
    match arg.parse::<f64>() {
        Ok(score) if !score.is_nan() => Ok(score),
        _ => Err(Error::NotFloat),
    }
}
