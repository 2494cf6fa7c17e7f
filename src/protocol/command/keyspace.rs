//! String values and key lifetime: GET, SET, DEL, EXISTS, TTL, EXPIRE

use super::executor::parse_int;
use crate::error::{Error, Result};
use crate::protocol::resp::RespValue;
use crate::store::{Shard, Ttl};
use bytes::Bytes;
use std::time::{Duration, Instant};

pub(super) fn get(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    Ok(match shard.get(&args[0])? {
        Some(value) => RespValue::BulkString(Some(value)),
        None => RespValue::null(),
    })
}

/// SET key value [EX seconds | PX milliseconds]
pub(super) fn set(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let (key, value) = (&args[0], &args[1]);
    let mut expires_at = None;

    let mut opts = args[2..].iter();
    while let Some(opt) = opts.next() {
        let unit: fn(u64) -> Duration = match opt.to_ascii_uppercase().as_str() {
            "EX" => Duration::from_secs,
            "PX" => Duration::from_millis,
            _ => return Err(Error::Syntax),
        };
        if expires_at.is_some() {
            return Err(Error::Syntax);
        }
        let amount = parse_int(opts.next().ok_or(Error::Syntax)?)?;
        if amount <= 0 {
            return Err(Error::InvalidExpire("set"));
        }
        expires_at = Some(deadline(unit(amount as u64), "set")?);
    }

    shard.set(key, Bytes::copy_from_slice(value.as_bytes()), expires_at);
    Ok(RespValue::ok())
}

pub(super) fn del(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let removed = args.iter().filter(|key| shard.delete(key)).count();
    Ok(RespValue::Integer(removed as i64))
}

/// Counts repeats, so `EXISTS k k` is 2 when `k` exists
pub(super) fn exists(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let found = args.iter().filter(|key| shard.exists(key)).count();
    Ok(RespValue::Integer(found as i64))
}

pub(super) fn ttl(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let secs = match shard.ttl(&args[0]) {
        Ttl::Missing => -2,
        Ttl::Persistent => -1,
        Ttl::Remaining(left) => ((left.as_millis() + 500) / 1000) as i64,
    };
    Ok(RespValue::Integer(secs))
}

/// A non-positive timeout deletes the key
pub(super) fn expire(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let secs = parse_int(&args[1])?;
    let at = deadline(Duration::from_secs(secs.max(0) as u64), "expire")?;
    Ok(RespValue::Integer(shard.expire_at(&args[0], at) as i64))
}

/// `ttl` from now, or an error when that lies beyond what `Instant` can hold
fn deadline(ttl: Duration, command: &'static str) -> Result<Instant> {
    Instant::now()
        .checked_add(ttl)
        .ok_or(Error::InvalidExpire(command))
}

#[cfg(test)]
mod tests {
    use crate::protocol::command::{Command, CommandExecutor};
    use crate::protocol::resp::RespValue;
    use crate::store::Shard;

    fn run(exec: &mut CommandExecutor, words: &[&str]) -> RespValue {
        exec.execute(&Command::new(
            words[0],
            words[1..].iter().map(|w| w.to_string()).collect(),
        ))
    }

    #[test]
    fn set_then_get() {
        let mut exec = CommandExecutor::new(Shard::default());
        assert_eq!(run(&mut exec, &["SET", "k", "v"]), RespValue::ok());
        assert_eq!(run(&mut exec, &["GET", "k"]), RespValue::bulk("v"));
        assert_eq!(run(&mut exec, &["GET", "missing"]), RespValue::null());
    }

    #[test]
    fn set_with_expiry_options() {
        let mut exec = CommandExecutor::new(Shard::default());
        assert_eq!(run(&mut exec, &["SET", "k", "v", "ex", "100"]), RespValue::ok());
        assert_eq!(run(&mut exec, &["TTL", "k"]), RespValue::Integer(100));
        assert_eq!(run(&mut exec, &["SET", "p", "v", "PX", "2000"]), RespValue::ok());
        assert_eq!(run(&mut exec, &["TTL", "p"]), RespValue::Integer(2));

        assert_eq!(
            run(&mut exec, &["SET", "k", "v", "EX", "0"]),
            RespValue::Error("ERR invalid expire time in 'set' command".to_string())
        );
        assert_eq!(
            run(&mut exec, &["SET", "k", "v", "EX"]),
            RespValue::Error("ERR syntax error".to_string())
        );
        assert_eq!(
            run(&mut exec, &["SET", "k", "v", "EX", "1", "PX", "1"]),
            RespValue::Error("ERR syntax error".to_string())
        );
        assert_eq!(
            run(&mut exec, &["SET", "k", "v", "EX", "ten"]),
            RespValue::Error("ERR value is not an integer or out of range".to_string())
        );
    }

    #[test]
    fn plain_set_clears_an_old_deadline() {
        let mut exec = CommandExecutor::new(Shard::default());
        run(&mut exec, &["SET", "k", "v", "EX", "100"]);
        run(&mut exec, &["SET", "k", "w"]);
        assert_eq!(run(&mut exec, &["TTL", "k"]), RespValue::Integer(-1));
    }

    #[test]
    fn del_and_exists_count_keys() {
        let mut exec = CommandExecutor::new(Shard::default());
        run(&mut exec, &["SET", "a", "1"]);
        run(&mut exec, &["SADD", "b", "x"]);
        assert_eq!(run(&mut exec, &["EXISTS", "a", "b", "c", "a"]), RespValue::Integer(3));
        assert_eq!(run(&mut exec, &["DEL", "a", "b", "c"]), RespValue::Integer(2));
        assert_eq!(run(&mut exec, &["EXISTS", "a", "b"]), RespValue::Integer(0));
    }

    #[test]
    fn ttl_and_expire() {
        let mut exec = CommandExecutor::new(Shard::default());
        assert_eq!(run(&mut exec, &["TTL", "k"]), RespValue::Integer(-2));
        assert_eq!(run(&mut exec, &["EXPIRE", "k", "10"]), RespValue::Integer(0));

        run(&mut exec, &["SET", "k", "v"]);
        assert_eq!(run(&mut exec, &["TTL", "k"]), RespValue::Integer(-1));
        assert_eq!(run(&mut exec, &["EXPIRE", "k", "10"]), RespValue::Integer(1));
        assert_eq!(run(&mut exec, &["TTL", "k"]), RespValue::Integer(10));

        assert_eq!(run(&mut exec, &["EXPIRE", "k", "-1"]), RespValue::Integer(1));
        assert_eq!(run(&mut exec, &["GET", "k"]), RespValue::null());
    }

    #[test]
    fn unrepresentable_expire_times_are_rejected() {
        let mut exec = CommandExecutor::new(Shard::default());
        let huge = i64::MAX.to_string();

        assert_eq!(
            run(&mut exec, &["SET", "k", "v", "EX", &huge]),
            RespValue::Error("ERR invalid expire time in 'set' command".to_string())
        );
        assert_eq!(run(&mut exec, &["GET", "k"]), RespValue::null());

        run(&mut exec, &["SET", "k", "v"]);
        assert_eq!(
            run(&mut exec, &["EXPIRE", "k", &huge]),
            RespValue::Error("ERR invalid expire time in 'expire' command".to_string())
        );
        assert_eq!(run(&mut exec, &["TTL", "k"]), RespValue::Integer(-1));
        assert_eq!(run(&mut exec, &["GET", "k"]), RespValue::bulk("v"));
    }

    #[test]
    fn get_on_a_set_is_wrongtype() {
        let mut exec = CommandExecutor::new(Shard::default());
        run(&mut exec, &["SADD", "s", "x"]);
        let reply = run(&mut exec, &["GET", "s"]);
        assert!(matches!(reply, RespValue::Error(ref msg) if msg.starts_with("WRONGTYPE")));
    }
}
