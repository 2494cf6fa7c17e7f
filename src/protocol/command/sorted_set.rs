//! Sorted set verbs over the per-key ordered index

use super::executor::{parse_int, parse_score};
use crate::error::{Error, Result};
use crate::protocol::resp::RespValue;
use crate::store::{Item, Shard};

/// Redis-style score text: `inf`, `-inf`, otherwise the shortest round-trip form
fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn with_scores_flag(arg: Option<&String>) -> Result<bool> {
    match arg {
        None => Ok(false),
        Some(arg) if arg.eq_ignore_ascii_case("WITHSCORES") => Ok(true),
        Some(_) => Err(Error::Syntax),
    }
}

fn items_reply(items: &[&Item], with_scores: bool) -> RespValue {
    let mut out = Vec::with_capacity(items.len() * if with_scores { 2 } else { 1 });
    for item in items {
        out.push(RespValue::bulk(item.member.clone()));
        if with_scores {
            out.push(RespValue::bulk(format_score(item.score)));
        }
    }
    RespValue::array(out)
}

/// Resolve Redis rank bounds (negative counts from the end) to an inclusive range
fn rank_window(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start >= len || start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// One side of a ZRANGEBYSCORE interval; a leading `(` makes it exclusive
#[derive(Debug, Clone, Copy, PartialEq)]
struct ScoreBound {
    value: f64,
    exclusive: bool,
}

impl ScoreBound {
    fn parse(arg: &str) -> Result<Self> {
        let (text, exclusive) = match arg.strip_prefix('(') {
            Some(rest) => (rest, true),
            None => (arg, false),
        };
        let value = parse_score(text).map_err(|_| Error::BadScoreBound)?;
        Ok(Self { value, exclusive })
    }

    fn admits_above(&self, score: f64) -> bool {
        !self.exclusive || score > self.value
    }

    fn admits_below(&self, score: f64) -> bool {
        !self.exclusive || score < self.value
    }
}

/// ZADD key score member [score member ...]
pub(super) fn zadd(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let pairs = &args[1..];
    if pairs.len() % 2 != 0 {
        return Err(Error::Syntax);
    }
    // Validate every score before touching the set
    let entries = pairs
        .chunks_exact(2)
        .map(|pair| Ok((parse_score(&pair[0])?, pair[1].clone())))
        .collect::<Result<Vec<_>>>()?;

    let added = shard.zadd(&args[0], &entries)?;
    Ok(RespValue::Integer(added as i64))
}

pub(super) fn zrem(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let removed = shard.zrem(&args[0], &args[1..])?;
    Ok(RespValue::Integer(removed as i64))
}

pub(super) fn zscore(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let score = shard
        .sorted_set(&args[0])?
        .and_then(|zset| zset.score(&args[1]));
    Ok(match score {
        Some(score) => RespValue::bulk(format_score(score)),
        None => RespValue::null(),
    })
}

pub(super) fn zrank(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let rank = shard
        .sorted_set(&args[0])?
        .and_then(|zset| zset.rank(&args[1]));
    Ok(match rank {
        Some(rank) => RespValue::Integer(rank as i64),
        None => RespValue::null(),
    })
}

pub(super) fn zcard(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let len = shard.sorted_set(&args[0])?.map_or(0, |zset| zset.len());
    Ok(RespValue::Integer(len as i64))
}

/// ZRANGE key start stop [WITHSCORES]
pub(super) fn zrange(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let start = parse_int(&args[1])?;
    let stop = parse_int(&args[2])?;
    let with_scores = with_scores_flag(args.get(3))?;

    let Some(zset) = shard.sorted_set(&args[0])? else {
        return Ok(RespValue::array(Vec::new()));
    };
    let items = match rank_window(start, stop, zset.len()) {
        Some((start, stop)) => zset.range_by_rank(start, stop),
        None => Vec::new(),
    };
    Ok(items_reply(&items, with_scores))
}

/// ZRANGEBYSCORE key min max [WITHSCORES]
pub(super) fn zrangebyscore(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let min = ScoreBound::parse(&args[1])?;
    let max = ScoreBound::parse(&args[2])?;
    let with_scores = with_scores_flag(args.get(3))?;

    let Some(zset) = shard.sorted_set(&args[0])? else {
        return Ok(RespValue::array(Vec::new()));
    };
    let items: Vec<&Item> = zset
        .range_by_score(min.value, max.value)
        .into_iter()
        .filter(|item| min.admits_above(item.score) && max.admits_below(item.score))
        .collect();
    Ok(items_reply(&items, with_scores))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::{Command, CommandExecutor};

    fn run(exec: &mut CommandExecutor, words: &[&str]) -> RespValue {
        exec.execute(&Command::new(
            words[0],
            words[1..].iter().map(|w| w.to_string()).collect(),
        ))
    }

    fn bulks(words: &[&str]) -> RespValue {
        RespValue::array(words.iter().map(|w| RespValue::bulk(w.to_string())).collect())
    }

    fn leaderboard() -> CommandExecutor {
        let mut exec = CommandExecutor::new(Shard::default());
        run(&mut exec, &["ZADD", "z", "3", "c", "1", "a", "2", "b"]);
        exec
    }

    #[test]
    fn zadd_counts_only_new_members() {
        let mut exec = CommandExecutor::new(Shard::default());
        assert_eq!(
            run(&mut exec, &["ZADD", "z", "1", "a", "2", "b"]),
            RespValue::Integer(2)
        );
        assert_eq!(
            run(&mut exec, &["ZADD", "z", "5", "a", "3", "c"]),
            RespValue::Integer(1)
        );
        assert_eq!(run(&mut exec, &["ZSCORE", "z", "a"]), RespValue::bulk("5"));
        assert_eq!(run(&mut exec, &["ZCARD", "z"]), RespValue::Integer(3));
    }

    #[test]
    fn zadd_rejects_bad_input_without_side_effects() {
        let mut exec = CommandExecutor::new(Shard::default());
        assert_eq!(
            run(&mut exec, &["ZADD", "z", "1", "a", "2"]),
            RespValue::Error("ERR syntax error".to_string())
        );
        assert_eq!(
            run(&mut exec, &["ZADD", "z", "1", "a", "nan", "b"]),
            RespValue::Error("ERR value is not a valid float".to_string())
        );
        assert_eq!(run(&mut exec, &["ZCARD", "z"]), RespValue::Integer(0));
    }

    #[test]
    fn zrange_orders_by_score_with_negative_indices() {
        let mut exec = leaderboard();
        assert_eq!(run(&mut exec, &["ZRANGE", "z", "0", "-1"]), bulks(&["a", "b", "c"]));
        assert_eq!(run(&mut exec, &["ZRANGE", "z", "-2", "-1"]), bulks(&["b", "c"]));
        assert_eq!(run(&mut exec, &["ZRANGE", "z", "1", "100"]), bulks(&["b", "c"]));
        assert_eq!(run(&mut exec, &["ZRANGE", "z", "2", "1"]), bulks(&[]));
        assert_eq!(run(&mut exec, &["ZRANGE", "z", "5", "9"]), bulks(&[]));
        assert_eq!(
            run(&mut exec, &["ZRANGE", "z", "0", "0", "withscores"]),
            bulks(&["a", "1"])
        );
        assert!(run(&mut exec, &["ZRANGE", "z", "0", "1", "BOGUS"]).is_error());
    }

    #[test]
    fn zrangebyscore_bounds() {
        let mut exec = leaderboard();
        assert_eq!(
            run(&mut exec, &["ZRANGEBYSCORE", "z", "-inf", "+inf"]),
            bulks(&["a", "b", "c"])
        );
        assert_eq!(
            run(&mut exec, &["ZRANGEBYSCORE", "z", "(1", "3"]),
            bulks(&["b", "c"])
        );
        assert_eq!(
            run(&mut exec, &["ZRANGEBYSCORE", "z", "1", "(3", "WITHSCORES"]),
            bulks(&["a", "1", "b", "2"])
        );
        assert_eq!(run(&mut exec, &["ZRANGEBYSCORE", "z", "3", "1"]), bulks(&[]));
        assert_eq!(
            run(&mut exec, &["ZRANGEBYSCORE", "z", "x", "1"]),
            RespValue::Error("ERR min or max is not a float".to_string())
        );
    }

    #[test]
    fn rank_score_and_removal() {
        let mut exec = leaderboard();
        assert_eq!(run(&mut exec, &["ZRANK", "z", "c"]), RespValue::Integer(2));
        assert_eq!(run(&mut exec, &["ZRANK", "z", "nope"]), RespValue::null());
        assert_eq!(run(&mut exec, &["ZSCORE", "z", "nope"]), RespValue::null());

        assert_eq!(run(&mut exec, &["ZREM", "z", "a", "nope"]), RespValue::Integer(1));
        assert_eq!(run(&mut exec, &["ZRANK", "z", "c"]), RespValue::Integer(1));
        assert_eq!(run(&mut exec, &["ZREM", "z", "b", "c"]), RespValue::Integer(2));
        assert_eq!(run(&mut exec, &["ZCARD", "z"]), RespValue::Integer(0));
        assert_eq!(run(&mut exec, &["ZRANGE", "z", "0", "-1"]), bulks(&[]));
    }

    #[test]
    fn scores_render_like_redis() {
        assert_eq!(format_score(1.5), "1.5");
        assert_eq!(format_score(2.0), "2");
        assert_eq!(format_score(-0.25), "-0.25");
        assert_eq!(format_score(f64::INFINITY), "inf");
        assert_eq!(format_score(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn rank_window_clamps() {
        assert_eq!(rank_window(0, -1, 3), Some((0, 2)));
        assert_eq!(rank_window(-10, 1, 3), Some((0, 1)));
        assert_eq!(rank_window(0, -1, 0), None);
        assert_eq!(rank_window(-1, -3, 3), None);
    }
}
