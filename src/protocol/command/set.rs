use crate::error::Result;
use crate::protocol::resp::RespValue;
use crate::store::Shard;

pub(super) fn sadd(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let added = shard.sadd(&args[0], &args[1..])?;
    Ok(RespValue::Integer(added as i64))
}

pub(super) fn srem(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let removed = shard.srem(&args[0], &args[1..])?;
    Ok(RespValue::Integer(removed as i64))
}

/// Members come back sorted so replies are stable across calls
pub(super) fn smembers(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let Some(set) = shard.set_members(&args[0])? else {
        return Ok(RespValue::array(Vec::new()));
    };
    let mut members: Vec<&String> = set.iter().collect();
    members.sort_unstable();
    Ok(RespValue::array(
        members
            .into_iter()
            .map(|m| RespValue::bulk(m.clone()))
            .collect(),
    ))
}

pub(super) fn sismember(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let present = shard
        .set_members(&args[0])?
        .is_some_and(|set| set.contains(&args[1]));
    Ok(RespValue::Integer(present as i64))
}

pub(super) fn scard(shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    let len = shard.set_members(&args[0])?.map_or(0, |set| set.len());
    Ok(RespValue::Integer(len as i64))
}
