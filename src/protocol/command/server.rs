use super::executor::TABLE;
use crate::error::{Error, Result};
use crate::protocol::resp::RespValue;
use crate::store::Shard;

const RULE: &str = "----------------------------------------";

pub(super) fn ping(_shard: &mut Shard, args: &[String]) -> Result<RespValue> {
    match args {
        [] => Ok(RespValue::simple("PONG")),
        [message] => Ok(RespValue::bulk(message.clone())),
        _ => Err(Error::WrongArity("ping".to_string())),
    }
}

pub(super) fn help(_shard: &mut Shard, _args: &[String]) -> Result<RespValue> {
    let mut lines = Vec::with_capacity(TABLE.len() + 2);
    lines.push(RespValue::bulk(RULE));
    lines.extend(
        TABLE
            .iter()
            .map(|spec| RespValue::bulk(format!("{} - {}", spec.usage, spec.summary))),
    );
    lines.push(RespValue::bulk(RULE));
    Ok(RespValue::array(lines))
}
