use crate::error::{Error, Result};
use crate::protocol::resp::{self, RespValue};
use bytes::Bytes;

mod executor;
mod keyspace;
mod server;
mod set;
mod sorted_set;

pub use executor::{lookup, CommandExecutor, CommandSpec};

/// A decoded client request: uppercase verb plus its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into().to_ascii_uppercase(),
            args,
        }
    }

    /// Parse command from RESP array of bulk strings
    pub fn from_resp(value: RespValue) -> Result<Self> {
        let parts = match value {
            RespValue::Array(Some(parts)) if !parts.is_empty() => parts,
            RespValue::Array(_) => {
                return Err(Error::Protocol("empty command".to_string()));
            }
            _ => {
                return Err(Error::Protocol(
                    "expected an array of bulk strings".to_string(),
                ));
            }
        };

        let mut words = parts.into_iter().map(|part| match part {
            RespValue::BulkString(Some(bytes)) => String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::Protocol("invalid UTF-8 in argument".to_string())),
            _ => Err(Error::Protocol("expected bulk string".to_string())),
        });

        let name = match words.next() {
            Some(name) => name?,
            None => return Err(Error::Protocol("empty command".to_string())),
        };
        let args = words.collect::<Result<Vec<_>>>()?;

        Ok(Self::new(name, args))
    }

    /// The request form of this command, as a client would send it
    pub fn to_resp(&self) -> RespValue {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(RespValue::bulk(Bytes::copy_from_slice(self.name.as_bytes())));
        parts.extend(
            self.args
                .iter()
                .map(|arg| RespValue::bulk(Bytes::copy_from_slice(arg.as_bytes()))),
        );
        RespValue::array(parts)
    }

    pub fn encode(&self) -> Vec<u8> {
        resp::encode(&self.to_resp())
    }

    /// Routing key: the first argument, if any
    pub fn key(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Split a multi-key command into one single-key command per key
    ///
    /// Returns `None` unless the verb sums integer results across keys and more
    /// than one key was given.
    pub fn split_keys(&self) -> Option<Vec<Command>> {
        let spec = lookup(&self.name)?;
        if !spec.sums_over_keys || self.args.len() < 2 {
            return None;
        }
        Some(
            self.args
                .iter()
                .map(|key| Command {
                    name: self.name.clone(),
                    args: vec![key.clone()],
                })
                .collect(),
        )
    }
}
