use crate::protocol::RespValue;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("max request size exceeded")]
    BufferOverflow,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("value is not an integer or out of range")]
    NotInteger,

    #[error("value is not a valid float")]
    NotFloat,

    #[error("min or max is not a float")]
    BadScoreBound,

    #[error("invalid expire time in '{0}' command")]
    InvalidExpire(&'static str),

    #[error("syntax error")]
    Syntax,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("command timed out")]
    Timeout,

    #[error("server is shutting down")]
    Shutdown,

    #[error("System error: {0}")]
    System(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convert error to Redis error reply
    pub fn to_resp(&self) -> RespValue {
        match self {
            Error::WrongType => RespValue::Error(format!("WRONGTYPE {}", self)),
            Error::Protocol(msg) => RespValue::Error(format!("ERR Protocol error: {}", msg)),
            _ => RespValue::Error(format!("ERR {}", self)),
        }
    }

    /// True when the error means the peer went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::System(errno.desc().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_error_reply_matches_redis_wording() {
        let reply = Error::WrongArity("ping".to_string()).to_resp();
        assert_eq!(
            reply,
            RespValue::Error("ERR wrong number of arguments for 'ping' command".to_string())
        );
    }

    #[test]
    fn wrong_type_uses_its_own_prefix() {
        match Error::WrongType.to_resp() {
            RespValue::Error(msg) => assert!(msg.starts_with("WRONGTYPE ")),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn reset_counts_as_disconnect() {
        let err = Error::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.is_disconnect());
        let err = Error::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!err.is_disconnect());
    }
}
