//! Redis protocol (RESP) framing and command execution

pub mod command;
pub mod resp;

pub use command::{Command, CommandExecutor};
pub use resp::{RespParser, RespValue};
