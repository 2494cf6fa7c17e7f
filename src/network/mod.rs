pub mod connection;
pub mod handler;

pub use connection::Connection;
pub use handler::{HandlerOptions, IoHandler};
