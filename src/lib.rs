//! shardis: a Redis-compatible key/value server with a sharded in-memory store
//!
//! Strings, sets and sorted sets are spread across worker threads by key
//! hash; each worker owns its shard outright. Sorted sets are backed by a
//! B+ tree index.
//!
//! # Architecture
//!
//! - Acceptor threads hand sockets to I/O handlers round-robin
//! - Each I/O handler runs a mio event loop over its connections
//! - Commands are routed to the owning worker and the reply awaited
//! - Workers run an active expiry sweep between tasks

/// Configuration management for the server
pub mod config;

/// Error types and result aliases
pub mod error;

/// Readiness multiplexing
pub mod io;

/// Network layer for connection management
pub mod network;

/// Redis protocol (RESP) implementation
pub mod protocol;

/// Core server implementation
pub mod server;

/// Per-worker data and the sorted set index
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
