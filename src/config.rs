use crate::store::IndexConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address
    pub bind_addr: String,

    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,

    /// Number of listening sockets; more than one binds with SO_REUSEPORT
    pub listeners: usize,

    /// I/O handler threads (0 = derived from the CPU count)
    pub io_handlers: usize,

    /// Worker threads, one shard each (0 = derived from the CPU count)
    pub workers: usize,

    /// Pending tasks per worker before enqueueing blocks
    pub worker_queue_capacity: usize,

    /// Connections beyond this are refused with an error reply
    pub max_connections: usize,

    /// Bytes per read syscall
    pub read_buffer_size: usize,

    /// Upper bound on unparsed input buffered for one connection
    pub max_request_size: usize,

    /// TCP nodelay
    pub tcp_nodelay: bool,

    /// How long a handler waits for a worker to answer
    pub reply_timeout_ms: u64,

    /// Period of the active expiry sweep
    pub active_expire_interval_ms: u64,

    /// Sorted set index backend
    pub index: IndexConfig,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 6379,
            listeners: 1,
            io_handlers: 0,
            workers: 0,
            worker_queue_capacity: 1024,
            max_connections: 20_000,
            read_buffer_size: 4096,
            max_request_size: 64 * 1024 * 1024, // 64MB
            tcp_nodelay: true,
            reply_timeout_ms: 5000,
            active_expire_interval_ms: 100,
            index: IndexConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing fields take their defaults.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use shardis::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("shardis.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Override fields from `SHARDIS_*` environment variables
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(bind) = var("SHARDIS_BIND") {
            self.bind_addr = bind;
        }
        if let Some(port) = var("SHARDIS_PORT") {
            self.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("SHARDIS_PORT: {}", e))?;
        }
        if let Some(max) = var("SHARDIS_MAX_CONNECTIONS") {
            self.max_connections = max
                .parse()
                .map_err(|e| anyhow::anyhow!("SHARDIS_MAX_CONNECTIONS: {}", e))?;
        }
        if let Some(listeners) = var("SHARDIS_LISTENERS") {
            self.listeners = listeners
                .parse()
                .map_err(|e| anyhow::anyhow!("SHARDIS_LISTENERS: {}", e))?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listeners == 0 {
            anyhow::bail!("listeners must be > 0");
        }

        if self.worker_queue_capacity == 0 {
            anyhow::bail!("worker_queue_capacity must be > 0");
        }

        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be > 0");
        }

        if self.read_buffer_size < 512 {
            anyhow::bail!("read_buffer_size must be >= 512");
        }

        if self.max_request_size < self.read_buffer_size {
            anyhow::bail!("max_request_size must be >= read_buffer_size");
        }

        if self.reply_timeout_ms == 0 {
            anyhow::bail!("reply_timeout_ms must be > 0");
        }

        if self.active_expire_interval_ms == 0 {
            anyhow::bail!("active_expire_interval_ms must be > 0");
        }

        if self.index.degree != 0 && self.index.degree < 3 {
            anyhow::bail!("index.degree must be 0 (default) or >= 3");
        }

        Ok(())
    }

    /// Resolved I/O handler count: a third of the CPUs, at least one
    pub fn io_handler_count(&self) -> usize {
        if self.io_handlers > 0 {
            self.io_handlers
        } else {
            (num_cpus::get() / 3).max(1)
        }
    }

    /// Resolved worker count: the CPUs left over after the handlers, at least one
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            num_cpus::get()
                .saturating_sub(self.io_handler_count())
                .max(1)
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn active_expire_interval(&self) -> Duration {
        Duration::from_millis(self.active_expire_interval_ms)
    }
}
