use clap::Parser;
use shardis::{Config, Server};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Listening sockets sharing the port via SO_REUSEPORT
    #[arg(short, long)]
    listeners: Option<usize>,

    /// Worker threads (0 = derived from the CPU count)
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// I/O handler threads (0 = derived from the CPU count)
    #[arg(long)]
    io_handlers: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Defaults, then the config file, then the environment, then flags
    fn into_config(self) -> anyhow::Result<(Config, bool)> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env()?;

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(listeners) = self.listeners {
            config.listeners = listeners;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(io_handlers) = self.io_handlers {
            config.io_handlers = io_handlers;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        Ok((config, self.verbose))
    }
}

fn main() -> anyhow::Result<()> {
    let (config, verbose) = Args::parse().into_config()?;

    // Initialize tracing
    let log_level = if verbose { "debug" } else { &config.log_level };
    tracing_subscriber::fmt()
        .with_env_filter(format!("shardis={}", log_level))
        .init();

    info!(
        "Starting shardis v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.bind_addr,
        config.port
    );
    info!(
        "Detected {} CPUs, using {} workers and {} I/O handlers",
        num_cpus::get(),
        config.worker_count(),
        config.io_handler_count()
    );

    // Create and run server
    let server = Arc::new(Server::new(config)?);

    // Setup signal handlers for graceful shutdown
    let server_clone = Arc::clone(&server);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, shutting down gracefully...");
        server_clone.shutdown();
    })?;

    // Run the server
    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
