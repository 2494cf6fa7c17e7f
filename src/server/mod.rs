//! Server lifecycle: listeners, acceptors, I/O handlers and the worker pool

pub mod dispatch;
pub mod status;
pub mod worker;

pub use dispatch::{partition, Dispatcher};
pub use status::{Busy, ServerStatus};
pub use worker::{Task, Worker, WorkerOptions};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::io::{Multiplexer, Op, Registrar};
use crate::network::{Connection, HandlerOptions, IoHandler};
use crate::store::Shard;
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrStorage,
};
use parking_lot::Mutex;
use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const LISTEN_BACKLOG: i32 = 1024;
const MAX_CLIENTS_REPLY: &[u8] = b"-ERR max number of clients reached\r\n";

/// Redis-compatible server with a partitioned in-memory store
pub struct Server {
    config: Config,
    listeners: Mutex<Vec<TcpListener>>,
    local_addr: SocketAddr,
    status: Arc<ServerStatus>,
    active_connections: Arc<AtomicUsize>,
    acceptor_wakers: Mutex<Vec<Registrar>>,
}

impl Server {
    /// Validate the configuration and bind the listening sockets
    pub fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let addr = resolve(&config.bind_addr, config.port)?;
        let listeners = bind_listeners(addr, config.listeners)?;
        let local_addr = listeners[0].local_addr()?;

        Ok(Self {
            config,
            listeners: Mutex::new(listeners),
            local_addr,
            status: Arc::new(ServerStatus::new()),
            active_connections: Arc::new(AtomicUsize::new(0)),
            acceptor_wakers: Mutex::new(Vec::new()),
        })
    }

    /// Address the listeners are bound to, with the real port if 0 was asked for
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the server, spawning worker, handler and acceptor threads
    ///
    /// This method blocks until the server is shut down.
    pub fn run(self: Arc<Self>) -> Result<()> {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        if listeners.is_empty() {
            return Err(Error::Config("server is already running".to_string()));
        }

        let worker_count = self.config.worker_count();
        let handler_count = self.config.io_handler_count();
        info!(
            "Starting {} workers and {} I/O handlers",
            worker_count, handler_count
        );

        let mut workers = self.spawn_workers(worker_count)?;
        let dispatcher = Dispatcher::new(
            workers.iter().map(Worker::sender).collect(),
            self.config.reply_timeout(),
        );
        let handlers = self.spawn_handlers(handler_count, &dispatcher)?;

        let next_handler = Arc::new(AtomicUsize::new(0));
        let mut acceptors = Vec::with_capacity(listeners.len());
        for (id, listener) in listeners.into_iter().enumerate() {
            let server = Arc::clone(&self);
            let handlers = handlers.clone();
            let next_handler = Arc::clone(&next_handler);
            let spawned = thread::Builder::new()
                .name(format!("acceptor-{}", id))
                .spawn(move || {
                    if let Err(e) = server.accept_loop(id, listener, &handlers, &next_handler) {
                        error!("Acceptor {} failed: {}", id, e);
                    }
                });
            match spawned {
                Ok(handle) => acceptors.push(handle),
                Err(e) => {
                    error!("Failed to spawn acceptor {}: {}", id, e);
                    self.shutdown();
                    break;
                }
            }
        }

        info!("Server listening on {}", self.local_addr);

        for acceptor in acceptors {
            let _ = acceptor.join();
        }

        // Acceptors only return once shutdown has begun
        for worker in &mut workers {
            worker.stop();
        }
        for handler in &handlers {
            handler.stop();
        }

        info!("Server stopped");
        Ok(())
    }

    /// Signal the server to shut down gracefully
    pub fn shutdown(&self) {
        info!("Initiating server shutdown");
        self.status.shutdown();
        for waker in self.acceptor_wakers.lock().iter() {
            if let Err(e) = waker.wake() {
                debug!("Waking acceptor: {}", e);
            }
        }
    }

    /// Get the number of active client connections
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    fn spawn_workers(&self, count: usize) -> Result<Vec<Worker>> {
        let options = WorkerOptions {
            queue_capacity: self.config.worker_queue_capacity,
            expire_interval: self.config.active_expire_interval(),
        };
        // Workers already spawned are stopped by Drop if a later one fails
        (0..count)
            .map(|id| {
                Worker::spawn(
                    id,
                    Shard::new(self.config.index.clone()),
                    &options,
                    Arc::clone(&self.status),
                )
            })
            .collect()
    }

    fn spawn_handlers(&self, count: usize, dispatcher: &Dispatcher) -> Result<Vec<Arc<IoHandler>>> {
        let options = HandlerOptions {
            read_buffer_size: self.config.read_buffer_size,
            max_request_size: self.config.max_request_size,
        };

        let mut handlers = Vec::with_capacity(count);
        for id in 0..count {
            match IoHandler::spawn(
                id,
                dispatcher.clone(),
                options,
                Arc::clone(&self.active_connections),
            ) {
                Ok(handler) => handlers.push(handler),
                Err(e) => {
                    for handler in &handlers {
                        handler.stop();
                    }
                    return Err(e);
                }
            }
        }
        Ok(handlers)
    }

    fn accept_loop(
        &self,
        id: usize,
        listener: TcpListener,
        handlers: &[Arc<IoHandler>],
        next_handler: &AtomicUsize,
    ) -> Result<()> {
        listener.set_nonblocking(true)?;
        let mut mux = Multiplexer::new(64)?;
        mux.monitor(listener.as_raw_fd(), Op::Read)?;
        self.acceptor_wakers.lock().push(mux.registrar());

        debug!("Acceptor {} started", id);
        while !self.status.is_shutdown() {
            match mux.wait(Some(ACCEPT_POLL)) {
                Ok(ready) if ready.is_empty() => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!("Acceptor {} wait failed: {}", id, e);
                    continue;
                }
            }

            // Edge-triggered: drain the backlog
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => self.admit(stream, peer, handlers, next_handler),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        break;
                    }
                }
            }
        }

        mux.close();
        drop(listener);
        debug!("Acceptor {} stopped", id);
        Ok(())
    }

    fn admit(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        handlers: &[Arc<IoHandler>],
        next_handler: &AtomicUsize,
    ) {
        let open = self.active_connections.fetch_add(1, Ordering::AcqRel);
        if open >= self.config.max_connections {
            self.active_connections.fetch_sub(1, Ordering::AcqRel);
            warn!("Refusing {}: max number of clients reached", peer);
            let _ = stream.write_all(MAX_CLIENTS_REPLY);
            return;
        }

        if let Err(e) = configure(&stream, self.config.tcp_nodelay) {
            warn!("Failed to configure connection from {}: {}", peer, e);
            self.active_connections.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        let slot = next_handler.fetch_add(1, Ordering::Relaxed) % handlers.len();
        let conn = Connection::new(stream, Some(peer), self.config.read_buffer_size);
        debug!("New connection from {} assigned to I/O handler {}", peer, handlers[slot].id());
        // On failure the handler has already released the connection
        if let Err(e) = handlers[slot].add_conn(conn) {
            warn!("I/O handler {} rejected {}: {}", slot, peer, e);
        }
    }
}

fn configure(stream: &TcpStream, nodelay: bool) -> std::io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(nodelay)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Config(format!("cannot resolve bind address {}", host)))
}

/// One plain listener, or `count` SO_REUSEPORT listeners sharing a port
fn bind_listeners(addr: SocketAddr, count: usize) -> Result<Vec<TcpListener>> {
    if count <= 1 {
        return Ok(vec![TcpListener::bind(addr)?]);
    }

    let first = reuseport_listener(addr)?;
    // Later sockets join whatever port the first one actually got
    let shared = first.local_addr()?;
    let mut listeners = vec![first];
    for _ in 1..count {
        listeners.push(reuseport_listener(shared)?);
    }
    Ok(listeners)
}

fn reuseport_listener(addr: SocketAddr) -> Result<TcpListener> {
    let family = if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let fd = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    setsockopt(&fd, sockopt::ReusePort, &true)?;
    bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;
    listen(&fd, Backlog::new(LISTEN_BACKLOG)?)?;
    Ok(TcpListener::from(fd))
}
