use super::connection::Connection;
use crate::error::{Error, Result};
use crate::io::{Multiplexer, Op, Ready, Registrar};
use crate::server::Dispatcher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct HandlerOptions {
    pub read_buffer_size: usize,
    pub max_request_size: usize,
}

/// Event loop thread serving the connections assigned to it
///
/// Commands from all of its connections run one at a time: each is handed to
/// the dispatcher and its reply awaited before the next is decoded.
pub struct IoHandler {
    id: usize,
    registrar: Registrar,
    pending: Mutex<Vec<Connection>>,
    stopping: AtomicBool,
    /// Server-wide open connection count; decremented here on every close
    active: Arc<AtomicUsize>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IoHandler {
    pub fn spawn(
        id: usize,
        dispatcher: Dispatcher,
        options: HandlerOptions,
        active: Arc<AtomicUsize>,
    ) -> Result<Arc<Self>> {
        let mux = Multiplexer::new(EVENT_CAPACITY)?;
        let handler = Arc::new(Self {
            id,
            registrar: mux.registrar(),
            pending: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            active,
            thread: Mutex::new(None),
        });

        let event_loop = EventLoop {
            mux,
            connections: HashMap::new(),
            dispatcher,
            scratch: vec![0; options.read_buffer_size.max(1)],
            max_request_size: options.max_request_size,
        };
        let shared = Arc::clone(&handler);
        let thread = thread::Builder::new()
            .name(format!("io-{}", id))
            .spawn(move || event_loop.run(&shared))?;
        *handler.thread.lock() = Some(thread);

        Ok(handler)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Hand a connection to this handler
    ///
    /// Safe to call while the loop is blocked waiting; the connection is
    /// picked up after the next wakeup.
    pub fn add_conn(&self, conn: Connection) -> Result<()> {
        let mut pending = self.pending.lock();
        if self.stopping.load(Ordering::Acquire) {
            self.release(conn);
            return Err(Error::Shutdown);
        }
        if let Err(e) = self.registrar.monitor(conn.fd(), Op::Read) {
            self.release(conn);
            return Err(e);
        }
        pending.push(conn);
        Ok(())
    }

    /// Stop the loop, close its connections and wait for the thread
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        if let Err(e) = self.registrar.wake() {
            warn!("Failed to wake I/O handler {}: {}", self.id, e);
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("I/O handler {} panicked", self.id);
            }
        }
    }

    fn release(&self, conn: Connection) {
        drop(conn);
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

struct EventLoop {
    mux: Multiplexer,
    connections: HashMap<RawFd, Connection>,
    dispatcher: Dispatcher,
    scratch: Vec<u8>,
    max_request_size: usize,
}

impl EventLoop {
    fn run(mut self, handler: &IoHandler) {
        info!("I/O handler {} started", handler.id);

        while !handler.stopping.load(Ordering::Acquire) {
            let ready = match self.mux.wait(Some(POLL_TIMEOUT)) {
                Ok(ready) => ready,
                Err(e) => {
                    warn!("I/O handler {} wait failed: {}", handler.id, e);
                    continue;
                }
            };
            self.adopt(handler);
            for event in ready {
                self.service(event, handler);
            }
        }

        // Take anything added after the last wakeup so it is closed too
        self.adopt(handler);
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            self.drop_conn(fd, handler);
        }
        self.mux.close();
        info!("I/O handler {} stopped", handler.id);
    }

    fn adopt(&mut self, handler: &IoHandler) {
        let adopted = std::mem::take(&mut *handler.pending.lock());
        for conn in adopted {
            debug!(
                "I/O handler {} serving connection {} from {:?}",
                handler.id,
                conn.id(),
                conn.peer_addr()
            );
            self.connections.insert(conn.fd(), conn);
        }
    }

    fn service(&mut self, event: Ready, handler: &IoHandler) {
        let Some(conn) = self.connections.get_mut(&event.fd) else {
            return;
        };

        let mut open = true;
        if event.readable || event.hangup {
            open = serve(
                conn,
                &self.dispatcher,
                &mut self.scratch,
                self.max_request_size,
            );
        }
        let flushed = flush(conn, &self.mux);
        if !(open && flushed) {
            self.drop_conn(event.fd, handler);
        }
    }

    fn drop_conn(&mut self, fd: RawFd, handler: &IoHandler) {
        let Some(conn) = self.connections.remove(&fd) else {
            return;
        };
        if let Err(e) = self.mux.forget(fd) {
            debug!("Deregistering connection {}: {}", conn.id(), e);
        }
        debug!(
            "Closing connection {} after {} commands",
            conn.id(),
            conn.commands_processed()
        );
        handler.release(conn);
    }
}

/// Read what is available and execute every complete command in order.
/// Returns false when the connection should be closed.
fn serve(
    conn: &mut Connection,
    dispatcher: &Dispatcher,
    scratch: &mut [u8],
    max_request_size: usize,
) -> bool {
    let status = match conn.fill(scratch, max_request_size) {
        Ok(status) => status,
        Err(Error::BufferOverflow) => {
            warn!("Connection {} exceeded the request size limit", conn.id());
            conn.queue_reply(&Error::BufferOverflow.to_resp());
            return false;
        }
        Err(e) if e.is_disconnect() => return false,
        Err(e) => {
            warn!("Read from connection {} failed: {}", conn.id(), e);
            return true;
        }
    };

    loop {
        match conn.next_command() {
            Ok(Some(command)) => {
                let reply = dispatcher.dispatch(command);
                conn.queue_reply(&reply);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Protocol error on connection {}: {}", conn.id(), e);
                conn.queue_reply(&e.to_resp());
                conn.discard_input();
                break;
            }
        }
    }

    !status.eof
}

/// Push buffered replies out, tracking write interest. False means the peer is gone.
fn flush(conn: &mut Connection, mux: &Multiplexer) -> bool {
    let interest = match conn.flush() {
        Ok(true) => mux.unmonitor(conn.fd(), Op::Write),
        Ok(false) => mux.monitor(conn.fd(), Op::Write),
        Err(e) if e.is_disconnect() => return false,
        Err(e) => {
            warn!("Write to connection {} failed: {}", conn.id(), e);
            return true;
        }
    };
    if let Err(e) = interest {
        warn!("Updating write interest for connection {}: {}", conn.id(), e);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RespParser, RespValue};
    use crate::server::status::ServerStatus;
    use crate::server::worker::{Worker, WorkerOptions};
    use crate::store::Shard;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    struct Rig {
        _workers: Vec<Worker>,
        handler: Arc<IoHandler>,
        active: Arc<AtomicUsize>,
        listener: TcpListener,
    }

    fn rig(max_request_size: usize) -> Rig {
        let status = Arc::new(ServerStatus::new());
        let options = WorkerOptions {
            queue_capacity: 64,
            expire_interval: Duration::from_millis(100),
        };
        let workers: Vec<Worker> = (0..2)
            .map(|id| Worker::spawn(id, Shard::default(), &options, status.clone()).unwrap())
            .collect();
        let dispatcher = Dispatcher::new(
            workers.iter().map(Worker::sender).collect(),
            Duration::from_secs(5),
        );
        let active = Arc::new(AtomicUsize::new(0));
        let handler = IoHandler::spawn(
            0,
            dispatcher,
            HandlerOptions {
                read_buffer_size: 64,
                max_request_size,
            },
            active.clone(),
        )
        .unwrap();

        Rig {
            _workers: workers,
            handler,
            active,
            listener: TcpListener::bind("127.0.0.1:0").unwrap(),
        }
    }

    impl Rig {
        fn connect(&self) -> TcpStream {
            let client = TcpStream::connect(self.listener.local_addr().unwrap()).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let (stream, peer) = self.listener.accept().unwrap();
            stream.set_nonblocking(true).unwrap();
            self.active.fetch_add(1, Ordering::AcqRel);
            self.handler
                .add_conn(Connection::new(stream, Some(peer), 64))
                .unwrap();
            client
        }
    }

    fn read_replies(client: &mut TcpStream, count: usize) -> Vec<RespValue> {
        let mut parser = RespParser::new();
        let mut replies = Vec::new();
        let mut buf = [0u8; 512];
        while replies.len() < count {
            while let Some(reply) = parser.parse_next().unwrap() {
                replies.push(reply);
            }
            if replies.len() >= count {
                break;
            }
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0, "server closed the connection");
            parser.feed(&buf[..n]);
        }
        replies
    }

    #[test]
    fn serves_pipelined_commands_in_order() {
        let rig = rig(1 << 20);
        let mut client = rig.connect();
        client
            .write_all(
                b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n*1\r\n$4\r\nPING\r\n",
            )
            .unwrap();

        let replies = read_replies(&mut client, 3);
        assert_eq!(
            replies,
            [RespValue::ok(), RespValue::bulk("v"), RespValue::simple("PONG")]
        );
        rig.handler.stop();
    }

    #[test]
    fn protocol_error_keeps_the_connection() {
        let rig = rig(1 << 20);
        let mut client = rig.connect();
        client.write_all(b"*1\r\n:1\r\n").unwrap();
        assert!(read_replies(&mut client, 1)[0].is_error());

        client.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
        assert_eq!(read_replies(&mut client, 1), [RespValue::simple("PONG")]);
        rig.handler.stop();
    }

    #[test]
    fn oversized_request_closes_the_connection() {
        let rig = rig(16);
        let mut client = rig.connect();
        client.write_all(&[b'*'; 40]).unwrap();

        let mut received = Vec::new();
        let _ = client.read_to_end(&mut received);
        assert!(received.starts_with(b"-ERR max request size exceeded"));
        rig.handler.stop();
    }

    #[test]
    fn stop_closes_connections() {
        let rig = rig(1 << 20);
        let mut client = rig.connect();
        client.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
        read_replies(&mut client, 1);

        rig.handler.stop();
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap(), 0);
        assert_eq!(rig.active.load(Ordering::Acquire), 0);

        let late = TcpStream::connect(rig.listener.local_addr().unwrap()).unwrap();
        rig.active.fetch_add(1, Ordering::AcqRel);
        assert!(rig.handler.add_conn(Connection::new(late, None, 64)).is_err());
        assert_eq!(rig.active.load(Ordering::Acquire), 0);
    }
}
