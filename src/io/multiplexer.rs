//! Readiness multiplexing over raw descriptors
//!
//! A thin layer over `mio::Poll` that speaks in file descriptors and
//! read/write ops instead of tokens and sources. Tokens are the fd itself,
//! so a ready event maps straight back to its connection. Registration goes
//! through a cloneable [`Registrar`] so that an acceptor thread can hand a
//! socket to a handler that is currently blocked in [`Multiplexer::wait`].

use crate::error::Result;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const WAKE: Token = Token(usize::MAX);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

impl Op {
    fn interest(self) -> Interest {
        match self {
            Op::Read => Interest::READABLE,
            Op::Write => Interest::WRITABLE,
        }
    }
}

/// Readiness of one descriptor, merged across all events for it in a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Peer closed, or the socket reported an error
    pub hangup: bool,
}

/// Shareable handle for changing interest sets from any thread
#[derive(Clone)]
pub struct Registrar {
    registry: Arc<Registry>,
    interests: Arc<Mutex<HashMap<RawFd, Interest>>>,
    waker: Arc<Waker>,
}

impl Registrar {
    /// Watch `fd` for `op`; a no-op if already watched for it
    pub fn monitor(&self, fd: RawFd, op: Op) -> Result<()> {
        let mut interests = self.interests.lock();
        let token = Token(fd as usize);

        match interests.get(&fd).copied() {
            Some(current) => {
                let wanted = current | op.interest();
                if wanted != current {
                    self.registry
                        .reregister(&mut SourceFd(&fd), token, wanted)?;
                    interests.insert(fd, wanted);
                }
            }
            None => {
                self.registry
                    .register(&mut SourceFd(&fd), token, op.interest())?;
                interests.insert(fd, op.interest());
            }
        }
        Ok(())
    }

    /// Stop watching `fd` for `op`. Dropping the last op deregisters the fd.
    pub fn unmonitor(&self, fd: RawFd, op: Op) -> Result<()> {
        let mut interests = self.interests.lock();
        let Some(current) = interests.get(&fd).copied() else {
            return Ok(());
        };

        match current.remove(op.interest()) {
            Some(rest) if rest == current => {}
            Some(rest) => {
                self.registry
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), rest)?;
                interests.insert(fd, rest);
            }
            None => {
                interests.remove(&fd);
                self.registry.deregister(&mut SourceFd(&fd))?;
            }
        }
        Ok(())
    }

    /// Drop every op for `fd`. Must run before the descriptor is closed.
    pub fn forget(&self, fd: RawFd) -> Result<()> {
        if self.interests.lock().remove(&fd).is_some() {
            self.registry.deregister(&mut SourceFd(&fd))?;
        }
        Ok(())
    }

    pub fn is_monitored(&self, fd: RawFd, op: Op) -> bool {
        self.interests.lock().get(&fd).is_some_and(|current| match op {
            Op::Read => current.is_readable(),
            Op::Write => current.is_writable(),
        })
    }

    /// Interrupt a blocked [`Multiplexer::wait`]
    pub fn wake(&self) -> Result<()> {
        self.waker.wake()?;
        Ok(())
    }
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    registrar: Registrar,
}

impl Multiplexer {
    pub fn new(event_capacity: usize) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE)?;
        let registry = poll.registry().try_clone()?;

        Ok(Self {
            poll,
            events: Events::with_capacity(event_capacity),
            registrar: Registrar {
                registry: Arc::new(registry),
                interests: Arc::new(Mutex::new(HashMap::new())),
                waker: Arc::new(waker),
            },
        })
    }

    pub fn registrar(&self) -> Registrar {
        self.registrar.clone()
    }

    pub fn monitor(&self, fd: RawFd, op: Op) -> Result<()> {
        self.registrar.monitor(fd, op)
    }

    pub fn unmonitor(&self, fd: RawFd, op: Op) -> Result<()> {
        self.registrar.unmonitor(fd, op)
    }

    pub fn forget(&self, fd: RawFd) -> Result<()> {
        self.registrar.forget(fd)
    }

    /// Block until at least one descriptor is ready, the timeout lapses or a
    /// wake arrives. Each fd appears at most once in the result.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Ready>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut ready: Vec<Ready> = Vec::new();
        let mut slots: HashMap<RawFd, usize> = HashMap::new();

        for event in self.events.iter() {
            if event.token() == WAKE {
                continue;
            }
            let fd = event.token().0 as RawFd;
            let slot = *slots.entry(fd).or_insert_with(|| {
                ready.push(Ready {
                    fd,
                    readable: false,
                    writable: false,
                    hangup: false,
                });
                ready.len() - 1
            });

            let entry = &mut ready[slot];
            entry.readable |= event.is_readable();
            entry.writable |= event.is_writable();
            entry.hangup |= event.is_read_closed() || event.is_write_closed() || event.is_error();
        }

        Ok(ready)
    }

    /// Deregister everything and release the poll instance
    pub fn close(self) {
        let mut interests = self.registrar.interests.lock();
        for (fd, _) in interests.drain() {
            if let Err(e) = self.registrar.registry.deregister(&mut SourceFd(&fd)) {
                debug!("Deregistering fd {} on close: {}", fd, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Instant;

    const TICK: Option<Duration> = Some(Duration::from_millis(200));

    #[test]
    fn reports_readable_once_per_fd() {
        let mut mux = Multiplexer::new(64).unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        mux.monitor(rx.as_raw_fd(), Op::Read).unwrap();
        mux.monitor(rx.as_raw_fd(), Op::Read).unwrap();
        tx.write_all(b"ping").unwrap();

        let ready = mux.wait(TICK).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd, rx.as_raw_fd());
        assert!(ready[0].readable);
        mux.close();
    }

    #[test]
    fn write_interest_merges_with_read() {
        let mut mux = Multiplexer::new(64).unwrap();
        let (_peer, sock) = UnixStream::pair().unwrap();
        let fd = sock.as_raw_fd();

        mux.monitor(fd, Op::Read).unwrap();
        mux.monitor(fd, Op::Write).unwrap();
        assert!(mux.registrar().is_monitored(fd, Op::Read));
        assert!(mux.registrar().is_monitored(fd, Op::Write));

        let ready = mux.wait(TICK).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].writable);

        mux.unmonitor(fd, Op::Write).unwrap();
        assert!(!mux.registrar().is_monitored(fd, Op::Write));
        assert!(mux.registrar().is_monitored(fd, Op::Read));
        mux.unmonitor(fd, Op::Read).unwrap();
        assert!(!mux.registrar().is_monitored(fd, Op::Read));
    }

    #[test]
    fn unmonitor_unknown_fd_is_a_no_op() {
        let mux = Multiplexer::new(8).unwrap();
        mux.unmonitor(12345, Op::Read).unwrap();
        mux.registrar().forget(12345).unwrap();
    }

    #[test]
    fn peer_close_is_a_hangup() {
        let mut mux = Multiplexer::new(8).unwrap();
        let (peer, sock) = UnixStream::pair().unwrap();
        mux.monitor(sock.as_raw_fd(), Op::Read).unwrap();
        drop(peer);

        let ready = mux.wait(TICK).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].hangup);
    }

    #[test]
    fn wake_interrupts_a_blocked_wait() {
        let mut mux = Multiplexer::new(8).unwrap();
        let registrar = mux.registrar();

        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            registrar.wake().unwrap();
        });

        let started = Instant::now();
        let ready = mux.wait(Some(Duration::from_secs(10))).unwrap();
        assert!(ready.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
    }
}
