//! Routing commands to the worker that owns their key

use super::worker::Task;
use crate::error::{Error, Result};
use crate::protocol::{Command, RespValue};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::time::{Duration, Instant};

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a
pub fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Owning worker for `key` among `workers`
pub fn partition(key: &str, workers: usize) -> usize {
    fnv1a(key.as_bytes()) as usize % workers
}

/// Cloneable front door to the worker pool; one clone per I/O handler
#[derive(Clone)]
pub struct Dispatcher {
    workers: Vec<Sender<Task>>,
    reply_timeout: Duration,
}

impl Dispatcher {
    /// `workers` must not be empty
    pub fn new(workers: Vec<Sender<Task>>, reply_timeout: Duration) -> Self {
        Self {
            workers,
            reply_timeout,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Run `command` on its owning worker and wait for the reply
    ///
    /// Summing multi-key commands are fanned out per key and the integer
    /// replies added up. Failures come back as error replies.
    pub fn dispatch(&self, command: Command) -> RespValue {
        let deadline = Instant::now() + self.reply_timeout;
        match command.split_keys() {
            Some(parts) => self.fan_out(parts, deadline),
            None => self
                .enqueue(command, deadline)
                .and_then(|rx| await_reply(&rx, deadline))
                .unwrap_or_else(|e| e.to_resp()),
        }
    }

    fn fan_out(&self, parts: Vec<Command>, deadline: Instant) -> RespValue {
        let pending = match parts
            .into_iter()
            .map(|part| self.enqueue(part, deadline))
            .collect::<Result<Vec<_>>>()
        {
            Ok(pending) => pending,
            Err(e) => return e.to_resp(),
        };

        let mut total = 0;
        for rx in &pending {
            match await_reply(rx, deadline) {
                Ok(RespValue::Integer(n)) => total += n,
                Ok(other) => return other,
                Err(e) => return e.to_resp(),
            }
        }
        RespValue::Integer(total)
    }

    fn enqueue(&self, command: Command, deadline: Instant) -> Result<Receiver<RespValue>> {
        let owner = partition(command.key().unwrap_or(""), self.workers.len());
        let (reply, rx) = bounded(1);
        let task = Task {
            command,
            reply,
            deadline,
        };

        self.workers[owner]
            .send_deadline(task, deadline)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => Error::Timeout,
                SendTimeoutError::Disconnected(_) => Error::Shutdown,
            })?;
        Ok(rx)
    }
}

fn await_reply(rx: &Receiver<RespValue>, deadline: Instant) -> Result<RespValue> {
    rx.recv_deadline(deadline).map_err(|e| match e {
        RecvTimeoutError::Timeout => Error::Timeout,
        RecvTimeoutError::Disconnected => Error::Shutdown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::status::ServerStatus;
    use crate::server::worker::{Worker, WorkerOptions};
    use crate::store::Shard;
    use std::sync::Arc;

    fn cmd(words: &[&str]) -> Command {
        Command::new(words[0], words[1..].iter().map(|w| w.to_string()).collect())
    }

    fn pool(n: usize) -> (Vec<Worker>, Dispatcher) {
        let status = Arc::new(ServerStatus::new());
        let options = WorkerOptions {
            queue_capacity: 64,
            expire_interval: Duration::from_millis(100),
        };
        let workers: Vec<Worker> = (0..n)
            .map(|id| Worker::spawn(id, Shard::default(), &options, status.clone()).unwrap())
            .collect();
        let dispatcher = Dispatcher::new(
            workers.iter().map(Worker::sender).collect(),
            Duration::from_secs(5),
        );
        (workers, dispatcher)
    }

    #[test]
    fn fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn partition_is_deterministic() {
        for key in ["", "user:1", "leaderboard", "ключ"] {
            let first = partition(key, 7);
            assert!(first < 7);
            assert_eq!(partition(key, 7), first);
        }
        assert_eq!(partition("", 4), (0x811c_9dc5u32 % 4) as usize);
    }

    #[test]
    fn keys_land_on_their_owner() {
        let (_workers, dispatcher) = pool(4);
        for i in 0..32 {
            let key = format!("k{}", i);
            assert_eq!(dispatcher.dispatch(cmd(&["SET", &key, "v"])), RespValue::ok());
        }
        for i in 0..32 {
            let key = format!("k{}", i);
            assert_eq!(dispatcher.dispatch(cmd(&["GET", &key])), RespValue::bulk("v"));
        }
    }

    #[test]
    fn multi_key_replies_are_summed() {
        let (_workers, dispatcher) = pool(4);
        for key in ["a", "b", "c"] {
            dispatcher.dispatch(cmd(&["SET", key, "1"]));
        }
        assert_eq!(
            dispatcher.dispatch(cmd(&["EXISTS", "a", "b", "c", "d"])),
            RespValue::Integer(3)
        );
        assert_eq!(
            dispatcher.dispatch(cmd(&["DEL", "a", "b", "d"])),
            RespValue::Integer(2)
        );
        assert_eq!(
            dispatcher.dispatch(cmd(&["EXISTS", "a", "b", "c"])),
            RespValue::Integer(1)
        );
    }

    #[test]
    fn keyless_commands_reach_a_worker() {
        let (_workers, dispatcher) = pool(3);
        assert_eq!(dispatcher.dispatch(cmd(&["PING"])), RespValue::simple("PONG"));
        assert!(dispatcher.dispatch(cmd(&["FOOBAR"])).is_error());
    }

    #[test]
    fn far_future_expiry_leaves_the_owner_serving() {
        let (_workers, dispatcher) = pool(2);
        let huge = i64::MAX.to_string();
        dispatcher.dispatch(cmd(&["SET", "k", "v"]));
        assert_eq!(
            dispatcher.dispatch(cmd(&["EXPIRE", "k", &huge])),
            RespValue::Error("ERR invalid expire time in 'expire' command".to_string())
        );
        assert_eq!(dispatcher.dispatch(cmd(&["GET", "k"])), RespValue::bulk("v"));
    }

    #[test]
    fn unanswered_task_times_out() {
        let (tx, _rx) = bounded(8);
        let dispatcher = Dispatcher::new(vec![tx], Duration::from_millis(50));
        assert_eq!(
            dispatcher.dispatch(cmd(&["PING"])),
            RespValue::Error("ERR command timed out".to_string())
        );
    }

    #[test]
    fn stopped_pool_reports_shutdown() {
        let (workers, dispatcher) = pool(2);
        drop(workers);
        assert_eq!(
            dispatcher.dispatch(cmd(&["GET", "k"])),
            RespValue::Error("ERR server is shutting down".to_string())
        );
    }
}
