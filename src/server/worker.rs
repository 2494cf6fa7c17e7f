use super::status::{Busy, ServerStatus};
use crate::error::Result;
use crate::protocol::{Command, CommandExecutor, RespValue};
use crate::store::Shard;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// One command on its way to a worker, with a single-use reply slot
pub struct Task {
    pub command: Command,
    pub reply: Sender<RespValue>,
    /// The task is skipped if it is dequeued after this instant
    pub deadline: Instant,
}

pub struct WorkerOptions {
    pub queue_capacity: usize,
    pub expire_interval: Duration,
}

/// A thread that owns one shard and executes its tasks in FIFO order
pub struct Worker {
    id: usize,
    inbox: Sender<Task>,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(
        id: usize,
        shard: Shard,
        options: &WorkerOptions,
        status: Arc<ServerStatus>,
    ) -> Result<Self> {
        let (inbox, tasks) = bounded(options.queue_capacity);
        let (stop_tx, stop_rx) = bounded(1);
        let expire_interval = options.expire_interval;

        let handle = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || {
                run(
                    id,
                    CommandExecutor::new(shard),
                    tasks,
                    stop_rx,
                    expire_interval,
                    &status,
                )
            })?;

        Ok(Self {
            id,
            inbox,
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Queue handle for the dispatcher
    pub fn sender(&self) -> Sender<Task> {
        self.inbox.clone()
    }

    /// Ask the loop to exit and wait for it. Tasks still queued are dropped.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.stop_tx.try_send(());
        if handle.join().is_err() {
            error!("Worker {} panicked", self.id);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    id: usize,
    mut executor: CommandExecutor,
    tasks: Receiver<Task>,
    stop_rx: Receiver<()>,
    expire_interval: Duration,
    status: &ServerStatus,
) {
    let ticker = tick(expire_interval);
    info!("Worker {} started", id);

    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(tasks) -> task => match task {
                Ok(task) => execute(&mut executor, task),
                Err(_) => break,
            },
            recv(ticker) -> _ => {
                if sweep(id, &mut executor, status).is_break() {
                    break;
                }
            }
        }
    }

    info!(
        "Worker {} stopped after {} commands",
        id,
        executor.commands_processed()
    );
}

fn execute(executor: &mut CommandExecutor, task: Task) {
    if Instant::now() > task.deadline {
        debug!("Skipping {} past its deadline", task.command.name);
        return;
    }
    let reply = executor.execute(&task.command);
    // Capacity 1 and a single send: never blocks. The caller may have given up.
    let _ = task.reply.try_send(reply);
}

fn sweep(id: usize, executor: &mut CommandExecutor, status: &ServerStatus) -> ControlFlow<()> {
    match status.begin_busy() {
        Busy::Acquired => {
            let purged = executor.shard_mut().purge_expired(Instant::now());
            status.end_busy();
            if purged > 0 {
                debug!("Worker {} expired {} keys", id, purged);
            }
            ControlFlow::Continue(())
        }
        Busy::Busy => ControlFlow::Continue(()),
        Busy::Shutdown => ControlFlow::Break(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> WorkerOptions {
        WorkerOptions {
            queue_capacity: 16,
            expire_interval: Duration::from_millis(10),
        }
    }

    fn submit(worker: &Worker, words: &[&str]) -> Receiver<RespValue> {
        let (reply, rx) = bounded(1);
        let command = Command::new(words[0], words[1..].iter().map(|w| w.to_string()).collect());
        worker
            .sender()
            .send(Task {
                command,
                reply,
                deadline: Instant::now() + Duration::from_secs(5),
            })
            .unwrap();
        rx
    }

    #[test]
    fn same_key_commands_run_in_enqueue_order() {
        let status = Arc::new(ServerStatus::new());
        let worker = Worker::spawn(0, Shard::default(), &options(), status).unwrap();

        let pending: Vec<_> = (0..100)
            .map(|i| submit(&worker, &["SET", "k", &i.to_string()]))
            .collect();
        let last = submit(&worker, &["GET", "k"]);

        for rx in pending {
            assert_eq!(rx.recv().unwrap(), RespValue::ok());
        }
        assert_eq!(last.recv().unwrap(), RespValue::bulk("99"));
    }

    #[test]
    fn expired_tasks_are_skipped() {
        let status = Arc::new(ServerStatus::new());
        let worker = Worker::spawn(0, Shard::default(), &options(), status).unwrap();

        let (reply, rx) = bounded(1);
        worker
            .sender()
            .send(Task {
                command: Command::new("PING", vec![]),
                reply,
                deadline: Instant::now() - Duration::from_millis(1),
            })
            .unwrap();
        // Dropped without a reply
        assert!(rx.recv().is_err());
    }

    #[test]
    fn sweep_purges_expired_keys() {
        let status = Arc::new(ServerStatus::new());
        let worker = Worker::spawn(0, Shard::default(), &options(), status).unwrap();

        submit(&worker, &["SET", "k", "v", "PX", "20"]).recv().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(
            submit(&worker, &["EXISTS", "k"]).recv().unwrap(),
            RespValue::Integer(0)
        );
    }

    #[test]
    fn stop_disconnects_the_queue() {
        let status = Arc::new(ServerStatus::new());
        let mut worker = Worker::spawn(3, Shard::default(), &options(), status).unwrap();
        let sender = worker.sender();
        worker.stop();
        worker.stop();

        let (reply, _rx) = bounded(1);
        let task = Task {
            command: Command::new("PING", vec![]),
            reply,
            deadline: Instant::now() + Duration::from_secs(1),
        };
        assert!(sender.send(task).is_err());
    }

    #[test]
    fn shutdown_status_ends_the_loop() {
        let status = Arc::new(ServerStatus::new());
        let worker = Worker::spawn(0, Shard::default(), &options(), status.clone()).unwrap();
        let sender = worker.sender();
        status.shutdown();
        thread::sleep(Duration::from_millis(100));

        let (reply, _rx) = bounded(1);
        let task = Task {
            command: Command::new("PING", vec![]),
            reply,
            deadline: Instant::now() + Duration::from_secs(1),
        };
        assert!(sender.send(task).is_err());
    }
}
