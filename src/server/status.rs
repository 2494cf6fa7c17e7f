use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const SHUTDOWN: u8 = 2;

/// Result of trying to claim the server for a background job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Busy {
    Acquired,
    Busy,
    Shutdown,
}

/// Process-wide Idle / Running / Shutdown flag
///
/// Background jobs such as the expiry sweep claim it with [`begin_busy`] and
/// hand it back with [`end_busy`]. Shutdown is terminal.
///
/// [`begin_busy`]: ServerStatus::begin_busy
/// [`end_busy`]: ServerStatus::end_busy
#[derive(Debug)]
pub struct ServerStatus(AtomicU8);

impl ServerStatus {
    pub fn new() -> Self {
        Self(AtomicU8::new(IDLE))
    }

    pub fn begin_busy(&self) -> Busy {
        match self
            .0
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Busy::Acquired,
            Err(SHUTDOWN) => Busy::Shutdown,
            Err(_) => Busy::Busy,
        }
    }

    /// Running → Idle. Leaves Shutdown in place.
    pub fn end_busy(&self) {
        let _ = self
            .0
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn shutdown(&self) {
        self.0.store(SHUTDOWN, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::Acquire) == SHUTDOWN
    }
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self::new()
    }
}
