//! Worker lifecycle shared by the transports.
//!
//! A [`WorkerGroup`] owns the run state of one transport and its set of
//! receive workers:
//! - One OS thread per registered handler
//! - Compare-and-swap transition between `Stopped` and `Running`
//! - `stop()` blocks until the last worker has exited; that worker sends the
//!   drain signal
//!
//! Handlers registered before `start()` are spawned by `start()`; handlers
//! registered while running are spawned immediately. Registrations survive
//! a stop, so a transport can be restarted.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::POLL_INTERVAL;
use crate::transport::{TransportError, TransportResult};

/// Run state of a worker group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// No worker loop may run
    Stopped = 0,
    /// Worker loops keep polling
    Running = 1,
}

/// A worker loop body. It must return soon after
/// [`WorkerContext::is_running`] turns false.
pub type WorkerJob = Arc<dyn Fn(&WorkerContext) + Send + Sync>;

struct Shared {
    state: AtomicU8,
    active: AtomicUsize,
    drain_tx: Sender<()>,
}

/// View of the group handed to each worker loop
pub struct WorkerContext {
    id: usize,
    shared: Arc<Shared>,
}

impl WorkerContext {
    /// Worker identifier, unique within the group
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether the loop should keep polling
    pub fn is_running(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == WorkerState::Running as u8
    }
}

/// First pause after a receive error
const BACKOFF_BASE: Duration = Duration::from_millis(10);

/// Pause between retries after consecutive receive errors.
///
/// The pause doubles per failure up to [`POLL_INTERVAL`], so a stop request
/// is still observed within one poll interval. Only failures whose count is
/// a power of two are meant to be logged.
#[derive(Debug, Default)]
pub struct ErrorBackoff {
    failures: u32,
}

impl ErrorBackoff {
    /// No failures recorded
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure. Returns the pause before the next attempt and
    /// whether this failure should be logged.
    pub fn failure(&mut self) -> (Duration, bool) {
        self.failures = self.failures.saturating_add(1);
        let shift = (self.failures - 1).min(16);
        let delay = BACKOFF_BASE.saturating_mul(1 << shift).min(POLL_INTERVAL);
        (delay, self.failures.is_power_of_two())
    }

    /// Record a success. Returns the number of failures it ended.
    pub fn reset(&mut self) -> u32 {
        std::mem::take(&mut self.failures)
    }

    /// Consecutive failures so far
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Decrements the active count when a worker exits, panics included.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self.0.drain_tx.send(());
        }
    }
}

/// Set of receive workers with a shared run flag
pub struct WorkerGroup {
    name: String,
    shared: Arc<Shared>,
    drain_rx: Receiver<()>,
    jobs: Mutex<Vec<WorkerJob>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicUsize,
}

impl WorkerGroup {
    /// Create a stopped group; `name` prefixes the worker thread names
    pub fn new(name: impl Into<String>) -> Self {
        let (drain_tx, drain_rx) = unbounded();
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: AtomicU8::new(WorkerState::Stopped as u8),
                active: AtomicUsize::new(0),
                drain_tx,
            }),
            drain_rx,
            jobs: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Current run state
    pub fn state(&self) -> WorkerState {
        if self.shared.state.load(Ordering::Acquire) == WorkerState::Running as u8 {
            WorkerState::Running
        } else {
            WorkerState::Stopped
        }
    }

    /// Whether the group is running
    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Number of worker threads currently alive
    pub fn worker_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Number of registered handlers
    pub fn registered(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Register a worker loop.
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the group is running and the thread
    /// cannot be spawned
    pub fn register(&self, job: WorkerJob) -> TransportResult<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.push(Arc::clone(&job));
        if self.is_running() {
            self.spawn(job)?;
        }
        Ok(())
    }

    /// Drop every registered handler. Running workers are not affected.
    pub fn clear(&self) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Transition to `Running` and spawn every registered handler.
    ///
    /// # Errors
    /// Returns `TransportError::AlreadyRunning` if already running, or
    /// `TransportError::Io` if a thread cannot be spawned. In the latter case
    /// the group is stopped again before returning.
    pub fn start(&self) -> TransportResult<()> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared
            .state
            .compare_exchange(
                WorkerState::Stopped as u8,
                WorkerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| TransportError::AlreadyRunning)?;

        // Signals left over from workers that exited on their own
        while self.drain_rx.try_recv().is_ok() {}

        let spawned = jobs
            .iter()
            .try_for_each(|job| self.spawn(Arc::clone(job)));
        drop(jobs);
        if let Err(e) = spawned {
            let _ = self.stop();
            return Err(e);
        }

        info!(group = %self.name, workers = self.worker_count(), "Workers started");
        Ok(())
    }

    /// Transition to `Stopped` and wait for every worker to exit.
    ///
    /// # Errors
    /// Returns `TransportError::NotRunning` if not running
    pub fn stop(&self) -> TransportResult<()> {
        self.shared
            .state
            .compare_exchange(
                WorkerState::Running as u8,
                WorkerState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| TransportError::NotRunning)?;

        while self.worker_count() > 0 {
            match self.drain_rx.recv_timeout(POLL_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.join() {
                error!(group = %self.name, "Worker panicked: {:?}", e);
            }
        }

        info!(group = %self.name, "Workers drained");
        Ok(())
    }

    fn spawn(&self, job: WorkerJob) -> TransportResult<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.active.fetch_add(1, Ordering::AcqRel);
        let guard = ExitGuard(Arc::clone(&self.shared));
        let ctx = WorkerContext {
            id,
            shared: Arc::clone(&self.shared),
        };
        let group = self.name.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-worker-{}", self.name, id))
            .spawn(move || {
                let _guard = guard;
                debug!(group = %group, worker = id, "Worker starting");
                job(&ctx);
                debug!(group = %group, worker = id, "Worker exiting");
            })?;

        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}
