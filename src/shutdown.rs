//! # Graceful Shutdown Coordination
//!
//! Shutdown runs a fixed phase sequence, strictly in order:
//!
//! ```text
//! STOP_ACCEPTING → DRAIN_CONNECTIONS → FLUSH_WAL → CLOSE_FILES → CLEANUP → DONE
//! ```
//!
//! Callbacks registered for a phase run in registration order; a callback
//! error is logged and does not abort the sequence — a failing flush must
//! not prevent files from closing.
//!
//! DRAIN_CONNECTIONS is special: after its callbacks, the coordinator
//! waits (up to the remaining deadline) for the active-operation count to
//! reach zero. Operations are tracked by [`ActiveOperationGuard`]s; once
//! shutdown has been requested, `begin_operation` hands out an *invalid*
//! guard that never bumps the counter, so late arrivals cannot hold the
//! drain open.
//!
//! Initiation is idempotent: the first caller drives the sequence, any
//! later caller blocks until completion and receives the same graceful
//! flag. A timeout surfaces a warning and `false`, but later phases still
//! run — a stuck connection must not block the WAL flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use eyre::Result;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    StopAccepting,
    DrainConnections,
    FlushWal,
    CloseFiles,
    Cleanup,
    Done,
}

impl ShutdownPhase {
    /// The driven phases, in execution order (`Done` is a terminal
    /// marker, not a phase with callbacks).
    pub const SEQUENCE: [ShutdownPhase; 5] = [
        ShutdownPhase::StopAccepting,
        ShutdownPhase::DrainConnections,
        ShutdownPhase::FlushWal,
        ShutdownPhase::CloseFiles,
        ShutdownPhase::Cleanup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ShutdownPhase::StopAccepting => "stop_accepting",
            ShutdownPhase::DrainConnections => "drain_connections",
            ShutdownPhase::FlushWal => "flush_wal",
            ShutdownPhase::CloseFiles => "close_files",
            ShutdownPhase::Cleanup => "cleanup",
            ShutdownPhase::Done => "done",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

type PhaseCallback = Box<dyn Fn() -> Result<()> + Send + Sync>;

#[derive(Default)]
struct CoordinatorState {
    current_phase: Option<ShutdownPhase>,
    complete: bool,
    graceful: bool,
}

/// Drives the phased shutdown sequence. One per engine.
pub struct ShutdownCoordinator {
    requested: AtomicBool,
    state: Mutex<CoordinatorState>,
    phase_cv: Condvar,
    callbacks: Mutex<[Vec<PhaseCallback>; 5]>,
    active: Mutex<usize>,
    active_cv: Condvar,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            state: Mutex::new(CoordinatorState::default()),
            phase_cv: Condvar::new(),
            callbacks: Mutex::new([
                Vec::new(),
                Vec::new(),
                Vec::new(),
                Vec::new(),
                Vec::new(),
            ]),
            active: Mutex::new(0),
            active_cv: Condvar::new(),
        }
    }

    /// Registers a callback for a phase. `Done` accepts none.
    pub fn register_callback<F>(&self, phase: ShutdownPhase, callback: F)
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        if phase == ShutdownPhase::Done {
            return;
        }
        self.callbacks.lock()[phase.index()].push(Box::new(callback));
    }

    /// True once shutdown has been requested.
    pub fn in_progress(&self) -> bool {
        self.requested.load(Ordering::Acquire) && !self.state.lock().complete
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn current_phase(&self) -> Option<ShutdownPhase> {
        self.state.lock().current_phase
    }

    pub fn active_operations(&self) -> usize {
        *self.active.lock()
    }

    /// Starts tracking an operation. After shutdown is requested the
    /// returned guard is invalid: it does not bump the counter and the
    /// caller must refuse to start the operation.
    pub fn begin_operation(&self) -> ActiveOperationGuard<'_> {
        if self.requested.load(Ordering::Acquire) {
            return ActiveOperationGuard {
                coordinator: self,
                valid: false,
            };
        }
        *self.active.lock() += 1;
        ActiveOperationGuard {
            coordinator: self,
            valid: true,
        }
    }

    /// Runs the shutdown sequence. The first caller drives it; later
    /// callers block for completion. Returns whether the drain finished
    /// inside the deadline.
    pub fn initiate(&self, timeout: Duration) -> bool {
        if self.requested.swap(true, Ordering::AcqRel) {
            return self.wait_for_completion(timeout);
        }

        info!(timeout_ms = timeout.as_millis() as u64, "shutdown initiated");
        let deadline = Instant::now() + timeout;
        let mut graceful = true;

        for phase in ShutdownPhase::SEQUENCE {
            {
                let mut state = self.state.lock();
                state.current_phase = Some(phase);
                self.phase_cv.notify_all();
            }
            info!(phase = phase.name(), "shutdown phase");

            let callbacks = self.callbacks.lock();
            for callback in &callbacks[phase.index()] {
                if let Err(e) = callback() {
                    warn!(phase = phase.name(), error = %e, "shutdown callback failed");
                }
            }
            drop(callbacks);

            if phase == ShutdownPhase::DrainConnections && !self.wait_for_drain(deadline) {
                warn!(
                    active = self.active_operations(),
                    "shutdown drain timed out with operations still active"
                );
                graceful = false;
            }
        }

        {
            let mut state = self.state.lock();
            state.current_phase = Some(ShutdownPhase::Done);
            state.complete = true;
            state.graceful = graceful;
            self.phase_cv.notify_all();
        }
        info!(graceful, "shutdown complete");

        graceful
    }

    fn wait_for_drain(&self, deadline: Instant) -> bool {
        let mut active = self.active.lock();
        while *active > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self
                .active_cv
                .wait_until(&mut active, deadline)
                .timed_out()
            {
                return *active == 0;
            }
        }
        true
    }

    fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.complete {
            if self.phase_cv.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
        state.graceful
    }

    /// Blocks until the sequence has reached (or passed) `phase`.
    pub fn wait_for_phase(&self, phase: ShutdownPhase, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.current_phase.map_or(false, |p| p >= phase) {
                return true;
            }
            if self.phase_cv.wait_until(&mut state, deadline).timed_out() {
                return state.current_phase.map_or(false, |p| p >= phase);
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII tracking of one in-flight operation. An invalid guard (issued
/// after shutdown was requested) counts nothing and signals the caller
/// to refuse the operation.
pub struct ActiveOperationGuard<'a> {
    coordinator: &'a ShutdownCoordinator,
    valid: bool,
}

impl ActiveOperationGuard<'_> {
    pub fn valid(&self) -> bool {
        self.valid
    }
}

impl Drop for ActiveOperationGuard<'_> {
    fn drop(&mut self) {
        if self.valid {
            let mut active = self.coordinator.active.lock();
            *active -= 1;
            if *active == 0 {
                self.coordinator.active_cv.notify_all();
            }
        }
    }
}
