//! Resource governor
//!
//! Tracks CPU usage on a monotonic clock, enforces the normal and emergency
//! CPU limits through the watchdog thread, and keeps the memory figures the
//! host can query. The interpreter's allocator does the actual memory
//! enforcement; the governor records the limit and the observed peak.
//!
//! The first non-catchable failure of an invocation window is kept as its
//! breach and reported however the guest call itself ends. Guest code can
//! replace an error value while it unwinds, but not the breach.
//!
//! CPU usage accumulates across calls. Limits are measured from the usage at
//! the time they were set, so a budget that ran out stays exhausted until the
//! host sets a new limit.

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use super::error::{
    ErrorKind, ErrorRecord, StackFrame, EMERGENCY_TIMEOUT_MESSAGE, MEMORY_ERROR_MESSAGE, TIMEOUT_MESSAGE,
};
use super::memory::AllocWatch;
use super::timer::{Deadlines, Interrupt, TimerShared, Watchdog};
use crate::error::SandboxError;

/// Governor state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorPhase {
    /// No guest invocation in flight
    Idle,

    /// A guest invocation is running under the limits
    Armed,

    /// A limit fired; the invocation is unwinding
    Interrupted,
}

/// Snapshot of limits and usage
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceBudget {
    /// Memory ceiling in bytes (0 = unlimited)
    pub memory_limit: usize,

    /// Normal CPU limit
    pub cpu_limit: Option<Duration>,

    /// Emergency CPU limit
    pub emergency_cpu_limit: Option<Duration>,

    /// Bytes currently allocated by the interpreter
    pub current_memory: usize,

    /// Highest allocation figure observed
    pub peak_memory: usize,

    /// Accumulated guest CPU time
    pub cpu_used: Duration,
}

#[derive(Debug, Default)]
struct Clock {
    normal_limit: Option<Duration>,
    emergency_limit: Option<Duration>,
    usage: Duration,
    /// Usage at the moment the limits were last set
    limit_base: Duration,
    /// Set while armed and not paused
    running_since: Option<Instant>,
    paused: bool,
    /// Nesting depth of guest invocations
    depth: u32,
}

impl Clock {
    fn usage(&self, now: Instant) -> Duration {
        self.usage + self.running_since.map_or(Duration::ZERO, |since| now - since)
    }

    fn consumed(&self, now: Instant) -> Duration {
        self.usage(now).saturating_sub(self.limit_base)
    }

    fn normal_exhausted(&self, now: Instant) -> bool {
        self.normal_limit.map_or(false, |limit| self.consumed(now) >= limit)
    }

    fn stop(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.usage += now - since;
        }
    }

    fn deadlines(&self, now: Instant) -> Deadlines {
        if self.running_since.is_none() {
            return Deadlines::default();
        }
        let consumed = self.consumed(now);
        Deadlines {
            // A deadline too far away to represent is no deadline
            normal: self
                .normal_limit
                .and_then(|limit| now.checked_add(limit.saturating_sub(consumed))),
            emergency: self
                .emergency_limit
                .and_then(|limit| now.checked_add(limit.saturating_sub(consumed))),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Governor {
    sandbox_id: Uuid,
    clock: RefCell<Clock>,
    memory_limit: Cell<usize>,
    peak_memory: Cell<usize>,
    allocations: AllocWatch,
    /// First non-catchable failure of the current window
    breach: RefCell<Option<ErrorRecord>>,
    shared: Arc<TimerShared>,
    watchdog: RefCell<Option<Watchdog>>,
}

impl Governor {
    pub fn new(sandbox_id: Uuid, allocations: AllocWatch) -> Self {
        Governor {
            sandbox_id,
            clock: RefCell::new(Clock::default()),
            memory_limit: Cell::new(0),
            peak_memory: Cell::new(0),
            allocations,
            breach: RefCell::new(None),
            shared: Arc::new(TimerShared::default()),
            watchdog: RefCell::new(None),
        }
    }

    fn ensure_watchdog(&self) -> Result<(), SandboxError> {
        let mut slot = self.watchdog.borrow_mut();
        if slot.is_none() {
            let id = self.sandbox_id.simple().to_string();
            let name = format!("luasandbox-timer-{}", &id[..8]);
            *slot = Some(Watchdog::spawn(Arc::clone(&self.shared), name)?);
            debug!(sandbox = %self.sandbox_id, "watchdog thread started");
        }
        Ok(())
    }

    /// Set the CPU limits. `None` or zero disables a limit. The budget restarts
    /// from the current usage.
    pub fn set_cpu_limits(
        &self,
        normal: Option<Duration>,
        emergency: Option<Duration>,
    ) -> Result<(), SandboxError> {
        let normal = normal.filter(|limit| !limit.is_zero());
        let emergency = emergency.filter(|limit| !limit.is_zero());
        if let (Some(normal), Some(emergency)) = (normal, emergency) {
            if emergency < normal {
                return Err(SandboxError::InvalidArgument(format!(
                    "emergency CPU limit ({:?}) is lower than the normal limit ({:?})",
                    emergency, normal
                )));
            }
        }
        if normal.is_some() || emergency.is_some() {
            self.ensure_watchdog()?;
        }

        let now = Instant::now();
        let mut clock = self.clock.borrow_mut();
        clock.normal_limit = normal;
        clock.emergency_limit = emergency;
        clock.limit_base = clock.usage(now);
        let deadlines = clock.deadlines(now);
        drop(clock);

        self.shared.set_deadlines(deadlines);
        debug!(sandbox = %self.sandbox_id, ?normal, ?emergency, "CPU limits set");
        Ok(())
    }

    pub fn cpu_limits(&self) -> (Option<Duration>, Option<Duration>) {
        let clock = self.clock.borrow();
        (clock.normal_limit, clock.emergency_limit)
    }

    /// Accumulated guest CPU time, excluding paused intervals
    pub fn cpu_usage(&self) -> Duration {
        self.clock.borrow().usage(Instant::now())
    }

    /// Enter a guest invocation. The outermost invocation arms the limits;
    /// nested ones join its window and resume a paused clock.
    pub fn begin(&self) -> Result<InvocationGuard<'_>, ErrorRecord> {
        let now = Instant::now();
        let mut clock = self.clock.borrow_mut();

        if clock.depth > 0 {
            drop(clock);
            if let Some(record) = self.breach(Vec::new) {
                return Err(record);
            }
            self.clock.borrow_mut().depth += 1;
            self.unpause();
            return Ok(InvocationGuard { governor: self, active: true });
        }

        if clock.normal_exhausted(now) {
            return Err(interrupt_record(Interrupt::Timeout, Vec::new()));
        }
        clock.depth = 1;
        clock.paused = false;
        clock.running_since = Some(now);
        let deadlines = clock.deadlines(now);
        drop(clock);

        self.shared.take_interrupt();
        self.allocations.take_refusal();
        self.breach.borrow_mut().take();
        self.shared.set_deadlines(deadlines);
        self.shared.set_sampling(true);
        Ok(InvocationGuard { governor: self, active: true })
    }

    fn end(&self) -> Option<ErrorRecord> {
        let mut clock = self.clock.borrow_mut();
        clock.depth = clock.depth.saturating_sub(1);
        let nested = clock.depth > 0;
        drop(clock);

        let breach = self.breach(Vec::new);
        if nested {
            return breach;
        }

        let mut clock = self.clock.borrow_mut();
        clock.stop(Instant::now());
        clock.paused = false;
        drop(clock);

        self.shared.set_deadlines(Deadlines::default());
        self.shared.set_sampling(false);
        let interrupt = self.shared.take_interrupt();
        self.breach.borrow_mut().take();

        let breach = match (breach, interrupt) {
            // The emergency limit outranks whatever the guest was unwinding
            (Some(record), Some(Interrupt::Emergency)) if record.kind != ErrorKind::EmergencyTimeout => {
                Some(interrupt_record(Interrupt::Emergency, record.trace))
            }
            (breach, _) => breach,
        };
        if let Some(record) = &breach {
            debug!(sandbox = %self.sandbox_id, kind = %record.kind, "guest invocation breached its limits");
        }
        breach
    }

    /// The first non-catchable failure of the current window, if any. Picks
    /// up refused allocations and fired CPU limits; `trace` is only called
    /// when one of those is recorded now.
    pub fn breach(&self, trace: impl FnOnce() -> Vec<StackFrame>) -> Option<ErrorRecord> {
        if self.breach.borrow().is_none() {
            if self.allocations.take_refusal() {
                self.note_breach(ErrorRecord::new(ErrorKind::Memory, MEMORY_ERROR_MESSAGE).with_trace(trace()));
            } else if let Some(interrupt) = self.shared.interrupt() {
                self.note_breach(interrupt_record(interrupt, trace()));
            }
        }
        self.breach.borrow().clone()
    }

    /// Keep `record` as the window's breach unless one is already kept.
    /// Errors the guest may catch are ignored.
    pub fn note_breach(&self, record: ErrorRecord) {
        if record.is_catchable() || record.kind == ErrorKind::Syntax {
            return;
        }
        let mut breach = self.breach.borrow_mut();
        if breach.is_none() {
            *breach = Some(record);
        }
    }

    /// Stop charging time to the guest. Only meaningful inside an invocation.
    pub fn pause(&self) -> bool {
        let mut clock = self.clock.borrow_mut();
        if clock.depth == 0 || clock.paused {
            return false;
        }
        clock.stop(Instant::now());
        clock.paused = true;
        drop(clock);

        self.shared.set_deadlines(Deadlines::default());
        self.shared.set_sampling(false);
        true
    }

    /// Resume charging time to the guest
    pub fn unpause(&self) -> bool {
        let now = Instant::now();
        let mut clock = self.clock.borrow_mut();
        if !clock.paused {
            return false;
        }
        clock.paused = false;
        if clock.depth == 0 {
            return true;
        }
        clock.running_since = Some(now);
        let deadlines = clock.deadlines(now);
        drop(clock);

        self.shared.set_deadlines(deadlines);
        self.shared.set_sampling(true);
        true
    }

    pub fn is_paused(&self) -> bool {
        self.clock.borrow().paused
    }

    pub fn phase(&self) -> GovernorPhase {
        if self.clock.borrow().depth == 0 {
            GovernorPhase::Idle
        } else if self.shared.interrupt().is_some() || self.breach.borrow().is_some() {
            GovernorPhase::Interrupted
        } else {
            GovernorPhase::Armed
        }
    }

    /// Start or stop profiler sampling; `None` stops it
    pub fn set_profiler_period(&self, period: Option<Duration>) -> Result<(), SandboxError> {
        if period.is_some() {
            self.ensure_watchdog()?;
        }
        self.shared.set_profiler_period(period);
        if period.is_some() && self.clock.borrow().running_since.is_some() {
            self.shared.set_sampling(true);
        }
        Ok(())
    }

    pub fn take_profiler_ticks(&self) -> u64 {
        self.shared.take_profiler_ticks()
    }

    pub fn set_memory_limit(&self, limit: usize) {
        self.memory_limit.set(limit);
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit.get()
    }

    /// Record an observation of current memory usage
    pub fn note_memory(&self, used: usize) {
        if used > self.peak_memory.get() {
            self.peak_memory.set(used);
        }
    }

    pub fn peak_memory(&self) -> usize {
        self.peak_memory.get()
    }

    pub fn budget(&self, current_memory: usize) -> ResourceBudget {
        self.note_memory(current_memory);
        let (cpu_limit, emergency_cpu_limit) = self.cpu_limits();
        ResourceBudget {
            memory_limit: self.memory_limit(),
            cpu_limit,
            emergency_cpu_limit,
            current_memory,
            peak_memory: self.peak_memory(),
            cpu_used: self.cpu_usage(),
        }
    }
}

/// Error record reported for a limit breach
pub(crate) fn interrupt_record(interrupt: Interrupt, trace: Vec<StackFrame>) -> ErrorRecord {
    let record = match interrupt {
        Interrupt::Timeout => ErrorRecord::new(ErrorKind::Timeout, TIMEOUT_MESSAGE),
        Interrupt::Emergency => ErrorRecord::new(ErrorKind::EmergencyTimeout, EMERGENCY_TIMEOUT_MESSAGE),
    };
    record.with_trace(trace)
}

/// Keeps an invocation window open; closing it disarms the governor when it
/// is the outermost one.
#[must_use]
pub(crate) struct InvocationGuard<'a> {
    governor: &'a Governor,
    active: bool,
}

impl InvocationGuard<'_> {
    /// Close the window, returning its breach
    pub fn finish(mut self) -> Option<ErrorRecord> {
        self.active = false;
        self.governor.end()
    }
}

impl Drop for InvocationGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.governor.end();
        }
    }
}
