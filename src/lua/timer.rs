//! Watchdog thread for CPU limits and profiler sampling
//!
//! The watchdog never touches the interpreter. It only raises flags that the
//! interpreter polls at safe points: an interrupt level for limit breaches and
//! a counter of elapsed profiler periods.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::trace;

const NO_INTERRUPT: u8 = 0;
const TIMEOUT_INTERRUPT: u8 = 1;
const EMERGENCY_INTERRUPT: u8 = 2;

/// Limit breach observed by the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Interrupt {
    /// Normal limit passed
    Timeout,

    /// Emergency limit passed
    Emergency,
}

/// Longer sampling periods are clamped so that tick times stay representable
const MAX_PROFILER_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Deadlines for the current armed window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Deadlines {
    pub normal: Option<Instant>,
    pub emergency: Option<Instant>,
}

#[derive(Debug, Default)]
struct Schedule {
    deadlines: Deadlines,
    /// Sample period and the next sample time
    profiler: Option<(Duration, Instant)>,
    /// Samples are only counted while guest code is running
    sampling: bool,
    shutdown: bool,
}

/// State shared between a sandbox and its watchdog thread
#[derive(Debug, Default)]
pub(crate) struct TimerShared {
    interrupt: AtomicU8,
    profiler_ticks: AtomicU64,
    schedule: Mutex<Schedule>,
    wakeup: Condvar,
}

impl TimerShared {
    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn interrupt(&self) -> Option<Interrupt> {
        match self.interrupt.load(Ordering::Acquire) {
            TIMEOUT_INTERRUPT => Some(Interrupt::Timeout),
            EMERGENCY_INTERRUPT => Some(Interrupt::Emergency),
            _ => None,
        }
    }

    /// Clear the interrupt flag, returning what was set
    pub fn take_interrupt(&self) -> Option<Interrupt> {
        match self.interrupt.swap(NO_INTERRUPT, Ordering::AcqRel) {
            TIMEOUT_INTERRUPT => Some(Interrupt::Timeout),
            EMERGENCY_INTERRUPT => Some(Interrupt::Emergency),
            _ => None,
        }
    }

    pub fn raise(&self, interrupt: Interrupt) {
        let level = match interrupt {
            Interrupt::Timeout => TIMEOUT_INTERRUPT,
            Interrupt::Emergency => EMERGENCY_INTERRUPT,
        };
        self.interrupt.fetch_max(level, Ordering::AcqRel);
    }

    pub fn take_profiler_ticks(&self) -> u64 {
        self.profiler_ticks.swap(0, Ordering::AcqRel)
    }

    pub fn set_deadlines(&self, deadlines: Deadlines) {
        self.schedule().deadlines = deadlines;
        self.wakeup.notify_all();
    }

    pub fn set_sampling(&self, sampling: bool) {
        let mut schedule = self.schedule();
        schedule.sampling = sampling;
        if let Some((period, next)) = schedule.profiler.as_mut() {
            *next = Instant::now() + *period;
        }
        drop(schedule);
        self.wakeup.notify_all();
    }

    pub fn set_profiler_period(&self, period: Option<Duration>) {
        let period = period.map(|p| p.min(MAX_PROFILER_PERIOD));
        self.schedule().profiler = period.map(|p| (p, Instant::now() + p));
        self.profiler_ticks.store(0, Ordering::Release);
        self.wakeup.notify_all();
    }

    fn shutdown(&self) {
        self.schedule().shutdown = true;
        self.wakeup.notify_all();
    }
}

/// Owner of the watchdog thread; stops and joins it on drop
#[derive(Debug)]
pub(crate) struct Watchdog {
    shared: Arc<TimerShared>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(shared: Arc<TimerShared>, name: String) -> std::io::Result<Self> {
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(&thread_shared))?;
        Ok(Watchdog {
            shared,
            handle: Some(handle),
        })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shared.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn earliest(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

fn run(shared: &TimerShared) {
    trace!("watchdog started");
    let mut schedule = shared.schedule();
    loop {
        if schedule.shutdown {
            break;
        }
        let now = Instant::now();
        let mut wake_at = None;

        if let Some(at) = schedule.deadlines.emergency {
            if now >= at {
                shared.raise(Interrupt::Emergency);
                schedule.deadlines = Deadlines::default();
            } else {
                wake_at = earliest(wake_at, at);
            }
        }
        if let Some(at) = schedule.deadlines.normal {
            if now >= at {
                shared.raise(Interrupt::Timeout);
                schedule.deadlines.normal = None;
            } else {
                wake_at = earliest(wake_at, at);
            }
        }

        let sampling = schedule.sampling;
        if let Some((period, next)) = schedule.profiler.as_mut() {
            if sampling {
                if now >= *next {
                    let missed = now.duration_since(*next).as_nanos() / period.as_nanos().max(1);
                    let ticks = u64::try_from(missed).unwrap_or(u64::MAX).saturating_add(1);
                    shared.profiler_ticks.fetch_add(ticks, Ordering::AcqRel);
                    *next = now + *period;
                }
                wake_at = earliest(wake_at, *next);
            }
        }

        schedule = match wake_at {
            Some(at) => {
                let timeout = at.saturating_duration_since(Instant::now());
                shared
                    .wakeup
                    .wait_timeout(schedule, timeout)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => shared.wakeup.wait(schedule).unwrap_or_else(PoisonError::into_inner),
        };
    }
    trace!("watchdog stopped");
}
