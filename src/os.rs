//! Single-threaded cooperative task runtime.
//!
//! Every driver in this crate is a small state machine advanced by repeated
//! calls to its `poll`/`step` method from [`run_until_idle`]. Interrupts are
//! only allowed to flip atomic words and call [`request_poll`]; all parsing
//! and protocol logic happens in this cooperative context.
//!
//! Processes never block and the scheduler never preempts one mid-step:
//! `run_until_idle` invokes each active process's entry function once per
//! pass and relies on the process itself to return [`Status::Again`] at an
//! await point rather than spinning.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use critical_section::Mutex;
use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::error::{Error, PbResult};

/// Maximum number of processes the scheduler can hold at once.
///
/// Sized for this crate's three top-level processes (block device bring-up,
/// charger supervisor, USB device) with headroom; raising it costs four
/// bytes of static storage per slot.
pub const MAX_PROCESSES: usize = 8;

/// Outcome of one poll of a process or an awaitable sub-operation.
///
/// `T` is `()` for top-level processes, which run forever and only ever
/// resolve to signal a fatal setup failure, and the operation's return type
/// for leaf awaitables such as [`crate::spi::SpiSequencer::run_command`].
#[derive(Debug)]
pub enum Status<T = ()> {
    /// Not finished; call again after the next [`request_poll`].
    Again,
    /// Finished, with the given result.
    Done(PbResult<T>),
}

impl<T> Status<T> {
    /// True if this poll produced a final result.
    pub fn is_done(&self) -> bool {
        matches!(self, Status::Done(_))
    }
}

/// A request made to a running process from outside its own poll function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Request {
    /// No pending request.
    None = 0,
    /// Ask the process to unwind and stop at its next yield point.
    Cancel = 1,
}

impl Request {
    fn from_u8(v: u8) -> Request {
        match v {
            1 => Request::Cancel,
            _ => Request::None,
        }
    }
}

/// A statically allocated, schedulable unit of work.
///
/// A `Process` is registered once (typically at boot) via [`start_process`]
/// and is polled by [`run_until_idle`] until its entry function returns
/// anything other than [`Status::Again`].
pub struct Process {
    entry: fn() -> Status,
    request: AtomicU8,
    active: AtomicBool,
}

impl Process {
    /// Creates a process wrapping the given entry function.
    ///
    /// The entry function is expected to close over its own task-private
    /// state via a module-level static; there is no separate `context`
    /// pointer because Rust statics already give each driver exclusive,
    /// named storage for its locals.
    pub const fn new(entry: fn() -> Status) -> Self {
        Self {
            entry,
            request: AtomicU8::new(Request::None as u8),
            active: AtomicBool::new(false),
        }
    }

    /// The cancellation request this process should observe at its next
    /// yield point, if any.
    pub fn request(&self) -> Request {
        Request::from_u8(self.request.load(Ordering::Acquire))
    }

    /// Clears any pending request. Drivers call this once they have acted on
    /// [`Process::request`] so a stale `Cancel` doesn't linger after restart.
    pub fn clear_request(&self) {
        self.request.store(Request::None as u8, Ordering::Release);
    }
}

static POLL_REQUESTED: AtomicBool = AtomicBool::new(false);
static REGISTRY: Mutex<core::cell::RefCell<Vec<&'static Process, MAX_PROCESSES>>> =
    Mutex::new(core::cell::RefCell::new(Vec::new()));

/// Interrupt-safe, idempotent signal that at least one runnable step exists.
///
/// ISRs call this after flipping whatever atomic word they own; it never
/// blocks and never touches anything other than the global poll flag.
pub fn request_poll() {
    POLL_REQUESTED.store(true, Ordering::Release);
}

/// Registers `process` with the scheduler and requests an initial poll.
///
/// Starting the same process twice is a no-op beyond the extra poll request.
pub fn start_process(process: &'static Process) {
    critical_section::with(|cs| {
        let mut reg = REGISTRY.borrow(cs).borrow_mut();
        if !reg.iter().any(|p| core::ptr::eq(*p, process)) {
            // Deliberately ignored: MAX_PROCESSES is sized with headroom for
            // this crate's fixed process set; a full registry here is a
            // build-time sizing bug, not a runtime condition to recover from.
            let _ = reg.push(process);
        }
    });
    process.active.store(true, Ordering::Release);
    request_poll();
}

/// Sets `request` on `process`. The process observes it only at its next
/// yield point; there is no forced unwinding.
pub fn make_request(process: &'static Process, request: Request) {
    process.request.store(request as u8, Ordering::Release);
    request_poll();
}

/// Drains the poll flag, invoking every active process's entry function once
/// per pass, in registration order, until no process requested another pass.
///
/// A process returning [`Status::Again`] stays on the run list; any other
/// return value deactivates it (it is not removed from the registry, just
/// skipped, so restarting it later needs no re-registration).
pub fn run_until_idle() {
    while POLL_REQUESTED.swap(false, Ordering::Acquire) {
        let count = critical_section::with(|cs| REGISTRY.borrow(cs).borrow().len());
        for i in 0..count {
            let process = critical_section::with(|cs| REGISTRY.borrow(cs).borrow()[i]);
            if !process.active.load(Ordering::Acquire) {
                continue;
            }
            if let Status::Done(result) = (process.entry)() {
                process.active.store(false, Ordering::Release);
                if let Err(err) = result {
                    defmt::warn!("process terminated: {}", err);
                }
            }
        }
    }
}

/// An opaque resume point inside a coroutine, plus helpers for the await
/// primitives built around it.
///
/// Concrete drivers in this crate express their coroutines as explicit
/// state-enum structs with a `step` method rather than raw `TaskState`
/// checkpoints (see `SPEC_FULL.md` Design Notes); this type exists so
/// generic scheduler-level code and tests have a minimal, literal
/// realization of the checkpoint contract to exercise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskState(u32);

impl TaskState {
    /// A fresh task state, resuming from the beginning.
    pub const fn new() -> Self {
        Self(0)
    }

    /// The current checkpoint.
    pub fn checkpoint(&self) -> u32 {
        self.0
    }

    /// Records `checkpoint` as the point to resume from next time.
    pub fn set_checkpoint(&mut self, checkpoint: u32) {
        self.0 = checkpoint;
    }

    /// Resets to the initial checkpoint, as if the coroutine had never run.
    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

/// A polled countdown. Timers do not fire callbacks; they are checked from
/// inside a task's own `step`/poll call.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// A timer with no deadline set; [`Timer::is_expired`] is true until
    /// [`Timer::set_ms`] is called.
    pub const fn new() -> Self {
        Self { deadline: None }
    }

    /// Arms the timer for `duration_ms` starting at `now`.
    pub fn set_ms(&mut self, now: Instant, duration_ms: u64) {
        self.deadline = Some(now + Duration::from_millis(duration_ms));
    }

    /// Whether the timer has fired as of `now`. An unset timer reads as
    /// expired, matching the "await ms" contract collapsing to a no-op wait
    /// when a timer was never armed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|deadline| now >= deadline)
    }
}
