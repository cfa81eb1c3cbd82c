//! Global monotonic counter coordinating staged, asynchronous driver init.
//!
//! A driver with an async bring-up sequence calls [`init_busy_up`] before it
//! starts and [`init_busy_down`] once it finishes (successfully or not, as
//! long as it intends to let the boot sequence proceed). The boot loop polls
//! [`init_busy`] and only considers startup complete once it reaches zero.
//! A driver that detects a fatal condition during bring-up (e.g. a flash ID
//! mismatch) simply never calls `init_busy_down`, which stalls the counter
//! and makes the hardware fault visible to the boot sequence without
//! crashing anything else.

use core::sync::atomic::{AtomicU32, Ordering};

static INIT_BUSY_COUNT: AtomicU32 = AtomicU32::new(0);

/// Increases the init-busy count. Call before starting an async bring-up.
pub fn init_busy_up() {
    INIT_BUSY_COUNT.fetch_add(1, Ordering::AcqRel);
}

/// Decreases the init-busy count. Call once bring-up has finished.
pub fn init_busy_down() {
    INIT_BUSY_COUNT.fetch_sub(1, Ordering::AcqRel);
}

/// The current init-busy count. Boot is complete once this reaches zero.
pub fn init_busy() -> u32 {
    INIT_BUSY_COUNT.load(Ordering::Acquire)
}
