//! Shared error taxonomy used by every driver in this crate.

/// Outcome of a fallible driver operation.
///
/// `Again` is not a failure: it signals a cooperative yield returned by a
/// non-awaitable call (e.g. [`crate::usb::stdout_tx`] when the stdout buffer
/// is still occupied). Awaitable operations instead yield by returning
/// [`crate::os::Status::Again`] and are not expected to ever resolve to
/// `Err(Error::Again)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum Error {
    /// Not a failure; a cooperative yield from a non-awaitable call.
    Again,
    /// Caller-supplied argument out of range.
    InvalidArg,
    /// Operation not valid in the current state.
    InvalidOp,
    /// Resource already in use by a concurrent operation.
    Busy,
    /// Hardware returned an error status.
    Io,
    /// Operation did not complete before its timer expired.
    TimedOut,
    /// Addressed device does not exist.
    NoDev,
    /// Unspecified failure.
    Failed,
    /// Build-time disabled feature.
    NotImplemented,
}

/// Result alias used throughout the driver stack.
pub type PbResult<T = ()> = Result<T, Error>;
