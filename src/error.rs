//! Crate-wide error type.
//!
//! Mirrors the categories called out in the source design: allocation
//! failure, a non-numeric value under `incr_by`, an NX/XX precondition
//! miss, and a condvar timeout. `InvariantViolation` and
//! `IteratorFingerprintMismatch` are not part of this enum — they stay as
//! `debug_assert!`/`assert!` since they are only reachable by bugs, not
//! expected failure paths.

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("allocation failed while growing {0}")]
    Alloc(&'static str),

    #[error("value is not numeric")]
    NonNumeric,

    #[error("NX/XX precondition failed")]
    Precondition,

    #[error("operation timed out")]
    TimedOut,

    #[error("OS primitive error: {0}")]
    Os(#[from] std::io::Error),
}
