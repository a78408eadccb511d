//! Acquisition context for ADC drivers.
//!
//! [`AcquisitionContext`] serializes reads from different callers, sequences
//! single-shot and interval-triggered sampling rounds, and reports exactly
//! one result per read. The hardware side is supplied by a [`SamplingDriver`]
//! implementation.

pub use {context::*, sequence::*, timer::*};

mod context;
mod sequence;
mod timer;


/// Error type returned by the acquisition context and its drivers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("sampling requested faster than it could be performed")]
    Overrun,
    #[error("invalid sampling sequence")]
    InvalidSequence,
    #[error("sample buffer too small")]
    BufferTooSmall,
    #[error("failed to start sampling timer")]
    Timer,
    #[error("hardware error {0}")]
    Hardware(i32),
}

/// Common acquisition result type.
pub type Result<T> = std::result::Result<T, Error>;
