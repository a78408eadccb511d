use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{Error, Result};

/// Sample buffer shared between the caller and the driver.
pub type Buffer = Arc<Mutex<Vec<i32>>>;

/// Per-round callback. Receives the index of the completed round and
/// decides what happens next.
pub type RoundCallback = Box<dyn FnMut(usize) -> Action + Send>;

/// Action requested by a [`RoundCallback`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Action {
    /// Advance to the next round, or finish after the last one.
    #[default]
    Continue,
    /// Repeat the round into the same buffer position.
    Repeat,
    /// Finish the sequence.
    Finish,
}

/// Options for repeated sampling.
#[derive(Default)]
pub struct Options {
    /// Interval between the starts of consecutive rounds. Zero starts each
    /// round as soon as the previous one is done.
    pub interval: Duration,
    /// Number of rounds after the first one.
    pub extra_samplings: usize,
    /// Optional per-round callback.
    pub callback: Option<RoundCallback>,
}

impl Debug for Options {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("interval", &self.interval)
            .field("extra_samplings", &self.extra_samplings)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Sampling request.
#[derive(Debug, Default)]
pub struct Sequence {
    /// Bitmask of channels to sample in each round.
    pub channels: u32,
    /// Sample resolution in bits.
    pub resolution: u8,
    /// Oversampling as a power of two.
    pub oversampling: u8,
    /// Whether to calibrate before the first round.
    pub calibrate: bool,
    /// Destination of the samples, one per channel per round.
    pub buffer: Buffer,
    pub options: Option<Options>,
}

impl Sequence {
    /// Returns the number of samples that the buffer must be able to hold.
    #[must_use]
    pub fn required_len(&self) -> usize {
        let rounds = 1 + self.options.as_ref().map_or(0, |o| o.extra_samplings);
        self.channels.count_ones() as usize * rounds
    }

    /// Verifies that the sequence selects at least one channel and that its
    /// buffer is large enough.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(Error::InvalidSequence);
        }
        if self.buffer.lock().len() < self.required_len() {
            return Err(Error::BufferTooSmall);
        }
        Ok(())
    }

    /// Returns the sampling interval if the sequence is timer-driven.
    #[inline]
    pub(crate) fn interval(&self) -> Option<Duration> {
        (self.options.as_ref())
            .map(|o| o.interval)
            .filter(|d| !d.is_zero())
    }
}

/// Parameters of one sampling round passed to the driver.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Round {
    pub channels: u32,
    pub resolution: u8,
    pub oversampling: u8,
    pub calibrate: bool,
    pub buffer: Buffer,
    /// Number of extra rounds completed before this one.
    pub index: usize,
}

impl Round {
    #[inline]
    pub(crate) fn new(seq: &Sequence, index: usize) -> Self {
        Self {
            channels: seq.channels,
            resolution: seq.resolution,
            oversampling: seq.oversampling,
            calibrate: seq.calibrate,
            buffer: Arc::clone(&seq.buffer),
            index,
        }
    }
}
