//! Interrupt-driven double buffering of analog conversions.
//!
//! A [`FillEngine`] running in interrupt context fills one slot of a
//! [`BufferPool`] while a [`StreamWriter`] in the foreground drains the other
//! one to a [`Transport`]. Ownership of each slot is handed back and forth
//! through an atomic state per slot, so no lock is shared between the two
//! contexts.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod config;
pub mod fault;
pub mod fill;
pub mod pool;
pub mod sequencer;
pub mod source;
pub mod writer;

#[cfg(test)]
mod scenarios;

pub use config::{ConfigError, OverrunPolicy, PipelineConfig, RetryPolicy, SampleWidth};
pub use fault::{FaultSnapshot, Faults};
pub use fill::{FillEngine, FillError, FillOutcome};
pub use pool::{BufferPool, Consumer, Producer, ReadySlot, SlotId, SlotState};
pub use sequencer::ChannelSequencer;
pub use source::{AcquireError, ConversionSource, PolledAcquisition};
pub use writer::{PollReport, StreamWriter, Transport, WriterError, WriterStats};

/// A single conversion result, right aligned in a 16-bit cell.
pub type Sample = u16;

/// Position of a sample in the acquisition stream, counted from the first
/// conversion after arming.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SampleIndex(pub u64);
