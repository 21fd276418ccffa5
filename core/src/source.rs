use core::fmt;

use crate::{
    fill::{FillEngine, FillError, FillOutcome},
    sequencer::ChannelSequencer,
    Sample,
};

/// A converter that produces one fixed-width sample per request.
///
/// Implemented both by on-chip converters feeding a transfer engine and by
/// external converters polled over handshake lines.
pub trait ConversionSource {
    type Error: fmt::Debug;

    /// Route logical channel `index` to the converter for the next
    /// conversion.
    fn select_channel(&mut self, index: u8);

    fn start_conversion(&mut self);

    /// Result of the last started conversion, `WouldBlock` while it is still
    /// running.
    fn read(&mut self) -> nb::Result<Sample, Self::Error>;

    /// Let the converter start conversions on its own.
    fn set_free_running(&mut self, _enabled: bool) {}
}

impl<S: ConversionSource + ?Sized> ConversionSource for &mut S {
    type Error = S::Error;

    fn select_channel(&mut self, index: u8) {
        (**self).select_channel(index)
    }

    fn start_conversion(&mut self) {
        (**self).start_conversion()
    }

    fn read(&mut self) -> nb::Result<Sample, Self::Error> {
        (**self).read()
    }

    fn set_free_running(&mut self, enabled: bool) {
        (**self).set_free_running(enabled)
    }
}

#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AcquireError<E> {
    /// The fill engine is not armed, either never started or halted.
    Stopped,
    /// The converter did not finish within the handshake budget.
    HandshakeTimeout,
    Source(E),
    Fill(FillError),
}

impl<E> From<FillError> for AcquireError<E> {
    fn from(value: FillError) -> Self {
        Self::Fill(value)
    }
}

impl<E: fmt::Debug> fmt::Display for AcquireError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::Stopped => write!(f, "acquisition stopped"),
            AcquireError::HandshakeTimeout => write!(f, "converter handshake timed out"),
            AcquireError::Source(e) => write!(f, "converter error: {e:?}"),
            AcquireError::Fill(e) => write!(f, "{e}"),
        }
    }
}

/// Drives a converter by explicit request and handshake, one sample at a
/// time, feeding the fill engine and advancing the sequencer after every
/// conversion.
///
/// This is the software counterpart of a transfer engine: whoever calls
/// [`acquire_one`](Self::acquire_one) (a timer interrupt, or a foreground
/// loop) decides the sampling instants.
pub struct PolledAcquisition<'a, S, const N: usize> {
    source: S,
    sequencer: ChannelSequencer,
    fill: FillEngine<'a, N>,
    handshake_spins: u32,
}

impl<'a, S: ConversionSource, const N: usize> PolledAcquisition<'a, S, N> {
    pub const DEFAULT_HANDSHAKE_SPINS: u32 = 10_000;

    pub fn new(source: S, fill: FillEngine<'a, N>, num_channels: u8) -> Self {
        Self {
            source,
            sequencer: ChannelSequencer::new(num_channels),
            fill,
            handshake_spins: Self::DEFAULT_HANDSHAKE_SPINS,
        }
    }

    pub fn with_handshake_spins(mut self, spins: u32) -> Self {
        self.handshake_spins = spins;
        self
    }

    /// Select the first channel and arm the fill engine.
    pub fn start(&mut self) -> Result<(), AcquireError<S::Error>> {
        self.sequencer.arm(&mut self.source);
        self.fill.start()?;
        Ok(())
    }

    /// Convert one sample on the current channel.
    ///
    /// A failed conversion is counted as a fault and the channel is not
    /// advanced, so the next call converts the same channel again and the
    /// channel order of stored samples stays intact.
    pub fn acquire_one(&mut self) -> Result<Option<FillOutcome>, AcquireError<S::Error>> {
        if self.fill.active().is_none() {
            return Err(AcquireError::Stopped);
        }

        self.source.start_conversion();

        let mut spins = 0;
        let sample = loop {
            match self.source.read() {
                Ok(sample) => break sample,
                Err(nb::Error::WouldBlock) if spins < self.handshake_spins => {
                    spins += 1;
                    core::hint::spin_loop();
                }
                Err(nb::Error::WouldBlock) => {
                    self.fill.record_conversion_error();
                    return Err(AcquireError::HandshakeTimeout);
                }
                Err(nb::Error::Other(e)) => {
                    self.fill.record_conversion_error();
                    return Err(AcquireError::Source(e));
                }
            }
        };

        let outcome = self.fill.push(sample);
        self.sequencer.tick(&mut self.source);
        Ok(outcome)
    }

    /// Convert until the active slot is complete.
    pub fn acquire_block(&mut self) -> Result<FillOutcome, AcquireError<S::Error>> {
        loop {
            if let Some(outcome) = self.acquire_one()? {
                return Ok(outcome);
            }
        }
    }

    pub fn fill(&self) -> &FillEngine<'a, N> {
        &self.fill
    }

    pub fn sequencer(&self) -> &ChannelSequencer {
        &self.sequencer
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}
