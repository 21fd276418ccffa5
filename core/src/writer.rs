//! Foreground side of the pipeline: drains ready slots to a byte sink.

use core::{convert::Infallible, fmt};

use crate::{
    config::{RetryPolicy, SampleWidth},
    fault::FaultSnapshot,
    pool::{Consumer, ReadySlot},
};

/// Encoded bytes handed to the transport per write call.
const SCRATCH_BYTES: usize = 64;

/// An ordered byte sink with backpressure.
pub trait Transport {
    type Error: fmt::Debug;

    /// Write a prefix of `bytes`, returning how many were accepted.
    /// `WouldBlock` (or `Ok(0)`) signals backpressure.
    fn write(&mut self, bytes: &[u8]) -> nb::Result<usize, Self::Error>;

    /// Push everything written so far out of any intermediate buffer.
    fn flush(&mut self) -> nb::Result<(), Self::Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    type Error = T::Error;

    fn write(&mut self, bytes: &[u8]) -> nb::Result<usize, Self::Error> {
        (**self).write(bytes)
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        (**self).flush()
    }
}

#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriterError<E> {
    /// The transport kept failing for a whole block.
    Transport { attempts: u8, error: E },
    /// The transport applied backpressure for longer than allowed.
    Timeout { attempts: u8 },
    /// The fill engine halted after an overrun and every block it published
    /// has been delivered.
    Halted { overruns: u32 },
    /// An earlier transport failure may have left part of a block on the
    /// wire. Nothing more is written.
    Stopped { attempts: u8 },
}

impl<E: fmt::Debug> fmt::Display for WriterError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriterError::Transport { attempts, error } => {
                write!(f, "transport failed after {attempts} attempts: {error:?}")
            }
            WriterError::Timeout { attempts } => {
                write!(f, "transport blocked for {attempts} attempts")
            }
            WriterError::Halted { overruns } => {
                write!(f, "acquisition halted after {overruns} overruns")
            }
            WriterError::Stopped { attempts } => {
                write!(f, "stream stopped after a transport failure ({attempts} attempts)")
            }
        }
    }
}

#[cfg(feature = "std")]
impl<E: fmt::Debug> std::error::Error for WriterError<E> {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WriterStats {
    pub blocks: u64,
    pub bytes: u64,
    /// Failed or timed out transport attempts that were retried.
    pub retries: u64,
    /// Sequence number of the last delivered block.
    pub last_sequence: Option<u32>,
}

/// Result of one pass over both slots.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PollReport {
    pub delivered: u8,
    /// Faults raised since the previous pass.
    pub faults: FaultSnapshot,
}

struct Sink<T> {
    transport: T,
    width: SampleWidth,
    retry: RetryPolicy,
    stats: WriterStats,
}

impl<T: Transport> Sink<T> {
    /// Write one block in full and flush it.
    ///
    /// Retries resume after the last byte the transport accepted, so a block
    /// is never partially repeated.
    fn deliver<const N: usize>(
        &mut self,
        slot: &ReadySlot<'_, N>,
    ) -> Result<(), WriterError<T::Error>> {
        let samples = slot.samples();
        let bps = self.width.bytes_per_sample();
        let total = samples.len() * bps;

        let mut attempts = 0;
        let mut scratch = [0u8; SCRATCH_BYTES];
        let mut written = 0;

        while written < total {
            let first = written / bps;
            let last = (first + SCRATCH_BYTES / bps).min(samples.len());
            let len = self.width.encode(&samples[first..last], &mut scratch);
            let chunk = &scratch[written % bps..len];

            written += self.with_retry(&mut attempts, |transport| {
                match transport.write(chunk) {
                    Ok(0) => Err(nb::Error::WouldBlock),
                    result => result,
                }
            })?;
        }

        self.with_retry(&mut attempts, |transport| transport.flush())?;

        self.stats.blocks = self.stats.blocks.wrapping_add(1);
        self.stats.bytes = self.stats.bytes.wrapping_add(total as u64);
        self.stats.last_sequence = Some(slot.sequence());

        Ok(())
    }

    fn with_retry<R>(
        &mut self,
        attempts: &mut u8,
        mut op: impl FnMut(&mut T) -> nb::Result<R, T::Error>,
    ) -> Result<R, WriterError<T::Error>> {
        let mut spins = 0;

        loop {
            match op(&mut self.transport) {
                Ok(result) => return Ok(result),
                Err(nb::Error::WouldBlock) if spins < self.retry.backpressure_spins => {
                    spins += 1;
                    core::hint::spin_loop();
                }
                Err(nb::Error::WouldBlock) => {
                    spins = 0;
                    *attempts += 1;
                    if *attempts >= self.retry.max_attempts {
                        return Err(WriterError::Timeout {
                            attempts: *attempts,
                        });
                    }
                    self.stats.retries = self.stats.retries.wrapping_add(1);
                    log::warn!("Transport blocked, retrying (attempt {})", *attempts);
                }
                Err(nb::Error::Other(error)) => {
                    *attempts += 1;
                    if *attempts >= self.retry.max_attempts {
                        return Err(WriterError::Transport {
                            attempts: *attempts,
                            error,
                        });
                    }
                    self.stats.retries = self.stats.retries.wrapping_add(1);
                    log::warn!(
                        "Transport write failed: {:?}, retrying (attempt {})",
                        error,
                        *attempts
                    );
                }
            }
        }
    }
}

/// Drains completed slots to a [`Transport`], oldest first.
///
/// Runs outside interrupt context. A slot's ready flag is only cleared once
/// its block has been written and flushed; when the transport gives up the
/// slot keeps its flag and the error is returned. Transport errors are fatal
/// to the stream: the receiver may have seen part of the block, so every
/// later call returns [`WriterError::Stopped`] without writing.
pub struct StreamWriter<'a, T, const N: usize> {
    consumer: Consumer<'a, N>,
    sink: Sink<T>,
    reported: FaultSnapshot,
    /// Attempts spent on the block that failed.
    stopped: Option<u8>,
}

impl<'a, T: Transport, const N: usize> StreamWriter<'a, T, N> {
    pub fn new(
        consumer: Consumer<'a, N>,
        transport: T,
        width: SampleWidth,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            consumer,
            sink: Sink {
                transport,
                width,
                retry,
                stats: WriterStats::default(),
            },
            reported: FaultSnapshot::default(),
            stopped: None,
        }
    }

    /// Check both slots once and deliver whatever is ready.
    pub fn poll(&mut self) -> Result<PollReport, WriterError<T::Error>> {
        if let Some(attempts) = self.stopped {
            return Err(WriterError::Stopped { attempts });
        }

        let mut report = PollReport::default();

        for _ in 0..2 {
            let Some(slot) = self.consumer.claim_oldest() else {
                break;
            };

            if let Err(error) = self.sink.deliver(&slot) {
                if let WriterError::Transport { attempts, .. } | WriterError::Timeout { attempts } =
                    error
                {
                    self.stopped = Some(attempts);
                }
                return Err(error);
            }
            log::trace!("Delivered block {}", slot.sequence());
            slot.release();
            report.delivered += 1;
        }

        let faults = self.consumer.faults().snapshot();
        report.faults = faults.since(&self.reported);
        self.reported = faults;
        self.log_faults(&report.faults, &faults);

        if faults.halted && !self.consumer.any_ready() {
            return Err(WriterError::Halted {
                overruns: faults.overruns,
            });
        }

        Ok(report)
    }

    /// Busy-poll forever, calling `idle` whenever there was nothing to do.
    pub fn run(&mut self, mut idle: impl FnMut()) -> Result<Infallible, WriterError<T::Error>> {
        loop {
            if self.poll()?.delivered == 0 {
                idle();
            }
        }
    }

    /// Like [`run`](Self::run), but sleeps on the pool's ready signal.
    pub async fn run_async(&mut self) -> Result<Infallible, WriterError<T::Error>> {
        loop {
            if self.poll()?.delivered == 0 {
                self.consumer.wait_ready().await;
            }
        }
    }

    pub fn stats(&self) -> &WriterStats {
        &self.sink.stats
    }

    pub fn transport(&self) -> &T {
        &self.sink.transport
    }

    pub fn into_transport(self) -> T {
        self.sink.transport
    }

    fn log_faults(&self, new: &FaultSnapshot, total: &FaultSnapshot) {
        if new.overruns > 0 {
            log::warn!(
                "Buffer overrun: {} new, {} total, {} samples dropped so far",
                new.overruns,
                total.overruns,
                total.dropped_samples
            );
        }
        if new.conversion_errors > 0 {
            log::warn!(
                "Conversion errors: {} new, {} total",
                new.conversion_errors,
                total.conversion_errors
            );
        }
        if new.halted {
            log::error!("Acquisition halted after {} overruns", total.overruns);
        }
    }
}
