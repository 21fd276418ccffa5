use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Fault indicators shared between interrupt and foreground context.
///
/// Interrupt handlers only ever bump counters or raise the halt flag. All
/// reporting happens in the foreground by comparing [`FaultSnapshot`]s.
pub struct Faults {
    overruns: AtomicU32,
    dropped_blocks: AtomicU32,
    dropped_samples: AtomicU32,
    conversion_errors: AtomicU32,
    halted: AtomicBool,
}

impl Faults {
    pub const fn new() -> Self {
        Self {
            overruns: AtomicU32::new(0),
            dropped_blocks: AtomicU32::new(0),
            dropped_samples: AtomicU32::new(0),
            conversion_errors: AtomicU32::new(0),
            halted: AtomicBool::new(false),
        }
    }

    /// Returns the total number of overruns including this one.
    pub(crate) fn record_overrun(&self) -> u32 {
        self.overruns.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub(crate) fn record_dropped_block(&self, samples: usize) {
        self.dropped_blocks.fetch_add(1, Ordering::Relaxed);
        self.dropped_samples
            .fetch_add(samples as u32, Ordering::Relaxed);
    }

    pub(crate) fn record_conversion_error(&self) {
        self.conversion_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn overruns(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> FaultSnapshot {
        FaultSnapshot {
            overruns: self.overruns.load(Ordering::Relaxed),
            dropped_blocks: self.dropped_blocks.load(Ordering::Relaxed),
            dropped_samples: self.dropped_samples.load(Ordering::Relaxed),
            conversion_errors: self.conversion_errors.load(Ordering::Relaxed),
            halted: self.is_halted(),
        }
    }
}

impl Default for Faults {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FaultSnapshot {
    pub overruns: u32,
    pub dropped_blocks: u32,
    pub dropped_samples: u32,
    pub conversion_errors: u32,
    pub halted: bool,
}

impl FaultSnapshot {
    /// What happened between `earlier` and `self`.
    pub fn since(&self, earlier: &FaultSnapshot) -> FaultSnapshot {
        FaultSnapshot {
            overruns: self.overruns.wrapping_sub(earlier.overruns),
            dropped_blocks: self.dropped_blocks.wrapping_sub(earlier.dropped_blocks),
            dropped_samples: self.dropped_samples.wrapping_sub(earlier.dropped_samples),
            conversion_errors: self
                .conversion_errors
                .wrapping_sub(earlier.conversion_errors),
            halted: self.halted && !earlier.halted,
        }
    }

    pub fn is_clean(&self) -> bool {
        *self == FaultSnapshot::default()
    }
}
