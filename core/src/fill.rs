use core::fmt;

use crate::{
    config::OverrunPolicy,
    fault::Faults,
    pool::{Producer, SlotId},
    Sample,
};

/// What a completed fill cycle did with the slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FillOutcome {
    /// `ready` went to the writer, filling continues in `next`.
    Switched { ready: SlotId, next: SlotId },
    /// The writer fell behind and one block was discarded. `ready` is the
    /// slot that went to the writer, if the discarded block was not the one
    /// just filled.
    Overrun {
        ready: Option<SlotId>,
        next: SlotId,
        overruns: u32,
    },
    /// The writer fell behind and acquisition stopped after publishing
    /// `ready`.
    Halted { ready: SlotId, overruns: u32 },
    /// Completion while no slot was being filled.
    Spurious,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FillError {
    AlreadyStarted,
    Halted,
    SlotBusy,
}

impl fmt::Display for FillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillError::AlreadyStarted => write!(f, "fill engine already started"),
            FillError::Halted => write!(f, "fill engine halted after an overrun"),
            FillError::SlotBusy => write!(f, "first slot is still owned by the writer"),
        }
    }
}

/// Fills the active slot and hands it to the writer when full.
///
/// Runs in interrupt context. Samples either arrive one by one through
/// [`push`](Self::push), or a transfer engine writes them to
/// [`dma_target`](Self::dma_target) and reports with
/// [`on_transfer_complete`](Self::on_transfer_complete). The caller must make
/// sure neither is re-entered, e.g. by running them from a single interrupt
/// source.
pub struct FillEngine<'a, const N: usize> {
    producer: Producer<'a, N>,
    policy: OverrunPolicy,
    active: Option<SlotId>,
    count: usize,
    sequence: u32,
}

impl<'a, const N: usize> FillEngine<'a, N> {
    pub fn new(producer: Producer<'a, N>, policy: OverrunPolicy) -> Self {
        Self {
            producer,
            policy,
            active: None,
            count: 0,
            sequence: 0,
        }
    }

    /// Arm the engine on the first slot.
    pub fn start(&mut self) -> Result<SlotId, FillError> {
        if self.active.is_some() {
            return Err(FillError::AlreadyStarted);
        }
        if self.producer.faults().is_halted() {
            return Err(FillError::Halted);
        }
        if !self.producer.acquire(SlotId::A) {
            return Err(FillError::SlotBusy);
        }

        self.switch_to(SlotId::A);
        Ok(SlotId::A)
    }

    pub fn active(&self) -> Option<SlotId> {
        self.active
    }

    /// Samples written into the active slot during the current fill cycle.
    pub fn sample_count(&self) -> usize {
        self.count
    }

    /// Number the next published block will carry.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn is_halted(&self) -> bool {
        self.producer.faults().is_halted()
    }

    pub fn faults(&self) -> &'a Faults {
        self.producer.faults()
    }

    /// Store one conversion. Returns the outcome when it completed the slot.
    ///
    /// Samples are discarded while the engine is not armed.
    #[inline]
    pub fn push(&mut self, sample: Sample) -> Option<FillOutcome> {
        let active = self.active?;

        // SAFETY: `active` is in `Filling` and only this engine writes to it.
        // `count` is reset on every switch and never reaches `N` here.
        unsafe { self.producer.write(active, self.count, sample) };
        self.count += 1;

        if self.count == N {
            Some(self.complete())
        } else {
            None
        }
    }

    /// Destination for a transfer engine filling the active slot.
    pub fn dma_target(&self) -> Option<*mut Sample> {
        self.active.map(|id| self.slot_ptr(id))
    }

    fn slot_ptr(&self, id: SlotId) -> *mut Sample {
        self.producer.slot_ptr(id)
    }

    /// The transfer engine filled the active slot.
    ///
    /// Publishes it, switches to the other slot and resets the sample count.
    /// The caller reprograms the transfer engine to
    /// [`dma_target`](Self::dma_target), or stops it when there is none.
    pub fn on_transfer_complete(&mut self) -> FillOutcome {
        self.complete()
    }

    /// Count a conversion that could not be stored, e.g. a converter data
    /// overrun.
    pub fn record_conversion_error(&self) {
        self.producer.faults().record_conversion_error();
    }

    fn complete(&mut self) -> FillOutcome {
        let Some(filled) = self.active else {
            return FillOutcome::Spurious;
        };
        let next = filled.other();

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.producer.publish(filled, sequence);

        if self.producer.acquire(next) {
            self.switch_to(next);
            return FillOutcome::Switched {
                ready: filled,
                next,
            };
        }

        // `next` still carries its ready flag
        let faults = self.producer.faults();

        let policy = self.policy;
        match policy {
            OverrunPolicy::DropOldest if self.producer.reclaim(next) => {
                let overruns = faults.record_overrun();
                faults.record_dropped_block(N);
                self.switch_to(next);
                FillOutcome::Overrun {
                    ready: Some(filled),
                    next,
                    overruns,
                }
            }
            // The writer is busy sending `next`, so give up the block that
            // was just filled instead
            OverrunPolicy::DropOldest if self.producer.reclaim(filled) => {
                let overruns = faults.record_overrun();
                faults.record_dropped_block(N);
                self.switch_to(filled);
                FillOutcome::Overrun {
                    ready: None,
                    next: filled,
                    overruns,
                }
            }
            // The writer released `next` and claimed `filled` in between
            OverrunPolicy::DropOldest if self.producer.acquire(next) => {
                self.switch_to(next);
                FillOutcome::Switched {
                    ready: filled,
                    next,
                }
            }
            OverrunPolicy::DropOldest | OverrunPolicy::Halt => {
                let overruns = faults.record_overrun();
                self.active = None;
                self.count = 0;
                faults.halt();
                self.producer.wake();
                FillOutcome::Halted {
                    ready: filled,
                    overruns,
                }
            }
        }
    }

    fn switch_to(&mut self, id: SlotId) {
        self.active = Some(id);
        self.count = 0;
    }
}
