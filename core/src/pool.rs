//! Two statically allocated slots and the protocol that moves them between
//! the fill engine and the stream writer.
//!
//! Every slot carries one [`SlotState`]. The producer moves a slot
//! `Idle -> Filling -> Ready`, the consumer moves it `Ready -> Draining ->
//! Idle`. A slot's ready flag is set from `Ready` until the consumer confirms
//! the drain, so `Draining` still counts as ready.
//!
//! Data written into a slot is published by a `Release` store of `Ready` and
//! observed by the consumer through an `Acquire` compare-exchange, so a block
//! is always complete before its flag becomes visible.

use core::cell::UnsafeCell;
use core::future::Future;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};

use crate::{fault::Faults, Sample, SampleIndex};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub const BOTH: [SlotId; 2] = [SlotId::A, SlotId::B];

    pub const fn other(self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    pub const fn index(self) -> usize {
        match self {
            SlotId::A => 0,
            SlotId::B => 1,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SlotState {
    Idle = 0,
    /// Owned by the fill engine.
    Filling = 1,
    /// Full and waiting for the writer.
    Ready = 2,
    /// Being written out by the writer.
    Draining = 3,
}

impl SlotState {
    const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => SlotState::Filling,
            2 => SlotState::Ready,
            3 => SlotState::Draining,
            _ => SlotState::Idle,
        }
    }

    pub const fn is_ready(self) -> bool {
        matches!(self, SlotState::Ready | SlotState::Draining)
    }
}

struct Slot<const N: usize> {
    data: UnsafeCell<[Sample; N]>,
    state: AtomicU8,
    sequence: AtomicU32,
}

impl<const N: usize> Slot<N> {
    const fn new() -> Self {
        Self {
            data: UnsafeCell::new([0; N]),
            state: AtomicU8::new(SlotState::Idle as u8),
            sequence: AtomicU32::new(0),
        }
    }

    fn state(&self) -> SlotState {
        SlotState::from_bits(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// Exactly two slots of `N` samples each.
///
/// Meant to live in a `static`. [`split`](Self::split) hands out the producer
/// and consumer halves once.
pub struct BufferPool<const N: usize> {
    slots: [Slot<N>; 2],
    faults: Faults,
    ready: Signal<CriticalSectionRawMutex, ()>,
    split: AtomicBool,
}

// SAFETY: slot data is only reachable through `Producer` and `Consumer`, of
// which only one pair ever exists. The slot state decides which of the two may
// touch the data, and every hand-off goes through an acquire/release pair.
unsafe impl<const N: usize> Sync for BufferPool<N> {}

impl<const N: usize> BufferPool<N> {
    pub const fn new() -> Self {
        assert!(N > 0, "slots must hold at least one sample");

        Self {
            slots: [Slot::new(), Slot::new()],
            faults: Faults::new(),
            ready: Signal::new(),
            split: AtomicBool::new(false),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn split(&self) -> Option<(Producer<'_, N>, Consumer<'_, N>)> {
        if self.split.swap(true, Ordering::AcqRel) {
            return None;
        }

        Some((Producer { pool: self }, Consumer { pool: self }))
    }

    pub fn state(&self, id: SlotId) -> SlotState {
        self.slot(id).state()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    fn slot(&self, id: SlotId) -> &Slot<N> {
        &self.slots[id.index()]
    }
}

impl<const N: usize> Default for BufferPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The fill engine's half of the pool.
pub struct Producer<'a, const N: usize> {
    pool: &'a BufferPool<N>,
}

impl<'a, const N: usize> Producer<'a, N> {
    /// Take an idle slot for filling.
    pub(crate) fn acquire(&mut self, id: SlotId) -> bool {
        self.pool
            .slot(id)
            .transition(SlotState::Idle, SlotState::Filling)
    }

    /// Take back a slot that was published but not yet claimed, discarding
    /// its block.
    pub(crate) fn reclaim(&mut self, id: SlotId) -> bool {
        self.pool
            .slot(id)
            .transition(SlotState::Ready, SlotState::Filling)
    }

    /// Hand a filled slot to the consumer and raise the wake signal.
    pub(crate) fn publish(&mut self, id: SlotId, sequence: u32) {
        let slot = self.pool.slot(id);
        debug_assert_eq!(slot.state(), SlotState::Filling);

        slot.sequence.store(sequence, Ordering::Relaxed);
        slot.state.store(SlotState::Ready as u8, Ordering::Release);
        self.pool.ready.signal(());
    }

    /// Start address of a slot, for programming a transfer engine.
    pub(crate) fn slot_ptr(&self, id: SlotId) -> *mut Sample {
        self.pool.slot(id).data.get().cast()
    }

    /// # Safety
    ///
    /// `id` must be in [`SlotState::Filling`] and `index` below `N`.
    pub(crate) unsafe fn write(&mut self, id: SlotId, index: usize, sample: Sample) {
        debug_assert!(index < N);
        debug_assert_eq!(self.pool.slot(id).state(), SlotState::Filling);

        self.slot_ptr(id).add(index).write(sample);
    }

    /// Wake the consumer without publishing anything.
    pub(crate) fn wake(&self) {
        self.pool.ready.signal(());
    }

    pub fn state(&self, id: SlotId) -> SlotState {
        self.pool.state(id)
    }

    pub fn faults(&self) -> &'a Faults {
        &self.pool.faults
    }
}

/// The stream writer's half of the pool.
pub struct Consumer<'a, const N: usize> {
    pool: &'a BufferPool<N>,
}

impl<'a, const N: usize> Consumer<'a, N> {
    pub fn is_ready(&self, id: SlotId) -> bool {
        self.pool.state(id).is_ready()
    }

    pub fn any_ready(&self) -> bool {
        SlotId::BOTH.iter().any(|&id| self.is_ready(id))
    }

    /// Claim a specific slot if it is waiting to be drained.
    pub fn claim(&mut self, id: SlotId) -> Option<ReadySlot<'_, N>> {
        if self.try_claim(id) {
            Some(self.ready_slot(id))
        } else {
            None
        }
    }

    /// Claim the ready slot that was filled first.
    pub fn claim_oldest(&mut self) -> Option<ReadySlot<'_, N>> {
        let a = self.pool.slot(SlotId::A);
        let b = self.pool.slot(SlotId::B);

        let order = match (a.state(), b.state()) {
            (SlotState::Ready, SlotState::Ready) => {
                let seq_a = a.sequence.load(Ordering::Relaxed);
                let seq_b = b.sequence.load(Ordering::Relaxed);
                if (seq_b.wrapping_sub(seq_a) as i32) < 0 {
                    [SlotId::B, SlotId::A]
                } else {
                    [SlotId::A, SlotId::B]
                }
            }
            (_, SlotState::Ready) => [SlotId::B, SlotId::A],
            _ => [SlotId::A, SlotId::B],
        };

        let id = order.into_iter().find(|&id| self.try_claim(id))?;
        Some(self.ready_slot(id))
    }

    /// Resolves once a slot has been published (or the producer halted)
    /// since the last time this resolved. A signal raised before the call
    /// is not lost.
    pub fn wait_ready(&self) -> impl Future<Output = ()> + '_ {
        self.pool.ready.wait()
    }

    pub fn faults(&self) -> &'a Faults {
        &self.pool.faults
    }

    fn try_claim(&self, id: SlotId) -> bool {
        self.pool
            .slot(id)
            .transition(SlotState::Ready, SlotState::Draining)
    }

    fn ready_slot(&self, id: SlotId) -> ReadySlot<'_, N> {
        ReadySlot {
            pool: self.pool,
            id,
            sequence: self.pool.slot(id).sequence.load(Ordering::Relaxed),
            released: false,
        }
    }
}

/// A claimed, full slot.
///
/// [`release`](Self::release) clears the ready flag and gives the slot back to
/// the fill engine. Dropping it without releasing leaves the ready flag set,
/// so the block stays protected from being overwritten.
pub struct ReadySlot<'a, const N: usize> {
    pool: &'a BufferPool<N>,
    id: SlotId,
    sequence: u32,
    released: bool,
}

impl<'a, const N: usize> ReadySlot<'a, N> {
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Number of the fill cycle that produced this block.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn first_sample(&self) -> SampleIndex {
        SampleIndex(u64::from(self.sequence) * N as u64)
    }

    pub fn samples(&self) -> &[Sample; N] {
        // SAFETY: the slot is `Draining`, which the producer never writes to,
        // and the claim synchronized with the publishing `Release` store.
        unsafe { &*self.pool.slot(self.id).data.get() }
    }

    /// Confirm the block was delivered.
    pub fn release(mut self) {
        self.pool
            .slot(self.id)
            .state
            .store(SlotState::Idle as u8, Ordering::Release);
        self.released = true;
    }

    /// Give the slot back without clearing its ready flag.
    pub fn unclaim(self) {}
}

impl<const N: usize> Drop for ReadySlot<'_, N> {
    fn drop(&mut self) {
        if !self.released {
            self.pool
                .slot(self.id)
                .state
                .store(SlotState::Ready as u8, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_only_once() {
        let pool: BufferPool<4> = BufferPool::new();
        assert!(pool.split().is_some());
        assert!(pool.split().is_none());
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn slot_lifecycle() {
        let pool: BufferPool<4> = BufferPool::new();
        let (mut producer, mut consumer) = pool.split().unwrap();

        assert!(producer.acquire(SlotId::A));
        assert!(!producer.acquire(SlotId::A));
        assert!(consumer.claim(SlotId::A).is_none());

        for i in 0..4 {
            unsafe { producer.write(SlotId::A, i, i as Sample + 1) };
        }
        producer.publish(SlotId::A, 7);
        assert_eq!(pool.state(SlotId::A), SlotState::Ready);
        assert!(consumer.is_ready(SlotId::A));

        let slot = consumer.claim(SlotId::A).unwrap();
        assert_eq!(slot.samples(), &[1, 2, 3, 4]);
        assert_eq!(slot.sequence(), 7);
        assert_eq!(slot.first_sample(), SampleIndex(28));
        assert_eq!(pool.state(SlotId::A), SlotState::Draining);

        // Still ready while draining, the producer can not take it back
        assert!(pool.state(SlotId::A).is_ready());
        assert!(!producer.reclaim(SlotId::A));
        assert!(!producer.acquire(SlotId::A));

        slot.release();
        assert_eq!(pool.state(SlotId::A), SlotState::Idle);
        assert!(!consumer.any_ready());
        assert!(producer.acquire(SlotId::A));
    }

    #[test]
    fn dropped_claim_keeps_ready_flag() {
        let pool: BufferPool<2> = BufferPool::new();
        let (mut producer, mut consumer) = pool.split().unwrap();

        assert!(producer.acquire(SlotId::B));
        producer.publish(SlotId::B, 0);

        consumer.claim(SlotId::B).unwrap().unclaim();
        assert_eq!(pool.state(SlotId::B), SlotState::Ready);

        drop(consumer.claim_oldest().unwrap());
        assert_eq!(pool.state(SlotId::B), SlotState::Ready);
    }

    #[test]
    fn oldest_first() {
        let pool: BufferPool<1> = BufferPool::new();
        let (mut producer, mut consumer) = pool.split().unwrap();

        assert!(producer.acquire(SlotId::B));
        producer.publish(SlotId::B, u32::MAX);
        assert!(producer.acquire(SlotId::A));
        // Sequence numbers wrap around
        producer.publish(SlotId::A, 0);

        let first = consumer.claim_oldest().unwrap();
        assert_eq!(first.id(), SlotId::B);
        first.release();

        let second = consumer.claim_oldest().unwrap();
        assert_eq!(second.id(), SlotId::A);
        second.release();

        assert!(consumer.claim_oldest().is_none());
    }

    #[test]
    fn wake_signal_is_not_lost() {
        let pool: BufferPool<1> = BufferPool::new();
        let (mut producer, consumer) = pool.split().unwrap();

        // Published before anyone waits
        assert!(producer.acquire(SlotId::A));
        producer.publish(SlotId::A, 0);

        futures::executor::block_on(consumer.wait_ready());
        assert!(consumer.is_ready(SlotId::A));
    }
}
