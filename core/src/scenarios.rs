//! End-to-end runs of fill engine, sequencer and writer sharing one pool.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::{rngs::StdRng, Rng, SeedableRng};
use static_cell::StaticCell;

use crate::{
    BufferPool, ChannelSequencer, ConversionSource, FillEngine, FillOutcome, OverrunPolicy,
    PolledAcquisition, RetryPolicy, Sample, SampleIndex, SampleWidth, StreamWriter, Transport,
};

/// Transport that keeps everything and can refuse a scripted number of
/// writes.
#[derive(Default)]
struct Capture {
    bytes: Vec<u8>,
    failures: u32,
    writes: u32,
}

impl Capture {
    fn samples(&self) -> Vec<Sample> {
        self.bytes
            .chunks_exact(2)
            .map(|b| Sample::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    fn blocks<const N: usize>(&self) -> Vec<Vec<Sample>> {
        self.samples().chunks(N).map(<[Sample]>::to_vec).collect()
    }
}

impl Transport for Capture {
    type Error = &'static str;

    fn write(&mut self, bytes: &[u8]) -> nb::Result<usize, Self::Error> {
        self.writes += 1;
        if self.failures > 0 {
            self.failures -= 1;
            return Err(nb::Error::Other("cable unplugged"));
        }
        self.bytes.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

/// Replays a fixed list of conversions and remembers which channel each was
/// taken on.
struct Replay {
    values: std::vec::IntoIter<Sample>,
    channel: u8,
    channels: Vec<u8>,
}

impl Replay {
    fn new(values: impl IntoIterator<Item = Sample>) -> Self {
        Self {
            values: values.into_iter().collect::<Vec<_>>().into_iter(),
            channel: 0,
            channels: Vec::new(),
        }
    }
}

impl ConversionSource for Replay {
    type Error = &'static str;

    fn select_channel(&mut self, index: u8) {
        self.channel = index;
    }

    fn start_conversion(&mut self) {}

    fn read(&mut self) -> nb::Result<Sample, Self::Error> {
        let sample = self.values.next().ok_or(nb::Error::Other("out of data"))?;
        self.channels.push(self.channel);
        Ok(sample)
    }
}

fn retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backpressure_spins: 16,
    }
}

#[test]
fn two_blocks_in_order() {
    let pool: BufferPool<4> = BufferPool::new();
    let (producer, consumer) = pool.split().unwrap();
    let fill = FillEngine::new(producer, OverrunPolicy::DropOldest);
    let mut acquisition = PolledAcquisition::new(Replay::new(10..18), fill, 1);
    let mut writer = StreamWriter::new(consumer, Capture::default(), SampleWidth::Bits16, retry());

    acquisition.start().unwrap();
    for _ in 0..2 {
        acquisition.acquire_block().unwrap();
        writer.poll().unwrap();
    }

    assert_eq!(
        writer.transport().blocks::<4>(),
        [vec![10, 11, 12, 13], vec![14, 15, 16, 17]]
    );
    assert_eq!(writer.stats().blocks, 2);
    assert!(pool.faults().snapshot().is_clean());
}

#[test]
fn interleaved_channels() {
    let pool: BufferPool<4> = BufferPool::new();
    let (producer, mut consumer) = pool.split().unwrap();
    let fill = FillEngine::new(producer, OverrunPolicy::DropOldest);
    let mut acquisition = PolledAcquisition::new(Replay::new(0..4), fill, 2);

    acquisition.start().unwrap();
    acquisition.acquire_block().unwrap();
    assert_eq!(acquisition.source_mut().channels, [0, 1, 0, 1]);

    let slot = consumer.claim_oldest().unwrap();
    let sequencer = ChannelSequencer::new(2);
    let channels: Vec<u8> = (0..4)
        .map(|k| sequencer.channel_of(SampleIndex(slot.first_sample().0 + k)))
        .collect();
    assert_eq!(channels, [0, 1, 0, 1]);
}

#[test]
fn stalled_writer_raises_one_overrun() {
    const N: usize = 4;
    let pool: BufferPool<N> = BufferPool::new();
    let (producer, consumer) = pool.split().unwrap();
    let mut fill = FillEngine::new(producer, OverrunPolicy::DropOldest);
    let mut writer = StreamWriter::new(consumer, Capture::default(), SampleWidth::Bits16, retry());

    fill.start().unwrap();
    let mut outcomes = Vec::new();
    for k in 0..2 * N {
        outcomes.extend(fill.push(k as Sample));
    }

    assert!(matches!(outcomes[0], FillOutcome::Switched { .. }));
    assert!(matches!(
        outcomes[1],
        FillOutcome::Overrun { overruns: 1, .. }
    ));
    // Still filling, into the slot it took back
    assert!(fill.active().is_some());

    let report = writer.poll().unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.faults.overruns, 1);
    assert_eq!(report.faults.dropped_blocks, 1);
    assert_eq!(writer.transport().samples(), [4, 5, 6, 7]);

    for k in 2 * N..3 * N {
        fill.push(k as Sample);
    }
    let report = writer.poll().unwrap();
    assert_eq!(report.faults.overruns, 0);
    assert_eq!(pool.faults().overruns(), 1);
    assert_eq!(writer.transport().blocks::<N>()[1], [8, 9, 10, 11]);
}

#[test]
fn failed_write_is_retried_without_duplicates() {
    let pool: BufferPool<8> = BufferPool::new();
    let (producer, consumer) = pool.split().unwrap();
    let mut fill = FillEngine::new(producer, OverrunPolicy::DropOldest);
    let transport = Capture {
        failures: 1,
        ..Default::default()
    };
    let mut writer = StreamWriter::new(consumer, transport, SampleWidth::Bits16, retry());

    fill.start().unwrap();
    for k in 100..108 {
        fill.push(k);
    }

    assert_eq!(writer.poll().unwrap().delivered, 1);
    assert_eq!(writer.transport().samples(), (100..108).collect::<Vec<Sample>>());
    assert_eq!(writer.transport().writes, 2);
    assert_eq!(writer.stats().retries, 1);

    // Nothing left to send a second time
    assert_eq!(writer.poll().unwrap().delivered, 0);
    assert_eq!(writer.transport().bytes.len(), 16);
}

/// Every delivered block holds the samples of exactly one fill cycle, in
/// order, while fill and drain really run in parallel.
#[test]
fn concurrent_blocks_are_never_torn() {
    const N: usize = 64;
    const BLOCKS: usize = 500;
    static POOL: StaticCell<BufferPool<N>> = StaticCell::new();
    static DONE: AtomicBool = AtomicBool::new(false);

    let pool: &'static BufferPool<N> = POOL.init(BufferPool::new());
    let (producer, consumer) = pool.split().unwrap();

    let filler = std::thread::spawn(move || {
        let mut fill = FillEngine::new(producer, OverrunPolicy::DropOldest);
        fill.start().unwrap();
        for k in 0..N * BLOCKS {
            fill.push(k as Sample);
        }
        DONE.store(true, Ordering::Release);
    });

    let mut writer = StreamWriter::new(consumer, Capture::default(), SampleWidth::Bits16, retry());
    loop {
        let done = DONE.load(Ordering::Acquire);
        if writer.poll().unwrap().delivered == 0 && done {
            break;
        }
    }
    filler.join().unwrap();

    let blocks = writer.transport().blocks::<N>();
    let faults = pool.faults().snapshot();
    assert_eq!(blocks.len() + faults.dropped_blocks as usize, BLOCKS);
    assert_eq!(blocks.len(), writer.stats().blocks as usize);

    let mut previous = None;
    for block in blocks {
        assert_eq!(block.len(), N);
        let first = block[0] as usize;
        assert_eq!(first % N, 0, "block starts mid-cycle: {block:?}");
        for (i, &sample) in block.iter().enumerate() {
            assert_eq!(sample as usize, first + i, "torn block: {block:?}");
        }
        assert!(previous < Some(first), "blocks out of order");
        previous = Some(first);
    }
}

#[test]
fn timely_drain_never_overruns() {
    const N: usize = 16;
    let pool: BufferPool<N> = BufferPool::new();
    let (producer, consumer) = pool.split().unwrap();
    let mut fill = FillEngine::new(producer, OverrunPolicy::Halt);
    let mut writer = StreamWriter::new(consumer, Capture::default(), SampleWidth::Bits12, retry());
    let mut rng = StdRng::seed_from_u64(1);

    fill.start().unwrap();
    for _ in 0..1000 {
        // The writer gets to run somewhere inside every fill period
        let poll_at = rng.gen_range(0..N);
        for k in 0..N {
            if k == poll_at {
                writer.poll().unwrap();
            }
            fill.push(rng.gen_range(0..0x1000));
        }
    }
    writer.poll().unwrap();

    assert!(pool.faults().snapshot().is_clean());
    assert_eq!(writer.stats().blocks, 1000);
}

#[test]
fn overruns_count_every_collision() {
    const N: usize = 8;
    let pool: BufferPool<N> = BufferPool::new();
    let (producer, consumer) = pool.split().unwrap();
    let mut fill = FillEngine::new(producer, OverrunPolicy::DropOldest);
    let mut writer = StreamWriter::new(consumer, Capture::default(), SampleWidth::Bits16, retry());
    let mut rng = StdRng::seed_from_u64(5);

    fill.start().unwrap();
    let mut counter: usize = 0;
    let mut expected = 0;
    for _ in 0..200 {
        // Writer stalled for `periods` fill periods
        let periods = rng.gen_range(1..5);
        for _ in 0..periods * N {
            if let Some(FillOutcome::Overrun { overruns, .. }) = fill.push(counter as Sample) {
                expected += 1;
                assert_eq!(overruns, expected);
            }
            counter += 1;
        }

        let report = writer.poll().unwrap();
        assert_eq!(report.faults.overruns, periods as u32 - 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(pool.faults().overruns(), expected);
    }

    // Survivors are always the most recent block of their stall
    for block in writer.transport().blocks::<N>() {
        let first = block[0] as usize;
        assert_eq!(first % N, 0);
        assert!(block.iter().enumerate().all(|(i, &s)| s as usize == first + i));
    }
}
