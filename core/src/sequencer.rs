use crate::{source::ConversionSource, SampleIndex};

/// Round-robin selection of the converter input.
///
/// [`arm`](Self::arm) selects channel 0 before the first conversion and every
/// [`tick`](Self::tick) selects the channel for the following one, so in
/// steady state sample `k` belongs to channel `k % num_channels`. Ticks run in
/// interrupt context once per conversion and only do a select and an
/// increment.
#[derive(Clone, Debug)]
pub struct ChannelSequencer {
    num_channels: u8,
    next: u8,
    held: bool,
}

impl ChannelSequencer {
    pub const fn new(num_channels: u8) -> Self {
        Self {
            num_channels: if num_channels == 0 { 1 } else { num_channels },
            next: 0,
            held: false,
        }
    }

    pub fn num_channels(&self) -> u8 {
        self.num_channels
    }

    pub fn arm<S: ConversionSource + ?Sized>(&mut self, source: &mut S) {
        source.select_channel(0);
        self.next = 1 % self.num_channels;
        self.held = false;
    }

    /// Select the next channel and return it.
    #[inline]
    pub fn tick<S: ConversionSource + ?Sized>(&mut self, source: &mut S) -> u8 {
        if core::mem::take(&mut self.held) {
            return self.current();
        }

        let channel = self.next;
        source.select_channel(channel);
        self.next = (channel + 1) % self.num_channels;
        channel
    }

    /// Make the next tick keep the current channel, so a conversion that
    /// was lost gets repeated on the same input.
    pub fn hold(&mut self) {
        self.held = true;
    }

    /// Channel the converter is currently set to.
    pub fn current(&self) -> u8 {
        match self.next {
            0 => self.num_channels - 1,
            next => next - 1,
        }
    }

    pub fn channel_of(&self, sample: SampleIndex) -> u8 {
        (sample.0 % u64::from(self.num_channels)) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sample;

    #[derive(Default)]
    struct Selections(Vec<u8>);

    impl ConversionSource for Selections {
        type Error = ();

        fn select_channel(&mut self, index: u8) {
            self.0.push(index);
        }

        fn start_conversion(&mut self) {}

        fn read(&mut self) -> nb::Result<Sample, ()> {
            Err(nb::Error::WouldBlock)
        }
    }

    #[test]
    fn round_robin() {
        let mut source = Selections::default();
        let mut sequencer = ChannelSequencer::new(3);

        sequencer.arm(&mut source);
        assert_eq!(sequencer.current(), 0);

        for _ in 0..5 {
            sequencer.tick(&mut source);
        }
        assert_eq!(source.0, [0, 1, 2, 0, 1, 2]);
        assert_eq!(sequencer.current(), 2);
    }

    #[test]
    fn single_channel_stays_put() {
        let mut source = Selections::default();
        let mut sequencer = ChannelSequencer::new(1);

        sequencer.arm(&mut source);
        assert_eq!(sequencer.tick(&mut source), 0);
        assert_eq!(sequencer.tick(&mut source), 0);
        assert_eq!(source.0, [0, 0, 0]);
    }

    #[test]
    fn hold_repeats_channel_once() {
        let mut source = Selections::default();
        let mut sequencer = ChannelSequencer::new(3);

        sequencer.arm(&mut source);
        sequencer.tick(&mut source);
        sequencer.hold();
        assert_eq!(sequencer.tick(&mut source), 1);
        assert_eq!(sequencer.tick(&mut source), 2);
        assert_eq!(source.0, [0, 1, 2]);
    }

    #[test]
    fn zero_channels_is_one_channel() {
        let sequencer = ChannelSequencer::new(0);
        assert_eq!(sequencer.num_channels(), 1);
        assert_eq!(sequencer.channel_of(SampleIndex(17)), 0);
    }

    #[test]
    fn channel_of_sample() {
        let sequencer = ChannelSequencer::new(4);
        let channels: Vec<u8> = (0..8).map(|k| sequencer.channel_of(SampleIndex(k))).collect();
        assert_eq!(channels, [0, 1, 2, 3, 0, 1, 2, 3]);
    }
}
