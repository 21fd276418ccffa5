use std::f32::consts::TAU;

use adcstream_core::{ConversionSource, PipelineConfig, Sample};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::{SimConfig, Tone};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Glitch;

/// A multiplexed converter sampling synthetic tones.
///
/// Time advances by one conversion period on every conversion, so the
/// signal a channel sees depends on where the sequencer put it in the scan.
pub struct SyntheticAdc {
    channel_inputs: Vec<u8>,
    tones: Vec<Tone>,
    noise: f32,
    full_scale: f32,
    tick_secs: f32,
    rng: StdRng,
    fail_every: Option<u32>,

    input: u8,
    conversions: u64,
    pending: bool,
}

impl SyntheticAdc {
    pub fn new(config: &SimConfig) -> Self {
        let pipeline: &PipelineConfig = &config.pipeline;

        Self {
            channel_inputs: pipeline.channel_inputs.to_vec(),
            tones: config.tones.clone(),
            noise: config.noise,
            full_scale: f32::from(pipeline.sample_width.mask()),
            tick_secs: 1.0 / pipeline.sample_rate_hz as f32,
            rng: StdRng::seed_from_u64(config.seed),
            fail_every: config.conversion_fail_every.filter(|&n| n > 0),
            input: pipeline.channel_inputs.first().copied().unwrap_or_default(),
            conversions: 0,
            pending: false,
        }
    }

    pub fn input(&self) -> u8 {
        self.input
    }

    fn level(&mut self, t: f32) -> f32 {
        let input = self.input;
        let tone: f32 = self
            .tones
            .iter()
            .filter(|tone| tone.input == input)
            .map(|tone| tone.amplitude * (TAU * tone.frequency_hz * t).sin())
            .sum();
        let noise = if self.noise > 0.0 {
            self.rng.gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };

        (0.5 + 0.5 * (tone + noise)).clamp(0.0, 1.0)
    }
}

impl ConversionSource for SyntheticAdc {
    type Error = Glitch;

    fn select_channel(&mut self, index: u8) {
        if let Some(&input) = self.channel_inputs.get(usize::from(index)) {
            self.input = input;
        }
    }

    fn start_conversion(&mut self) {
        self.pending = true;
    }

    fn read(&mut self) -> nb::Result<Sample, Self::Error> {
        if !std::mem::take(&mut self.pending) {
            return Err(nb::Error::WouldBlock);
        }

        let t = self.conversions as f32 * self.tick_secs;
        self.conversions += 1;

        if let Some(n) = self.fail_every {
            if self.conversions % u64::from(n) == 0 {
                return Err(nb::Error::Other(Glitch));
            }
        }

        Ok((self.level(t) * self.full_scale).round() as Sample)
    }
}

#[cfg(test)]
mod tests {
    use adcstream_core::ChannelSequencer;

    use super::*;

    fn config(inputs: &[u8]) -> SimConfig {
        let mut config = SimConfig {
            noise: 0.0,
            tones: vec![Tone {
                input: 3,
                frequency_hz: 1.0,
                amplitude: 1.0,
            }],
            ..Default::default()
        };
        config.pipeline.channel_inputs = heapless::Vec::from_slice(inputs).unwrap();
        config
    }

    #[test]
    fn follows_channel_mapping() {
        let mut adc = SyntheticAdc::new(&config(&[0, 3]));
        let mut sequencer = ChannelSequencer::new(2);

        sequencer.arm(&mut adc);
        assert_eq!(adc.input(), 0);
        sequencer.tick(&mut adc);
        assert_eq!(adc.input(), 3);
        sequencer.tick(&mut adc);
        assert_eq!(adc.input(), 0);
    }

    #[test]
    fn silent_input_sits_mid_scale() {
        let mut adc = SyntheticAdc::new(&config(&[0]));

        assert_eq!(adc.read(), Err(nb::Error::WouldBlock));
        adc.start_conversion();
        assert_eq!(adc.read(), Ok(2048));
    }

    #[test]
    fn scripted_glitches() {
        let mut config = config(&[0]);
        config.conversion_fail_every = Some(2);
        let mut adc = SyntheticAdc::new(&config);

        adc.start_conversion();
        assert!(adc.read().is_ok());
        adc.start_conversion();
        assert_eq!(adc.read(), Err(nb::Error::Other(Glitch)));
    }
}
