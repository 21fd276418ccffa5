use core::fmt;

use fugit::{HertzU32, NanosDurationU64};
use heapless::Vec;

use crate::Sample;

/// Upper bound on the number of multiplexed inputs.
pub const MAX_CHANNELS: usize = 16;

/// Upper bound on the capacity of a single slot.
pub const MAX_BUFFER_SAMPLES: usize = 16 * 1024;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Resolution of a conversion and how it is packed on the wire.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "snake_case")]
pub enum SampleWidth {
    /// One byte per sample.
    Bits8,
    /// Little-endian 16-bit cell, upper nibble always zero.
    #[default]
    Bits12,
    /// Little-endian 16-bit cell.
    Bits16,
}

impl SampleWidth {
    pub const fn bits(self) -> u32 {
        match self {
            SampleWidth::Bits8 => 8,
            SampleWidth::Bits12 => 12,
            SampleWidth::Bits16 => 16,
        }
    }

    pub const fn mask(self) -> Sample {
        match self {
            SampleWidth::Bits8 => 0x00FF,
            SampleWidth::Bits12 => 0x0FFF,
            SampleWidth::Bits16 => 0xFFFF,
        }
    }

    pub const fn bytes_per_sample(self) -> usize {
        match self {
            SampleWidth::Bits8 => 1,
            SampleWidth::Bits12 | SampleWidth::Bits16 => 2,
        }
    }

    /// Pack as many of `samples` as fit into `out`, returning the number of
    /// bytes written.
    pub fn encode(self, samples: &[Sample], out: &mut [u8]) -> usize {
        let bps = self.bytes_per_sample();
        let mask = self.mask();

        let mut len = 0;
        for (sample, cell) in samples.iter().zip(out.chunks_exact_mut(bps)) {
            let value = sample & mask;
            match self {
                SampleWidth::Bits8 => cell[0] = value as u8,
                SampleWidth::Bits12 | SampleWidth::Bits16 => {
                    cell.copy_from_slice(&value.to_le_bytes())
                }
            }
            len += bps;
        }

        len
    }
}

/// What the fill engine does when the slot it needs next is still undrained.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Discard the oldest undrained block and keep acquiring. If the writer
    /// is already sending that block, the newest one is discarded instead.
    #[default]
    DropOldest,
    /// Stop acquiring. Blocks already filled are still delivered.
    Halt,
}

/// Bounds on how long the stream writer keeps trying a single block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct RetryPolicy {
    /// Failed attempts tolerated per block before the transport is declared
    /// faulty.
    pub max_attempts: u8,
    /// Consecutive `WouldBlock` polls that make up one timed out attempt.
    pub backpressure_spins: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backpressure_spins: 1_000_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Aggregate conversions per second over all channels.
    pub sample_rate_hz: u32,
    /// Physical converter input for every logical channel, in sequencing
    /// order. Its length is the number of channels.
    pub channel_inputs: Vec<u8, MAX_CHANNELS>,
    pub sample_width: SampleWidth,
    /// Worst case time a single conversion takes.
    pub conversion_time_ns: u32,
    /// Sustained throughput of the transport, if known.
    pub transport_bytes_per_sec: Option<u32>,
    pub overrun_policy: OverrunPolicy,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 40_000,
            channel_inputs: Vec::from_slice(&[0]).unwrap_or_default(),
            sample_width: SampleWidth::Bits12,
            conversion_time_ns: 2_000,
            transport_bytes_per_sec: None,
            overrun_policy: OverrunPolicy::DropOldest,
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn num_channels(&self) -> u8 {
        self.channel_inputs.len() as u8
    }

    pub fn sample_rate(&self) -> HertzU32 {
        HertzU32::Hz(self.sample_rate_hz)
    }

    /// Time between two consecutive conversions, which is also the period
    /// of the channel sequencer.
    pub fn tick_period(&self) -> NanosDurationU64 {
        NanosDurationU64::nanos(NANOS_PER_SEC / u64::from(self.sample_rate_hz.max(1)))
    }

    /// Time between two conversions of the same channel.
    pub fn channel_period(&self) -> NanosDurationU64 {
        NanosDurationU64::nanos(
            NANOS_PER_SEC * u64::from(self.num_channels()) / u64::from(self.sample_rate_hz.max(1)),
        )
    }

    /// Time it takes to fill one slot of `buffer_samples` samples.
    pub fn fill_period(&self, buffer_samples: usize) -> NanosDurationU64 {
        NanosDurationU64::nanos(
            NANOS_PER_SEC * buffer_samples as u64 / u64::from(self.sample_rate_hz.max(1)),
        )
    }

    /// Size in bytes of one block on the wire.
    pub fn block_bytes(&self, buffer_samples: usize) -> usize {
        buffer_samples * self.sample_width.bytes_per_sample()
    }

    /// Check the configuration before anything gets armed.
    pub fn validate(&self, buffer_samples: usize) -> Result<(), ConfigError> {
        if self.channel_inputs.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        if self.sample_rate_hz == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if buffer_samples == 0 {
            return Err(ConfigError::EmptyBuffer);
        }
        if buffer_samples > MAX_BUFFER_SAMPLES {
            return Err(ConfigError::BufferTooLarge {
                requested: buffer_samples,
                max: MAX_BUFFER_SAMPLES,
            });
        }

        let period_ns = self.tick_period().ticks();
        if u64::from(self.conversion_time_ns) > period_ns {
            return Err(ConfigError::ConversionTooSlow {
                period_ns,
                conversion_ns: self.conversion_time_ns,
            });
        }

        if let Some(available) = self.transport_bytes_per_sec {
            let required =
                u64::from(self.sample_rate_hz) * self.sample_width.bytes_per_sample() as u64;
            if required > u64::from(available) {
                return Err(ConfigError::TransportTooSlow {
                    required,
                    available,
                });
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::NoRetries);
        }

        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    NoChannels,
    ZeroSampleRate,
    EmptyBuffer,
    BufferTooLarge { requested: usize, max: usize },
    ConversionTooSlow { period_ns: u64, conversion_ns: u32 },
    TransportTooSlow { required: u64, available: u32 },
    NoRetries,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoChannels => write!(f, "no input channels configured"),
            ConfigError::ZeroSampleRate => write!(f, "sample rate must be non-zero"),
            ConfigError::EmptyBuffer => write!(f, "slots must hold at least one sample"),
            ConfigError::BufferTooLarge { requested, max } => {
                write!(f, "slot of {requested} samples exceeds the maximum of {max}")
            }
            ConfigError::ConversionTooSlow {
                period_ns,
                conversion_ns,
            } => write!(
                f,
                "conversion takes {conversion_ns} ns but a sample is due every {period_ns} ns"
            ),
            ConfigError::TransportTooSlow {
                required,
                available,
            } => write!(
                f,
                "stream needs {required} B/s but the transport only carries {available} B/s"
            ),
            ConfigError::NoRetries => write!(f, "at least one transport attempt is required"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConfigError {}

/// Load a TOML file named `file_name` from `path`, or from the first of the
/// current directory and its ancestors that has one.
#[cfg(feature = "config")]
pub fn load_toml<T: serde::de::DeserializeOwned>(
    file_name: &str,
    path: Option<&std::path::Path>,
) -> Result<T, Box<dyn std::error::Error>> {
    let paths: std::vec::Vec<std::path::PathBuf> = match path {
        Some(p) => vec![p.into()],
        None => std::env::current_dir()?
            .ancestors()
            .map(|path| path.join(file_name))
            .collect(),
    };

    let mut last_error = None;

    for path in paths {
        match std::fs::read_to_string(&path) {
            Ok(config_string) => {
                log::debug!("Loading configuration from {}", path.display());
                return Ok(toml::from_str(&config_string)?);
            }
            Err(e) => last_error = Some(e),
        }
    }

    match last_error {
        Some(e) => Err(e.into()),
        None => Err(format!("no {file_name} found").into()),
    }
}
