use std::{error::Error, path::Path, path::PathBuf};

use adcstream_core::{config::load_toml, PipelineConfig};

/// A sine on one physical input.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Tone {
    pub input: u8,
    pub frequency_hz: f32,
    /// Peak amplitude as a fraction of full scale.
    pub amplitude: f32,
}

/// Stop draining for a while once `after_blocks` blocks went out.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Stall {
    pub after_blocks: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub pipeline: PipelineConfig,
    pub duration_ms: u64,
    /// Where the sample stream goes. Stdout when unset.
    pub output: Option<PathBuf>,
    pub tones: Vec<Tone>,
    /// Peak noise as a fraction of full scale.
    pub noise: f32,
    pub seed: u64,
    pub writer_stall: Option<Stall>,
    /// Fail every n-th transport write once.
    pub transport_fail_every: Option<u32>,
    /// Fail every n-th conversion.
    pub conversion_fail_every: Option<u32>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            duration_ms: 1_000,
            output: None,
            tones: vec![Tone {
                input: 0,
                frequency_hz: 440.0,
                amplitude: 0.8,
            }],
            noise: 0.01,
            seed: 0,
            writer_stall: None,
            transport_fail_every: None,
            conversion_fail_every: None,
        }
    }
}

impl SimConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn Error>> {
        load_toml("adcstream.toml", path)
    }
}
