// Data-driven pipeline configuration.
//
// Every tunable of the data pipeline lives in `PipelineConfig`, loaded from
// JSON. Each component reads only its own narrow section: the window sampler
// gets `sampler`, the batch builder gets `batch_size` and the sample length,
// the step driver gets `schedule`. Missing fields fall back to defaults, so
// `{}` is a complete config.
//
// On-disk layout under `root_dir`:
//
//     data/midi/<dataset_tag>/*.mid      source scores
//     data/samples/<dataset_tag>.bin     persisted corpus
//     data/test/initiator.json           generation seeds
//
// Policies are validated when a driver is built from the config, so a bad
// schedule fails at startup rather than mid-training.

use std::path::{Path, PathBuf};

use keyroll_prng::SeededRng;
use serde::{Deserialize, Serialize};

use crate::batch::BatchBuilder;
use crate::corpus::Corpus;
use crate::driver::{Mode, StepDriver};
use crate::error::Result;
use crate::initiator::{Initiator, load_initiators};
use crate::schedule::ScheduleConfig;
use crate::score::ScoreParser;
use crate::window::{WindowSampler, WindowSamplerConfig};

/// Format tag written into (and required from) the persisted corpus.
pub const DATA_VERSION: &str = "0.2";

const MIDI_DIR: &str = "data/midi";
const SAMPLES_DIR: &str = "data/samples";
const SAMPLES_EXT: &str = "bin";
const INITIATOR_FILE: &str = "data/test/initiator.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory the `data/` tree lives under.
    pub root_dir: PathBuf,
    /// Name of the score collection, e.g. `ragtimemusic`.
    pub dataset_tag: String,
    pub data_version: String,
    /// Seed of the single random stream driving shuffles, windows and feeds.
    pub seed: u64,
    pub sampler: WindowSamplerConfig,
    pub batch_size: usize,
    pub schedule: ScheduleConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            root_dir: PathBuf::from("."),
            dataset_tag: "ragtimemusic".into(),
            data_version: DATA_VERSION.into(),
            seed: 0,
            sampler: WindowSamplerConfig::default(),
            batch_size: 64,
            schedule: ScheduleConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn sample_length(&self) -> usize {
        self.sampler.sample_length
    }

    pub fn midi_dir(&self) -> PathBuf {
        self.root_dir.join(MIDI_DIR).join(&self.dataset_tag)
    }

    pub fn samples_path(&self) -> PathBuf {
        self.root_dir
            .join(SAMPLES_DIR)
            .join(format!("{}.{SAMPLES_EXT}", self.dataset_tag))
    }

    pub fn initiator_path(&self) -> PathBuf {
        self.root_dir.join(INITIATOR_FILE)
    }

    pub fn rng(&self) -> SeededRng {
        SeededRng::new(self.seed)
    }

    pub fn window_sampler(&self) -> Result<WindowSampler> {
        WindowSampler::new(self.sampler)
    }

    pub fn batch_builder(&self) -> Result<BatchBuilder> {
        BatchBuilder::new(self.batch_size, self.sample_length())
    }

    /// A driver for `mode`, with every schedule policy validated.
    pub fn driver(&self, mode: Mode) -> Result<StepDriver> {
        StepDriver::from_config(mode, self.sample_length(), &self.schedule)
    }

    /// Restore the corpus from `samples_path()`, building it from
    /// `midi_dir()` on first use.
    pub fn restore_corpus<P: ScoreParser + Sync>(
        &self,
        parser: &P,
        rng: &mut SeededRng,
    ) -> Result<Corpus> {
        Corpus::restore_or_build(
            &self.samples_path(),
            &self.data_version,
            &self.midi_dir(),
            parser,
            rng,
        )
    }

    pub fn initiators(&self) -> Result<Vec<Initiator>> {
        load_initiators(&self.initiator_path())
    }
}
