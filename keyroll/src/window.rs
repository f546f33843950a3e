// Random fixed-length windows over the corpus rolls.
//
// Each epoch cuts fresh windows of `sample_length + 1` time units out of the
// rolls of one partition. The extra column is the target of the last step.
// Longer songs contribute proportionally more windows
// (`floor(2 * width / sample_length)` each), and start offsets are drawn
// uniformly with replacement, so windows from the same roll may overlap or
// repeat.
//
// Windows borrow their roll; nothing is copied until the batch builder turns
// them into tensors. Output is roll-major; shuffling is the batch builder's
// job.

use keyroll_prng::SeededRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::corpus::split_index;
use crate::error::{Error, Result};
use crate::pianoroll::PianoRoll;

/// Which side of the train/test split to sample from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSet {
    Train,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSamplerConfig {
    /// Steps per training sequence. Windows are one column longer.
    pub sample_length: usize,
    /// Fraction of the corpus used for training, in [0, 1].
    pub train_ratio: f64,
}

impl Default for WindowSamplerConfig {
    fn default() -> Self {
        WindowSamplerConfig {
            sample_length: 40,
            train_ratio: 0.9,
        }
    }
}

/// A contiguous run of columns of one roll.
#[derive(Debug, Clone, Copy)]
pub struct Window<'a> {
    roll: &'a PianoRoll,
    start: usize,
    len: usize,
}

impl<'a> Window<'a> {
    /// Panics if the window does not fit inside `roll`. Only the sampler
    /// builds windows, after checking the roll width.
    pub(crate) fn new(roll: &'a PianoRoll, start: usize, len: usize) -> Self {
        assert!(start + len <= roll.width(), "window past the end of the roll");
        Window { roll, start, len }
    }

    /// Offset of the first column in the source roll.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Keyboard state at window-relative time `t`.
    pub fn column(&self, t: usize) -> &'a [u8] {
        debug_assert!(t < self.len);
        self.roll.column(self.start + t)
    }
}

#[derive(Debug, Clone)]
pub struct WindowSampler {
    config: WindowSamplerConfig,
}

impl WindowSampler {
    pub fn new(config: WindowSamplerConfig) -> Result<Self> {
        if config.sample_length == 0 {
            return Err(Error::Configuration("sample length must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&config.train_ratio) {
            return Err(Error::Configuration(format!(
                "train ratio {} is outside [0, 1]",
                config.train_ratio
            )));
        }
        Ok(WindowSampler { config })
    }

    pub fn config(&self) -> &WindowSamplerConfig {
        &self.config
    }

    /// Columns per window: one per step plus the final target.
    pub fn window_len(&self) -> usize {
        self.config.sample_length + 1
    }

    /// Cut windows from the `set` partition of `rolls`.
    ///
    /// Fails with `InsufficientLength` (before drawing anything) if any roll
    /// of the partition is narrower than a window.
    pub fn sample<'a>(
        &self,
        rolls: &'a [PianoRoll],
        set: DataSet,
        rng: &mut SeededRng,
    ) -> Result<Vec<Window<'a>>> {
        let split = split_index(rolls.len(), self.config.train_ratio);
        let (offset, partition) = match set {
            DataSet::Train => (0, &rolls[..split]),
            DataSet::Test => (split, &rolls[split..]),
        };

        let window_len = self.window_len();
        if let Some((i, roll)) = partition
            .iter()
            .enumerate()
            .find(|(_, roll)| roll.width() < window_len)
        {
            return Err(Error::InsufficientLength {
                index: offset + i,
                width: roll.width(),
                window_len,
            });
        }

        let mut windows = Vec::new();
        for roll in partition {
            let max_start = roll.width() - window_len;
            let count = 2 * roll.width() / self.config.sample_length;
            for _ in 0..count {
                let start = rng.range_usize_inclusive(0, max_start);
                windows.push(Window::new(roll, start, window_len));
            }
        }
        debug!(?set, songs = partition.len(), windows = windows.len(), "subsampled songs");
        Ok(windows)
    }
}
