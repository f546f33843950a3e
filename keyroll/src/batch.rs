// Mini-batches of per-step input/target tensors.
//
// The windows of an epoch are shuffled, grouped into exact `batch_size`
// chunks (a trailing partial chunk is dropped, never padded), and each chunk
// is turned into `sample_length` input/target pairs of shape
// `[batch_size, NUM_PITCHES]`:
//
// - input at step t: +1 where column t sounds, -1 elsewhere (bipolar);
// - target at step t: 1 where column t+1 sounds, 0 elsewhere (binary).
//
// So the target sequence is the input sequence shifted by one step. Silence
// and padding share the -1 encoding.

use keyroll_prng::SeededRng;
use tracing::info;

use crate::error::{Error, Result};
use crate::pianoroll::NUM_PITCHES;
use crate::window::Window;

pub const SOUNDING_INPUT: f32 = 1.0;
pub const SILENT_INPUT: f32 = -1.0;
pub const SOUNDING_TARGET: f32 = 1.0;
pub const SILENT_TARGET: f32 = 0.0;

/// Dense `[batch_size, NUM_PITCHES]` matrix for one time step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepTensor {
    batch_size: usize,
    data: Vec<f32>,
}

impl StepTensor {
    pub fn filled(batch_size: usize, value: f32) -> Self {
        StepTensor {
            batch_size,
            data: vec![value; batch_size * NUM_PITCHES],
        }
    }

    /// Wrap row-major data (`data[row * NUM_PITCHES + pitch_class]`).
    pub fn from_data(batch_size: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != batch_size * NUM_PITCHES {
            return Err(Error::Shape(format!(
                "{} values cannot form a {batch_size}x{NUM_PITCHES} tensor",
                data.len()
            )));
        }
        Ok(StepTensor { batch_size, data })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn get(&self, row: usize, pitch_class: usize) -> f32 {
        self.data[row * NUM_PITCHES + pitch_class]
    }

    pub fn set(&mut self, row: usize, pitch_class: usize, value: f32) {
        self.data[row * NUM_PITCHES + pitch_class] = value;
    }

    /// One example's keyboard.
    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * NUM_PITCHES..(row + 1) * NUM_PITCHES]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Elementwise transform into a new tensor of the same shape.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        StepTensor {
            batch_size: self.batch_size,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }
}

/// `sample_length` steps of inputs, with matching targets for training
/// batches. Generation seeds carry inputs only.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    inputs: Vec<StepTensor>,
    targets: Vec<StepTensor>,
}

impl Batch {
    /// Tensors for a group of equally long windows (at least two columns).
    pub fn from_windows(windows: &[Window<'_>]) -> Result<Self> {
        let first = windows
            .first()
            .ok_or_else(|| Error::Shape("cannot batch zero windows".into()))?;
        let window_len = first.len();
        if window_len < 2 {
            return Err(Error::Shape(format!(
                "a {window_len}-column window has no target column"
            )));
        }
        if let Some(w) = windows.iter().find(|w| w.len() != window_len) {
            return Err(Error::Shape(format!(
                "window of {} columns in a batch of {window_len}-column windows",
                w.len()
            )));
        }

        let batch_size = windows.len();
        let steps = window_len - 1;
        let mut inputs = Vec::with_capacity(steps);
        let mut targets = Vec::with_capacity(steps);
        for t in 0..steps {
            let mut input = StepTensor::filled(batch_size, SILENT_INPUT);
            let mut target = StepTensor::filled(batch_size, SILENT_TARGET);
            for (j, window) in windows.iter().enumerate() {
                let current = window.column(t);
                let next = window.column(t + 1);
                for p in 0..NUM_PITCHES {
                    if current[p] != 0 {
                        input.set(j, p, SOUNDING_INPUT);
                    }
                    if next[p] != 0 {
                        target.set(j, p, SOUNDING_TARGET);
                    }
                }
            }
            inputs.push(input);
            targets.push(target);
        }
        Ok(Batch { inputs, targets })
    }

    /// Input-only batch used to prime generation.
    pub fn seed(inputs: Vec<StepTensor>) -> Result<Self> {
        let batch_size = inputs
            .first()
            .ok_or_else(|| Error::Shape("a seed needs at least one step".into()))?
            .batch_size();
        if inputs.iter().any(|t| t.batch_size() != batch_size) {
            return Err(Error::Shape("seed steps disagree on batch size".into()));
        }
        Ok(Batch {
            inputs,
            targets: Vec::new(),
        })
    }

    pub fn inputs(&self) -> &[StepTensor] {
        &self.inputs
    }

    /// Empty for generation seeds.
    pub fn targets(&self) -> &[StepTensor] {
        &self.targets
    }

    pub fn sample_length(&self) -> usize {
        self.inputs.len()
    }

    pub fn batch_size(&self) -> usize {
        self.inputs.first().map_or(0, StepTensor::batch_size)
    }
}

/// Shuffles windows and packs them into fixed-size batches.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    batch_size: usize,
    sample_length: usize,
}

impl BatchBuilder {
    pub fn new(batch_size: usize, sample_length: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Configuration("batch size must be at least 1".into()));
        }
        if sample_length == 0 {
            return Err(Error::Configuration("sample length must be at least 1".into()));
        }
        Ok(BatchBuilder {
            batch_size,
            sample_length,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// One epoch of batches. `floor(windows / batch_size)` batches, each
    /// exactly `batch_size` examples by `sample_length` steps.
    pub fn build_batches(
        &self,
        mut windows: Vec<Window<'_>>,
        rng: &mut SeededRng,
    ) -> Result<Vec<Batch>> {
        let window_len = self.sample_length + 1;
        if let Some(w) = windows.iter().find(|w| w.len() != window_len) {
            return Err(Error::Shape(format!(
                "expected {window_len}-column windows, got {}",
                w.len()
            )));
        }

        rng.shuffle(&mut windows);
        let batches = windows
            .chunks_exact(self.batch_size)
            .map(Batch::from_windows)
            .collect::<Result<Vec<_>>>()?;
        info!(
            windows = windows.len(),
            batches = batches.len(),
            dropped = windows.len() % self.batch_size,
            "generated batches"
        );
        Ok(batches)
    }
}
