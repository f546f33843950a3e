// Per-batch feeding decisions for the autoregressive model.
//
// The step driver sits between the batch pipeline and the recurrent cell.
// For every step of a batch it decides whether the cell sees the ground-truth
// input or its own previous prediction, and attaches what the optimizer
// needs (position weights, learning rate). The cell itself is opaque: it
// comes in through `StepFunction` and is only driven by `StepFeed::unroll`.
//
// Modes:
// - Train: one uniform draw r per step; ground truth when r < θ(global_step),
//   previous output otherwise. Carries w(t) and lr(global_step).
// - Evaluate: the same draws and weights, so the unrolled computation matches
//   training, but no learning rate (there is no optimizer step).
// - Generate: batch size 1. Seed steps are fed as ground truth, every step
//   after the seed feeds the previous prediction. No targets, weights or
//   learning rate.
//
// Step 0 always consumes its given input: there is no previous prediction
// yet, whatever its feed decision says.

use std::borrow::Cow;

use keyroll_prng::SeededRng;
use serde::{Deserialize, Serialize};

use crate::batch::{Batch, StepTensor};
use crate::error::{Error, Result};
use crate::schedule::{ScheduleConfig, SchedulePolicies};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    Evaluate,
    Generate,
}

/// What the cell receives at one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    GroundTruth,
    PreviousOutput,
}

/// The recurrent cell: one step from an input and a hidden state to an output
/// (logits over the keyboard) and the next state.
pub trait StepFunction {
    type State;

    fn initial_state(&self, batch_size: usize) -> Self::State;

    fn step(&mut self, input: &StepTensor, state: Self::State) -> (StepTensor, Self::State);
}

#[derive(Debug, Clone)]
pub struct StepDriver {
    mode: Mode,
    sample_length: usize,
    policies: SchedulePolicies,
}

impl StepDriver {
    pub fn new(mode: Mode, sample_length: usize, policies: SchedulePolicies) -> Result<Self> {
        if sample_length == 0 {
            return Err(Error::Configuration("sample length must be at least 1".into()));
        }
        Ok(StepDriver {
            mode,
            sample_length,
            policies,
        })
    }

    /// Validate the schedule configuration and build a driver from it.
    pub fn from_config(mode: Mode, sample_length: usize, config: &ScheduleConfig) -> Result<Self> {
        Self::new(mode, sample_length, config.build(sample_length)?)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn sample_length(&self) -> usize {
        self.sample_length
    }

    pub fn policies(&self) -> &SchedulePolicies {
        &self.policies
    }

    /// Feed decisions for a training or evaluation batch.
    pub fn prepare<'a>(
        &self,
        batch: &'a Batch,
        global_step: u64,
        rng: &mut SeededRng,
    ) -> Result<StepFeed<'a>> {
        if self.mode == Mode::Generate {
            return Err(self.mode_error("preparing a training batch"));
        }
        if batch.sample_length() != self.sample_length
            || batch.targets().len() != self.sample_length
        {
            return Err(Error::Shape(format!(
                "batch has {} inputs and {} targets, driver expects {} steps",
                batch.sample_length(),
                batch.targets().len(),
                self.sample_length
            )));
        }

        let threshold = self.policies.sampling.threshold(global_step);
        let feeds = (0..self.sample_length)
            .map(|_| {
                if rng.random_bool(threshold) {
                    Feed::GroundTruth
                } else {
                    Feed::PreviousOutput
                }
            })
            .collect();

        let learning_rate = match self.mode {
            Mode::Train => Some(self.policies.learning_rate.learning_rate(global_step)),
            _ => None,
        };

        Ok(StepFeed {
            mode: self.mode,
            inputs: batch.inputs().iter().collect(),
            targets: batch.targets(),
            feeds,
            weights: self.policies.target_weights.weights(self.sample_length),
            learning_rate,
        })
    }

    /// Feed decisions for generation from a single-example seed. Seeds longer
    /// than the sample length are cut.
    pub fn prepare_generation<'a>(&self, seed: &'a Batch) -> Result<StepFeed<'a>> {
        if self.mode != Mode::Generate {
            return Err(self.mode_error("generation"));
        }
        if seed.batch_size() != 1 {
            return Err(Error::Shape(format!(
                "generation runs one example at a time, seed has {}",
                seed.batch_size()
            )));
        }
        let seed_inputs = seed.inputs();
        let first = seed_inputs
            .first()
            .ok_or_else(|| Error::Shape("empty generation seed".into()))?;

        let (inputs, feeds): (Vec<&StepTensor>, Vec<Feed>) = (0..self.sample_length)
            .map(|t| match seed_inputs.get(t) {
                Some(input) => (input, Feed::GroundTruth),
                // Only there for shape; the previous prediction replaces it.
                None => (first, Feed::PreviousOutput),
            })
            .unzip();

        Ok(StepFeed {
            mode: self.mode,
            inputs,
            targets: &[],
            feeds,
            weights: Vec::new(),
            learning_rate: None,
        })
    }

    fn mode_error(&self, operation: &'static str) -> Error {
        Error::Mode {
            operation,
            mode: self.mode,
        }
    }
}

/// Everything needed to run one batch through the cell.
#[derive(Debug, Clone)]
pub struct StepFeed<'a> {
    mode: Mode,
    inputs: Vec<&'a StepTensor>,
    targets: &'a [StepTensor],
    feeds: Vec<Feed>,
    weights: Vec<f64>,
    learning_rate: Option<f64>,
}

impl<'a> StepFeed<'a> {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    pub fn feeds(&self) -> &[Feed] {
        &self.feeds
    }

    /// Given input at step `t`.
    pub fn input(&self, t: usize) -> &'a StepTensor {
        self.inputs[t]
    }

    /// Given inputs of every step.
    pub fn inputs(&self) -> &[&'a StepTensor] {
        &self.inputs
    }

    pub fn batch_size(&self) -> usize {
        self.inputs.first().map_or(0, |t| t.batch_size())
    }

    /// Learning rate for the optimizer step. Train mode only.
    pub fn learning_rate(&self) -> Result<f64> {
        self.learning_rate.ok_or(Error::Mode {
            operation: "learning rate",
            mode: self.mode,
        })
    }

    /// Per-position loss weights. Not available when generating.
    pub fn weights(&self) -> Result<&[f64]> {
        self.require_targets("target weights")?;
        Ok(&self.weights)
    }

    pub fn targets(&self) -> Result<&'a [StepTensor]> {
        self.require_targets("targets")?;
        Ok(self.targets)
    }

    /// Run the cell over every step and collect its outputs.
    pub fn unroll<F: StepFunction>(&self, cell: &mut F) -> Vec<StepTensor> {
        let mut state = cell.initial_state(self.batch_size());
        let mut outputs: Vec<StepTensor> = Vec::with_capacity(self.len());
        for (t, feed) in self.feeds.iter().enumerate() {
            let input = match (feed, outputs.last()) {
                (Feed::PreviousOutput, Some(prev)) => Cow::Owned(prev.map(activate_and_scale)),
                _ => Cow::Borrowed(self.inputs[t]),
            };
            let (output, next) = cell.step(&input, state);
            state = next;
            outputs.push(output);
        }
        outputs
    }

    /// Weighted sigmoid cross-entropy of `outputs` (logits) against the
    /// targets, summed over steps, examples and pitches.
    pub fn loss(&self, outputs: &[StepTensor]) -> Result<f64> {
        let targets = self.targets()?;
        if outputs.len() != targets.len() {
            return Err(Error::Shape(format!(
                "{} outputs for {} targets",
                outputs.len(),
                targets.len()
            )));
        }
        let mut total = 0.0;
        for ((output, target), weight) in outputs.iter().zip(targets).zip(&self.weights) {
            if output.batch_size() != target.batch_size() {
                return Err(Error::Shape(format!(
                    "output batch of {} against target batch of {}",
                    output.batch_size(),
                    target.batch_size()
                )));
            }
            let step_loss: f64 = output
                .data()
                .iter()
                .zip(target.data())
                .map(|(&x, &z)| sigmoid_cross_entropy(x as f64, z as f64))
                .sum();
            total += weight * step_loss;
        }
        Ok(total)
    }

    fn require_targets(&self, operation: &'static str) -> Result<()> {
        if self.mode == Mode::Generate {
            Err(Error::Mode {
                operation,
                mode: self.mode,
            })
        } else {
            Ok(())
        }
    }
}

/// Map a logit onto the bipolar input range: `2 * sigmoid(x) - 1`.
pub fn activate_and_scale(x: f32) -> f32 {
    2.0 / (1.0 + (-x).exp()) - 1.0
}

/// `max(x, 0) - x * z + ln(1 + e^-|x|)`, stable for large |x|.
fn sigmoid_cross_entropy(logit: f64, target: f64) -> f64 {
    logit.max(0.0) - logit * target + (-logit.abs()).exp().ln_1p()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{SILENT_INPUT, SOUNDING_INPUT};
    use crate::pianoroll::{NUM_PITCHES, PianoRoll};
    use crate::schedule::{LearningRatePolicy, SamplingPolicy, TargetWeightPolicy};
    use crate::window::Window;

    fn policies(sampling: SamplingPolicy) -> SchedulePolicies {
        SchedulePolicies {
            sampling,
            target_weights: TargetWeightPolicy::None,
            learning_rate: LearningRatePolicy::step(0.1, 10).unwrap(),
        }
    }

    /// Pitch class t sounds at time t.
    fn diagonal(width: usize) -> PianoRoll {
        let mut roll = PianoRoll::zeros(width);
        for t in 0..width {
            roll.set(t, t, 1);
        }
        roll
    }

    fn batch_from(roll: &PianoRoll, sample_length: usize, batch_size: usize) -> Batch {
        let windows: Vec<Window<'_>> = (0..batch_size)
            .map(|i| Window::new(roll, i, sample_length + 1))
            .collect();
        Batch::from_windows(&windows).unwrap()
    }

    /// Echoes its input as output and records what it was fed.
    struct Echo {
        seen: Vec<StepTensor>,
    }

    impl StepFunction for Echo {
        type State = usize;

        fn initial_state(&self, _batch_size: usize) -> usize {
            0
        }

        fn step(&mut self, input: &StepTensor, state: usize) -> (StepTensor, usize) {
            self.seen.push(input.clone());
            (input.map(|v| v * 10.0), state + 1)
        }
    }

    #[test]
    fn teacher_forcing_always_feeds_ground_truth() {
        let roll = diagonal(6);
        let b = batch_from(&roll, 4, 2);
        let driver = StepDriver::new(Mode::Train, 4, policies(SamplingPolicy::None)).unwrap();
        let mut rng = SeededRng::new(1);
        for step in 0..50 {
            let feed = driver.prepare(&b, step, &mut rng).unwrap();
            assert!(feed.feeds().iter().all(|&f| f == Feed::GroundTruth));
        }
    }

    #[test]
    fn always_sampling_never_feeds_ground_truth() {
        let roll = diagonal(6);
        let b = batch_from(&roll, 4, 2);
        let driver = StepDriver::new(Mode::Train, 4, policies(SamplingPolicy::Always)).unwrap();
        let mut rng = SeededRng::new(1);
        for step in 0..50 {
            let feed = driver.prepare(&b, step, &mut rng).unwrap();
            assert!(feed.feeds().iter().all(|&f| f == Feed::PreviousOutput));
        }
    }

    #[test]
    fn feed_decisions_follow_the_rng_stream() {
        let roll = diagonal(9);
        let b = batch_from(&roll, 8, 1);
        let sampling = SamplingPolicy::linear(0, 10, 1.0, 0.0).unwrap();
        let driver = StepDriver::new(Mode::Train, 8, policies(sampling)).unwrap();
        let feed = driver.prepare(&b, 4, &mut SeededRng::new(3)).unwrap();

        let theta = sampling.threshold(4);
        let mut rng = SeededRng::new(3);
        let expected: Vec<Feed> = (0..8)
            .map(|_| {
                if rng.random_bool(theta) {
                    Feed::GroundTruth
                } else {
                    Feed::PreviousOutput
                }
            })
            .collect();
        assert_eq!(feed.feeds(), expected.as_slice());
    }

    #[test]
    fn ground_truth_rate_tracks_threshold() {
        let roll = diagonal(11);
        let b = batch_from(&roll, 10, 1);
        let sampling = SamplingPolicy::linear(0, 100, 1.0, 0.0).unwrap();
        let driver = StepDriver::new(Mode::Train, 10, policies(sampling)).unwrap();
        let mut rng = SeededRng::new(8);
        let mut truth = 0;
        let trials = 2000;
        for _ in 0..trials {
            let feed = driver.prepare(&b, 70, &mut rng).unwrap();
            truth += feed.feeds().iter().filter(|&&f| f == Feed::GroundTruth).count();
        }
        let rate = truth as f64 / (trials * 10) as f64;
        assert!((rate - 0.3).abs() < 0.02, "rate {rate}");
    }

    #[test]
    fn train_carries_learning_rate_and_weights() {
        let roll = diagonal(6);
        let b = batch_from(&roll, 4, 2);
        let mut p = policies(SamplingPolicy::None);
        p.target_weights = TargetWeightPolicy::linear(4).unwrap();
        let driver = StepDriver::new(Mode::Train, 4, p).unwrap();
        let feed = driver.prepare(&b, 25, &mut SeededRng::new(0)).unwrap();
        assert_eq!(feed.learning_rate().unwrap(), 0.025);
        assert_eq!(feed.weights().unwrap().len(), 4);
        assert_eq!(feed.weights().unwrap()[3], 1.0);
        assert_eq!(feed.targets().unwrap().len(), 4);
    }

    #[test]
    fn evaluate_has_no_learning_rate() {
        let roll = diagonal(6);
        let b = batch_from(&roll, 4, 2);
        let driver = StepDriver::new(Mode::Evaluate, 4, policies(SamplingPolicy::Always)).unwrap();
        let feed = driver.prepare(&b, 3, &mut SeededRng::new(0)).unwrap();
        assert!(matches!(
            feed.learning_rate(),
            Err(Error::Mode {
                mode: Mode::Evaluate,
                ..
            })
        ));
        assert!(feed.feeds().iter().all(|&f| f == Feed::PreviousOutput));
        assert!(feed.weights().is_ok());
    }

    #[test]
    fn wrong_mode_calls_fail() {
        let roll = diagonal(5);
        let b = batch_from(&roll, 4, 1);
        let train = StepDriver::new(Mode::Train, 4, policies(SamplingPolicy::None)).unwrap();
        assert!(matches!(train.prepare_generation(&b), Err(Error::Mode { .. })));
        let generate = StepDriver::new(Mode::Generate, 4, policies(SamplingPolicy::None)).unwrap();
        assert!(matches!(
            generate.prepare(&b, 0, &mut SeededRng::new(0)),
            Err(Error::Mode { .. })
        ));
    }

    #[test]
    fn step_count_mismatch_is_shape_error() {
        let roll = diagonal(6);
        let b = batch_from(&roll, 4, 2);
        let driver = StepDriver::new(Mode::Train, 5, policies(SamplingPolicy::None)).unwrap();
        assert!(matches!(
            driver.prepare(&b, 0, &mut SeededRng::new(0)),
            Err(Error::Shape(_))
        ));
    }

    fn seed_step(pitch_class: usize) -> StepTensor {
        let mut t = StepTensor::filled(1, SILENT_INPUT);
        t.set(0, pitch_class, SOUNDING_INPUT);
        t
    }

    #[test]
    fn generation_feeds_seed_then_predictions() {
        let seed = Batch::seed(vec![seed_step(39), seed_step(43)]).unwrap();
        let driver = StepDriver::new(Mode::Generate, 5, policies(SamplingPolicy::None)).unwrap();
        let feed = driver.prepare_generation(&seed).unwrap();
        assert_eq!(
            feed.feeds(),
            &[
                Feed::GroundTruth,
                Feed::GroundTruth,
                Feed::PreviousOutput,
                Feed::PreviousOutput,
                Feed::PreviousOutput,
            ]
        );
        assert_eq!(feed.input(1), &seed.inputs()[1]);
        assert_eq!(feed.inputs().len(), 5);
        assert_eq!(feed.inputs()[4], &seed.inputs()[0]);
        assert!(matches!(feed.learning_rate(), Err(Error::Mode { .. })));
        assert!(matches!(feed.weights(), Err(Error::Mode { .. })));
        assert!(matches!(feed.targets(), Err(Error::Mode { .. })));

        let mut cell = Echo { seen: Vec::new() };
        let outputs = feed.unroll(&mut cell);
        assert_eq!(outputs.len(), 5);
        assert_eq!(cell.seen[0], seed.inputs()[0]);
        assert_eq!(cell.seen[1], seed.inputs()[1]);
        // Step 2 sees the squashed output of step 1.
        assert_eq!(cell.seen[2], outputs[1].map(activate_and_scale));
        assert!(cell.seen[2].get(0, 43) > 0.99);
        assert!(cell.seen[2].get(0, 0) < -0.99);
    }

    #[test]
    fn long_seed_is_truncated() {
        let seed = Batch::seed((0..8).map(seed_step).collect()).unwrap();
        let driver = StepDriver::new(Mode::Generate, 3, policies(SamplingPolicy::None)).unwrap();
        let feed = driver.prepare_generation(&seed).unwrap();
        assert_eq!(feed.len(), 3);
        assert!(feed.feeds().iter().all(|&f| f == Feed::GroundTruth));
    }

    #[test]
    fn generation_requires_single_example() {
        let seed = Batch::seed(vec![StepTensor::filled(2, SILENT_INPUT)]).unwrap();
        let driver = StepDriver::new(Mode::Generate, 3, policies(SamplingPolicy::None)).unwrap();
        assert!(matches!(driver.prepare_generation(&seed), Err(Error::Shape(_))));
    }

    #[test]
    fn first_step_ignores_previous_output_decision() {
        let roll = diagonal(4);
        let b = batch_from(&roll, 3, 1);
        let driver = StepDriver::new(Mode::Train, 3, policies(SamplingPolicy::Always)).unwrap();
        let feed = driver.prepare(&b, 0, &mut SeededRng::new(0)).unwrap();
        let mut cell = Echo { seen: Vec::new() };
        let outputs = feed.unroll(&mut cell);
        assert_eq!(cell.seen[0], b.inputs()[0]);
        assert_eq!(cell.seen[1], outputs[0].map(activate_and_scale));
        assert_eq!(cell.seen[2], outputs[1].map(activate_and_scale));
    }

    #[test]
    fn loss_is_weighted_cross_entropy() {
        let roll = diagonal(3);
        let b = batch_from(&roll, 2, 1);
        let mut p = policies(SamplingPolicy::None);
        p.target_weights = TargetWeightPolicy::linear(2).unwrap();
        let driver = StepDriver::new(Mode::Train, 2, p).unwrap();
        let feed = driver.prepare(&b, 0, &mut SeededRng::new(0)).unwrap();

        // Zero logits: ln 2 per cell. Step 0 has weight 0, step 1 weight 1.
        let outputs = vec![StepTensor::filled(1, 0.0); 2];
        let loss = feed.loss(&outputs).unwrap();
        assert!((loss - NUM_PITCHES as f64 * std::f64::consts::LN_2).abs() < 1e-9);

        assert!(matches!(feed.loss(&outputs[..1]), Err(Error::Shape(_))));
    }

    #[test]
    fn confident_correct_predictions_have_near_zero_loss() {
        let roll = diagonal(5);
        let b = batch_from(&roll, 3, 2);
        let driver = StepDriver::new(Mode::Evaluate, 3, policies(SamplingPolicy::None)).unwrap();
        let feed = driver.prepare(&b, 0, &mut SeededRng::new(0)).unwrap();
        let outputs: Vec<StepTensor> = feed
            .targets()
            .unwrap()
            .iter()
            .map(|t| t.map(|z| if z > 0.5 { 40.0 } else { -40.0 }))
            .collect();
        assert!(feed.loss(&outputs).unwrap() < 1e-10);
    }

    #[test]
    fn activate_and_scale_range() {
        assert_eq!(activate_and_scale(0.0), 0.0);
        assert!(activate_and_scale(50.0) > 0.999);
        assert!(activate_and_scale(-50.0) < -0.999);
    }

    #[test]
    fn driver_from_config_validates() {
        let config: ScheduleConfig =
            serde_json::from_str(r#"{"learning_rate": {"policy": "exponential"}}"#).unwrap();
        assert!(matches!(
            StepDriver::from_config(Mode::Train, 4, &config),
            Err(Error::NotImplemented(_))
        ));
    }
}
