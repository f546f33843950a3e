// Time-varying training policies.
//
// Three independent, pure policies:
// - `SamplingPolicy`: scheduled-sampling threshold θ(n), the probability of
//   feeding ground truth at global step n (1.0 is full teacher forcing).
//   See Bengio et al., "Scheduled Sampling for Sequence Prediction with
//   Recurrent Neural Networks" (arXiv:1506.03099).
// - `TargetWeightPolicy`: loss weight w(t) of position t inside a sequence.
// - `LearningRatePolicy`: learning rate lr(n) at global step n.
//
// Each policy is a tagged enum carrying its own validated parameters.
// Configuration arrives either as a serde config enum (JSON config files) or
// as the positional string form, e.g. `"linear 1000 20000 1.0 0.0"` or
// `"step 0.01 5000"`. Both paths validate at construction; evaluation never
// fails. Variants that are recognized but not built yet (`step` target
// weights, `exponential` learning rate) are rejected at construction with
// `NotImplemented`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Scheduled sampling
// ---------------------------------------------------------------------------

/// Piecewise-linear schedule: flat at `start_value` before `start_step`,
/// linear until `end_step`, flat at `end_value` afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearRamp {
    start_step: u64,
    end_step: u64,
    start_value: f64,
    end_value: f64,
}

impl LinearRamp {
    pub fn new(start_step: u64, end_step: u64, start_value: f64, end_value: f64) -> Result<Self> {
        if start_step >= end_step {
            return Err(Error::Configuration(format!(
                "linear schedule must start before it ends ({start_step} >= {end_step})"
            )));
        }
        for value in [start_value, end_value] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Configuration(format!(
                    "scheduled sampling threshold {value} is outside [0, 1]"
                )));
            }
        }
        Ok(LinearRamp {
            start_step,
            end_step,
            start_value,
            end_value,
        })
    }

    pub fn value(&self, step: u64) -> f64 {
        if step < self.start_step {
            self.start_value
        } else if step < self.end_step {
            let slope = (self.start_value - self.end_value)
                / (self.start_step as f64 - self.end_step as f64);
            let value = slope * (step - self.start_step) as f64 + self.start_value;
            value.clamp(0.0, 1.0)
        } else {
            self.end_value
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingPolicy {
    /// Always ground truth (θ = 1).
    None,
    /// Always the model's previous output (θ = 0).
    Always,
    Linear(LinearRamp),
}

impl SamplingPolicy {
    pub fn linear(start_step: u64, end_step: u64, start_value: f64, end_value: f64) -> Result<Self> {
        LinearRamp::new(start_step, end_step, start_value, end_value).map(SamplingPolicy::Linear)
    }

    /// Probability of feeding ground truth at `global_step`, in [0, 1].
    pub fn threshold(&self, global_step: u64) -> f64 {
        match self {
            SamplingPolicy::None => 1.0,
            SamplingPolicy::Always => 0.0,
            SamplingPolicy::Linear(ramp) => ramp.value(global_step),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SamplingPolicyConfig {
    #[default]
    None,
    Always,
    Linear {
        start_step: u64,
        end_step: u64,
        start_value: f64,
        end_value: f64,
    },
}

impl TryFrom<SamplingPolicyConfig> for SamplingPolicy {
    type Error = Error;

    fn try_from(config: SamplingPolicyConfig) -> Result<Self> {
        match config {
            SamplingPolicyConfig::None => Ok(SamplingPolicy::None),
            SamplingPolicyConfig::Always => Ok(SamplingPolicy::Always),
            SamplingPolicyConfig::Linear {
                start_step,
                end_step,
                start_value,
                end_value,
            } => SamplingPolicy::linear(start_step, end_step, start_value, end_value),
        }
    }
}

impl FromStr for SamplingPolicyConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let args = PolicyArgs::split(s, "scheduled sampling")?;
        match args.name {
            "none" => args.expect_arity(0).map(|_| SamplingPolicyConfig::None),
            "always" => args.expect_arity(0).map(|_| SamplingPolicyConfig::Always),
            "linear" => {
                args.expect_arity(4)?;
                Ok(SamplingPolicyConfig::Linear {
                    start_step: args.parse(0)?,
                    end_step: args.parse(1)?,
                    start_value: args.parse(2)?,
                    end_value: args.parse(3)?,
                })
            }
            other => Err(args.unknown(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Target weights
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetWeightPolicy {
    /// Every position weighs 1.
    None,
    /// `t / (sample_length - 1)`: early predictions, made with little
    /// context, count less.
    Linear { sample_length: usize },
}

impl TargetWeightPolicy {
    pub fn linear(sample_length: usize) -> Result<Self> {
        if sample_length < 2 {
            return Err(Error::Configuration(format!(
                "linear target weights need at least 2 steps, got {sample_length}"
            )));
        }
        Ok(TargetWeightPolicy::Linear { sample_length })
    }

    /// Loss weight of sequence position `t`.
    pub fn weight(&self, t: usize) -> f64 {
        match self {
            TargetWeightPolicy::None => 1.0,
            TargetWeightPolicy::Linear { sample_length } => t as f64 / (*sample_length - 1) as f64,
        }
    }

    /// Weights for positions `0..sample_length`.
    pub fn weights(&self, sample_length: usize) -> Vec<f64> {
        (0..sample_length).map(|t| self.weight(t)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TargetWeightConfig {
    #[default]
    None,
    Linear,
    /// Start penalizing only after a number of steps. Not implemented.
    Step,
}

impl TargetWeightConfig {
    pub fn build(self, sample_length: usize) -> Result<TargetWeightPolicy> {
        match self {
            TargetWeightConfig::None => Ok(TargetWeightPolicy::None),
            TargetWeightConfig::Linear => TargetWeightPolicy::linear(sample_length),
            TargetWeightConfig::Step => Err(Error::NotImplemented("step target weight policy")),
        }
    }
}

impl FromStr for TargetWeightConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let args = PolicyArgs::split(s, "target weight")?;
        args.expect_arity(0)?;
        match args.name {
            "none" => Ok(TargetWeightConfig::None),
            "linear" => Ok(TargetWeightConfig::Linear),
            "step" => Ok(TargetWeightConfig::Step),
            other => Err(args.unknown(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Learning rate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearningRatePolicy {
    Constant(f64),
    /// Halved every `decay_period` steps.
    Step { initial: f64, decay_period: u64 },
}

impl LearningRatePolicy {
    pub fn constant(value: f64) -> Result<Self> {
        check_rate(value)?;
        Ok(LearningRatePolicy::Constant(value))
    }

    pub fn step(initial: f64, decay_period: u64) -> Result<Self> {
        check_rate(initial)?;
        if decay_period == 0 {
            return Err(Error::Configuration("learning rate decay period must be at least 1".into()));
        }
        Ok(LearningRatePolicy::Step {
            initial,
            decay_period,
        })
    }

    pub fn learning_rate(&self, global_step: u64) -> f64 {
        match *self {
            LearningRatePolicy::Constant(value) => value,
            LearningRatePolicy::Step {
                initial,
                decay_period,
            } => {
                let halvings = (global_step / decay_period).min(i32::MAX as u64) as i32;
                initial / 2f64.powi(halvings)
            }
        }
    }
}

fn check_rate(value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(Error::Configuration(format!("invalid learning rate {value}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum LearningRateConfig {
    Cst { value: f64 },
    Step { initial: f64, decay_period: u64 },
    /// Not implemented.
    Exponential,
}

impl Default for LearningRateConfig {
    fn default() -> Self {
        LearningRateConfig::Cst { value: 0.001 }
    }
}

impl TryFrom<LearningRateConfig> for LearningRatePolicy {
    type Error = Error;

    fn try_from(config: LearningRateConfig) -> Result<Self> {
        match config {
            LearningRateConfig::Cst { value } => LearningRatePolicy::constant(value),
            LearningRateConfig::Step {
                initial,
                decay_period,
            } => LearningRatePolicy::step(initial, decay_period),
            LearningRateConfig::Exponential => {
                Err(Error::NotImplemented("exponential learning rate policy"))
            }
        }
    }
}

impl FromStr for LearningRateConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let args = PolicyArgs::split(s, "learning rate")?;
        match args.name {
            "cst" => {
                args.expect_arity(1)?;
                Ok(LearningRateConfig::Cst {
                    value: args.parse(0)?,
                })
            }
            "step" => {
                args.expect_arity(2)?;
                Ok(LearningRateConfig::Step {
                    initial: args.parse(0)?,
                    decay_period: args.parse(1)?,
                })
            }
            "exponential" => Ok(LearningRateConfig::Exponential),
            other => Err(args.unknown(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// All three together
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub scheduled_sampling: SamplingPolicyConfig,
    pub target_weights: TargetWeightConfig,
    pub learning_rate: LearningRateConfig,
}

/// The validated policies a step driver consults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulePolicies {
    pub sampling: SamplingPolicy,
    pub target_weights: TargetWeightPolicy,
    pub learning_rate: LearningRatePolicy,
}

impl ScheduleConfig {
    /// Validate every policy; the first invalid one is reported.
    pub fn build(&self, sample_length: usize) -> Result<SchedulePolicies> {
        Ok(SchedulePolicies {
            sampling: self.scheduled_sampling.try_into()?,
            target_weights: self.target_weights.build(sample_length)?,
            learning_rate: self.learning_rate.try_into()?,
        })
    }
}

/// A positional policy string split into its name and arguments.
struct PolicyArgs<'a> {
    kind: &'static str,
    name: &'a str,
    args: Vec<&'a str>,
}

impl<'a> PolicyArgs<'a> {
    fn split(s: &'a str, kind: &'static str) -> Result<Self> {
        let mut tokens = s.split_whitespace();
        let name = tokens
            .next()
            .ok_or_else(|| Error::Configuration(format!("empty {kind} policy")))?;
        Ok(PolicyArgs {
            kind,
            name,
            args: tokens.collect(),
        })
    }

    fn expect_arity(&self, n: usize) -> Result<()> {
        if self.args.len() == n {
            Ok(())
        } else {
            Err(Error::Configuration(format!(
                "{} policy {:?} takes {n} arguments, got {}",
                self.kind,
                self.name,
                self.args.len()
            )))
        }
    }

    fn parse<T: FromStr>(&self, i: usize) -> Result<T> {
        self.args[i].parse().map_err(|_| {
            Error::Configuration(format!(
                "{} policy {:?}: cannot parse argument {:?}",
                self.kind, self.name, self.args[i]
            ))
        })
    }

    fn unknown(&self, name: &str) -> Error {
        Error::Configuration(format!("unknown {} policy {name:?}", self.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_sampling_policies() {
        for step in [0, 1, 1000, u64::MAX] {
            assert_eq!(SamplingPolicy::None.threshold(step), 1.0);
            assert_eq!(SamplingPolicy::Always.threshold(step), 0.0);
        }
    }

    #[test]
    fn linear_ramp_shape() {
        let p = SamplingPolicy::linear(100, 200, 1.0, 0.0).unwrap();
        assert_eq!(p.threshold(0), 1.0);
        assert_eq!(p.threshold(99), 1.0);
        assert_eq!(p.threshold(100), 1.0);
        assert!((p.threshold(150) - 0.5).abs() < 1e-12);
        assert!((p.threshold(199) - 0.01).abs() < 1e-12);
        assert_eq!(p.threshold(200), 0.0);
        assert_eq!(p.threshold(10_000), 0.0);
    }

    #[test]
    fn linear_ramp_is_monotone_and_bounded() {
        for (sv, ev) in [(1.0, 0.0), (0.9, 0.2), (0.1, 0.7), (0.5, 0.5)] {
            let p = SamplingPolicy::linear(10, 73, sv, ev).unwrap();
            let mut prev = p.threshold(0);
            for step in 1..100 {
                let v = p.threshold(step);
                assert!((0.0..=1.0).contains(&v));
                if sv >= ev {
                    assert!(v <= prev + 1e-12, "{sv}->{ev} rose at {step}");
                } else {
                    assert!(v >= prev - 1e-12, "{sv}->{ev} fell at {step}");
                }
                prev = v;
            }
            // Continuous at both ends.
            assert!((p.threshold(10) - sv).abs() < 1e-12);
            let slope = (ev - sv) / 63.0;
            assert!((p.threshold(72) + slope - ev).abs() < 1e-9);
            assert_eq!(p.threshold(73), ev);
        }
    }

    #[test]
    fn invalid_linear_ramps() {
        let cases = [
            (200, 100, 1.0, 0.0),
            (100, 100, 1.0, 0.0),
            (0, 10, 1.5, 0.0),
            (0, 10, 1.0, -0.1),
            (0, 10, f64::NAN, 0.0),
        ];
        for (a, b, c, d) in cases {
            assert!(
                matches!(SamplingPolicy::linear(a, b, c, d), Err(Error::Configuration(_))),
                "{a} {b} {c} {d}"
            );
        }
    }

    #[test]
    fn target_weights() {
        assert_eq!(TargetWeightPolicy::None.weights(3), vec![1.0, 1.0, 1.0]);
        let linear = TargetWeightPolicy::linear(5).unwrap();
        assert_eq!(linear.weights(5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert!(matches!(TargetWeightPolicy::linear(1), Err(Error::Configuration(_))));
        assert!(matches!(
            TargetWeightConfig::Step.build(5),
            Err(Error::NotImplemented(_))
        ));
    }

    #[test]
    fn step_learning_rate_halves_at_period_boundaries() {
        let lr = LearningRatePolicy::step(0.08, 100).unwrap();
        for k in 0..10u64 {
            let at_boundary = lr.learning_rate(k * 100);
            assert_eq!(at_boundary, 0.08 / 2f64.powi(k as i32));
            assert_eq!(lr.learning_rate(k * 100 + 99), at_boundary);
            if k > 0 {
                assert_eq!(at_boundary * 2.0, lr.learning_rate(k * 100 - 1));
            }
        }
        assert_eq!(lr.learning_rate(u64::MAX), 0.0);
    }

    #[test]
    fn constant_learning_rate() {
        let lr = LearningRatePolicy::constant(0.001).unwrap();
        assert_eq!(lr.learning_rate(0), 0.001);
        assert_eq!(lr.learning_rate(1 << 40), 0.001);
    }

    #[test]
    fn invalid_learning_rates() {
        assert!(matches!(LearningRatePolicy::constant(-1.0), Err(Error::Configuration(_))));
        assert!(matches!(LearningRatePolicy::constant(f64::INFINITY), Err(Error::Configuration(_))));
        assert!(matches!(LearningRatePolicy::step(0.1, 0), Err(Error::Configuration(_))));
        assert!(matches!(
            LearningRatePolicy::try_from(LearningRateConfig::Exponential),
            Err(Error::NotImplemented(_))
        ));
    }

    #[test]
    fn positional_forms() {
        assert_eq!("none".parse::<SamplingPolicyConfig>().unwrap(), SamplingPolicyConfig::None);
        assert_eq!(
            "linear 100 1000 1.0 0.2".parse::<SamplingPolicyConfig>().unwrap(),
            SamplingPolicyConfig::Linear {
                start_step: 100,
                end_step: 1000,
                start_value: 1.0,
                end_value: 0.2,
            }
        );
        assert_eq!(
            "step 0.01 500".parse::<LearningRateConfig>().unwrap(),
            LearningRateConfig::Step {
                initial: 0.01,
                decay_period: 500,
            }
        );
        assert_eq!(
            "cst 0.5".parse::<LearningRateConfig>().unwrap(),
            LearningRateConfig::Cst { value: 0.5 }
        );
        assert_eq!("linear".parse::<TargetWeightConfig>().unwrap(), TargetWeightConfig::Linear);
    }

    #[test]
    fn malformed_positional_forms() {
        for s in ["", "linear 1 2 3", "linear a 2 0.5 0.5", "sometimes", "none 1"] {
            assert!(
                matches!(s.parse::<SamplingPolicyConfig>(), Err(Error::Configuration(_))),
                "{s:?}"
            );
        }
        assert!(matches!("cst".parse::<LearningRateConfig>(), Err(Error::Configuration(_))));
        assert!(matches!("step 0.1 -3".parse::<LearningRateConfig>(), Err(Error::Configuration(_))));
        assert!(matches!("linear 2".parse::<TargetWeightConfig>(), Err(Error::Configuration(_))));
    }

    #[test]
    fn schedule_config_from_json() {
        let json = r#"{
            "scheduled_sampling": {"policy": "linear", "start_step": 0, "end_step": 10,
                                   "start_value": 1.0, "end_value": 0.0},
            "target_weights": {"policy": "linear"},
            "learning_rate": {"policy": "step", "initial": 0.1, "decay_period": 5}
        }"#;
        let config: ScheduleConfig = serde_json::from_str(json).unwrap();
        let policies = config.build(4).unwrap();
        assert_eq!(policies.sampling.threshold(5), 0.5);
        assert_eq!(policies.target_weights.weight(3), 1.0);
        assert_eq!(policies.learning_rate.learning_rate(5), 0.05);
    }

    #[test]
    fn schedule_config_defaults() {
        let config: ScheduleConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ScheduleConfig::default());
        let policies = config.build(1).unwrap();
        assert_eq!(policies.sampling, SamplingPolicy::None);
        assert_eq!(policies.learning_rate, LearningRatePolicy::Constant(0.001));
    }
}
