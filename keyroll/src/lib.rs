// Keyroll: piano-roll training data and stepwise feeding policies
//
// Turns a directory of musical scores into fixed-resolution binary piano
// rolls, cuts them into shuffled mini-batches of input/target steps for a
// recurrent next-keyboard predictor, and decides at every step whether the
// model is fed the ground truth or its own previous prediction.
//
// Architecture:
// - error.rs: Crate-wide error enum and `Result` alias
// - score.rs: Parsed score representation + `ScoreParser` seam
// - pianoroll.rs: Score <-> 88-key sixteenth-note roll codec
// - corpus.rs: Versioned, persisted collection of rolls (build, save, restore)
// - window.rs: Random fixed-length windows over the rolls of one partition
// - batch.rs: Bipolar input / binary target step tensors, grouped in batches
// - schedule.rs: Scheduled sampling, target weight and learning rate policies
// - driver.rs: Per-step feed decisions, cell unrolling and the weighted loss
// - initiator.rs: JSON generation seeds
// - render.rs: Model outputs -> rolls -> recorders
// - midi.rs: SMF reader and MIDI recorder (midly)
// - config.rs: JSON pipeline configuration and data layout
//
// All randomness flows through one explicit `SeededRng`, so a fixed seed
// reproduces the shuffle, the windows, the batches and the feed decisions.

pub mod batch;
pub mod config;
pub mod corpus;
pub mod driver;
pub mod error;
pub mod initiator;
pub mod midi;
pub mod pianoroll;
pub mod render;
pub mod schedule;
pub mod score;
pub mod window;

pub use error::{Error, Result};
