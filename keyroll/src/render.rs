// Model output back to files.
//
// The cell emits one `[batch_size, NUM_PITCHES]` tensor per step. Rendering
// regroups them into one activation roll per example (width = number of
// steps) and hands each roll to a set of recorders. A recorder declares
// whether it wants the decoded `Score` or the raw roll, and appends its own
// file extension to the base path it is given.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::batch::StepTensor;
use crate::error::{Error, Result};
use crate::pianoroll::{ActivationRoll, decode};
use crate::score::Score;

/// Transpose per-step outputs into one roll per batch example.
pub fn outputs_to_rolls(outputs: &[StepTensor]) -> Vec<ActivationRoll> {
    let Some(first) = outputs.first() else {
        return Vec::new();
    };
    (0..first.batch_size())
        .map(|example| {
            let mut roll = ActivationRoll::zeros(outputs.len());
            for (t, step) in outputs.iter().enumerate() {
                for (class, &value) in step.row(example).iter().enumerate() {
                    roll.set(class, t, value);
                }
            }
            roll
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Decoded score.
    Song,
    /// Raw activation roll.
    Array,
}

#[derive(Debug, Clone, Copy)]
pub enum Rendered<'a> {
    Song(&'a Score),
    Array(&'a ActivationRoll),
}

pub trait Recorder {
    fn input_kind(&self) -> InputKind;

    /// Write one example. `base_path` has no extension; the recorder adds
    /// its own.
    fn write(&self, input: Rendered<'_>, base_path: &Path) -> Result<()>;
}

/// Render every example of `outputs` through every recorder, as
/// `base_dir/{base_name}-{i}.<ext>`.
pub fn visit_recorders(
    outputs: &[StepTensor],
    base_dir: &Path,
    base_name: &str,
    recorders: &[&dyn Recorder],
) -> Result<()> {
    std::fs::create_dir_all(base_dir)?;
    let rolls = outputs_to_rolls(outputs);
    for (i, roll) in rolls.iter().enumerate() {
        let base_path = base_dir.join(format!("{base_name}-{i}"));
        let song = decode(roll);
        for recorder in recorders {
            let input = match recorder.input_kind() {
                InputKind::Song => Rendered::Song(&song),
                InputKind::Array => Rendered::Array(roll),
            };
            recorder.write(input, &base_path)?;
        }
    }
    info!(
        dir = %base_dir.display(),
        examples = rolls.len(),
        recorders = recorders.len(),
        "outputs recorded"
    );
    Ok(())
}

/// `base_path` plus `.ext`, kept even when the base name contains dots.
pub(crate) fn with_extension(base_path: &Path, ext: &str) -> PathBuf {
    let mut path = base_path.as_os_str().to_owned();
    path.push(".");
    path.push(ext);
    PathBuf::from(path)
}

/// Dumps the raw activation roll as JSON (`.json`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRollRecorder;

impl Recorder for JsonRollRecorder {
    fn input_kind(&self) -> InputKind {
        InputKind::Array
    }

    fn write(&self, input: Rendered<'_>, base_path: &Path) -> Result<()> {
        let Rendered::Array(roll) = input else {
            return Err(Error::Render("JSON recorder expects an activation roll".into()));
        };
        let json = serde_json::to_string(roll)?;
        std::fs::write(with_extension(base_path, "json"), json)?;
        Ok(())
    }
}
