// Hand-written seeds that prime generation.
//
// An initiator file names a few short openings, each an ordered list of
// simultaneous-note sets in plain MIDI pitch numbers:
//
//     {"initiator": [
//         {"name": "Simple_C4", "seq": [{"notes": [60]}]},
//         {"name": "some_chords", "seq": [
//             {"notes": [60, 64]}, {"notes": [66, 68, 71]}, {"notes": [60, 64]}
//         ]}
//     ]}
//
// Each set becomes one seed step of a single-example batch: listed pitches
// sound (+1), everything else is silent (-1).

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::batch::{Batch, SILENT_INPUT, SOUNDING_INPUT, StepTensor};
use crate::error::{Error, Result};
use crate::pianoroll::pitch_class;

#[derive(Debug, Deserialize)]
struct InitiatorFile {
    initiator: Vec<InitiatorEntry>,
}

#[derive(Debug, Deserialize)]
struct InitiatorEntry {
    name: String,
    seq: Vec<NoteSet>,
}

#[derive(Debug, Deserialize)]
struct NoteSet {
    notes: Vec<i64>,
}

/// A named generation seed.
#[derive(Debug, Clone)]
pub struct Initiator {
    pub name: String,
    pub batch: Batch,
}

pub fn parse_initiators(json: &str) -> Result<Vec<Initiator>> {
    let file: InitiatorFile = serde_json::from_str(json)?;
    file.initiator.into_iter().map(to_initiator).collect()
}

pub fn load_initiators(path: &Path) -> Result<Vec<Initiator>> {
    let initiators = parse_initiators(&std::fs::read_to_string(path)?)?;
    info!(path = %path.display(), count = initiators.len(), "initiators loaded");
    Ok(initiators)
}

fn to_initiator(entry: InitiatorEntry) -> Result<Initiator> {
    if entry.seq.is_empty() {
        return Err(Error::Shape(format!("initiator {:?} has no steps", entry.name)));
    }
    let steps = entry
        .seq
        .iter()
        .map(|set| {
            let mut step = StepTensor::filled(1, SILENT_INPUT);
            for &note in &set.notes {
                let pitch = u8::try_from(note).map_err(|_| Error::Range(note))?;
                step.set(0, pitch_class(pitch)?, SOUNDING_INPUT);
            }
            Ok(step)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Initiator {
        name: entry.name,
        batch: Batch::seed(steps)?,
    })
}
