// Piano-roll codec: Score <-> fixed-resolution pitch/time matrix.
//
// Time is quantized to sixteenth notes under a 4/4 assumption. The scale
// factor maps ticks to grid units:
//
//     s = 4 * ticks_per_beat / (MAX_RESOLUTION * NOTES_PER_BAR)
//
// and must be an exact integer; a remainder is reported as a configuration
// error instead of being truncated. Durations are not represented: every note
// is a single active cell at `tick / s`, and repeated notes on the same cell
// collapse. Decoding emits one default-length note per active cell on a
// single track, at the default resolution.
//
// Rolls are stored time-major (one 88-cell column after another), so a
// window of consecutive time units is one contiguous slice. `PianoRoll` is
// the binary form kept in the corpus; `ActivationRoll` holds raw model
// output and decodes with the same threshold.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::score::{Note, Score, Track};

/// Keys on the keyboard, A0 to C8.
pub const NUM_PITCHES: usize = 88;
/// MIDI pitch of pitch class 0.
pub const LOWEST_PITCH: u8 = 21;
/// MIDI pitch of the last pitch class.
pub const HIGHEST_PITCH: u8 = LOWEST_PITCH + (NUM_PITCHES as u8 - 1);

/// Inverse of the finest note value on the grid, per quarter of a bar.
pub const MAX_RESOLUTION: u32 = 4;
pub const NOTES_PER_BAR: u32 = 4;

/// Resolution of decoded scores.
pub const DEFAULT_TICKS_PER_BEAT: u16 = 96;
/// Length given to every decoded note.
pub const DEFAULT_NOTE_DURATION: u32 = 32;

/// Cells at or below this value decode to silence. Strictly positive so raw
/// (pre-sigmoid) model output can be decoded as well as binary rolls.
pub const ACTIVATION_THRESHOLD: f64 = 1e-12;

const GRID_DIVISOR: u32 = MAX_RESOLUTION * NOTES_PER_BAR;
const DEFAULT_SCALE: u32 = 4 * DEFAULT_TICKS_PER_BEAT as u32 / GRID_DIVISOR;
const _: () = assert!((4 * DEFAULT_TICKS_PER_BEAT as u32) % GRID_DIVISOR == 0);

/// Pitch/time matrix, indexed `[pitch_class, time_unit]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roll<T> {
    width: usize,
    cells: Vec<T>,
}

/// Binary roll: 1 where a pitch sounds during a time unit.
pub type PianoRoll = Roll<u8>;
/// Continuous-valued roll built from model output.
pub type ActivationRoll = Roll<f32>;

impl<T: Copy + Default> Roll<T> {
    /// All-silent roll `width` time units long.
    pub fn zeros(width: usize) -> Self {
        Roll {
            width,
            cells: vec![T::default(); width * NUM_PITCHES],
        }
    }

    /// Build from time-major cells (`cells[t * NUM_PITCHES + p]`).
    pub fn from_cells(width: usize, cells: Vec<T>) -> Result<Self> {
        if cells.len() != width * NUM_PITCHES {
            return Err(Error::Shape(format!(
                "{} cells cannot form a {NUM_PITCHES}x{width} roll",
                cells.len()
            )));
        }
        Ok(Roll { width, cells })
    }

    /// Number of time units.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn get(&self, pitch_class: usize, time_unit: usize) -> T {
        self.cells[Self::index(pitch_class, time_unit)]
    }

    pub fn set(&mut self, pitch_class: usize, time_unit: usize, value: T) {
        self.cells[Self::index(pitch_class, time_unit)] = value;
    }

    /// The keyboard state at one time unit.
    pub fn column(&self, time_unit: usize) -> &[T] {
        self.columns(time_unit, 1)
    }

    /// `len` consecutive columns starting at `start`, as one slice.
    pub fn columns(&self, start: usize, len: usize) -> &[T] {
        &self.cells[start * NUM_PITCHES..(start + len) * NUM_PITCHES]
    }

    fn index(pitch_class: usize, time_unit: usize) -> usize {
        debug_assert!(pitch_class < NUM_PITCHES);
        time_unit * NUM_PITCHES + pitch_class
    }
}

impl<T: Copy + Default + Into<f64>> Roll<T> {
    /// Every `(pitch_class, time_unit)` above the activation threshold.
    pub fn active_cells(&self) -> BTreeSet<(usize, usize)> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, v)| Into::<f64>::into(**v) > ACTIVATION_THRESHOLD)
            .map(|(i, _)| (i % NUM_PITCHES, i / NUM_PITCHES))
            .collect()
    }
}

/// Map a MIDI pitch to its row in the roll.
pub fn pitch_class(pitch: u8) -> Result<usize> {
    if (LOWEST_PITCH..=HIGHEST_PITCH).contains(&pitch) {
        Ok((pitch - LOWEST_PITCH) as usize)
    } else {
        Err(Error::Range(pitch as i64))
    }
}

/// Map a roll row back to its MIDI pitch.
pub fn pitch_from_class(class: usize) -> Result<u8> {
    if class < NUM_PITCHES {
        Ok(LOWEST_PITCH + class as u8)
    } else {
        Err(Error::Range(class as i64 + LOWEST_PITCH as i64))
    }
}

/// Ticks per grid unit for a score at `ticks_per_beat`.
pub fn scale_factor(ticks_per_beat: u16) -> Result<u32> {
    let ticks_per_bar = 4 * ticks_per_beat as u32;
    if ticks_per_bar == 0 || ticks_per_bar % GRID_DIVISOR != 0 {
        return Err(Error::Configuration(format!(
            "{ticks_per_beat} ticks per beat cannot be quantized to 1/{GRID_DIVISOR} notes \
             without a remainder"
        )));
    }
    Ok(ticks_per_bar / GRID_DIVISOR)
}

/// Encode a score as a binary piano roll.
pub fn encode(score: &Score) -> Result<PianoRoll> {
    let scale = scale_factor(score.ticks_per_beat)? as u64;
    let width = score.length_ticks().div_ceil(scale) as usize;

    let mut roll = PianoRoll::zeros(width);
    for note in score.notes() {
        let class = pitch_class(note.pitch)?;
        roll.set(class, (note.tick as u64 / scale) as usize, 1);
    }
    Ok(roll)
}

/// Decode a roll (binary or activations) into a single-track score.
pub fn decode<T: Copy + Default + Into<f64>>(roll: &Roll<T>) -> Score {
    let notes = roll
        .active_cells()
        .into_iter()
        .map(|(class, time_unit)| (time_unit, class))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|(time_unit, class)| Note {
            pitch: LOWEST_PITCH + class as u8,
            tick: time_unit as u32 * DEFAULT_SCALE,
            duration: DEFAULT_NOTE_DURATION,
        })
        .collect();

    Score::new(DEFAULT_TICKS_PER_BEAT, vec![Track { notes }])
}
