// Normalized in-memory score: tracks of absolute-tick note events.
//
// This is the boundary type between score parsing and the piano-roll codec.
// Parsers (see `midi.rs` for the SMF one) produce a `Score`; `pianoroll.rs`
// encodes it once and the score is dropped. Decoding goes the other way and
// yields a single-track score with default timing for the recorders.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One note event. `tick` is absolute from the start of the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Note {
    /// MIDI pitch number.
    pub pitch: u8,
    pub tick: u32,
    /// Length in ticks. Only used to measure the score; the roll drops it.
    pub duration: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub ticks_per_beat: u16,
    pub tracks: Vec<Track>,
}

impl Score {
    pub fn new(ticks_per_beat: u16, tracks: Vec<Track>) -> Self {
        Score {
            ticks_per_beat,
            tracks,
        }
    }

    /// End of the last sounding note, in ticks. Zero-length notes still
    /// occupy one tick so the note's own grid cell is always inside the
    /// roll.
    pub fn length_ticks(&self) -> u64 {
        self.notes()
            .map(|n| n.tick as u64 + n.duration.max(1) as u64)
            .max()
            .unwrap_or(0)
    }

    pub fn note_count(&self) -> usize {
        self.tracks.iter().map(|t| t.notes.len()).sum()
    }

    /// All notes, track by track.
    pub fn notes(&self) -> impl Iterator<Item = &Note> {
        self.tracks.iter().flat_map(|t| t.notes.iter())
    }
}

/// Turns a score file into a `Score`. Failures are reported as
/// `Error::Parse` so the corpus builder can skip the file.
pub trait ScoreParser {
    fn parse(&self, path: &Path) -> Result<Score>;
}
