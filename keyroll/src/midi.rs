// Standard MIDI File input and output.
//
// `MidiScoreReader` turns an SMF into a `Score` for the corpus builder.
// Only metrical timing (ticks per quarter note) can be quantized; SMPTE
// timecode files are rejected as parse failures so the builder skips them.
// Keys outside the 88-key range make the whole file unreadable, so one
// stray note skips the score instead of failing the corpus build.
// Note durations come from pairing NoteOn with the next NoteOff (or NoteOn
// at velocity 0) on the same channel and key. A retriggered key closes the
// sounding note first; notes still open at the end of a track end at its
// last event.
//
// `MidiRecorder` writes a decoded score back out as a single-track SMF at the
// score's own resolution.
//
// Uses the `midly` crate for both directions.

use std::path::Path;

use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u28},
};

use crate::error::{Error, Result};
use crate::pianoroll::{HIGHEST_PITCH, LOWEST_PITCH};
use crate::render::{InputKind, Recorder, Rendered, with_extension};
use crate::score::{Note, Score, ScoreParser, Track};

const CHANNELS: usize = 16;
const KEYS: usize = 128;

/// Velocity of every note written by `MidiRecorder`.
const NOTE_VELOCITY: u8 = 80;
/// Largest values the u15 division and u28 delta fields can hold.
const MAX_TICKS_PER_BEAT: u16 = (1 << 15) - 1;
const MAX_DELTA: u32 = (1 << 28) - 1;

/// Reads `.mid` files with midly.
#[derive(Debug, Clone, Copy, Default)]
pub struct MidiScoreReader;

impl MidiScoreReader {
    /// Parse an in-memory SMF. `path` is only used for error reporting.
    pub fn parse_bytes(&self, bytes: &[u8], path: &Path) -> Result<Score> {
        let parse_error = |reason: String| Error::Parse {
            path: path.to_path_buf(),
            reason,
        };
        let smf = Smf::parse(bytes).map_err(|e| parse_error(e.to_string()))?;
        let ticks_per_beat = match smf.header.timing {
            Timing::Metrical(ticks) => ticks.as_int(),
            Timing::Timecode(fps, subframe) => {
                return Err(parse_error(format!(
                    "timecode timing ({fps:?}, {subframe} subframes) cannot be quantized"
                )));
            }
        };

        let tracks = smf.tracks.iter().map(|events| read_track(events)).collect();
        let score = Score::new(ticks_per_beat, tracks);
        if let Some(note) = score
            .notes()
            .find(|n| !(LOWEST_PITCH..=HIGHEST_PITCH).contains(&n.pitch))
        {
            return Err(parse_error(format!(
                "note out of range: key {} at tick {}",
                note.pitch, note.tick
            )));
        }
        Ok(score)
    }
}

impl ScoreParser for MidiScoreReader {
    fn parse(&self, path: &Path) -> Result<Score> {
        let bytes = std::fs::read(path).map_err(|e| Error::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        self.parse_bytes(&bytes, path)
    }
}

/// Open notes of one track, keyed by channel and key.
struct NoteTracker {
    notes: Vec<Note>,
    active: Vec<Option<u32>>,
    current_tick: u32,
}

impl NoteTracker {
    fn new() -> Self {
        NoteTracker {
            notes: Vec::new(),
            active: vec![None; CHANNELS * KEYS],
            current_tick: 0,
        }
    }

    fn advance(&mut self, delta: u32) {
        self.current_tick = self.current_tick.saturating_add(delta);
    }

    fn note_on(&mut self, channel: u8, key: u8) {
        self.note_off(channel, key);
        self.active[slot(channel, key)] = Some(self.current_tick);
    }

    fn note_off(&mut self, channel: u8, key: u8) {
        if let Some(start) = self.active[slot(channel, key)].take() {
            self.notes.push(Note {
                pitch: key,
                tick: start,
                duration: self.current_tick - start,
            });
        }
    }

    fn finish(mut self) -> Track {
        let end = self.current_tick;
        for (i, start) in self.active.iter_mut().enumerate() {
            if let Some(start) = start.take() {
                self.notes.push(Note {
                    pitch: (i % KEYS) as u8,
                    tick: start,
                    duration: end - start,
                });
            }
        }
        self.notes.sort_by_key(|n| (n.tick, n.pitch));
        Track { notes: self.notes }
    }
}

fn slot(channel: u8, key: u8) -> usize {
    channel as usize * KEYS + key as usize
}

fn read_track(events: &[TrackEvent<'_>]) -> Track {
    let mut tracker = NoteTracker::new();
    for event in events {
        tracker.advance(event.delta.as_int());
        if let TrackEventKind::Midi { channel, message } = &event.kind {
            let channel = channel.as_int();
            match message {
                MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                    tracker.note_on(channel, key.as_int())
                }
                MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                    tracker.note_off(channel, key.as_int())
                }
                _ => {}
            }
        }
    }
    tracker.finish()
}

/// Writes decoded scores as `.mid` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct MidiRecorder;

impl Recorder for MidiRecorder {
    fn input_kind(&self) -> InputKind {
        InputKind::Song
    }

    fn write(&self, input: Rendered<'_>, base_path: &Path) -> Result<()> {
        let Rendered::Song(score) = input else {
            return Err(Error::Render("MIDI recorder expects a decoded score".into()));
        };
        let mut buf = Vec::new();
        score_to_smf(score)?
            .write(&mut buf)
            .map_err(|e| Error::Render(e.to_string()))?;
        std::fs::write(with_extension(base_path, "mid"), &buf)?;
        Ok(())
    }
}

/// Flatten every track of `score` into one SMF track.
fn score_to_smf(score: &Score) -> Result<Smf<'static>> {
    if score.ticks_per_beat == 0 || score.ticks_per_beat > MAX_TICKS_PER_BEAT {
        return Err(Error::Render(format!(
            "{} ticks per beat cannot be written as metrical timing",
            score.ticks_per_beat
        )));
    }
    let mut smf = Smf::new(Header::new(
        Format::SingleTrack,
        Timing::Metrical(u15::new(score.ticks_per_beat)),
    ));

    // (tick, is_on, key). Offs sort before ons at the same tick so a
    // repeated key is released before it is struck again.
    let mut timeline: Vec<(u64, bool, u8)> = Vec::with_capacity(2 * score.note_count());
    for note in score.notes() {
        if note.pitch as usize >= KEYS {
            return Err(Error::Range(note.pitch as i64));
        }
        timeline.push((note.tick as u64, true, note.pitch));
        timeline.push((note.tick as u64 + note.duration as u64, false, note.pitch));
    }
    timeline.sort_unstable();

    let channel = u4::new(0);
    let mut track = Vec::with_capacity(timeline.len() + 1);
    let mut last_tick = 0u64;
    for (tick, is_on, key) in timeline {
        let delta = u32::try_from(tick - last_tick)
            .ok()
            .filter(|&d| d <= MAX_DELTA)
            .ok_or_else(|| Error::Render(format!("gap of {} ticks is too long", tick - last_tick)))?;
        let key = u7::new(key);
        let message = if is_on {
            MidiMessage::NoteOn {
                key,
                vel: u7::new(NOTE_VELOCITY),
            }
        } else {
            MidiMessage::NoteOff {
                key,
                vel: u7::new(0),
            }
        };
        track.push(TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi { channel, message },
        });
        last_tick = tick;
    }
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    smf.tracks.push(track);
    Ok(smf)
}
