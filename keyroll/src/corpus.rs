// Persisted collection of encoded piano rolls.
//
// The corpus is built once from a directory of score files, shuffled, and
// saved with a format version tag. Later runs restore it from disk and never
// rebuild unless the file is missing. A stored tag that differs from the
// expected one is rejected outright; there is no migration path.
//
// The train/test split is positional (`floor(ratio * len)`), so it is fixed
// by the on-disk order. That is why the shuffle happens before the first
// save and never at load time.
//
// Building fans out over scores with rayon: parsing and encoding are
// independent per file and side-effect free, and `collect` keeps input
// order. Scores that fail to parse are logged and skipped; an encoding
// failure aborts the build.
//
// On-disk format: bincode of `{ version: String, rolls: Vec<PianoRoll> }`,
// written to a `.partial` sibling and renamed into place.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use keyroll_prng::SeededRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::pianoroll::{PianoRoll, encode};
use crate::score::{Score, ScoreParser};

/// Extension of the score files picked up by `build_from_dir`.
pub const SCORE_FILE_EXT: &str = "mid";

/// A score handed to the builder, or the reason it could not be read.
#[derive(Debug)]
pub struct ScoreSource {
    pub name: String,
    pub score: Result<Score>,
}

/// Versioned collection of piano rolls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Corpus {
    version: String,
    rolls: Vec<PianoRoll>,
}

/// Width summary over the rolls of a corpus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorpusStats {
    pub songs: usize,
    pub min_width: usize,
    pub max_width: usize,
    pub mean_width: f64,
}

enum Outcome {
    Loaded {
        roll: PianoRoll,
        tracks: usize,
        notes: usize,
        ticks_per_beat: u16,
    },
    Skipped(Error),
}

impl Corpus {
    pub fn new(version: impl Into<String>, rolls: Vec<PianoRoll>) -> Self {
        Corpus {
            version: version.into(),
            rolls,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn rolls(&self) -> &[PianoRoll] {
        &self.rolls
    }

    pub fn len(&self) -> usize {
        self.rolls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rolls.is_empty()
    }

    /// Encode every readable score. Unreadable ones are logged and skipped.
    pub fn build(version: impl Into<String>, sources: Vec<ScoreSource>) -> Result<Self> {
        let outcomes: Vec<(String, Result<Outcome>)> = sources
            .into_par_iter()
            .map(|source| {
                let outcome = match source.score {
                    Ok(score) => encode(&score).map(|roll| Outcome::Loaded {
                        roll,
                        tracks: score.tracks.len(),
                        notes: score.note_count(),
                        ticks_per_beat: score.ticks_per_beat,
                    }),
                    Err(err) => Ok(Outcome::Skipped(err)),
                };
                (source.name, outcome)
            })
            .collect();

        let mut rolls = Vec::with_capacity(outcomes.len());
        for (name, outcome) in outcomes {
            let outcome =
                outcome.inspect_err(|err| error!(file = %name, %err, "failed to encode song"))?;
            match outcome {
                Outcome::Loaded {
                    roll,
                    tracks,
                    notes,
                    ticks_per_beat,
                } => {
                    info!(file = %name, tracks, notes, ticks_per_beat, "song loaded");
                    rolls.push(roll);
                }
                Outcome::Skipped(err) => warn!(file = %name, %err, "file ignored"),
            }
        }

        if rolls.is_empty() {
            return Err(Error::EmptyCorpus);
        }
        Ok(Corpus::new(version, rolls))
    }

    /// Parse and encode every `.mid` file directly inside `dir`, in path
    /// order.
    pub fn build_from_dir<P: ScoreParser + Sync>(
        version: impl Into<String>,
        dir: &Path,
        parser: &P,
    ) -> Result<Self> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == SCORE_FILE_EXT) {
                paths.push(path);
            }
        }
        paths.sort();
        info!(dir = %dir.display(), files = paths.len(), "creating dataset");

        let sources = paths
            .par_iter()
            .map(|path| ScoreSource {
                name: path.display().to_string(),
                score: parser.parse(path),
            })
            .collect();
        Self::build(version, sources)
    }

    /// Read a saved corpus. `Ok(None)` when there is no file at `path`.
    pub fn load(path: &Path, expected_version: &str) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        // The tag is the first field; check it before decoding the rolls so
        // an older layout fails as a version mismatch, not a decode error.
        let found: String = bincode::deserialize(&bytes)?;
        if found != expected_version {
            return Err(Error::VersionMismatch {
                expected: expected_version.to_string(),
                found,
            });
        }

        let corpus: Corpus = bincode::deserialize(&bytes)?;
        info!(path = %path.display(), songs = corpus.len(), "dataset restored");
        Ok(Some(corpus))
    }

    /// Write atomically: serialize to a sibling file, then rename over `path`.
    ///
    /// Callers must shuffle before the first save; the split depends on the
    /// stored order.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut partial = OsString::from(path.as_os_str());
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        if let Err(err) = fs::write(&partial, bincode::serialize(self)?) {
            let _ = fs::remove_file(&partial);
            return Err(err.into());
        }
        fs::rename(&partial, path)?;
        info!(path = %path.display(), songs = self.len(), "dataset saved");
        Ok(())
    }

    /// Restore the corpus at `samples_path`, or build it from `midi_dir`,
    /// shuffle it and save it there.
    pub fn restore_or_build<P: ScoreParser + Sync>(
        samples_path: &Path,
        version: &str,
        midi_dir: &Path,
        parser: &P,
        rng: &mut SeededRng,
    ) -> Result<Self> {
        if let Some(corpus) = Self::load(samples_path, version)? {
            return Ok(corpus);
        }
        info!(path = %samples_path.display(), "training samples not found");
        let mut corpus = Self::build_from_dir(version, midi_dir, parser)?;
        corpus.shuffle(rng);
        corpus.save(samples_path)?;
        Ok(corpus)
    }

    pub fn shuffle(&mut self, rng: &mut SeededRng) {
        rng.shuffle(&mut self.rolls);
    }

    /// `(train, test)`: the first `floor(train_ratio * len)` rolls, then the rest.
    pub fn split(&self, train_ratio: f64) -> (&[PianoRoll], &[PianoRoll]) {
        self.rolls.split_at(split_index(self.rolls.len(), train_ratio))
    }

    pub fn stats(&self) -> Option<CorpusStats> {
        let widths = self.rolls.iter().map(PianoRoll::width);
        let min_width = widths.clone().min()?;
        let max_width = widths.clone().max()?;
        let total: usize = widths.sum();
        Some(CorpusStats {
            songs: self.rolls.len(),
            min_width,
            max_width,
            mean_width: total as f64 / self.rolls.len() as f64,
        })
    }
}

/// Index of the first test roll.
pub(crate) fn split_index(len: usize, train_ratio: f64) -> usize {
    ((train_ratio * len as f64).floor() as usize).min(len)
}
