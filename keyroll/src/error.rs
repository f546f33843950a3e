// Error taxonomy for the whole pipeline.
//
// Startup-fatal: `Configuration` (bad policy parameters, non-integer
// quantization scale), `NotImplemented` (recognized but unbuilt policy
// variants), `EmptyCorpus`. Data-pipeline preconditions: `VersionMismatch`,
// `InsufficientLength`. Contract violations: `Range`, `Shape`, `Mode`.
// `Parse` is the only variant recovered locally, by the corpus builder,
// which logs and skips the offending score.

use std::path::PathBuf;

use crate::driver::Mode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("corpus version {found:?} does not match expected {expected:?}")]
    VersionMismatch { expected: String, found: String },

    #[error("empty corpus: no score could be loaded")]
    EmptyCorpus,

    #[error("roll {index} is {width} units wide, shorter than a {window_len}-unit window")]
    InsufficientLength {
        index: usize,
        width: usize,
        window_len: usize,
    },

    #[error("pitch {0} is outside the representable keyboard range")]
    Range(i64),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("{0} is not implemented yet")]
    NotImplemented(&'static str),

    #[error("{operation} is not available in {mode:?} mode")]
    Mode { operation: &'static str, mode: Mode },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("render error: {0}")]
    Render(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("corpus serialization: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
