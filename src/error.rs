use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Errors surfaced by the embedding analysis pipeline. Every variant is fatal to a run.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Low-level IO failures while touching the filesystem.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// No checkpoint in the model folder matches the naming convention.
    #[error("no checkpoint matching {pattern} in {dir}")]
    CheckpointNotFound { dir: PathBuf, pattern: String },
    /// More than one checkpoint matches; the run cannot pick one.
    #[error("ambiguous checkpoint in {dir}: {candidates:?}")]
    AmbiguousCheckpoint { dir: PathBuf, candidates: Vec<String> },
    /// The data folder holds no pose-tracking files.
    #[error("no pose tracks found under {0}")]
    NoPoseData(PathBuf),
    /// Tracks within one run disagree on frame, keypoint or coordinate count.
    #[error("inconsistent pose track {source_name}: expected {expected}, found {found}")]
    InconsistentTracks {
        source_name: String,
        expected: String,
        found: String,
    },
    /// Two tracks share a recording name, so frames could not be traced back.
    #[error("recording name {source_name:?} is used by both {first} and {second}")]
    DuplicateSourceName {
        source_name: String,
        first: String,
        second: String,
    },
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// More sampled frames requested than the frame table holds.
    #[error("requested {requested} sampled frames but only {available} are available")]
    InsufficientFrames { requested: usize, available: usize },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// An environment variable could not be parsed.
    #[error("invalid config {key}: {message}")]
    InvalidConfig { key: String, message: String },
    /// Checkpoint loading or inference failed inside burn.
    #[error("model error: {0}")]
    Model(String),
    /// Reading or writing npy/npz/json artifacts failed.
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("projection failed: {0}")]
    Projection(String),
    #[error("clustering failed: {0}")]
    Clustering(String),
    #[error("render failed: {0}")]
    Render(String),
}

impl From<serde_json::Error> for AnalysisError {
    fn from(err: serde_json::Error) -> Self {
        AnalysisError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_frames_message_names_both_counts() {
        let err = AnalysisError::InsufficientFrames {
            requested: 5000,
            available: 1000,
        };
        let message = err.to_string();
        assert!(message.contains("5000"));
        assert!(message.contains("1000"));
    }

    #[test]
    fn ambiguous_checkpoint_lists_candidates() {
        let err = AnalysisError::AmbiguousCheckpoint {
            dir: PathBuf::from("/models/bams"),
            candidates: vec!["bams-a.mpk".into(), "bams-b.mpk".into()],
        };
        let message = err.to_string();
        assert!(message.contains("bams-a.mpk"));
        assert!(message.contains("bams-b.mpk"));
    }

    #[test]
    fn io_errors_convert() {
        let err: AnalysisError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, AnalysisError::Io(_)));
    }
}
