//! Error types for fieldmap selection and sidecar correction.
//!
//! Errors fall into two groups. Variants such as [`SefmError::MismatchedPolarityCount`]
//! or [`SefmError::DegenerateVolume`] abort the current (subject, session) unit of
//! work; the driver records them and moves on. [`SefmError::MalformedSidecar`] is
//! raised by the sidecar primitives but caught by the dataset-wide correction
//! passes, which log and skip the file.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout `sefm-core`.
pub type Result<T> = std::result::Result<T, SefmError>;

#[derive(Error, Debug)]
pub enum SefmError {
    /// AP and PA fieldmap counts differ for one session.
    #[error("mismatched number of SEFMs: {ap} AP vs {pa} PA")]
    MismatchedPolarityCount { ap: usize, pa: usize },

    /// No fieldmaps of one polarity were found.
    #[error("no {polarity} fieldmaps found")]
    EmptyPolarity { polarity: &'static str },

    /// Eta-squared denominator is zero (both volumes uniform at the same value).
    #[error("degenerate volume pair: total sum of squares is zero")]
    DegenerateVolume,

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("cannot average an empty set of volumes")]
    EmptyInput,

    /// Splitting a concatenated fieldmap needs a functional image to realign onto.
    #[error("no functional reference image for sub-{subject}")]
    MissingFunctionalReference { subject: String },

    #[error("splitting {path} produced {found} volume(s), expected 2")]
    SplitFailed { path: PathBuf, found: usize },

    /// External imaging tool exited unsuccessfully.
    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("malformed sidecar {path}: {reason}")]
    MalformedSidecar { path: PathBuf, reason: String },

    #[error("NIfTI error in {path}: {reason}")]
    Nifti { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SefmError {
    /// Whether this error aborts the whole session rather than one file.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, Self::MalformedSidecar { .. })
    }
}
