//! Crate-level error types.
//!
//! Only construction-time and storage failures are errors. Per-frame
//! tracking failures are reported through [`crate::tracking::TrackingState`].

use thiserror::Error;

use crate::storage::StorageError;
use crate::vocabulary::VocabularyError;

/// Invalid or unreadable session configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid camera calibration: {0}")]
    InvalidCalibration(String),
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("no vocabulary_path configured")]
    MissingVocabulary,
}

/// Errors surfaced by [`crate::system::SlamSystem`].
#[derive(Debug, Error)]
pub enum SlamError {
    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("extractor is fixed for the session ({current}), cannot switch to {requested}")]
    ExtractorLocked { current: String, requested: String },
    #[error("failed to spawn local mapping thread: {0}")]
    Thread(std::io::Error),
}
