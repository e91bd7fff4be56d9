use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Custom error types for the miresearch library
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Subject identifier could not be parsed
    #[error("Invalid subject identifier '{id}': {reason}")]
    Format { id: String, reason: String },

    /// No unique subject prefix could be guessed from a root directory
    #[error("Cannot determine subject prefix in {root}: {reason}")]
    AmbiguousPrefix { root: PathBuf, reason: String },

    /// Directory operation on a subject whose top directory does not exist
    #[error("Subject directory does not exist: {0}")]
    Structure(PathBuf),

    /// Create or rename target already exists
    #[error("Target already exists: {0}")]
    Conflict(PathBuf),

    /// Expected source path is missing
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    /// Metadata cache file present but unreadable or corrupt
    #[error("Cannot read metadata file {path}: {reason}")]
    MetadataIo { path: PathBuf, reason: String },

    /// Reserved metadata tag given a value of the wrong shape
    #[error("Invalid value for tag {tag}: {reason}")]
    InvalidTag { tag: String, reason: String },

    /// Load source archive could not be unpacked
    #[error("Cannot unpack {path}: {reason}")]
    Archive { path: PathBuf, reason: String },

    /// DICOM toolkit failure
    #[error("DICOM processing error: {0}")]
    Dicom(String),

    /// Invalid configuration error
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl Error {
    pub(crate) fn format(id: &str, reason: impl Into<String>) -> Self {
        Error::Format {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}
