//! Error types.
//!
//! Library code returns [`FitError`]; the binary converts it into [`AppError`],
//! which carries the process exit code.

use std::path::PathBuf;

use crate::domain::Field;

/// Errors raised by the data, stack, fitting and persistence layers.
#[derive(Debug, thiserror::Error)]
pub enum FitError {
    /// An expected data container field is absent.
    #[error("Data container has no `{field}` field.")]
    MissingField { field: Field },

    /// The requested setup cannot produce a meaningful fit.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Array shapes disagree with each other or with the module parameters.
    #[error("Shape mismatch: {0}")]
    Shape(String),

    /// A model name contains a keyword we do not know how to build.
    #[error("Unknown model keyword `{0}`.")]
    UnknownKeyword(String),

    /// A job for the same cell/batch/model is already waiting or running.
    #[error("Job `{note}` is already queued (id {id}).")]
    DuplicateJob { note: String, id: u64 },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in '{}': {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl FitError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FitError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        FitError::Json {
            path: path.into(),
            source,
        }
    }

    /// Process exit code used when this error reaches `main`.
    pub fn exit_code(&self) -> u8 {
        match self {
            FitError::Configuration(_) | FitError::UnknownKeyword(_) => 2,
            FitError::MissingField { .. } | FitError::Shape(_) => 3,
            FitError::DuplicateJob { .. } => 4,
            FitError::Io { .. } | FitError::Json { .. } => 5,
        }
    }
}

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl From<FitError> for AppError {
    fn from(err: FitError) -> Self {
        AppError::new(err.exit_code(), err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}
