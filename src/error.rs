//! Error types for lifecycle and generation operations

use crate::lifecycle::{LifecycleEvent, ModelState};
use thiserror::Error;

/// Failures of the model download protocol
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("a download is already in progress")]
    AlreadyInProgress,

    #[error("downloaded artifact is empty")]
    EmptyArtifact,

    #[error("more than one redirect in sequence")]
    TooManyRedirects,

    #[error("download cancelled")]
    Cancelled,

    #[error("not a model artifact name: {0}")]
    InvalidName(String),
}

/// Failures while loading a model artifact
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("inference backend failure: {0}")]
    BackendFailure(String),

    #[error("model file not found: {0}")]
    FileNotFound(String),

    #[error("no model artifacts available")]
    NoModelsAvailable,

    #[error("not a model artifact name: {0}")]
    InvalidName(String),
}

/// Failures of a generation request
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("a generation is already in progress")]
    Busy,

    #[error("backend exception: {0}")]
    BackendException(String),
}

/// An event was applied from a state that has no edge for it
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid transition: {event} from {from}")]
pub struct InvalidTransition {
    pub from: ModelState,
    pub event: LifecycleEvent,
}

/// Everything a lifecycle operation can report back to its caller
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("lifecycle worker is not running")]
    WorkerStopped,
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let err = InvalidTransition {
            from: ModelState::Ready,
            event: LifecycleEvent::BeginDownload,
        };
        assert_eq!(err.to_string(), "invalid transition: begin_download from ready");
    }

    #[test]
    fn test_lifecycle_error_from_download() {
        let err: LifecycleError = DownloadError::TooManyRedirects.into();
        assert_eq!(err, LifecycleError::Download(DownloadError::TooManyRedirects));
        assert_eq!(err.to_string(), "more than one redirect in sequence");
    }
}
