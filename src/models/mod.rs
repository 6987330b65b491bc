//! Model management module
//!
//! Provides functionality for:
//! - The static catalog of known model artifacts
//! - Listing and seeding artifacts in the models directory
//! - Downloading artifacts over HTTP with progress reporting

pub mod download;
pub mod registry;
pub mod storage;

pub use download::{DownloadCoordinator, DownloadSession, PROGRESS_INDETERMINATE, ProgressReporter};
pub use registry::{ModelDescriptor, ModelRegistry};
pub use storage::{LocalArtifact, has_model_extension, is_artifact_name, list_artifacts};
