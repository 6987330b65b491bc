//! Local LLM Manager - on-device model lifecycle and generation dispatch
//!
//! Manages a single local language-model artifact through download, load and
//! unload, and streams generations from a native inference engine or, when
//! none is usable, from a deterministic keyword-rule responder.

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod models;
pub mod sink;
pub mod state;

pub use backend::{ActivePath, BackendCapability, BackendStatus, InferenceBackendAdapter, NativeEngine};
pub use config::{FallbackConfig, ManagerConfig};
pub use dispatcher::{CommandHandler, CommandOutcome, ControlPermission, GenerationDispatcher, PromptTemplate};
pub use error::{
    DownloadError, GenerationError, InvalidTransition, LifecycleError, LifecycleResult, LoadError,
};
pub use lifecycle::{LifecycleEvent, LifecycleStateMachine, ModelState, StateChange};
pub use manager::{LifecycleManager, LoadTarget, ManagerStatus};
pub use models::{DownloadCoordinator, LocalArtifact, ModelDescriptor, ModelRegistry};
pub use sink::{ChannelSink, GenerationEvent, TerminalGuard, TokenSink};
pub use state::{PersistedConfig, PersistenceStore};
