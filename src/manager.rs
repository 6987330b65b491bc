//! Lifecycle worker
//!
//! All download, load, unload and delete operations are sent to one tokio
//! task over an mpsc queue and answered on a oneshot channel. Only one
//! mutating operation runs at any instant, so readers of the state machine
//! always observe a fully applied transition.

use crate::backend::{BackendStatus, InferenceBackendAdapter};
use crate::config::ManagerConfig;
use crate::error::{LifecycleError, LifecycleResult, LoadError};
use crate::lifecycle::{LifecycleEvent, LifecycleStateMachine, ModelState, StateChange};
use crate::models::download::{DownloadCoordinator, DownloadSession};
use crate::models::registry::ModelRegistry;
use crate::models::storage::{self, LocalArtifact};
use crate::state::{PersistedConfig, PersistenceStore};
use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Context length used for artifacts that are not in the catalog
pub const DEFAULT_CONTEXT_LENGTH: u32 = 2048;

const COMMAND_QUEUE_DEPTH: usize = 16;

/// What to load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadTarget {
    /// The persisted model, else the first local artifact
    Auto,
    /// A catalog entry or local artifact by file name
    Named(String),
    /// An explicit file path
    Path(PathBuf),
}

/// Combined view for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub state: ModelState,
    pub last_error: Option<String>,
    pub current_model: Option<PathBuf>,
    pub backend: BackendStatus,
}

enum Command {
    Download {
        session: DownloadSession,
        progress: Option<mpsc::UnboundedSender<i32>>,
        respond_to: oneshot::Sender<LifecycleResult<PathBuf>>,
    },
    Load {
        target: LoadTarget,
        respond_to: oneshot::Sender<LifecycleResult<PathBuf>>,
    },
    Unload {
        respond_to: oneshot::Sender<LifecycleResult<()>>,
    },
    Delete {
        name: String,
        respond_to: oneshot::Sender<LifecycleResult<()>>,
    },
}

pub struct LifecycleManager {
    tx: mpsc::Sender<Command>,
    inner: Arc<Inner>,
}

struct Inner {
    models_dir: PathBuf,
    registry: Arc<ModelRegistry>,
    state: Arc<LifecycleStateMachine>,
    downloader: DownloadCoordinator,
    backend: Arc<InferenceBackendAdapter>,
    store: Arc<PersistenceStore>,
    /// Persisted record as read at startup
    startup: PersistedConfig,
    current_model: RwLock<Option<PathBuf>>,
}

impl LifecycleManager {
    /// Prepare the models directory, read persisted state and spawn the worker
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        config: &ManagerConfig,
        registry: Arc<ModelRegistry>,
        backend: Arc<InferenceBackendAdapter>,
        store: Arc<PersistenceStore>,
    ) -> anyhow::Result<Self> {
        let models_dir = config.models_dir.clone();
        tokio::fs::create_dir_all(&models_dir)
            .await
            .with_context(|| format!("Failed to create models directory: {:?}", models_dir))?;

        if let Some(bundled) = &config.bundled_model
            && let Err(e) = storage::seed_bundled(&models_dir, bundled)
        {
            tracing::warn!(
                bundled = %bundled.display(),
                error = %e,
                "Failed to seed bundled model"
            );
        }

        let startup = match store.load().await {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::warn!(error = %e, "Persisted state unreadable, using defaults");
                PersistedConfig::default()
            }
        };

        let persisted_present = startup
            .last_loaded_model_path
            .as_deref()
            .is_some_and(|p| Path::new(p).is_file());
        let initial = if storage::has_artifacts(&models_dir) || persisted_present {
            ModelState::Downloaded
        } else {
            ModelState::NotDownloaded
        };

        tracing::info!(
            models_dir = %models_dir.display(),
            initial_state = %initial,
            catalog = registry.count(),
            "Lifecycle manager starting"
        );

        let inner = Arc::new(Inner {
            downloader: DownloadCoordinator::from_config(config)?,
            models_dir,
            registry,
            state: Arc::new(LifecycleStateMachine::new(initial)),
            backend,
            store,
            startup,
            current_model: RwLock::new(None),
        });

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        tokio::spawn(run_worker(rx, Arc::clone(&inner)));

        Ok(Self { tx, inner })
    }

    /// Load the persisted model if autoload is on and the file still exists
    ///
    /// Returns `None` when no attempt was made.
    pub async fn autoload(&self) -> Option<LifecycleResult<PathBuf>> {
        let persisted = &self.inner.startup;
        if !persisted.auto_load_enabled {
            tracing::info!("Autoload disabled");
            return None;
        }
        let path = PathBuf::from(persisted.last_loaded_model_path.as_deref()?);
        if !path.is_file() {
            tracing::info!(path = %path.display(), "Persisted model missing, skipping autoload");
            return None;
        }
        tracing::info!(path = %path.display(), "Autoloading last model");
        Some(self.load(LoadTarget::Path(path)).await)
    }

    /// Download a catalog model, reporting percentages on `progress`
    ///
    /// A second download while one is live fails immediately with
    /// `AlreadyInProgress`.
    pub async fn download(
        &self,
        name: &str,
        progress: Option<mpsc::UnboundedSender<i32>>,
    ) -> LifecycleResult<PathBuf> {
        let descriptor = self
            .inner
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownModel(name.to_string()))?;
        let session = self.inner.downloader.begin(descriptor)?;
        self.submit(|respond_to| Command::Download {
            session,
            progress,
            respond_to,
        })
        .await
    }

    /// Ask the live download to stop; returns `false` if none is running
    pub fn cancel_download(&self) -> bool {
        self.inner.downloader.cancel()
    }

    pub async fn load(&self, target: LoadTarget) -> LifecycleResult<PathBuf> {
        self.submit(|respond_to| Command::Load { target, respond_to })
            .await
    }

    pub async fn unload(&self) -> LifecycleResult<()> {
        self.submit(|respond_to| Command::Unload { respond_to }).await
    }

    pub async fn delete(&self, name: &str) -> LifecycleResult<()> {
        let name = name.to_string();
        self.submit(|respond_to| Command::Delete { name, respond_to })
            .await
    }

    /// Enable or disable autoload for future starts
    pub async fn set_auto_load(&self, enabled: bool) -> LifecycleResult<()> {
        self.inner
            .store
            .set_auto_load(enabled)
            .await
            .map_err(|e| LifecycleError::Storage(e.to_string()))
    }

    pub fn state(&self) -> ModelState {
        self.inner.state.current_state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.last_error()
    }

    pub fn state_machine(&self) -> Arc<LifecycleStateMachine> {
        Arc::clone(&self.inner.state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.state.subscribe()
    }

    pub fn current_model(&self) -> Option<PathBuf> {
        self.inner.current_model()
    }

    pub fn list_local(&self) -> Vec<LocalArtifact> {
        storage::list_artifacts(&self.inner.models_dir)
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn models_dir(&self) -> &Path {
        &self.inner.models_dir
    }

    /// Persisted record as it was when the manager started
    pub fn startup_config(&self) -> &PersistedConfig {
        &self.inner.startup
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            state: self.state(),
            last_error: self.last_error(),
            current_model: self.current_model(),
            backend: self.inner.backend.status(),
        }
    }

    async fn submit<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<LifecycleResult<T>>) -> Command,
    ) -> LifecycleResult<T> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(build(respond_to))
            .await
            .map_err(|_| LifecycleError::WorkerStopped)?;
        rx.await.map_err(|_| LifecycleError::WorkerStopped)?
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Command>, inner: Arc<Inner>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Download {
                session,
                progress,
                respond_to,
            } => {
                let result = inner.download(session, progress).await;
                let _ = respond_to.send(result);
            }
            Command::Load { target, respond_to } => {
                let result = inner.load(target).await;
                let _ = respond_to.send(result);
            }
            Command::Unload { respond_to } => {
                let _ = respond_to.send(inner.unload());
            }
            Command::Delete { name, respond_to } => {
                let result = inner.delete(&name).await;
                let _ = respond_to.send(result);
            }
        }
    }
    tracing::debug!("Lifecycle worker stopped");
}

impl Inner {
    fn current_model(&self) -> Option<PathBuf> {
        self.current_model.read().ok().and_then(|p| p.clone())
    }

    fn set_current_model(&self, path: Option<PathBuf>) {
        if let Ok(mut slot) = self.current_model.write() {
            *slot = path;
        }
    }

    async fn download(
        &self,
        session: DownloadSession,
        progress: Option<mpsc::UnboundedSender<i32>>,
    ) -> LifecycleResult<PathBuf> {
        let name = session.descriptor.name.clone();
        self.state.transition(LifecycleEvent::BeginDownload)?;

        let result = self
            .downloader
            .run(session, |percent| {
                if let Some(tx) = &progress {
                    let _ = tx.send(percent);
                }
            })
            .await;

        match result {
            Ok(path) => {
                self.state.transition(LifecycleEvent::DownloadSucceeded)?;
                Ok(path)
            }
            Err(e) => {
                crate::metrics::record_download_failed(&name);
                tracing::warn!(model = %name, error = %e, "Download failed");
                self.state
                    .transition(LifecycleEvent::DownloadFailed(e.to_string()))?;
                Err(e.into())
            }
        }
    }

    async fn load(&self, target: LoadTarget) -> LifecycleResult<PathBuf> {
        let path = self.resolve(target).await?;

        if self.state.current_state() == ModelState::Ready {
            self.unload()?;
        }
        self.state.transition(LifecycleEvent::BeginLoad)?;

        let context_length = self.context_length_for(&path);
        tracing::info!(path = %path.display(), context_length, "Loading model");

        if !self.backend.load_model(&path, context_length).await {
            let message = format!("backend refused {}", path.display());
            self.state
                .transition(LifecycleEvent::LoadFailed(message.clone()))?;
            return Err(LoadError::BackendFailure(message).into());
        }

        self.state.transition(LifecycleEvent::LoadSucceeded)?;
        self.set_current_model(Some(path.clone()));
        crate::metrics::record_model_loaded(self.backend.is_degraded());

        if let Err(e) = self.store.save(&path.to_string_lossy()).await {
            tracing::warn!(error = %e, "Failed to persist last loaded model");
        }

        tracing::info!(
            path = %path.display(),
            degraded = self.backend.is_degraded(),
            "Model ready"
        );
        Ok(path)
    }

    async fn resolve(&self, target: LoadTarget) -> LifecycleResult<PathBuf> {
        let path = match target {
            LoadTarget::Path(path) => path,
            LoadTarget::Named(name) => storage::artifact_path(&self.models_dir, &name)
                .ok_or(LoadError::InvalidName(name))?,
            LoadTarget::Auto => {
                let persisted = self.store.snapshot().await.last_loaded_model_path;
                match persisted.map(PathBuf::from).filter(|p| p.is_file()) {
                    Some(path) => path,
                    None => storage::list_artifacts(&self.models_dir)
                        .into_iter()
                        .next()
                        .map(|artifact| artifact.path)
                        .ok_or(LoadError::NoModelsAvailable)?,
                }
            }
        };

        if !path.is_file() {
            return Err(LoadError::FileNotFound(path.display().to_string()).into());
        }
        Ok(path)
    }

    fn context_length_for(&self, path: &Path) -> u32 {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| self.registry.get(name))
            .map(|descriptor| descriptor.context_length)
            .unwrap_or(DEFAULT_CONTEXT_LENGTH)
    }

    fn unload(&self) -> LifecycleResult<()> {
        self.state.can_apply(&LifecycleEvent::Unload)?;
        self.backend.unload_model();
        self.state.transition(LifecycleEvent::Unload)?;
        self.set_current_model(None);
        tracing::info!("Model unloaded");
        Ok(())
    }

    async fn delete(&self, name: &str) -> LifecycleResult<()> {
        let path = storage::artifact_path(&self.models_dir, name)
            .ok_or_else(|| LoadError::InvalidName(name.to_string()))?;
        if !path.is_file() {
            return Err(LoadError::FileNotFound(path.display().to_string()).into());
        }

        let is_active = self.current_model().as_deref() == Some(path.as_path());
        match self.state.current_state() {
            ModelState::Ready if is_active => self.unload()?,
            ModelState::Ready => {}
            _ => self.state.can_apply(&LifecycleEvent::Delete)?,
        }

        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| LifecycleError::Storage(format!("{}: {e}", path.display())))?;
        tracing::info!(model = %name, "Model artifact deleted");

        let persisted = self.store.snapshot().await.last_loaded_model_path;
        if persisted.as_deref().map(Path::new) == Some(path.as_path())
            && let Err(e) = self.store.clear_last_loaded().await
        {
            tracing::warn!(error = %e, "Failed to clear persisted model");
        }

        if !storage::has_artifacts(&self.models_dir)
            && self.state.current_state() != ModelState::Ready
        {
            self.state.transition(LifecycleEvent::Delete)?;
        }
        Ok(())
    }
}
