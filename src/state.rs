//! Persistence of the last loaded model and the autoload flag

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically
    async fn save(&self, path: &Path, content: &str) -> Result<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> Result<Option<String>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
pub struct FileSystemStorage;

impl FileSystemStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileSystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create state directory")?;
        }

        // Atomic write: write to temp file, then rename
        let temp_file = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file)
            .await
            .context("Failed to create temp state file")?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write state file")?;
        file.sync_all().await.context("Failed to sync state file")?;

        fs::rename(&temp_file, path)
            .await
            .context("Failed to rename temp state file")?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read state file: {:?}", path))?;

        Ok(Some(content))
    }
}

// ============================================================================
// Persisted record
// ============================================================================

/// Key-value record written on every successful load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(rename = "last_loaded_model", skip_serializing_if = "Option::is_none")]
    pub last_loaded_model_path: Option<String>,
    /// Epoch milliseconds of the last successful load
    #[serde(rename = "last_load_time", skip_serializing_if = "Option::is_none")]
    pub last_load_time_ms: Option<i64>,
    #[serde(rename = "auto_load_model", default = "default_auto_load")]
    pub auto_load_enabled: bool,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self {
            last_loaded_model_path: None,
            last_load_time_ms: None,
            auto_load_enabled: default_auto_load(),
        }
    }
}

fn default_auto_load() -> bool {
    true
}

// ============================================================================
// Persistence Store with Dependency Injection
// ============================================================================

/// Durable record of the last loaded model path and the autoload flag
pub struct PersistenceStore {
    state_file: PathBuf,
    storage: Arc<dyn StorageBackend>,
    current: RwLock<PersistedConfig>,
}

impl PersistenceStore {
    /// Create a new store with custom storage backend
    pub fn new_with_storage(state_file: PathBuf, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            state_file,
            storage,
            current: RwLock::new(PersistedConfig::default()),
        }
    }

    /// Create a new store with default filesystem storage
    pub fn new(state_file: PathBuf) -> Self {
        Self::new_with_storage(state_file, Arc::new(FileSystemStorage::new()))
    }

    /// Read the record from storage
    ///
    /// A missing file yields the defaults. A corrupted file is an error.
    pub async fn load(&self) -> Result<PersistedConfig> {
        let content = self.storage.load(&self.state_file).await?;

        let config = match content {
            Some(c) => toml::from_str::<PersistedConfig>(&c).with_context(|| {
                format!("Failed to parse state file: {:?}", self.state_file)
            })?,
            None => {
                tracing::info!("No state file found, using defaults");
                PersistedConfig::default()
            }
        };

        tracing::debug!(
            last_loaded_model = ?config.last_loaded_model_path,
            auto_load = config.auto_load_enabled,
            "Persisted config loaded"
        );

        *self.current.write().await = config.clone();
        Ok(config)
    }

    /// Record `path` as the last loaded model, stamped with the current time
    pub async fn save(&self, path: &str) -> Result<()> {
        let mut current = self.current.write().await;
        let mut next = current.clone();
        next.last_loaded_model_path = Some(path.to_string());
        next.last_load_time_ms = Some(chrono::Utc::now().timestamp_millis());
        self.write(&next).await?;
        *current = next;

        tracing::debug!(path = %path, "Last loaded model saved");
        Ok(())
    }

    /// Enable or disable loading the last model at startup
    pub async fn set_auto_load(&self, enabled: bool) -> Result<()> {
        let mut current = self.current.write().await;
        let mut next = current.clone();
        next.auto_load_enabled = enabled;
        self.write(&next).await?;
        *current = next;
        Ok(())
    }

    /// Forget the last loaded model, keeping the autoload flag
    pub async fn clear_last_loaded(&self) -> Result<()> {
        let mut current = self.current.write().await;
        let mut next = current.clone();
        next.last_loaded_model_path = None;
        next.last_load_time_ms = None;
        self.write(&next).await?;
        *current = next;
        Ok(())
    }

    /// The record as last read or written by this process
    pub async fn snapshot(&self) -> PersistedConfig {
        self.current.read().await.clone()
    }

    async fn write(&self, config: &PersistedConfig) -> Result<()> {
        let content =
            toml::to_string_pretty(config).context("Failed to serialize state to TOML")?;
        self.storage.save(&self.state_file, &content).await
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
