//! Configuration structures and loading logic

use crate::models::ModelDescriptor;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directory holding downloaded model artifacts
    pub models_dir: PathBuf,
    /// Key-value file recording the last loaded model
    pub state_file: PathBuf,
    /// Artifact shipped with the installation, copied into `models_dir` on first run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundled_model: Option<PathBuf>,
    /// Layers offloaded to the GPU by the native engine
    pub gpu_layers: u32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub default_max_tokens: u32,
    pub default_temperature: f32,
    pub system_prompt: String,
    pub fallback: FallbackConfig,
    /// Model catalog
    pub models: Vec<ModelDescriptor>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            state_file: default_state_file(),
            bundled_model: None,
            gpu_layers: 0,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            default_max_tokens: default_max_tokens(),
            default_temperature: default_temperature(),
            system_prompt: default_system_prompt(),
            fallback: FallbackConfig::default(),
            models: ModelDescriptor::default_catalog(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(dir) = std::env::var("LOCAL_LLM_MODELS_DIR") {
            config.models_dir = PathBuf::from(dir);
        }
        if let Ok(state_file) = std::env::var("LOCAL_LLM_STATE_FILE") {
            config.state_file = PathBuf::from(state_file);
        }
        if let Ok(bundled) = std::env::var("LOCAL_LLM_BUNDLED_MODEL") {
            config.bundled_model = Some(PathBuf::from(bundled));
        }
        if let Ok(layers) = std::env::var("LOCAL_LLM_GPU_LAYERS") {
            config.gpu_layers = layers
                .parse()
                .context("Invalid LOCAL_LLM_GPU_LAYERS value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            anyhow::bail!("Download timeouts must be non-zero");
        }
        if !(0.0..=2.0).contains(&self.default_temperature) {
            anyhow::bail!(
                "Default temperature must be within [0, 2] (got {})",
                self.default_temperature
            );
        }

        let fallback = &self.fallback;
        if fallback.chunk_min == 0 || fallback.chunk_min > fallback.chunk_max {
            anyhow::bail!(
                "Invalid fallback chunk bounds {}..={}",
                fallback.chunk_min,
                fallback.chunk_max
            );
        }
        if fallback.delay_min_ms > fallback.delay_max_ms {
            anyhow::bail!(
                "Invalid fallback delay bounds {}..={} ms",
                fallback.delay_min_ms,
                fallback.delay_max_ms
            );
        }

        let mut names = HashSet::new();
        for model in &self.models {
            if model.name.is_empty() {
                anyhow::bail!("Model name cannot be empty");
            }
            if !crate::models::storage::is_artifact_name(&model.name) {
                anyhow::bail!(
                    "Model name '{}' must be a plain file name ending in .gguf or .bin",
                    model.name
                );
            }
            if model.context_length == 0 {
                anyhow::bail!("Model '{}' context length must be positive", model.name);
            }
            if !names.insert(&model.name) {
                anyhow::bail!("Duplicate model name: {}", model.name);
            }
        }

        if let Some(parent) = self.state_file.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create state file directory: {:?}", parent))?;
        }

        Ok(())
    }
}

/// Pacing of the fallback responder's simulated token stream
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FallbackConfig {
    pub chunk_min: usize,
    pub chunk_max: usize,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            chunk_min: 2,
            chunk_max: 4,
            delay_min_ms: 20,
            delay_max_ms: 60,
        }
    }
}

// Default functions
fn data_root() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("local-llm"))
        .unwrap_or_else(|| PathBuf::from("/tmp/local-llm"))
}
fn default_models_dir() -> PathBuf {
    data_root().join("models")
}
fn default_state_file() -> PathBuf {
    data_root().join("state.toml")
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_read_timeout() -> u64 {
    60
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.7
}
fn default_system_prompt() -> String {
    "You are a helpful assistant running entirely on this device. Answer concisely.".to_string()
}
