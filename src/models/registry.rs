//! Static catalog of known model artifacts

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Immutable description of a downloadable model artifact
///
/// `name` is both the identity and the on-disk filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub display_name: String,
    pub download_url: String,
    /// Expected artifact size, used when the server omits `Content-Length`
    pub size_bytes: u64,
    pub context_length: u32,
    #[serde(default)]
    pub description: String,
}

impl ModelDescriptor {
    /// Built-in catalog used when the configuration does not supply one
    pub fn default_catalog() -> Vec<Self> {
        vec![
            Self {
                name: "qwen2-0_5b-instruct-q8_0.gguf".to_string(),
                display_name: "Qwen2 0.5B Instruct (Q8_0)".to_string(),
                download_url: "https://huggingface.co/Qwen/Qwen2-0.5B-Instruct-GGUF/resolve/main/qwen2-0_5b-instruct-q8_0.gguf".to_string(),
                size_bytes: 531_000_000,
                context_length: 2048,
                description: "Smallest option, fast on any device".to_string(),
            },
            Self {
                name: "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf".to_string(),
                display_name: "TinyLlama 1.1B Chat (Q4_K_M)".to_string(),
                download_url: "https://huggingface.co/TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF/resolve/main/tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf".to_string(),
                size_bytes: 668_788_096,
                context_length: 2048,
                description: "General chat, low memory footprint".to_string(),
            },
            Self {
                name: "DeepSeek-R1-Distill-Qwen-1.5B-Q4_K_M.gguf".to_string(),
                display_name: "DeepSeek R1 Distill Qwen 1.5B (Q4_K_M)".to_string(),
                download_url: "https://huggingface.co/bartowski/DeepSeek-R1-Distill-Qwen-1.5B-GGUF/resolve/main/DeepSeek-R1-Distill-Qwen-1.5B-Q4_K_M.gguf".to_string(),
                size_bytes: 1_117_000_000,
                context_length: 4096,
                description: "Reasoning-tuned distillation".to_string(),
            },
            Self {
                name: "qwen2.5-1.5b-instruct-q8_0.gguf".to_string(),
                display_name: "Qwen2.5 1.5B Instruct (Q8_0)".to_string(),
                download_url: "https://huggingface.co/Qwen/Qwen2.5-1.5B-Instruct-GGUF/resolve/main/qwen2.5-1.5b-instruct-q8_0.gguf".to_string(),
                size_bytes: 1_646_000_000,
                context_length: 4096,
                description: "Best quality, needs about 2 GB of free memory".to_string(),
            },
        ]
    }
}

/// Registry of catalog entries, fixed at construction
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
    index: HashMap<String, usize>,
}

impl ModelRegistry {
    /// Create a registry from catalog entries; later duplicates are ignored
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        let mut index = HashMap::new();
        let mut unique = Vec::with_capacity(models.len());
        for model in models {
            if index.contains_key(&model.name) {
                tracing::warn!(model = %model.name, "Ignoring duplicate catalog entry");
                continue;
            }
            index.insert(model.name.clone(), unique.len());
            unique.push(model);
        }
        Self {
            models: unique,
            index,
        }
    }

    /// Get a descriptor by name
    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.index.get(name).map(|&i| &self.models[i])
    }

    /// List descriptors in catalog order
    pub fn list(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.models.len()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(ModelDescriptor::default_catalog())
    }
}
