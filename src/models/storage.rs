//! Models directory layout
//!
//! All artifacts live flat in one directory, named by their descriptor:
//! ```text
//! <models_dir>/
//! ├── qwen2-0_5b-instruct-q8_0.gguf
//! └── tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf
//! ```
//! Only `.gguf` and `.bin` files count as artifacts.

use serde::Serialize;
use std::path::{Component, Path, PathBuf};

const MODEL_EXTENSIONS: [&str; 2] = ["gguf", "bin"];

/// Whether a filename carries one of the accepted artifact extensions
pub fn has_model_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| MODEL_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// An artifact found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalArtifact {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Whether `name` is a bare artifact file name
///
/// Accepts a single normal path component with a model extension, so the
/// name can never resolve outside the models directory.
pub fn is_artifact_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
        && has_model_extension(name)
}

/// Path an artifact named `name` occupies inside `models_dir`
///
/// `None` when `name` is not a bare artifact file name.
pub fn artifact_path(models_dir: &Path, name: &str) -> Option<PathBuf> {
    is_artifact_name(name).then(|| models_dir.join(name))
}

/// List non-empty artifacts, sorted by name
pub fn list_artifacts(models_dir: &Path) -> Vec<LocalArtifact> {
    let mut artifacts = Vec::new();

    let Ok(entries) = std::fs::read_dir(models_dir) else {
        return artifacts;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !has_model_extension(&name) {
            continue;
        }
        if let Ok(metadata) = std::fs::metadata(&path)
            && metadata.is_file()
            && metadata.len() > 0
        {
            artifacts.push(LocalArtifact {
                name,
                path,
                size_bytes: metadata.len(),
            });
        }
    }

    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    artifacts
}

/// Whether any artifact is present
pub fn has_artifacts(models_dir: &Path) -> bool {
    !list_artifacts(models_dir).is_empty()
}

/// Copy a bundled artifact into `models_dir` unless it is already there
///
/// Returns the destination when a copy was made.
pub fn seed_bundled(models_dir: &Path, bundled: &Path) -> std::io::Result<Option<PathBuf>> {
    let Some(file_name) = bundled.file_name() else {
        return Ok(None);
    };
    if !has_model_extension(&file_name.to_string_lossy()) || !bundled.is_file() {
        tracing::warn!(bundled = ?bundled, "Bundled model missing or not a model artifact");
        return Ok(None);
    }

    let dest = models_dir.join(file_name);
    if dest.exists() {
        return Ok(None);
    }

    std::fs::create_dir_all(models_dir)?;
    let part = dest.with_extension("part");
    std::fs::copy(bundled, &part)?;
    std::fs::rename(&part, &dest)?;

    tracing::info!(dest = ?dest, "Seeded bundled model");
    Ok(Some(dest))
}
