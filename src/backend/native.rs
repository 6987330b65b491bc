//! Capability surface of a native inference engine
//!
//! The engine itself (llama.cpp bindings or similar) lives outside this crate.
//! All methods are blocking; the adapter runs the slow ones on the blocking
//! pool.

use std::path::Path;

/// Native inference engine as seen by the adapter
pub trait NativeEngine: Send + Sync {
    /// The engine library is present
    fn is_available(&self) -> bool;

    /// The library is functional rather than a stub build
    fn supports_real_inference(&self) -> bool;

    /// Free-form build/hardware description
    fn system_info(&self) -> String;

    /// Load the artifact at `path`. `Ok(false)` means the engine refused it.
    fn load_model(&self, path: &Path, context_length: u32, gpu_layers: u32) -> anyhow::Result<bool>;

    fn unload_model(&self);

    fn is_model_loaded(&self) -> bool;

    /// Generate a completion, calling `on_token` for each decoded piece
    ///
    /// Returns the full text. Must honor [`NativeEngine::stop_generation`]
    /// between tokens and return what was produced so far.
    fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        on_token: &mut dyn FnMut(&str),
    ) -> anyhow::Result<String>;

    fn stop_generation(&self);

    fn is_generating(&self) -> bool;
}
