//! Inference backend adapter
//!
//! Wraps an optional [`NativeEngine`] detected once at startup. Every
//! operation degrades instead of failing: a load the engine rejects still
//! leaves the adapter "loaded" in degraded mode, and a generation the engine
//! cannot serve is answered by the fallback responder.

pub mod fallback;
pub mod native;

pub use fallback::{ChunkSource, FallbackResponder, FallbackStreamer, FixedChunks, RandomChunks};
pub use native::NativeEngine;

use crate::config::FallbackConfig;
use crate::error::GenerationError;
use crate::sink::{TerminalGuard, TokenSink};
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Which code path serves generations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivePath {
    Native,
    Fallback,
}

impl std::fmt::Display for ActivePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Snapshot of what the backend can currently do
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendCapability {
    pub native_loaded: bool,
    pub load_error: Option<String>,
    pub real_inference_supported: bool,
    pub model_loaded: bool,
}

/// Introspection result: capability plus the path generations would take
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub active_path: ActivePath,
    pub capability: BackendCapability,
    pub system_info: String,
}

enum BackendKind {
    Native {
        engine: Arc<dyn NativeEngine>,
        real_inference: bool,
    },
    Fallback,
}

pub struct InferenceBackendAdapter {
    kind: BackendKind,
    gpu_layers: u32,
    system_info: String,
    native_loaded: AtomicBool,
    degraded_loaded: AtomicBool,
    load_error: RwLock<Option<String>>,
    fallback: FallbackStreamer,
}

impl InferenceBackendAdapter {
    /// Probe the engine once and fix the variant for the adapter's lifetime
    pub fn detect(engine: Option<Arc<dyn NativeEngine>>, gpu_layers: u32) -> Self {
        let probed = engine.and_then(|engine| {
            let probe = catch_unwind(AssertUnwindSafe(|| {
                (
                    engine.is_available(),
                    engine.supports_real_inference(),
                    engine.system_info(),
                )
            }));
            match probe {
                Ok((true, real_inference, info)) => Some((engine, real_inference, info)),
                Ok((false, _, _)) => {
                    tracing::info!("Native engine present but unavailable");
                    None
                }
                Err(_) => {
                    tracing::warn!("Native engine panicked during detection");
                    None
                }
            }
        });

        match probed {
            Some((engine, real_inference, system_info)) => {
                tracing::info!(
                    real_inference,
                    gpu_layers,
                    system_info = %system_info,
                    "Detected native inference engine"
                );
                Self::with_kind(
                    BackendKind::Native {
                        engine,
                        real_inference,
                    },
                    gpu_layers,
                    system_info,
                )
            }
            None => {
                tracing::info!("No native inference engine, using fallback responder");
                Self::fallback_only()
            }
        }
    }

    pub fn fallback_only() -> Self {
        Self::with_kind(BackendKind::Fallback, 0, "fallback responder".to_string())
    }

    fn with_kind(kind: BackendKind, gpu_layers: u32, system_info: String) -> Self {
        Self {
            kind,
            gpu_layers,
            system_info,
            native_loaded: AtomicBool::new(false),
            degraded_loaded: AtomicBool::new(false),
            load_error: RwLock::new(None),
            fallback: FallbackStreamer::new(&FallbackConfig::default()),
        }
    }

    /// Replace the default fallback streamer
    pub fn with_fallback(mut self, fallback: FallbackStreamer) -> Self {
        self.fallback = fallback;
        self
    }

    fn engine(&self) -> Option<&Arc<dyn NativeEngine>> {
        match &self.kind {
            BackendKind::Native { engine, .. } => Some(engine),
            BackendKind::Fallback => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.kind, BackendKind::Native { .. })
    }

    pub fn supports_real_inference(&self) -> bool {
        matches!(
            self.kind,
            BackendKind::Native {
                real_inference: true,
                ..
            }
        )
    }

    pub fn system_info(&self) -> &str {
        &self.system_info
    }

    /// Load a model, degrading rather than failing
    ///
    /// Returns `true` for every outcome the lifecycle should treat as loaded,
    /// which includes degraded mode.
    pub async fn load_model(&self, path: &Path, context_length: u32) -> bool {
        self.native_loaded.store(false, Ordering::SeqCst);
        self.degraded_loaded.store(false, Ordering::SeqCst);

        let Some(engine) = self.engine().cloned() else {
            self.degrade(path, "native engine not available");
            return true;
        };

        let model_path: PathBuf = path.to_path_buf();
        let gpu_layers = self.gpu_layers;
        let outcome = tokio::task::spawn_blocking(move || {
            engine.load_model(&model_path, context_length, gpu_layers)
        })
        .await;

        match outcome {
            Ok(Ok(true)) => {
                self.native_loaded.store(true, Ordering::SeqCst);
                self.set_load_error(None);
                tracing::info!(path = %path.display(), context_length, "Native model loaded");
            }
            Ok(Ok(false)) => self.degrade(path, "native engine rejected the model"),
            Ok(Err(e)) => self.degrade(path, &e.to_string()),
            Err(e) => self.degrade(path, &format!("native load panicked: {e}")),
        }
        true
    }

    fn degrade(&self, path: &Path, reason: &str) {
        tracing::warn!(
            path = %path.display(),
            reason = %reason,
            "Model loaded in degraded mode, generations will use the fallback responder"
        );
        self.degraded_loaded.store(true, Ordering::SeqCst);
        self.set_load_error(Some(reason.to_string()));
    }

    fn set_load_error(&self, error: Option<String>) {
        if let Ok(mut slot) = self.load_error.write() {
            *slot = error;
        }
    }

    pub fn unload_model(&self) {
        if self.native_loaded.swap(false, Ordering::SeqCst)
            && let Some(engine) = self.engine()
            && catch_unwind(AssertUnwindSafe(|| engine.unload_model())).is_err()
        {
            tracing::warn!("Native engine panicked while unloading");
        }
        self.degraded_loaded.store(false, Ordering::SeqCst);
        self.set_load_error(None);
    }

    pub fn is_model_loaded(&self) -> bool {
        self.native_loaded.load(Ordering::SeqCst) || self.degraded_loaded.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_loaded.load(Ordering::SeqCst)
    }

    /// Whether a generation right now would reach the native engine
    pub fn native_ready(&self) -> bool {
        self.supports_real_inference() && self.native_loaded.load(Ordering::SeqCst)
    }

    /// Stream a completion for `prompt` into `sink`
    ///
    /// Uses the native engine when `allow_native` is set and the engine is
    /// ready. A native failure before any token falls back to the responder; a
    /// failure after partial output completes with what was streamed. The sink
    /// always receives exactly one terminal call.
    pub async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        sink: Arc<TerminalGuard>,
        allow_native: bool,
    ) -> ActivePath {
        if allow_native
            && self.native_ready()
            && !self.fallback.stop_requested()
            && let Some(engine) = self.engine().cloned()
        {
            let native_sink = Arc::clone(&sink);
            let native_prompt = prompt.to_string();
            let outcome = tokio::task::spawn_blocking(move || {
                let mut on_token = |token: &str| native_sink.on_token(token);
                engine.generate(&native_prompt, max_tokens, temperature, &mut on_token)
            })
            .await;

            let reason = match outcome {
                Ok(Ok(text)) => {
                    sink.on_complete(&text);
                    return ActivePath::Native;
                }
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("native generation panicked: {e}"),
            };

            if sink.token_count() > 0 {
                tracing::warn!(
                    error = %reason,
                    tokens = sink.token_count(),
                    "Native generation failed mid-stream, completing with partial output"
                );
                sink.on_complete(&sink.text());
                return ActivePath::Native;
            }
            tracing::warn!(error = %reason, "Native generation failed, using fallback responder");
        }

        self.fallback.stream(prompt, sink.as_ref()).await;
        if !sink.is_terminated() {
            sink.on_error(&GenerationError::BackendException(
                "fallback stream ended without a result".to_string(),
            ));
        }
        ActivePath::Fallback
    }

    /// Ask the active path to stop at its next chunk or token
    pub fn stop_generation(&self) {
        self.fallback.stop();
        if let Some(engine) = self.engine()
            && catch_unwind(AssertUnwindSafe(|| engine.stop_generation())).is_err()
        {
            tracing::warn!("Native engine panicked while stopping");
        }
    }

    pub fn is_generating(&self) -> bool {
        self.fallback.is_generating()
            || self
                .engine()
                .and_then(|engine| catch_unwind(AssertUnwindSafe(|| engine.is_generating())).ok())
                .unwrap_or(false)
    }

    /// Clear a stop request once its session has ended
    pub fn clear_stop(&self) {
        self.fallback.reset();
    }

    pub fn capability(&self) -> BackendCapability {
        BackendCapability {
            native_loaded: self.native_loaded.load(Ordering::SeqCst),
            load_error: self.load_error.read().ok().and_then(|e| e.clone()),
            real_inference_supported: self.supports_real_inference(),
            model_loaded: self.is_model_loaded(),
        }
    }

    pub fn status(&self) -> BackendStatus {
        let active_path = if self.native_ready() {
            ActivePath::Native
        } else {
            ActivePath::Fallback
        };
        BackendStatus {
            active_path,
            capability: self.capability(),
            system_info: self.system_info.clone(),
        }
    }
}
