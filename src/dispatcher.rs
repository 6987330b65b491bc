//! Generation dispatcher
//!
//! Single entry point for text generation. At most one session runs at a
//! time; a second request is rejected with [`GenerationError::Busy`] rather
//! than queued. Output streams through the caller's [`TokenSink`].

use crate::backend::{BackendStatus, InferenceBackendAdapter};
use crate::error::GenerationError;
use crate::lifecycle::{LifecycleStateMachine, ModelState};
use crate::sink::{TerminalGuard, TokenSink};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Reports whether device-control actions may be offered to the model
pub trait ControlPermission: Send + Sync {
    fn control_enabled(&self) -> bool;
}

/// Structured result of post-processing generated text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub action: String,
    pub detail: String,
}

/// Post-processor that may turn generated text into a device action
pub trait CommandHandler: Send + Sync {
    fn handle(&self, text: &str, produced_locally: bool) -> Option<CommandOutcome>;
}

// ============================================================================
// Prompt template
// ============================================================================

/// Appended to the system turn when control actions are permitted
pub const CONTROL_EXTENSION: &str = "\n\nYou can also operate this device. When the user asks \
for one of the following actions, reply with a single line of the form \
ACTION: <name> <argument>.\n\
- open_app <app name>\n\
- go_home\n\
- go_back\n\
- tap <x> <y>\n\
- swipe <up|down|left|right>\n\
- type_text <text>\n\
For anything else, answer normally.";

/// ChatML prompt builder
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    system_prompt: String,
}

impl PromptTemplate {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }

    pub fn build(&self, raw_prompt: &str, control_enabled: bool) -> String {
        let extension = if control_enabled { CONTROL_EXTENSION } else { "" };
        format!(
            "<|im_start|>system\n{}{}<|im_end|>\n<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
            self.system_prompt, extension, raw_prompt
        )
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Snapshot of the in-flight generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenerationSession {
    pub id: Uuid,
    pub cancel_requested: bool,
    pub active: bool,
}

pub struct GenerationDispatcher {
    backend: Arc<InferenceBackendAdapter>,
    lifecycle: Arc<LifecycleStateMachine>,
    template: PromptTemplate,
    permission: Option<Arc<dyn ControlPermission>>,
    commands: Option<Arc<dyn CommandHandler>>,
    busy: AtomicBool,
    cancel_requested: AtomicBool,
    session: Mutex<Option<Uuid>>,
}

impl GenerationDispatcher {
    pub fn new(
        backend: Arc<InferenceBackendAdapter>,
        lifecycle: Arc<LifecycleStateMachine>,
        template: PromptTemplate,
    ) -> Self {
        Self {
            backend,
            lifecycle,
            template,
            permission: None,
            commands: None,
            busy: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    pub fn with_control_permission(mut self, permission: Arc<dyn ControlPermission>) -> Self {
        self.permission = Some(permission);
        self
    }

    pub fn with_command_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.commands = Some(handler);
        self
    }

    /// Start a generation and return its session id
    ///
    /// Returns immediately. Tokens and the terminal event arrive through
    /// `sink`. Fails synchronously with `Busy` when a session is active; the
    /// active session is not affected.
    pub fn generate(
        self: &Arc<Self>,
        raw_prompt: &str,
        max_tokens: u32,
        temperature: f32,
        sink: Arc<dyn TokenSink>,
    ) -> Result<Uuid, GenerationError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            crate::metrics::record_generation_rejected();
            tracing::debug!("Generation rejected, another session is active");
            return Err(GenerationError::Busy);
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.busy.store(false, Ordering::SeqCst);
            return Err(GenerationError::BackendException(
                "no async runtime available".to_string(),
            ));
        };

        // Stop flags were cleared when the previous session released
        let id = Uuid::new_v4();
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);

        let control_enabled = self
            .permission
            .as_ref()
            .is_some_and(|permission| permission.control_enabled());
        let prompt = self.template.build(raw_prompt, control_enabled);

        tracing::info!(
            session = %id,
            max_tokens,
            temperature,
            control_enabled,
            "Starting generation"
        );

        let dispatcher = Arc::clone(self);
        runtime.spawn(async move {
            dispatcher
                .run_session(id, prompt, max_tokens, temperature, sink)
                .await;
        });

        Ok(id)
    }

    async fn run_session(
        self: Arc<Self>,
        id: Uuid,
        prompt: String,
        max_tokens: u32,
        temperature: f32,
        sink: Arc<dyn TokenSink>,
    ) {
        // Releases the busy flag even if the session unwinds
        let _guard = SessionGuard {
            dispatcher: self.as_ref(),
            id,
        };

        let session_sink: Arc<dyn TokenSink> = Arc::new(SessionSink {
            dispatcher: Arc::clone(&self),
            id,
            inner: sink,
        });
        let guard = Arc::new(TerminalGuard::new(session_sink));

        let state = self.lifecycle.current_state();
        let allow_native = state == ModelState::Ready;
        if !allow_native && self.backend.is_available() {
            tracing::debug!(session = %id, state = %state, "Model not ready, using fallback responder");
        }

        let run = self.backend.generate(
            &prompt,
            max_tokens,
            temperature,
            Arc::clone(&guard),
            allow_native,
        );

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(path) => {
                crate::metrics::record_generation(path);
                tracing::info!(
                    session = %id,
                    path = %path,
                    tokens = guard.token_count(),
                    "Generation finished"
                );
            }
            Err(_) => {
                tracing::error!(session = %id, "Generation panicked");
                guard.on_error(&GenerationError::BackendException(
                    "generation panicked".to_string(),
                ));
            }
        }

        if let Some(text) = guard.completion() {
            self.hand_off(id, &text);
        }
    }

    fn hand_off(&self, id: Uuid, text: &str) {
        let Some(handler) = &self.commands else {
            return;
        };
        match handler.handle(text, true) {
            Some(outcome) => tracing::info!(
                session = %id,
                action = %outcome.action,
                detail = %outcome.detail,
                "Command handler produced an action"
            ),
            None => tracing::debug!(session = %id, "Command handler found no action"),
        }
    }

    /// End session `id`: clear its stop request, then the busy flag
    ///
    /// Holds the session lock so a concurrent `stop` either lands on this
    /// session or sees no session at all.
    fn release(&self, id: Uuid) {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if *slot == Some(id) {
            *slot = None;
            self.cancel_requested.store(false, Ordering::SeqCst);
            self.backend.clear_stop();
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    /// Request the active session to stop at its next chunk or token
    ///
    /// Returns `false` if nothing was running.
    pub fn stop(&self) -> bool {
        let slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(id) = *slot else {
            return false;
        };
        tracing::info!(session = %id, "Stopping generation");
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.backend.stop_generation();
        true
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn current_session(&self) -> Option<GenerationSession> {
        let id = (*self.session.lock().unwrap_or_else(PoisonError::into_inner))?;
        Some(GenerationSession {
            id,
            cancel_requested: self.cancel_requested.load(Ordering::SeqCst),
            active: self.busy.load(Ordering::SeqCst),
        })
    }

    pub fn status(&self) -> BackendStatus {
        self.backend.status()
    }
}

/// Releases the session on terminal delivery, before the caller sees it
struct SessionSink {
    dispatcher: Arc<GenerationDispatcher>,
    id: Uuid,
    inner: Arc<dyn TokenSink>,
}

impl TokenSink for SessionSink {
    fn on_token(&self, token: &str) {
        self.inner.on_token(token);
    }

    fn on_complete(&self, text: &str) {
        self.dispatcher.release(self.id);
        self.inner.on_complete(text);
    }

    fn on_error(&self, error: &GenerationError) {
        self.dispatcher.release(self.id);
        self.inner.on_error(error);
    }
}

/// RAII guard to ensure the session's busy flag is cleared on drop
struct SessionGuard<'a> {
    dispatcher: &'a GenerationDispatcher,
    id: Uuid,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Allowed(bool);

    impl ControlPermission for Allowed {
        fn control_enabled(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn test_prompt_template() {
        let template = PromptTemplate::new("You are helpful.");
        let prompt = template.build("hi", false);
        assert_eq!(
            prompt,
            "<|im_start|>system\nYou are helpful.<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
        assert!(!prompt.contains("open_app"));
    }

    #[test]
    fn test_prompt_template_control_extension() {
        let template = PromptTemplate::new("You are helpful.");
        let prompt = template.build("open settings", Allowed(true).control_enabled());
        let system_end = prompt.find("<|im_end|>").unwrap_or(0);
        let open_app = prompt.find("open_app").unwrap_or(usize::MAX);
        // The extension lives inside the system turn
        assert!(open_app < system_end);
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_generate_without_runtime() {
        let dispatcher = Arc::new(GenerationDispatcher::new(
            Arc::new(InferenceBackendAdapter::fallback_only()),
            Arc::new(LifecycleStateMachine::default()),
            PromptTemplate::new("sys"),
        ));
        let (sink, _rx) = crate::sink::ChannelSink::channel();
        let result = dispatcher.generate("hi", 8, 0.5, Arc::new(sink));
        assert!(matches!(result, Err(GenerationError::BackendException(_))));
        assert!(!dispatcher.is_busy());
    }

    #[test]
    fn test_stop_when_idle() {
        let dispatcher = GenerationDispatcher::new(
            Arc::new(InferenceBackendAdapter::fallback_only()),
            Arc::new(LifecycleStateMachine::default()),
            PromptTemplate::new("sys"),
        );
        assert!(!dispatcher.stop());
        assert!(dispatcher.current_session().is_none());
    }
}
