//! Streaming output sinks
//!
//! Producers call [`TokenSink`] methods; [`ChannelSink`] marshals every call
//! onto one mpsc channel so the consumer sees events in emission order and
//! never concurrently.

use crate::error::GenerationError;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Receiver of streamed generation output
///
/// Contract: zero or more `on_token` calls, then exactly one of
/// `on_complete` or `on_error`.
pub trait TokenSink: Send + Sync {
    fn on_token(&self, token: &str);
    fn on_complete(&self, text: &str);
    fn on_error(&self, error: &GenerationError);
}

/// Event form of the sink callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Token(String),
    Complete(String),
    Error(GenerationError),
}

impl GenerationEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }
}

/// Sink that forwards every callback onto a single delivery channel
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<GenerationEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<GenerationEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GenerationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, event: GenerationEvent) {
        // A dropped receiver means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl TokenSink for ChannelSink {
    fn on_token(&self, token: &str) {
        self.send(GenerationEvent::Token(token.to_string()));
    }

    fn on_complete(&self, text: &str) {
        self.send(GenerationEvent::Complete(text.to_string()));
    }

    fn on_error(&self, error: &GenerationError) {
        self.send(GenerationEvent::Error(error.clone()));
    }
}

/// Wraps a sink so that nothing reaches it after the first terminal call
///
/// Also accumulates the streamed text so a terminal can be synthesized if the
/// producer never sends one.
pub struct TerminalGuard {
    inner: Arc<dyn TokenSink>,
    state: Mutex<GuardState>,
}

#[derive(Default)]
struct GuardState {
    text: String,
    tokens: usize,
    terminated: bool,
    completed: Option<String>,
}

impl TerminalGuard {
    pub fn new(inner: Arc<dyn TokenSink>) -> Self {
        Self {
            inner,
            state: Mutex::new(GuardState::default()),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().map(|s| s.terminated).unwrap_or(true)
    }

    /// Tokens forwarded so far
    pub fn token_count(&self) -> usize {
        self.state.lock().map(|s| s.tokens).unwrap_or(0)
    }

    /// Concatenation of the tokens forwarded so far
    pub fn text(&self) -> String {
        self.state
            .lock()
            .map(|s| s.text.clone())
            .unwrap_or_default()
    }

    /// Text passed to `on_complete`, if the stream ended successfully
    pub fn completion(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.completed.clone())
    }
}

impl TokenSink for TerminalGuard {
    fn on_token(&self, token: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.terminated {
            return;
        }
        state.text.push_str(token);
        state.tokens += 1;
        self.inner.on_token(token);
    }

    fn on_complete(&self, text: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.terminated {
            return;
        }
        state.terminated = true;
        state.completed = Some(text.to_string());
        self.inner.on_complete(text);
    }

    fn on_error(&self, error: &GenerationError) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.terminated {
            return;
        }
        state.terminated = true;
        self.inner.on_error(error);
    }
}
