//! Canonical model state and its transition table
//!
//! Exactly one [`ModelState`] is held per manager. Reads are a single atomic
//! load; writes go through [`LifecycleStateMachine::transition`], which the
//! lifecycle worker calls one operation at a time.

use crate::error::InvalidTransition;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::broadcast;

/// Lifecycle state of the active model artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ModelState {
    /// No artifact on disk
    NotDownloaded = 0,
    /// An artifact is being fetched
    Downloading = 1,
    /// An artifact is on disk but not loaded
    Downloaded = 2,
    /// The backend is loading an artifact
    Loading = 3,
    /// A model is loaded and generation can use it
    Ready = 4,
    /// The last download or load failed
    Error = 5,
}

impl ModelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotDownloaded,
            1 => Self::Downloading,
            2 => Self::Downloaded,
            3 => Self::Loading,
            4 => Self::Ready,
            _ => Self::Error,
        }
    }
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDownloaded => write!(f, "not_downloaded"),
            Self::Downloading => write!(f, "downloading"),
            Self::Downloaded => write!(f, "downloaded"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Outcomes that drive the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    BeginDownload,
    DownloadSucceeded,
    DownloadFailed(String),
    BeginLoad,
    LoadSucceeded,
    LoadFailed(String),
    Unload,
    Delete,
}

impl LifecycleEvent {
    /// States this event may be applied from
    pub fn valid_sources(&self) -> &'static [ModelState] {
        use ModelState::*;
        match self {
            Self::BeginDownload => &[NotDownloaded, Error],
            Self::DownloadSucceeded | Self::DownloadFailed(_) => &[Downloading],
            Self::BeginLoad => &[Downloaded, Error],
            Self::LoadSucceeded | Self::LoadFailed(_) => &[Loading],
            Self::Unload => &[Ready],
            Self::Delete => &[Downloaded, Error],
        }
    }

    /// State entered when the event is applied
    pub fn target(&self) -> ModelState {
        match self {
            Self::BeginDownload => ModelState::Downloading,
            Self::DownloadSucceeded => ModelState::Downloaded,
            Self::DownloadFailed(_) | Self::LoadFailed(_) => ModelState::Error,
            Self::BeginLoad => ModelState::Loading,
            Self::LoadSucceeded => ModelState::Ready,
            Self::Unload => ModelState::Downloaded,
            Self::Delete => ModelState::NotDownloaded,
        }
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BeginDownload => write!(f, "begin_download"),
            Self::DownloadSucceeded => write!(f, "download_succeeded"),
            Self::DownloadFailed(_) => write!(f, "download_failed"),
            Self::BeginLoad => write!(f, "begin_load"),
            Self::LoadSucceeded => write!(f, "load_succeeded"),
            Self::LoadFailed(_) => write!(f, "load_failed"),
            Self::Unload => write!(f, "unload"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Notification sent after every applied transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: ModelState,
    pub to: ModelState,
    pub error: Option<String>,
}

/// Owner of the process-wide [`ModelState`]
pub struct LifecycleStateMachine {
    state: AtomicU8,
    last_error: RwLock<Option<String>>,
    event_tx: broadcast::Sender<StateChange>,
}

impl LifecycleStateMachine {
    pub fn new(initial: ModelState) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            state: AtomicU8::new(initial as u8),
            last_error: RwLock::new(None),
            event_tx,
        }
    }

    pub fn current_state(&self) -> ModelState {
        ModelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Error message recorded when `Error` was entered
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Subscribe to applied transitions
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.event_tx.subscribe()
    }

    /// Check whether `event` would be accepted without applying it
    pub fn can_apply(&self, event: &LifecycleEvent) -> Result<(), InvalidTransition> {
        let from = self.current_state();
        if event.valid_sources().contains(&from) {
            Ok(())
        } else {
            Err(InvalidTransition {
                from,
                event: event.clone(),
            })
        }
    }

    /// Apply `event`, returning the new state
    ///
    /// Callers are serialized by the lifecycle worker; the compare-exchange
    /// still guarantees that a rejected event leaves the state untouched.
    pub fn transition(&self, event: LifecycleEvent) -> Result<ModelState, InvalidTransition> {
        let from = self.current_state();
        if !event.valid_sources().contains(&from) {
            tracing::warn!(from = %from, event = %event, "Rejected lifecycle transition");
            return Err(InvalidTransition { from, event });
        }

        let to = event.target();
        if self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(InvalidTransition {
                from: self.current_state(),
                event,
            });
        }

        let error = match &event {
            LifecycleEvent::DownloadFailed(msg) | LifecycleEvent::LoadFailed(msg) => {
                Some(msg.clone())
            }
            _ => None,
        };
        if let Ok(mut guard) = self.last_error.write() {
            *guard = error.clone();
        }

        tracing::info!(from = %from, to = %to, event = %event, "Model state changed");
        crate::metrics::update_model_state(to);

        let _ = self.event_tx.send(StateChange { from, to, error });

        Ok(to)
    }
}

impl Default for LifecycleStateMachine {
    fn default() -> Self {
        Self::new(ModelState::NotDownloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let sm = LifecycleStateMachine::default();
        assert_eq!(
            sm.transition(LifecycleEvent::BeginDownload),
            Ok(ModelState::Downloading)
        );
        assert_eq!(
            sm.transition(LifecycleEvent::DownloadSucceeded),
            Ok(ModelState::Downloaded)
        );
        assert_eq!(sm.transition(LifecycleEvent::BeginLoad), Ok(ModelState::Loading));
        assert_eq!(sm.transition(LifecycleEvent::LoadSucceeded), Ok(ModelState::Ready));
        assert_eq!(sm.transition(LifecycleEvent::Unload), Ok(ModelState::Downloaded));
        assert_eq!(sm.transition(LifecycleEvent::Delete), Ok(ModelState::NotDownloaded));
    }

    #[test]
    fn test_invalid_edge_leaves_state() {
        let sm = LifecycleStateMachine::new(ModelState::Ready);
        let err = sm.transition(LifecycleEvent::BeginDownload).unwrap_err();
        assert_eq!(err.from, ModelState::Ready);
        assert_eq!(err.event, LifecycleEvent::BeginDownload);
        assert_eq!(sm.current_state(), ModelState::Ready);
    }

    #[test]
    fn test_error_set_and_cleared() {
        let sm = LifecycleStateMachine::new(ModelState::Downloaded);
        sm.transition(LifecycleEvent::BeginLoad).unwrap();
        sm.transition(LifecycleEvent::LoadFailed("out of memory".to_string()))
            .unwrap();
        assert_eq!(sm.current_state(), ModelState::Error);
        assert_eq!(sm.last_error(), Some("out of memory".to_string()));

        // Retry from Error is allowed and clears the message
        sm.transition(LifecycleEvent::BeginLoad).unwrap();
        assert_eq!(sm.last_error(), None);
    }

    #[test]
    fn test_retry_download_from_error() {
        let sm = LifecycleStateMachine::new(ModelState::Error);
        assert_eq!(
            sm.transition(LifecycleEvent::BeginDownload),
            Ok(ModelState::Downloading)
        );
    }

    #[test]
    fn test_rejected_event_keeps_error_message() {
        let sm = LifecycleStateMachine::new(ModelState::Downloading);
        sm.transition(LifecycleEvent::DownloadFailed("timeout".to_string()))
            .unwrap();
        assert!(sm.transition(LifecycleEvent::Unload).is_err());
        assert_eq!(sm.last_error(), Some("timeout".to_string()));
    }

    #[test]
    fn test_can_apply_is_side_effect_free() {
        let sm = LifecycleStateMachine::new(ModelState::Downloaded);
        assert!(sm.can_apply(&LifecycleEvent::BeginLoad).is_ok());
        assert!(sm.can_apply(&LifecycleEvent::Unload).is_err());
        assert_eq!(sm.current_state(), ModelState::Downloaded);
    }

    #[tokio::test]
    async fn test_subscribe_receives_changes() {
        let sm = LifecycleStateMachine::default();
        let mut rx = sm.subscribe();
        sm.transition(LifecycleEvent::BeginDownload).unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.from, ModelState::NotDownloaded);
        assert_eq!(change.to, ModelState::Downloading);
        assert!(change.error.is_none());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ModelState::NotDownloaded.to_string(), "not_downloaded");
        assert_eq!(ModelState::Ready.to_string(), "ready");
        assert_eq!(ModelState::Error.to_string(), "error");
    }
}
