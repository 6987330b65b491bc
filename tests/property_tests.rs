//! Property-based tests using proptest
//!
//! Random event sequences against the lifecycle state machine, and random
//! chunk sequences against download progress reporting.

use local_llm_manager::models::{PROGRESS_INDETERMINATE, ProgressReporter};
use local_llm_manager::{LifecycleEvent, LifecycleStateMachine, ModelState};
use proptest::prelude::*;

// =============================================================================
// Strategies
// =============================================================================

fn arb_state() -> impl Strategy<Value = ModelState> {
    prop_oneof![
        Just(ModelState::NotDownloaded),
        Just(ModelState::Downloading),
        Just(ModelState::Downloaded),
        Just(ModelState::Loading),
        Just(ModelState::Ready),
        Just(ModelState::Error),
    ]
}

fn arb_event() -> impl Strategy<Value = LifecycleEvent> {
    prop_oneof![
        Just(LifecycleEvent::BeginDownload),
        Just(LifecycleEvent::DownloadSucceeded),
        "[a-z ]{1,20}".prop_map(LifecycleEvent::DownloadFailed),
        Just(LifecycleEvent::BeginLoad),
        Just(LifecycleEvent::LoadSucceeded),
        "[a-z ]{1,20}".prop_map(LifecycleEvent::LoadFailed),
        Just(LifecycleEvent::Unload),
        Just(LifecycleEvent::Delete),
    ]
}

/// Transition table written out independently of the implementation
fn expected(from: ModelState, event: &LifecycleEvent) -> Option<ModelState> {
    use LifecycleEvent as E;
    use ModelState as S;
    match (from, event) {
        (S::NotDownloaded | S::Error, E::BeginDownload) => Some(S::Downloading),
        (S::Downloading, E::DownloadSucceeded) => Some(S::Downloaded),
        (S::Downloading, E::DownloadFailed(_)) => Some(S::Error),
        (S::Downloaded | S::Error, E::BeginLoad) => Some(S::Loading),
        (S::Loading, E::LoadSucceeded) => Some(S::Ready),
        (S::Loading, E::LoadFailed(_)) => Some(S::Error),
        (S::Ready, E::Unload) => Some(S::Downloaded),
        (S::Downloaded | S::Error, E::Delete) => Some(S::NotDownloaded),
        _ => None,
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

proptest! {
    #[test]
    fn test_only_table_edges_are_applied(
        initial in arb_state(),
        events in prop::collection::vec(arb_event(), 0..40),
    ) {
        let machine = LifecycleStateMachine::new(initial);
        let mut model = initial;

        for event in events {
            let before = machine.current_state();
            let result = machine.transition(event.clone());
            match expected(model, &event) {
                Some(next) => {
                    prop_assert_eq!(result, Ok(next));
                    model = next;
                }
                None => {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(machine.current_state(), before);
                }
            }
            prop_assert_eq!(machine.current_state(), model);
        }
    }

    #[test]
    fn test_last_error_only_in_error_state(
        events in prop::collection::vec(arb_event(), 0..40),
    ) {
        let machine = LifecycleStateMachine::default();
        for event in events {
            let _ = machine.transition(event);
            if machine.current_state() != ModelState::Error {
                prop_assert_eq!(machine.last_error(), None);
            }
        }
    }

    #[test]
    fn test_every_applied_transition_is_broadcast(
        events in prop::collection::vec(arb_event(), 0..40),
    ) {
        let machine = LifecycleStateMachine::default();
        let mut rx = machine.subscribe();
        let mut applied = Vec::new();
        for event in events {
            let from = machine.current_state();
            if let Ok(to) = machine.transition(event) {
                applied.push((from, to));
            }
        }

        let mut seen = Vec::new();
        while let Ok(change) = rx.try_recv() {
            seen.push((change.from, change.to));
        }
        prop_assert_eq!(seen, applied);
    }
}

// =============================================================================
// Download progress
// =============================================================================

proptest! {
    #[test]
    fn test_progress_is_monotonic_and_ends_at_100(
        total in 1u64..10_000_000,
        chunks in prop::collection::vec(1u64..500_000, 0..64),
    ) {
        let mut reporter = ProgressReporter::new(Some(total));
        let mut transferred = 0u64;
        let mut reports = Vec::new();
        for chunk in chunks {
            transferred += chunk;
            reports.extend(reporter.update(transferred));
        }
        reports.extend(reporter.finish());

        for pair in reports.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
        prop_assert!(reports.iter().all(|p| (0..=100).contains(p)));
        prop_assert_eq!(reports.last(), Some(&100));
    }

    #[test]
    fn test_unknown_total_reports_indeterminate_once(
        chunks in prop::collection::vec(1u64..500_000, 0..64),
    ) {
        let mut reporter = ProgressReporter::new(None);
        let mut transferred = 0u64;
        let mut reports = Vec::new();
        for chunk in chunks {
            transferred += chunk;
            reports.extend(reporter.update(transferred));
        }
        reports.extend(reporter.finish());

        prop_assert_eq!(reports, vec![PROGRESS_INDETERMINATE]);
    }
}
