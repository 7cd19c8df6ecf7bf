//! Property tests for the patch-merge rules: history is append-only and
//! progress is monotone under arbitrary patch sequences.

use proptest::prelude::*;

use specloom::domain::{ConversationEntry, ErrorKind, ErrorRecord};
use specloom::state::{SessionIdentity, SessionInputs, SessionState, StatePatch};

fn fresh_state() -> SessionState {
    SessionState::new(
        SessionIdentity::next("p", "u", "j"),
        SessionInputs::default(),
    )
}

#[derive(Clone, Debug)]
struct PatchSpec {
    progress: Option<f32>,
    conversation: u8,
    errors: u8,
}

fn patch_spec() -> impl Strategy<Value = PatchSpec> {
    (
        proptest::option::of(0.0f32..=100.0),
        0u8..3,
        0u8..3,
    )
        .prop_map(|(progress, conversation, errors)| PatchSpec {
            progress,
            conversation,
            errors,
        })
}

fn build_patch(spec: &PatchSpec) -> StatePatch {
    let mut patch = StatePatch::new();
    patch.progress = spec.progress;
    for i in 0..spec.conversation {
        patch
            .conversation
            .push(ConversationEntry::system(format!("note {i}")));
    }
    for i in 0..spec.errors {
        patch.errors.push(ErrorRecord::recovered(
            "test",
            ErrorKind::ExternalServiceError,
            format!("transient {i}"),
        ));
    }
    patch
}

proptest! {
    #[test]
    fn history_never_shrinks_and_progress_never_regresses(
        specs in proptest::collection::vec(patch_spec(), 1..40)
    ) {
        let mut state = fresh_state();
        let mut last_conversation = 0;
        let mut last_errors = 0;
        let mut last_progress = 0.0f32;

        for spec in &specs {
            state.apply(build_patch(spec));

            prop_assert!(state.conversation_history.len() >= last_conversation);
            prop_assert!(state.errors.len() >= last_errors);
            prop_assert!(state.progress_percentage >= last_progress);
            prop_assert!((0.0..=100.0).contains(&state.progress_percentage));

            last_conversation = state.conversation_history.len();
            last_errors = state.errors.len();
            last_progress = state.progress_percentage;
        }

        let expected_entries: usize = specs.iter().map(|s| s.conversation as usize).sum();
        prop_assert_eq!(state.conversation_history.len(), expected_entries);
    }

    #[test]
    fn existing_history_prefix_is_preserved(
        first in "[a-z]{1,12}",
        later in proptest::collection::vec("[a-z]{1,12}", 0..10)
    ) {
        let mut state = fresh_state();
        state.apply(StatePatch::new().with_conversation(ConversationEntry::user(first.clone())));
        for message in &later {
            state.apply(
                StatePatch::new().with_conversation(ConversationEntry::system(message.clone())),
            );
        }
        prop_assert_eq!(state.conversation_history[0].message.as_str(), first.as_str());
        prop_assert_eq!(state.conversation_history.len(), later.len() + 1);
    }
}
