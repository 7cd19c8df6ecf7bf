//! Core identifiers for the specloom workflow.
//!
//! This module defines the fundamental types used throughout the system to
//! identify where a session is in its lifecycle: the [`Stage`] a session is
//! executing and the externally visible [`SessionStatus`].
//!
//! # Key Types
//!
//! - [`Stage`]: one step of the session state machine; the router selects
//!   the next stage from the current one, and every checkpoint records it.
//! - [`SessionStatus`]: the caller-facing lifecycle state reported by the
//!   session-control surface.
//!
//! # Examples
//!
//! ```rust
//! use specloom::types::Stage;
//!
//! let stage = Stage::ResearchTechnologies;
//! assert_eq!(stage.as_str(), "research_technologies");
//! assert_eq!(Stage::decode("research_technologies"), Some(stage));
//! assert!(Stage::WaitUserDecision.is_waiting());
//! assert!(Stage::Completed.is_terminal());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the session state machine.
///
/// The runnable stages correspond to the concrete nodes in
/// [`crate::nodes`]; `Created`, `Completed` and `Failed` are lifecycle
/// markers that never execute as nodes. `CodeAnalysisSkipped` is the
/// marker the code-parsing stage records when no code bundle was supplied;
/// the router treats it like a completed parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Session exists but no node has run yet.
    Created,
    LoadInputs,
    AnalyzeCompleteness,
    AskClarification,
    IdentifyTechGaps,
    ResearchTechnologies,
    PresentOptions,
    WaitUserDecision,
    ValidateDecision,
    WarnUser,
    ParseCode,
    /// Recorded by the parse stage when `code_bundle_ref` is absent.
    CodeAnalysisSkipped,
    InferApi,
    GenerateTrd,
    ValidateTrd,
    GenerateApiSpec,
    GenerateDbSchema,
    GenerateDbErd,
    GenerateArchitecture,
    ValidateArchitecture,
    GenerateTechStackDoc,
    Save,
    Notify,
    /// Terminal: the notify stage ran and the session is done.
    Completed,
    /// Terminal: an unrecoverable error halted the session.
    Failed,
}

impl Stage {
    /// Stable snake_case name used in checkpoints, events and status
    /// reports.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::LoadInputs => "load_inputs",
            Stage::AnalyzeCompleteness => "analyze_completeness",
            Stage::AskClarification => "ask_clarification",
            Stage::IdentifyTechGaps => "identify_tech_gaps",
            Stage::ResearchTechnologies => "research_technologies",
            Stage::PresentOptions => "present_options",
            Stage::WaitUserDecision => "wait_user_decision",
            Stage::ValidateDecision => "validate_decision",
            Stage::WarnUser => "warn_user",
            Stage::ParseCode => "parse_code",
            Stage::CodeAnalysisSkipped => "code_analysis_skipped",
            Stage::InferApi => "infer_api",
            Stage::GenerateTrd => "generate_trd",
            Stage::ValidateTrd => "validate_trd",
            Stage::GenerateApiSpec => "generate_api_spec",
            Stage::GenerateDbSchema => "generate_db_schema",
            Stage::GenerateDbErd => "generate_db_erd",
            Stage::GenerateArchitecture => "generate_architecture",
            Stage::ValidateArchitecture => "validate_architecture",
            Stage::GenerateTechStackDoc => "generate_tech_stack_doc",
            Stage::Save => "save",
            Stage::Notify => "notify",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    /// Decode a persisted stage name. Returns `None` for unknown names so
    /// stores can surface corruption instead of guessing.
    pub fn decode(s: &str) -> Option<Self> {
        ALL_STAGES.iter().copied().find(|k| k.as_str() == s)
    }

    /// Stages that suspend the runner and hand control back to the
    /// scheduler until an external decision arrives.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Stage::AskClarification | Stage::WaitUserDecision | Stage::WarnUser
        )
    }

    /// Terminal stages: nothing routes out of them.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// Stages that have a node bound in the registry. Lifecycle markers
    /// (`Created`, `CodeAnalysisSkipped`, terminals) do not execute.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        !matches!(
            self,
            Stage::Created | Stage::CodeAnalysisSkipped | Stage::Completed | Stage::Failed
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every stage, in spine order. Used by the registry to validate that all
/// runnable stages have a node bound.
pub const ALL_STAGES: &[Stage] = &[
    Stage::Created,
    Stage::LoadInputs,
    Stage::AnalyzeCompleteness,
    Stage::AskClarification,
    Stage::IdentifyTechGaps,
    Stage::ResearchTechnologies,
    Stage::PresentOptions,
    Stage::WaitUserDecision,
    Stage::ValidateDecision,
    Stage::WarnUser,
    Stage::ParseCode,
    Stage::CodeAnalysisSkipped,
    Stage::InferApi,
    Stage::GenerateTrd,
    Stage::ValidateTrd,
    Stage::GenerateApiSpec,
    Stage::GenerateDbSchema,
    Stage::GenerateDbErd,
    Stage::GenerateArchitecture,
    Stage::ValidateArchitecture,
    Stage::GenerateTechStackDoc,
    Stage::Save,
    Stage::Notify,
    Stage::Completed,
    Stage::Failed,
];

/// Caller-facing lifecycle state of a session.
///
/// Reported by the session-control surface and stored in the session
/// state so it survives checkpoints. A `Paused` session is resumable; a
/// `Failed` one is not (its artifacts up to the failure remain readable).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    /// Suspended: awaiting a user decision or a storage retry.
    Paused,
    Completed,
    Failed,
    Cancelled,
    /// No user activity within the absolute expiry window; resumable
    /// until pruned.
    Expired,
}

impl SessionStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_round_trip() {
        for stage in ALL_STAGES {
            assert_eq!(Stage::decode(stage.as_str()), Some(*stage));
        }
    }

    #[test]
    fn unknown_stage_name_is_none() {
        assert_eq!(Stage::decode("definitely_not_a_stage"), None);
    }

    #[test]
    fn waiting_stages() {
        let waiting: Vec<_> = ALL_STAGES.iter().filter(|s| s.is_waiting()).collect();
        assert_eq!(
            waiting,
            vec![
                &Stage::AskClarification,
                &Stage::WaitUserDecision,
                &Stage::WarnUser
            ]
        );
    }
}
