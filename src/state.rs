//! Session state and patch merging.
//!
//! A session is driven by exactly one value of [`SessionState`]: the single
//! typed record that flows through the stage graph, is serialized into
//! every checkpoint, and is the only thing a node may read. Nodes never
//! mutate state directly — they return a [`StatePatch`] and the runner
//! merges it with [`SessionState::apply`].
//!
//! # Merge rules
//!
//! - History fields (`conversation_history`, `research_results`,
//!   `user_decisions`, `errors`, `validation_warnings`, input
//!   clarifications) merge by **concatenation** and are never truncated or
//!   reordered, so checkpoint replay cannot drop history.
//! - `pending_decisions` merges with set semantics (ordered, no
//!   duplicates).
//! - `progress_percentage` merges by maximum, which makes progress
//!   monotone by construction.
//! - Everything else is last-write-wins in node emission order.
//!
//! After every merge the runner calls [`SessionState::check_invariants`];
//! a violation is an unrecoverable `InvalidState` fault.
//!
//! # Examples
//!
//! ```rust
//! use specloom::state::{SessionIdentity, SessionInputs, SessionState, StatePatch};
//! use specloom::domain::ConversationEntry;
//!
//! let mut state = SessionState::new(SessionIdentity::next("proj", "user", "job"),
//!                                   SessionInputs::default());
//! let patch = StatePatch::new()
//!     .with_progress(5.0)
//!     .with_conversation(ConversationEntry::system("inputs loaded"));
//! state.apply(patch);
//! assert_eq!(state.progress_percentage, 5.0);
//! assert_eq!(state.conversation_history.len(), 1);
//! ```

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    AiRecommendation, ApiEndpoint, ArchitectureValidation, ClarificationAnswer,
    ConversationEntry, DbSchema, DocKind, ErrorRecord, ParsedComponent, ResearchResult,
    ResumeDirective, SavedArtifact, TechGap, TrdValidation, UserDecision, ValidationWarning,
};
use crate::types::{SessionStatus, Stage};

/// Immutable identity of a session, populated at creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_id: Uuid,
    pub project_id: String,
    pub user_id: String,
    pub upstream_job_id: String,
}

impl SessionIdentity {
    /// Mint an identity with a fresh v4 session id.
    pub fn next(
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        upstream_job_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            upstream_job_id: upstream_job_id.into(),
        }
    }
}

/// Upstream artifacts, written once by the input-loading stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInputs {
    pub prd_content: String,
    pub design_docs: FxHashMap<DocKind, String>,
    pub code_bundle_ref: Option<String>,
    pub design_decisions: Vec<String>,
    /// Answers collected by the clarification loop; append-only.
    pub clarifications: Vec<ClarificationAnswer>,
}

/// The single typed record flowing through the stage graph.
///
/// Field groups follow the data model: identity, inputs, analysis,
/// research & decisions, code/API inference, generated artifacts, and
/// workflow control. See the module docs for merge semantics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    // Identity & inputs
    pub identity: SessionIdentity,
    pub inputs: SessionInputs,

    // Analysis
    pub completeness_score: u8,
    pub missing_elements: Vec<String>,
    pub ambiguous_elements: Vec<String>,
    pub clarification_queue: Vec<String>,
    /// The clarification currently posed to the user, if any.
    pub awaiting_question: Option<String>,
    pub tech_gaps: Vec<TechGap>,

    // Research & decisions
    pub research_results: Vec<ResearchResult>,
    pub pending_decisions: Vec<String>,
    pub user_decisions: Vec<UserDecision>,
    pub validation_warnings: Vec<ValidationWarning>,
    /// A chosen option not yet accepted by validation.
    pub candidate_decision: Option<UserDecision>,
    pub ai_recommendation: Option<AiRecommendation>,
    /// Gap the research loop is currently working on.
    pub active_gap_id: Option<String>,
    /// User-supplied `search:<query>` override for the active gap.
    pub custom_query: Option<String>,

    // Code / API inference
    pub parsed_components: Vec<ParsedComponent>,
    pub inferred_api_spec: Vec<ApiEndpoint>,

    // Generated artifacts
    pub trd_draft: Option<String>,
    pub trd_validation: Option<TrdValidation>,
    pub final_trd: Option<String>,
    pub api_specification: Option<Value>,
    pub db_schema: Option<DbSchema>,
    pub db_erd: Option<String>,
    pub architecture_diagram: Option<String>,
    pub architecture_validation: Option<ArchitectureValidation>,
    pub tech_stack_document: Option<Value>,
    pub saved_artifact: Option<SavedArtifact>,

    // Workflow control
    pub current_stage: Stage,
    pub status: SessionStatus,
    pub trd_iterations: u32,
    pub research_rounds: u32,
    pub progress_percentage: f32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<ErrorRecord>,
    pub conversation_history: Vec<ConversationEntry>,
    pub resume_directive: Option<ResumeDirective>,
}

impl SessionState {
    /// Create a fresh session at [`Stage::Created`] with identity and
    /// inputs populated and every other field empty.
    pub fn new(identity: SessionIdentity, inputs: SessionInputs) -> Self {
        Self {
            identity,
            inputs,
            completeness_score: 0,
            missing_elements: Vec::new(),
            ambiguous_elements: Vec::new(),
            clarification_queue: Vec::new(),
            awaiting_question: None,
            tech_gaps: Vec::new(),
            research_results: Vec::new(),
            pending_decisions: Vec::new(),
            user_decisions: Vec::new(),
            validation_warnings: Vec::new(),
            candidate_decision: None,
            ai_recommendation: None,
            active_gap_id: None,
            custom_query: None,
            parsed_components: Vec::new(),
            inferred_api_spec: Vec::new(),
            trd_draft: None,
            trd_validation: None,
            final_trd: None,
            api_specification: None,
            db_schema: None,
            db_erd: None,
            architecture_diagram: None,
            architecture_validation: None,
            tech_stack_document: None,
            saved_artifact: None,
            current_stage: Stage::Created,
            status: SessionStatus::InProgress,
            trd_iterations: 0,
            research_rounds: 0,
            progress_percentage: 0.0,
            started_at: Utc::now(),
            completed_at: None,
            errors: Vec::new(),
            conversation_history: Vec::new(),
            resume_directive: None,
        }
    }

    /// Merge a node's patch into this state. See the module docs for the
    /// per-field rules. Never fails: structural validity is asserted
    /// separately by [`check_invariants`](Self::check_invariants).
    pub fn apply(&mut self, patch: StatePatch) {
        // Append-only history fields: concatenation, never truncation.
        self.conversation_history.extend(patch.conversation);
        self.research_results.extend(patch.research_results);
        self.user_decisions.extend(patch.user_decisions);
        self.errors.extend(patch.errors);
        self.validation_warnings.extend(patch.validation_warnings);
        self.inputs.clarifications.extend(patch.clarifications);

        // pending_decisions: ordered set semantics.
        for id in patch.pending_add {
            if !self.pending_decisions.contains(&id) {
                self.pending_decisions.push(id);
            }
        }
        if !patch.pending_remove.is_empty() {
            self.pending_decisions
                .retain(|id| !patch.pending_remove.contains(id));
        }

        // Inputs, written once by the loading stage.
        if let Some(prd) = patch.prd_content {
            self.inputs.prd_content = prd;
        }
        if let Some(docs) = patch.design_docs {
            self.inputs.design_docs = docs;
        }
        if let Some(bundle) = patch.code_bundle_ref {
            self.inputs.code_bundle_ref = bundle;
        }
        if !patch.design_decisions.is_empty() {
            self.inputs.design_decisions.extend(patch.design_decisions);
        }

        // Analysis fields: last write wins.
        if let Some(score) = patch.completeness_score {
            self.completeness_score = score.min(100);
        }
        if let Some(missing) = patch.missing_elements {
            self.missing_elements = missing;
        }
        if let Some(ambiguous) = patch.ambiguous_elements {
            self.ambiguous_elements = ambiguous;
        }
        if let Some(queue) = patch.clarification_queue {
            self.clarification_queue = queue;
        }
        if let Some(question) = patch.awaiting_question {
            self.awaiting_question = Some(question);
        }
        if patch.clear_awaiting_question {
            self.awaiting_question = None;
        }
        if let Some(gaps) = patch.tech_gaps {
            self.tech_gaps = gaps;
        }

        // Research bookkeeping.
        if let Some(candidate) = patch.candidate_decision {
            self.candidate_decision = Some(candidate);
        }
        if patch.clear_candidate {
            self.candidate_decision = None;
        }
        if let Some(rec) = patch.ai_recommendation {
            self.ai_recommendation = Some(rec);
        }
        if let Some(gap) = patch.active_gap_id {
            self.active_gap_id = Some(gap);
        }
        if patch.clear_active_gap {
            self.active_gap_id = None;
        }
        if let Some(query) = patch.custom_query {
            self.custom_query = Some(query);
        }
        if patch.clear_custom_query {
            self.custom_query = None;
        }

        // Code / API inference.
        if let Some(components) = patch.parsed_components {
            self.parsed_components = components;
        }
        if let Some(endpoints) = patch.inferred_api_spec {
            self.inferred_api_spec = endpoints;
        }

        // Generated artifacts.
        if let Some(draft) = patch.trd_draft {
            self.trd_draft = Some(draft);
        }
        if let Some(validation) = patch.trd_validation {
            self.trd_validation = Some(validation);
        }
        if let Some(trd) = patch.final_trd {
            self.final_trd = Some(trd);
        }
        if let Some(api) = patch.api_specification {
            self.api_specification = Some(api);
        }
        if let Some(schema) = patch.db_schema {
            self.db_schema = Some(schema);
        }
        if let Some(erd) = patch.db_erd {
            self.db_erd = Some(erd);
        }
        if let Some(diagram) = patch.architecture_diagram {
            self.architecture_diagram = Some(diagram);
        }
        if let Some(validation) = patch.architecture_validation {
            self.architecture_validation = Some(validation);
        }
        if let Some(doc) = patch.tech_stack_document {
            self.tech_stack_document = Some(doc);
        }
        if let Some(saved) = patch.saved_artifact {
            self.saved_artifact = Some(saved);
        }

        // Workflow control.
        if let Some(stage) = patch.current_stage {
            self.current_stage = stage;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if patch.bump_trd_iterations {
            self.trd_iterations += 1;
        }
        if patch.bump_research_rounds {
            self.research_rounds += 1;
        }
        if let Some(progress) = patch.progress {
            // Monotone by construction: merges by maximum.
            if progress > self.progress_percentage {
                self.progress_percentage = progress.min(100.0);
            }
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = Some(at);
        }
        if let Some(directive) = patch.resume_directive {
            self.resume_directive = Some(directive);
        }
        if patch.clear_resume_directive {
            self.resume_directive = None;
        }
    }

    /// Assert the structural invariants that must hold after any node
    /// returns. `trd_retry_cap` is the configured regeneration limit.
    pub fn check_invariants(&self, trd_retry_cap: u32) -> Result<(), InvariantViolation> {
        if self.completeness_score > 100 {
            return Err(InvariantViolation::ScoreOutOfRange {
                field: "completeness_score",
                value: u32::from(self.completeness_score),
            });
        }
        if let Some(v) = &self.trd_validation {
            if v.score > 100 {
                return Err(InvariantViolation::ScoreOutOfRange {
                    field: "trd_validation.score",
                    value: u32::from(v.score),
                });
            }
        }
        if !(0.0..=100.0).contains(&self.progress_percentage) {
            return Err(InvariantViolation::ProgressOutOfRange {
                value: self.progress_percentage,
            });
        }
        for pending in &self.pending_decisions {
            if !self.tech_gaps.iter().any(|g| &g.id == pending) {
                return Err(InvariantViolation::UnknownPendingGap {
                    gap_id: pending.clone(),
                });
            }
        }
        for decision in &self.user_decisions {
            if self.pending_decisions.contains(&decision.gap_id) {
                return Err(InvariantViolation::DecidedGapStillPending {
                    gap_id: decision.gap_id.clone(),
                });
            }
        }
        if self.trd_iterations > trd_retry_cap {
            return Err(InvariantViolation::IterationCapExceeded {
                counter: "trd_iterations",
                value: self.trd_iterations,
                cap: trd_retry_cap,
            });
        }
        if self.final_trd.is_some() {
            let valid = self.trd_validation.as_ref().is_some_and(|v| v.is_valid);
            if !valid && self.trd_iterations < trd_retry_cap {
                return Err(InvariantViolation::PrematureFinalTrd);
            }
        }
        Ok(())
    }

    /// Gap ids in research order: topological over `depends_on`, ties by
    /// declaration order. `None` if the dependency graph has a cycle.
    #[must_use]
    pub fn gap_research_order(&self) -> Option<Vec<String>> {
        topo_order(&self.tech_gaps)
    }

    /// The topologically-first gap that has neither been decided nor is
    /// awaiting a decision commit.
    #[must_use]
    pub fn next_undecided_gap(&self) -> Option<&TechGap> {
        let order = self.gap_research_order()?;
        let decided: Vec<&str> = self.user_decisions.iter().map(|d| d.gap_id.as_str()).collect();
        order
            .iter()
            .find(|id| {
                !decided.contains(&id.as_str()) && !self.pending_decisions.contains(*id)
            })
            .and_then(|id| self.tech_gaps.iter().find(|g| &g.id == id))
    }

    /// Most recent research result for a gap, if any.
    #[must_use]
    pub fn latest_research(&self, gap_id: &str) -> Option<&ResearchResult> {
        self.research_results.iter().rev().find(|r| r.gap_id == gap_id)
    }
}

/// Topological order over `depends_on`, ties by declaration order;
/// `None` when the dependency graph has a cycle.
pub(crate) fn topo_order(gaps: &[TechGap]) -> Option<Vec<String>> {
    let mut order = Vec::with_capacity(gaps.len());
    let mut placed: Vec<&str> = Vec::with_capacity(gaps.len());
    let mut remaining: Vec<&TechGap> = gaps.iter().collect();
    while !remaining.is_empty() {
        let ready = remaining.iter().position(|g| {
            g.depends_on
                .iter()
                // Dangling references do not block ordering.
                .all(|d| placed.contains(&d.as_str()) || !gaps.iter().any(|o| &o.id == d))
        })?;
        let gap = remaining.remove(ready);
        placed.push(&gap.id);
        order.push(gap.id.clone());
    }
    Some(order)
}

/// Partial state update returned by node execution, merged by
/// [`SessionState::apply`]. All fields optional; builders keep call sites
/// readable.
#[derive(Clone, Debug, Default)]
pub struct StatePatch {
    // Append-only
    pub conversation: Vec<ConversationEntry>,
    pub research_results: Vec<ResearchResult>,
    pub user_decisions: Vec<UserDecision>,
    pub errors: Vec<ErrorRecord>,
    pub validation_warnings: Vec<ValidationWarning>,
    pub clarifications: Vec<ClarificationAnswer>,
    pub design_decisions: Vec<String>,

    // Set ops
    pub pending_add: Vec<String>,
    pub pending_remove: Vec<String>,

    // Inputs
    pub prd_content: Option<String>,
    pub design_docs: Option<FxHashMap<DocKind, String>>,
    pub code_bundle_ref: Option<Option<String>>,

    // Analysis
    pub completeness_score: Option<u8>,
    pub missing_elements: Option<Vec<String>>,
    pub ambiguous_elements: Option<Vec<String>>,
    pub clarification_queue: Option<Vec<String>>,
    pub awaiting_question: Option<String>,
    pub clear_awaiting_question: bool,
    pub tech_gaps: Option<Vec<TechGap>>,

    // Research
    pub candidate_decision: Option<UserDecision>,
    pub clear_candidate: bool,
    pub ai_recommendation: Option<AiRecommendation>,
    pub active_gap_id: Option<String>,
    pub clear_active_gap: bool,
    pub custom_query: Option<String>,
    pub clear_custom_query: bool,

    // Code / API inference
    pub parsed_components: Option<Vec<ParsedComponent>>,
    pub inferred_api_spec: Option<Vec<ApiEndpoint>>,

    // Artifacts
    pub trd_draft: Option<String>,
    pub trd_validation: Option<TrdValidation>,
    pub final_trd: Option<String>,
    pub api_specification: Option<Value>,
    pub db_schema: Option<DbSchema>,
    pub db_erd: Option<String>,
    pub architecture_diagram: Option<String>,
    pub architecture_validation: Option<ArchitectureValidation>,
    pub tech_stack_document: Option<Value>,
    pub saved_artifact: Option<SavedArtifact>,

    // Control
    pub current_stage: Option<Stage>,
    pub status: Option<SessionStatus>,
    pub bump_trd_iterations: bool,
    pub bump_research_rounds: bool,
    pub progress: Option<f32>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resume_directive: Option<ResumeDirective>,
    pub clear_resume_directive: bool,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_conversation(mut self, entry: ConversationEntry) -> Self {
        self.conversation.push(entry);
        self
    }

    #[must_use]
    pub fn with_error(mut self, record: ErrorRecord) -> Self {
        self.errors.push(record);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = Some(progress);
        self
    }

    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.current_stage = Some(stage);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_resume_directive(mut self, directive: ResumeDirective) -> Self {
        self.resume_directive = Some(directive);
        self
    }
}

/// Structural invariant violations; always unrecoverable.
#[derive(Debug, Error, Diagnostic)]
pub enum InvariantViolation {
    #[error("{field} out of range: {value} (expected 0..=100)")]
    #[diagnostic(code(specloom::state::score_range))]
    ScoreOutOfRange { field: &'static str, value: u32 },

    #[error("progress out of range: {value}")]
    #[diagnostic(code(specloom::state::progress_range))]
    ProgressOutOfRange { value: f32 },

    #[error("pending decision references unknown gap: {gap_id}")]
    #[diagnostic(
        code(specloom::state::unknown_pending_gap),
        help("pending_decisions must be a subset of tech_gaps ids")
    )]
    UnknownPendingGap { gap_id: String },

    #[error("gap {gap_id} is decided but still pending")]
    #[diagnostic(code(specloom::state::decided_still_pending))]
    DecidedGapStillPending { gap_id: String },

    #[error("{counter} exceeded its cap: {value} > {cap}")]
    #[diagnostic(code(specloom::state::iteration_cap))]
    IterationCapExceeded {
        counter: &'static str,
        value: u32,
        cap: u32,
    },

    #[error("final_trd set before validation passed or the retry cap was reached")]
    #[diagnostic(code(specloom::state::premature_final_trd))]
    PrematureFinalTrd,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Urgency;

    fn gap(id: &str, depends_on: &[&str]) -> TechGap {
        TechGap {
            id: id.into(),
            category: "database".into(),
            description: String::new(),
            requirements: vec![],
            urgency: Urgency::High,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn fresh() -> SessionState {
        SessionState::new(
            SessionIdentity::next("p", "u", "j"),
            SessionInputs::default(),
        )
    }

    #[test]
    fn progress_merges_by_maximum() {
        let mut state = fresh();
        state.apply(StatePatch::new().with_progress(30.0));
        state.apply(StatePatch::new().with_progress(10.0));
        assert_eq!(state.progress_percentage, 30.0);
    }

    #[test]
    fn pending_decisions_are_a_set() {
        let mut state = fresh();
        state.tech_gaps = vec![gap("g1", &[])];
        let mut patch = StatePatch::new();
        patch.pending_add = vec!["g1".into(), "g1".into()];
        state.apply(patch);
        assert_eq!(state.pending_decisions, vec!["g1".to_string()]);
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let mut state = fresh();
        state.tech_gaps = vec![gap("b", &["a"]), gap("a", &[]), gap("c", &["b"])];
        assert_eq!(
            state.gap_research_order(),
            Some(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn cycle_yields_none() {
        let mut state = fresh();
        state.tech_gaps = vec![gap("a", &["b"]), gap("b", &["a"])];
        assert_eq!(state.gap_research_order(), None);
    }

    #[test]
    fn invariant_rejects_unknown_pending_gap() {
        let mut state = fresh();
        state.pending_decisions.push("ghost".into());
        assert!(matches!(
            state.check_invariants(3),
            Err(InvariantViolation::UnknownPendingGap { .. })
        ));
    }

    #[test]
    fn invariant_rejects_premature_final_trd() {
        let mut state = fresh();
        state.final_trd = Some("trd".into());
        state.trd_iterations = 1;
        assert!(matches!(
            state.check_invariants(3),
            Err(InvariantViolation::PrematureFinalTrd)
        ));
    }

    #[test]
    fn serde_round_trip_preserves_state() {
        let mut state = fresh();
        state.tech_gaps = vec![gap("g1", &[])];
        state.apply(
            StatePatch::new()
                .with_progress(15.0)
                .with_conversation(ConversationEntry::system("analyzed")),
        );
        let json = serde_json::to_string(&state).unwrap();
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
