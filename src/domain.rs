//! Typed domain records carried by the session state.
//!
//! Everything the workflow accumulates — discovered technology gaps,
//! researched options, user decisions, parsed components, inferred
//! endpoints, generated artifacts and the conversation log — is a plain
//! serde-serializable struct defined here. The state module composes these
//! into [`crate::state::SessionState`]; nodes only ever construct them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of upstream design documents. The upstream loader must supply all
/// of them; the PRD travels separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    DesignSystem,
    UxFlow,
    ScreenSpecs,
}

impl DocKind {
    pub const ALL: &[DocKind] = &[DocKind::DesignSystem, DocKind::UxFlow, DocKind::ScreenSpecs];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::DesignSystem => "design_system",
            DocKind::UxFlow => "ux_flow",
            DocKind::ScreenSpecs => "screen_specs",
        }
    }
}

/// How urgently a technology gap must be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Critical,
    High,
    Medium,
    Low,
}

/// An unresolved technology-selection question discovered during analysis.
///
/// `depends_on` references other gap ids and defines research order; the
/// gap graph must be acyclic or the session is failed as invalid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TechGap {
    pub id: String,
    /// Coarse category such as `authentication` or `database`; also the
    /// key of the research cache and of the fallback option library.
    pub category: String,
    pub description: String,
    /// Requirements from the PRD the chosen technology must satisfy.
    pub requirements: Vec<String>,
    pub urgency: Urgency,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Numeric facets of a researched option, each 0–100. The recommendation
/// score is a weighted sum of these.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionScores {
    pub ease_of_use: u8,
    pub popularity: u8,
    pub recency: u8,
    pub docs: u8,
    pub cost: u8,
    pub setup: u8,
}

impl OptionScores {
    /// Weighted recommendation score: ease_of_use 30, popularity 20,
    /// recency 15, docs 10, cost 15, setup 10 (weights sum to 100).
    #[must_use]
    pub fn weighted(&self) -> u32 {
        u32::from(self.ease_of_use) * 30
            + u32::from(self.popularity) * 20
            + u32::from(self.recency) * 15
            + u32::from(self.docs) * 10
            + u32::from(self.cost) * 15
            + u32::from(self.setup) * 10
    }
}

/// One candidate technology for a gap, enriched during research.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TechOption {
    pub name: String,
    pub description: String,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
    /// Opaque popularity data (stars, downloads, survey rank…).
    #[serde(default)]
    pub popularity_metrics: Value,
    pub docs_url: String,
    pub learning_curve: String,
    pub setup_time: String,
    pub cost: String,
    #[serde(default)]
    pub scores: OptionScores,
}

/// An enriched option set appended for one gap. Append-only in state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    pub gap_id: String,
    pub options: Vec<TechOption>,
    pub timestamp: DateTime<Utc>,
}

/// The AI pick computed when options are presented, so a later
/// `"ai_recommendation"` selection can be resolved without recomputing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AiRecommendation {
    pub gap_id: String,
    pub name: String,
    pub reason: String,
}

/// Where a committed decision came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    User,
    AiRecommended,
    CustomSearch,
}

/// A choice that resolves a gap. Lives in `candidate_decision` while it is
/// still subject to validation, and is appended to `user_decisions` only
/// once accepted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserDecision {
    pub gap_id: String,
    pub chosen_name: String,
    pub reason: String,
    pub source: DecisionSource,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    RequirementMismatch,
    TechIncompatibility,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSeverity {
    Critical,
    Warning,
}

/// Compatibility finding for a candidate decision. Retained in state even
/// when the user re-selects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub gap_id: String,
    pub kind: WarningKind,
    pub severity: WarningSeverity,
    pub description: String,
}

impl ValidationWarning {
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.severity == WarningSeverity::Critical
    }
}

/// A UI component extracted from the uploaded code bundle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParsedComponent {
    pub name: String,
    pub file_path: String,
    #[serde(default)]
    pub props_schema: Value,
    #[serde(default)]
    pub state_vars: Vec<String>,
    /// Raw call sites such as `"GET /api/projects"`; endpoint inference
    /// parses these.
    #[serde(default)]
    pub api_calls: Vec<String>,
    #[serde(default)]
    pub event_handlers: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSource {
    ComponentCode,
    DesignDocs,
}

/// An inferred API endpoint; deduplicated on `(method, path)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub request_shape: Value,
    #[serde(default)]
    pub response_shape: Value,
    pub source: EndpointSource,
}

/// Critique of a TRD draft. `is_valid` means the score met the quality
/// threshold; the retry loop regenerates otherwise, up to its cap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrdValidation {
    pub score: u8,
    pub is_valid: bool,
    #[serde(default)]
    pub missing_sections: Vec<String>,
    #[serde(default)]
    pub inconsistencies: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Critique of the architecture diagram. Low scores record warnings but
/// never trigger regeneration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureValidation {
    pub score: u8,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbColumn {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub references: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbTable {
    pub name: String,
    pub columns: Vec<DbColumn>,
}

/// Generated database schema: executable DDL plus its structured form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbSchema {
    pub ddl: String,
    pub tables: Vec<DbTable>,
}

/// Who authored a conversation entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    Agent,
    User,
    System,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Question,
    OptionPresentation,
    Confirmation,
    ErrorNotice,
    Info,
}

/// One entry of the append-only conversation log.
///
/// Prefer the role constructors over struct literals:
///
/// ```rust
/// use specloom::domain::{ConversationEntry, MessageType};
///
/// let q = ConversationEntry::agent("Which auth provider?", MessageType::Question)
///     .expecting_input();
/// assert!(q.expecting_input);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: ConversationRole,
    pub message: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub expecting_input: bool,
}

impl ConversationEntry {
    pub fn agent(message: impl Into<String>, message_type: MessageType) -> Self {
        Self::new(ConversationRole::Agent, message, message_type)
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ConversationRole::User, message, MessageType::Info)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ConversationRole::System, message, MessageType::Info)
    }

    fn new(role: ConversationRole, message: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            role,
            message: message.into(),
            message_type,
            timestamp: Utc::now(),
            expecting_input: false,
        }
    }

    #[must_use]
    pub fn expecting_input(mut self) -> Self {
        self.expecting_input = true;
        self
    }
}

/// Closed set of error kinds; each maps to one handling policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UpstreamIncomplete,
    InvalidState,
    NodeTimeout,
    ExternalServiceError,
    ValidationBelowThreshold,
    UserTimeout,
    StorageUnavailable,
    Cancelled,
    /// Web search exhausted its retries and the static option library was
    /// used instead. Always recorded with `recovered = true`.
    ResearchFallback,
}

/// One entry of the append-only error log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Stage name the error was observed in.
    pub node: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub recovered: bool,
    pub when: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn recovered(node: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(node, kind, message, true)
    }

    pub fn fatal(node: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(node, kind, message, false)
    }

    fn new(
        node: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        recovered: bool,
    ) -> Self {
        Self {
            node: node.into(),
            kind,
            message: message.into(),
            stack: None,
            retry_count: 0,
            recovered,
            when: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// A clarification the user answered while the completeness loop ran.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClarificationAnswer {
    pub question: String,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
}

/// Routing hint left behind by the interrupt controller for the router to
/// consume when execution re-enters after a waiting stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumeDirective {
    /// Clarification answered; re-run the completeness analysis.
    Reanalyze,
    /// An option was chosen; validate the candidate decision.
    Validate,
    /// The user asked for a custom search on the active gap.
    Research { gap_id: String, query: String },
    /// Critical warning acknowledged with "reselect".
    Reselect,
    /// Critical warning acknowledged with "continue".
    Proceed,
}

/// Aggregated validation outcome persisted with the final artifacts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    #[serde(default)]
    pub trd: Option<TrdValidation>,
    #[serde(default)]
    pub architecture: Option<ArchitectureValidation>,
    /// Free-form annotations, e.g. `trd.forced_pass` when the retry cap
    /// forced acceptance of the draft.
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Note recorded in [`ValidationReport::notes`] when the TRD retry cap was
/// reached without a passing score.
pub const TRD_FORCED_PASS: &str = "trd.forced_pass";

/// The six generated documents plus scores, persisted at the save stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub session_id: String,
    pub trd_content: String,
    pub api_specification: Value,
    pub database_schema: DbSchema,
    pub architecture_diagram: String,
    pub db_erd: String,
    pub tech_stack_document: Value,
    pub quality_score: u8,
    pub validation_report: ValidationReport,
    /// Strictly increasing per `session_id`; assigned by the store.
    pub version: u32,
}

/// Store receipt for a persisted artifact record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedArtifact {
    pub artifact_id: String,
    pub version: u32,
}

/// Payload handed to the downstream notifier; idempotent on `session_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub project_id: String,
    pub session_id: String,
    pub artifact_id: String,
}

/// One web-search hit before enrichment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_score_uses_spec_weights() {
        let scores = OptionScores {
            ease_of_use: 100,
            popularity: 0,
            recency: 0,
            docs: 0,
            cost: 0,
            setup: 0,
        };
        assert_eq!(scores.weighted(), 3000);

        let uniform = OptionScores {
            ease_of_use: 50,
            popularity: 50,
            recency: 50,
            docs: 50,
            cost: 50,
            setup: 50,
        };
        assert_eq!(uniform.weighted(), 5000);
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ResearchFallback).unwrap();
        assert_eq!(json, "\"research_fallback\"");
    }

    #[test]
    fn conversation_constructors() {
        let entry = ConversationEntry::agent("pick one", MessageType::Question).expecting_input();
        assert_eq!(entry.role, ConversationRole::Agent);
        assert!(entry.expecting_input);
        let echo = ConversationEntry::user("option 2");
        assert!(!echo.expecting_input);
    }
}
