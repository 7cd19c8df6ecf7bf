//! External collaborator seams.
//!
//! The core never talks to the outside world directly: upstream artifact
//! loading, downstream notification, LLM completion, web search, code
//! parsing and artifact persistence are each one trait here, injected into
//! the scheduler at construction. Tests substitute in-memory
//! implementations; production wires real clients.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::domain::{ArtifactRecord, DocKind, NotifyPayload, ParsedComponent, SavedArtifact, SearchHit};

/// Faults surfaced by any collaborator. `Unavailable` is transient and
/// retried by the runner; the rest map to their dedicated policies.
#[derive(Debug, Error, Diagnostic)]
pub enum CollaboratorError {
    /// Required upstream documents are missing. Fail fast, never retried.
    #[error("upstream bundle incomplete, missing: {missing:?}")]
    #[diagnostic(
        code(specloom::collaborators::upstream_incomplete),
        help("The upstream job must provide prd, design_system, ux_flow and screen_specs.")
    )]
    UpstreamIncomplete { missing: Vec<String> },

    /// Transient provider failure (LLM, search, storage, notifier).
    #[error("{service} unavailable: {message}")]
    #[diagnostic(code(specloom::collaborators::unavailable))]
    Unavailable {
        service: &'static str,
        message: String,
    },

    /// The provider answered but the payload is unusable.
    #[error("{service} returned malformed payload: {message}")]
    #[diagnostic(code(specloom::collaborators::malformed))]
    Malformed {
        service: &'static str,
        message: String,
    },
}

/// Everything the upstream loader hands over for one job.
#[derive(Clone, Debug, Default)]
pub struct UpstreamBundle {
    pub prd: String,
    pub design_docs: FxHashMap<DocKind, String>,
    pub code_bundle_ref: Option<String>,
}

/// Fetches the upstream design artifacts for a job.
#[async_trait]
pub trait UpstreamLoader: Send + Sync {
    /// Errors with [`CollaboratorError::UpstreamIncomplete`] when a
    /// required document is absent.
    async fn load(&self, upstream_job_id: &str) -> Result<UpstreamBundle, CollaboratorError>;
}

/// Signals the next pipeline stage once artifacts are persisted.
/// Must be idempotent on `session_id`; the notify stage delivers
/// at-least-once.
#[async_trait]
pub trait DownstreamNotifier: Send + Sync {
    async fn notify(&self, payload: NotifyPayload) -> Result<(), CollaboratorError>;
}

/// Opaque LLM completion. `task` names the calling node's intent so
/// implementations (and test scripts) can dispatch without parsing the
/// prompt; the returned string is whatever envelope the node asked for.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, task: &str, prompt: &str) -> Result<String, CollaboratorError>;
}

/// Web search used by the research loop.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, CollaboratorError>;
}

/// Extracts component records from an uploaded code bundle. Individual
/// file failures are tolerated inside the implementation; only a wholly
/// unreadable bundle is an error.
#[async_trait]
pub trait CodeBundleParser: Send + Sync {
    async fn parse(&self, bundle_ref: &str) -> Result<Vec<ParsedComponent>, CollaboratorError>;
}

/// Persists the final artifact record. The write must be transactional
/// with the session-status update, and the returned version strictly
/// increasing per session.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save(&self, record: ArtifactRecord) -> Result<SavedArtifact, CollaboratorError>;
}

/// Bundle of all collaborator handles, passed into the scheduler at
/// construction and reachable from every node context.
pub struct Collaborators {
    pub upstream: std::sync::Arc<dyn UpstreamLoader>,
    pub notifier: std::sync::Arc<dyn DownstreamNotifier>,
    pub llm: std::sync::Arc<dyn LlmClient>,
    pub search: std::sync::Arc<dyn WebSearch>,
    pub code_parser: std::sync::Arc<dyn CodeBundleParser>,
    pub artifacts: std::sync::Arc<dyn ArtifactStore>,
}

impl CollaboratorError {
    /// Whether the runner should retry the node that saw this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Unavailable { .. })
    }
}
