//! Node execution primitives.
//!
//! A node is one step of the workflow: an async function from the current
//! [`SessionState`] to a [`StatePatch`] plus a [`Control`] hint. Nodes are
//! stateless; everything they need arrives through the state snapshot and
//! the [`NodeContext`].
//!
//! # Error handling
//!
//! Nodes report faults two ways:
//!
//! 1. **Fatal**: return `Err(NodeError)` — the runner classifies the kind
//!    and either retries (transient) or fails the session.
//! 2. **Absorbed**: append an [`crate::domain::ErrorRecord`] with
//!    `recovered = true` to the patch and return `Ok` — the route is
//!    unchanged.

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use std::sync::Arc;

use crate::collaborators::{CollaboratorError, Collaborators};
use crate::config::Config;
use crate::domain::ErrorKind;
use crate::events::SessionPublisher;
use crate::state::{SessionState, StatePatch};
use crate::types::Stage;

/// What the runner should do after merging a node's patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    /// Ask the router for the next stage.
    Continue,
    /// Checkpoint, hand the session back to the scheduler, and wait for an
    /// external decision.
    WaitForUser,
    /// The node decided the session cannot proceed.
    Fail,
}

/// Patch plus control hint returned by node execution.
#[derive(Debug, Default)]
pub struct NodeOutcome {
    pub patch: StatePatch,
    pub control: Control,
}

impl Default for Control {
    fn default() -> Self {
        Control::Continue
    }
}

impl NodeOutcome {
    pub fn advance(patch: StatePatch) -> Self {
        Self {
            patch,
            control: Control::Continue,
        }
    }

    pub fn wait(patch: StatePatch) -> Self {
        Self {
            patch,
            control: Control::WaitForUser,
        }
    }
}

/// Execution context handed to every node invocation.
#[derive(Clone)]
pub struct NodeContext {
    /// Stage being executed.
    pub stage: Stage,
    /// 1-based attempt number (grows across inline retries).
    pub attempt: u32,
    /// Event publishing handle bound to this session.
    pub events: SessionPublisher,
    /// External collaborator handles.
    pub collaborators: Arc<Collaborators>,
    pub config: Arc<Config>,
}

/// One executable step of the workflow.
#[async_trait]
pub trait WorkflowNode: Send + Sync {
    async fn run(&self, state: &SessionState, ctx: &NodeContext)
    -> Result<NodeOutcome, NodeError>;
}

/// Fatal node faults. The runner maps each variant to an [`ErrorKind`] and
/// the matching retry/escalation policy.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// A previous stage should have produced this data.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(specloom::node::missing_input),
        help("Check that the preceding stage produced {what}.")
    )]
    MissingInput { what: &'static str },

    /// State is structurally broken (e.g. a gap dependency cycle).
    #[error("invalid state: {message}")]
    #[diagnostic(code(specloom::node::invalid_state))]
    InvalidState { message: String },

    /// Collaborator fault; transient ones are retried.
    #[error(transparent)]
    #[diagnostic(code(specloom::node::collaborator))]
    Collaborator(#[from] CollaboratorError),

    /// An LLM envelope did not parse into the expected shape.
    #[error("unparseable {task} response: {source}")]
    #[diagnostic(
        code(specloom::node::envelope),
        help("The completion did not match the JSON envelope the node asked for.")
    )]
    Envelope {
        task: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl NodeError {
    /// The [`ErrorKind`] recorded in the session error log for this fault.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::MissingInput { .. } | NodeError::InvalidState { .. } => {
                ErrorKind::InvalidState
            }
            NodeError::Collaborator(CollaboratorError::UpstreamIncomplete { .. }) => {
                ErrorKind::UpstreamIncomplete
            }
            NodeError::Collaborator(_) | NodeError::Envelope { .. } => {
                ErrorKind::ExternalServiceError
            }
        }
    }

    /// Whether the runner's inline retry policy applies.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Collaborator(e) => e.is_transient(),
            // A malformed envelope is usually prompt nondeterminism; a
            // fresh completion often parses.
            NodeError::Envelope { .. } => true,
            _ => false,
        }
    }
}
