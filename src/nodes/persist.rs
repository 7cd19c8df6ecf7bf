//! Artifact persistence and downstream notification.

use async_trait::async_trait;
use chrono::Utc;

use crate::domain::{
    ArtifactRecord, ConversationEntry, ErrorKind, ErrorRecord, MessageType, NotifyPayload,
    TRD_FORCED_PASS, ValidationReport,
};
use crate::events::EventPayload;
use crate::node::{NodeContext, NodeError, NodeOutcome, WorkflowNode};
use crate::state::{SessionState, StatePatch};
use crate::types::SessionStatus;

/// Persists the artifact record through the artifact store. The store is
/// responsible for making the write transactional with the session-status
/// update and for assigning the strictly increasing version.
pub struct SaveArtifacts;

#[async_trait]
impl WorkflowNode for SaveArtifacts {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let final_trd = state.final_trd.clone().ok_or(NodeError::MissingInput {
            what: "final_trd",
        })?;
        let api_specification =
            state
                .api_specification
                .clone()
                .ok_or(NodeError::MissingInput {
                    what: "api_specification",
                })?;
        let database_schema = state.db_schema.clone().ok_or(NodeError::MissingInput {
            what: "db_schema",
        })?;
        let db_erd = state.db_erd.clone().ok_or(NodeError::MissingInput { what: "db_erd" })?;
        let architecture_diagram =
            state
                .architecture_diagram
                .clone()
                .ok_or(NodeError::MissingInput {
                    what: "architecture_diagram",
                })?;
        let tech_stack_document =
            state
                .tech_stack_document
                .clone()
                .ok_or(NodeError::MissingInput {
                    what: "tech_stack_document",
                })?;
        let trd_validation = state.trd_validation.clone().ok_or(NodeError::MissingInput {
            what: "trd_validation",
        })?;

        let mut report = ValidationReport {
            trd: Some(trd_validation.clone()),
            architecture: state.architecture_validation.clone(),
            notes: Vec::new(),
        };
        if !trd_validation.is_valid {
            // The retry cap forced acceptance of the last draft.
            report.notes.push(TRD_FORCED_PASS.to_string());
        }

        let record = ArtifactRecord {
            session_id: state.identity.session_id.to_string(),
            trd_content: final_trd,
            api_specification,
            database_schema,
            architecture_diagram,
            db_erd,
            tech_stack_document,
            quality_score: trd_validation.score,
            validation_report: report,
            // Assigned by the store; strictly increasing per session.
            version: 0,
        };
        let saved = ctx.collaborators.artifacts.save(record).await?;

        let mut patch = StatePatch::new().with_conversation(ConversationEntry::system(format!(
            "Persisted artifact {} (version {})",
            saved.artifact_id, saved.version
        )));
        patch.saved_artifact = Some(saved);
        Ok(NodeOutcome::advance(patch))
    }
}

/// Signals the downstream collaborator. Non-critical: failures are logged
/// and absorbed, never failing the session. Idempotency is the notifier's
/// contract (keyed by `session_id`), so at-least-once delivery is safe.
pub struct NotifyDownstream;

#[async_trait]
impl WorkflowNode for NotifyDownstream {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let saved = state.saved_artifact.clone().ok_or(NodeError::MissingInput {
            what: "saved_artifact",
        })?;
        let payload = NotifyPayload {
            project_id: state.identity.project_id.clone(),
            session_id: state.identity.session_id.to_string(),
            artifact_id: saved.artifact_id.clone(),
        };

        let mut patch = StatePatch::new();
        if let Err(e) = ctx.collaborators.notifier.notify(payload).await {
            tracing::warn!(error = %e, "downstream notification failed; continuing");
            patch.errors.push(ErrorRecord::recovered(
                ctx.stage.as_str(),
                ErrorKind::ExternalServiceError,
                format!("downstream notification failed: {e}"),
            ));
        }

        ctx.events.publish(EventPayload::Completion {
            artifact_id: saved.artifact_id.clone(),
            version: saved.version,
        });

        patch = patch.with_conversation(ConversationEntry::agent(
            "Technical specification package is ready",
            MessageType::Confirmation,
        ));
        patch.status = Some(SessionStatus::Completed);
        patch.completed_at = Some(Utc::now());
        patch.progress = Some(100.0);
        Ok(NodeOutcome::advance(patch))
    }
}
