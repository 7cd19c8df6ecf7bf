//! Upstream input loading.

use async_trait::async_trait;

use crate::domain::ConversationEntry;
use crate::node::{NodeContext, NodeError, NodeOutcome, WorkflowNode};
use crate::state::{SessionState, StatePatch};

/// Fetches the PRD, design documents and code-bundle reference from the
/// upstream collaborator. An incomplete bundle is a fail-fast
/// `UpstreamIncomplete`; the session never proceeds past this stage
/// without all required documents.
pub struct LoadInputs;

#[async_trait]
impl WorkflowNode for LoadInputs {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let bundle = ctx
            .collaborators
            .upstream
            .load(&state.identity.upstream_job_id)
            .await?;

        let mut patch = StatePatch::new();
        patch.prd_content = Some(bundle.prd);
        patch.design_docs = Some(bundle.design_docs);
        patch.code_bundle_ref = Some(bundle.code_bundle_ref.clone());
        patch = patch.with_conversation(ConversationEntry::system(format!(
            "Loaded upstream artifacts for job {} (code bundle: {})",
            state.identity.upstream_job_id,
            if bundle.code_bundle_ref.is_some() {
                "present"
            } else {
                "absent"
            },
        )));
        Ok(NodeOutcome::advance(patch))
    }
}
