//! PRD analysis: completeness scoring, clarification, gap identification.

use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::{ConversationEntry, MessageType, TechGap};
use crate::node::{NodeContext, NodeError, NodeOutcome, WorkflowNode};
use crate::router::COMPLETENESS_THRESHOLD;
use crate::state::{SessionState, StatePatch, topo_order};

/// Scores the PRD and design documents against a fixed weighted rubric
/// and extracts missing and ambiguous elements.
pub struct AnalyzeCompleteness;

#[derive(Deserialize)]
struct CompletenessEnvelope {
    completeness_score: u8,
    #[serde(default)]
    missing_elements: Vec<String>,
    #[serde(default)]
    ambiguous_elements: Vec<String>,
}

#[async_trait]
impl WorkflowNode for AnalyzeCompleteness {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let mut prompt = String::new();
        prompt.push_str("Score the completeness (0-100, weighted rubric) of this PRD and design documents. ");
        prompt.push_str(
            "Respond as JSON: {\"completeness_score\", \"missing_elements\", \"ambiguous_elements\"}.\n\nPRD:\n",
        );
        prompt.push_str(&state.inputs.prd_content);
        for (kind, body) in &state.inputs.design_docs {
            prompt.push_str(&format!("\n\n{}:\n{}", kind.as_str(), body));
        }
        for answer in &state.inputs.clarifications {
            prompt.push_str(&format!(
                "\n\nClarification — {}: {}",
                answer.question, answer.answer
            ));
        }

        let raw = ctx
            .collaborators
            .llm
            .complete("analyze_completeness", &prompt)
            .await?;
        let envelope: CompletenessEnvelope = super::parse_llm_json("analyze_completeness", &raw)?;

        let score = envelope.completeness_score.min(100);
        // Only questions the user has not already answered go back on the
        // queue, so the clarification loop converges.
        let queue: Vec<String> = if score >= COMPLETENESS_THRESHOLD {
            Vec::new()
        } else {
            envelope
                .missing_elements
                .iter()
                .chain(envelope.ambiguous_elements.iter())
                .filter(|q| {
                    !state
                        .inputs
                        .clarifications
                        .iter()
                        .any(|a| &a.question == *q)
                })
                .cloned()
                .collect()
        };

        let mut patch = StatePatch::new();
        patch.completeness_score = Some(score);
        patch.missing_elements = Some(envelope.missing_elements);
        patch.ambiguous_elements = Some(envelope.ambiguous_elements);
        patch.clarification_queue = Some(queue);
        patch = patch.with_conversation(ConversationEntry::system(format!(
            "Completeness analysis scored {score}/100"
        )));
        Ok(NodeOutcome::advance(patch))
    }
}

/// Dequeues one unresolved element, poses it to the user and suspends.
/// The answer re-enters through the interrupt controller and routes back
/// to the completeness analysis.
pub struct AskClarification;

#[async_trait]
impl WorkflowNode for AskClarification {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let Some(item) = state.clarification_queue.first() else {
            return Err(NodeError::MissingInput {
                what: "clarification_queue",
            });
        };
        let question = format!("The PRD needs clarification: {item}. Could you elaborate?");
        ctx.events
            .agent_message(question.clone(), MessageType::Question, None);

        let mut patch = StatePatch::new();
        patch.awaiting_question = Some(item.clone());
        patch.clarification_queue = Some(state.clarification_queue[1..].to_vec());
        patch = patch.with_conversation(
            ConversationEntry::agent(question, MessageType::Question).expecting_input(),
        );
        Ok(NodeOutcome::wait(patch))
    }
}

/// Derives the list of technology gaps, ordered for research by their
/// `depends_on` references. A dependency cycle is an unrecoverable
/// invalid-state fault.
pub struct IdentifyTechGaps;

#[derive(Deserialize)]
struct GapsEnvelope {
    #[serde(default)]
    gaps: Vec<TechGap>,
}

#[async_trait]
impl WorkflowNode for IdentifyTechGaps {
    async fn run(
        &self,
        state: &SessionState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let mut prompt = String::from(
            "Identify unresolved technology choices in this PRD as JSON \
             {\"gaps\": [{\"id\", \"category\", \"description\", \"requirements\", \
             \"urgency\", \"depends_on\"}]}. Urgency is one of critical/high/medium/low.\n\nPRD:\n",
        );
        prompt.push_str(&state.inputs.prd_content);
        for decision in &state.inputs.design_decisions {
            prompt.push_str(&format!("\nAlready decided: {decision}"));
        }

        let raw = ctx
            .collaborators
            .llm
            .complete("identify_tech_gaps", &prompt)
            .await?;
        let envelope: GapsEnvelope = super::parse_llm_json("identify_tech_gaps", &raw)?;

        if topo_order(&envelope.gaps).is_none() {
            return Err(NodeError::InvalidState {
                message: "tech gap dependencies contain a cycle".into(),
            });
        }

        let mut patch = StatePatch::new();
        patch = patch.with_conversation(ConversationEntry::system(format!(
            "Identified {} technology gap(s)",
            envelope.gaps.len()
        )));
        patch.tech_gaps = Some(envelope.gaps);
        Ok(NodeOutcome::advance(patch))
    }
}
