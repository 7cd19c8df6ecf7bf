//! Decision intake: the interrupt/resume controller.
//!
//! While a session is parked at a waiting stage, the only legal way to
//! mutate it is through [`InterruptController::submit`]. The controller
//! checks that the session is actually awaiting input and that the caller
//! owns it, serializes concurrent submissions per session, deduplicates
//! replays by the client-supplied request id, applies the decision to
//! state, persists a checkpoint and echoes the message to subscribers.
//! Re-entering the runner afterwards is the scheduler's job.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, WORKFLOW_NAMESPACE};
use crate::config::Config;
use crate::domain::{
    ClarificationAnswer, ConversationEntry, DecisionSource, ResumeDirective, UserDecision,
};
use crate::events::{EventFanout, EventPayload};
use crate::state::SessionState;
use crate::types::{SessionStatus, Stage};

/// How the user answered an option presentation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionChoice {
    /// 1-based index into the presented options.
    OptionIndex { value: usize },
    OptionName { value: String },
    AiRecommendation,
    /// `search:<query>` — re-research the active gap with a custom query.
    Search { query: String },
}

impl SelectionChoice {
    /// Parse the wire form: an integer, `"ai_recommendation"`,
    /// `"search:<query>"`, or an option name.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("ai_recommendation") {
            return SelectionChoice::AiRecommendation;
        }
        if let Some(query) = trimmed.strip_prefix("search:") {
            return SelectionChoice::Search {
                query: query.trim().to_string(),
            };
        }
        if let Ok(value) = trimmed.parse::<usize>() {
            return SelectionChoice::OptionIndex { value };
        }
        SelectionChoice::OptionName {
            value: trimmed.to_string(),
        }
    }
}

/// Verdict on a critical-conflict warning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningOutcome {
    Reselect,
    Continue,
}

/// Decision payloads accepted by the three waiting stages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Clarification { answer: String },
    Selection(SelectionChoice),
    Warning { outcome: WarningOutcome },
}

/// One submission, as received from the session-control surface.
#[derive(Clone, Debug)]
pub struct DecisionRequest {
    pub session_id: String,
    /// Must equal the session's owner; authorization proper is external.
    pub user_id: String,
    /// Client-supplied id used to deduplicate replays.
    pub request_id: Option<String>,
    pub decision: Decision,
}

/// Result of a successful submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitReceipt {
    Applied,
    /// Identical replay of an already-applied request id; state untouched.
    Duplicate,
}

#[derive(Debug, Error, Diagnostic)]
pub enum InterruptError {
    #[error("session not found: {session_id}")]
    #[diagnostic(code(specloom::interrupt::session_not_found))]
    SessionNotFound { session_id: String },

    #[error("session is not awaiting input (stage: {stage})")]
    #[diagnostic(
        code(specloom::interrupt::not_awaiting),
        help("Decisions are only accepted while the session is parked at a waiting stage.")
    )]
    NotAwaitingInput { stage: Stage },

    #[error("user {caller} does not own this session")]
    #[diagnostic(code(specloom::interrupt::user_mismatch))]
    UserMismatch { caller: String },

    #[error("decision kind does not match the waiting stage {stage}")]
    #[diagnostic(code(specloom::interrupt::wrong_kind))]
    WrongDecisionKind { stage: Stage },

    #[error("invalid selection: {message}")]
    #[diagnostic(code(specloom::interrupt::invalid_selection))]
    InvalidSelection { message: String },

    #[error("conflicting resubmission of request id {request_id}")]
    #[diagnostic(
        code(specloom::interrupt::conflict),
        help("The same request id was already applied with a different payload.")
    )]
    Conflict { request_id: String },

    #[error(transparent)]
    #[diagnostic(code(specloom::interrupt::checkpoint))]
    Checkpoint(#[from] CheckpointError),
}

/// Serializes and applies external decisions for paused sessions.
pub struct InterruptController {
    store: Arc<dyn CheckpointStore>,
    fanout: Arc<EventFanout>,
    config: Arc<Config>,
    locks: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    applied: Mutex<FxHashMap<(String, String), u64>>,
}

impl InterruptController {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        fanout: Arc<EventFanout>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            fanout,
            config,
            locks: Mutex::new(FxHashMap::default()),
            applied: Mutex::new(FxHashMap::default()),
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Validate and apply one decision. On success the session state
    /// carries a [`ResumeDirective`] and a fresh checkpoint; the caller
    /// re-enters the runner.
    #[instrument(skip(self, request), fields(session = %request.session_id), err)]
    pub async fn submit(&self, request: DecisionRequest) -> Result<SubmitReceipt, InterruptError> {
        let lock = self.session_lock(&request.session_id);
        let _guard = lock.lock().await;

        // Idempotent replay / conflict detection by client request id.
        let fingerprint = decision_fingerprint(&request.decision);
        if let Some(request_id) = &request.request_id {
            let applied = self.applied.lock();
            if let Some(seen) = applied.get(&(request.session_id.clone(), request_id.clone())) {
                return if *seen == fingerprint {
                    Ok(SubmitReceipt::Duplicate)
                } else {
                    Err(InterruptError::Conflict {
                        request_id: request_id.clone(),
                    })
                };
            }
        }

        let latest = self
            .store
            .latest(&request.session_id, WORKFLOW_NAMESPACE)
            .await?
            .ok_or_else(|| InterruptError::SessionNotFound {
                session_id: request.session_id.clone(),
            })?;
        let mut state = latest.state()?;

        if !state.current_stage.is_waiting() || state.status.is_terminal() {
            return Err(InterruptError::NotAwaitingInput {
                stage: state.current_stage,
            });
        }
        if state.identity.user_id != request.user_id {
            return Err(InterruptError::UserMismatch {
                caller: request.user_id,
            });
        }

        let echo = self.apply(&mut state, &request.decision)?;

        state.status = SessionStatus::InProgress;
        let checkpoint = Checkpoint::snapshot(
            &request.session_id,
            WORKFLOW_NAMESPACE,
            latest.checkpoint_id + 1,
            Some(latest.checkpoint_id),
            &state,
            state.current_stage.as_str(),
        )?;
        self.store.put(checkpoint).await?;

        if let Some(request_id) = request.request_id {
            self.applied
                .lock()
                .insert((request.session_id.clone(), request_id), fingerprint);
        }
        self.fanout
            .publish(&request.session_id, EventPayload::UserMessageEcho { message: echo });
        Ok(SubmitReceipt::Applied)
    }

    /// Mutate state for one decision; returns the echo text. Leaves state
    /// untouched on error.
    fn apply(
        &self,
        state: &mut SessionState,
        decision: &Decision,
    ) -> Result<String, InterruptError> {
        match (state.current_stage, decision) {
            (Stage::AskClarification, Decision::Clarification { answer }) => {
                let question = state
                    .awaiting_question
                    .take()
                    .unwrap_or_else(|| "clarification".to_string());
                state.inputs.clarifications.push(ClarificationAnswer {
                    question,
                    answer: answer.clone(),
                    timestamp: Utc::now(),
                });
                state
                    .conversation_history
                    .push(ConversationEntry::user(answer.clone()));
                state.resume_directive = Some(ResumeDirective::Reanalyze);
                Ok(answer.clone())
            }

            (Stage::WaitUserDecision, Decision::Selection(choice)) => {
                self.apply_selection(state, choice)
            }

            (Stage::WarnUser, Decision::Warning { outcome }) => {
                let candidate =
                    state
                        .candidate_decision
                        .clone()
                        .ok_or(InterruptError::InvalidSelection {
                            message: "no candidate decision to act on".into(),
                        })?;
                let echo = match outcome {
                    WarningOutcome::Reselect => {
                        // Warnings stay in state; only the candidate is
                        // withdrawn.
                        state.candidate_decision = None;
                        state.resume_directive = Some(ResumeDirective::Reselect);
                        "reselect".to_string()
                    }
                    WarningOutcome::Continue => {
                        commit_decision(state, candidate);
                        state.resume_directive = Some(ResumeDirective::Proceed);
                        "continue".to_string()
                    }
                };
                state
                    .conversation_history
                    .push(ConversationEntry::user(echo.clone()));
                Ok(echo)
            }

            (stage, _) => Err(InterruptError::WrongDecisionKind { stage }),
        }
    }

    fn apply_selection(
        &self,
        state: &mut SessionState,
        choice: &SelectionChoice,
    ) -> Result<String, InterruptError> {
        let gap_id = state
            .active_gap_id
            .clone()
            .ok_or(InterruptError::InvalidSelection {
                message: "no gap is awaiting a decision".into(),
            })?;

        if let SelectionChoice::Search { query } = choice {
            state.custom_query = Some(query.clone());
            state.resume_directive = Some(ResumeDirective::Research {
                gap_id,
                query: query.clone(),
            });
            let echo = format!("search:{query}");
            state
                .conversation_history
                .push(ConversationEntry::user(echo.clone()));
            return Ok(echo);
        }

        let research =
            state
                .latest_research(&gap_id)
                .cloned()
                .ok_or(InterruptError::InvalidSelection {
                    message: format!("no research results for gap {gap_id}"),
                })?;

        let (chosen_name, source, reason) = match choice {
            SelectionChoice::OptionIndex { value } => {
                let option = value
                    .checked_sub(1)
                    .and_then(|i| research.options.get(i))
                    .ok_or(InterruptError::InvalidSelection {
                        message: format!(
                            "option index {value} out of range 1..={}",
                            research.options.len()
                        ),
                    })?;
                (
                    option.name.clone(),
                    DecisionSource::User,
                    format!("user selected option {value}"),
                )
            }
            SelectionChoice::OptionName { value } => {
                let option = research
                    .options
                    .iter()
                    .find(|o| o.name.eq_ignore_ascii_case(value))
                    .ok_or(InterruptError::InvalidSelection {
                        message: format!("no option named \"{value}\""),
                    })?;
                (
                    option.name.clone(),
                    DecisionSource::User,
                    "user selected by name".to_string(),
                )
            }
            SelectionChoice::AiRecommendation => {
                let rec = state
                    .ai_recommendation
                    .as_ref()
                    .filter(|r| r.gap_id == gap_id)
                    .ok_or(InterruptError::InvalidSelection {
                        message: "no AI recommendation available for this gap".into(),
                    })?;
                (
                    rec.name.clone(),
                    DecisionSource::AiRecommended,
                    rec.reason.clone(),
                )
            }
            SelectionChoice::Search { .. } => unreachable!("handled above"),
        };

        // A pick made from custom-search results is attributed to the
        // search, not the original presentation.
        let source = if state.custom_query.is_some() && source == DecisionSource::User {
            DecisionSource::CustomSearch
        } else {
            source
        };

        state.candidate_decision = Some(UserDecision {
            gap_id,
            chosen_name: chosen_name.clone(),
            reason,
            source,
            timestamp: Utc::now(),
        });
        state.resume_directive = Some(ResumeDirective::Validate);
        state
            .conversation_history
            .push(ConversationEntry::user(chosen_name.clone()));
        Ok(chosen_name)
    }

    /// Whether a paused session has outlived the absolute expiry window.
    #[must_use]
    pub fn is_expired(&self, last_activity: chrono::DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        Utc::now() - last_activity > ttl
    }
}

/// Commit a validated (or user-overridden) candidate: append the decision,
/// release the gap and clear the per-gap scratch fields.
pub(crate) fn commit_decision(state: &mut SessionState, candidate: UserDecision) {
    state
        .pending_decisions
        .retain(|id| id != &candidate.gap_id);
    state.user_decisions.push(candidate);
    state.candidate_decision = None;
    state.active_gap_id = None;
    state.custom_query = None;
}

fn decision_fingerprint(decision: &Decision) -> u64 {
    let mut hasher = FxHasher::default();
    // Serialization cannot fail for these enums; fall back to a stable
    // tag if it ever does.
    let encoded = serde_json::to_string(decision).unwrap_or_else(|_| "decision".to_string());
    encoded.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_parsing() {
        assert_eq!(
            SelectionChoice::parse("2"),
            SelectionChoice::OptionIndex { value: 2 }
        );
        assert_eq!(
            SelectionChoice::parse("AI_Recommendation"),
            SelectionChoice::AiRecommendation
        );
        assert_eq!(
            SelectionChoice::parse("search: rust auth crates"),
            SelectionChoice::Search {
                query: "rust auth crates".into()
            }
        );
        assert_eq!(
            SelectionChoice::parse("PostgreSQL"),
            SelectionChoice::OptionName {
                value: "PostgreSQL".into()
            }
        );
    }

    #[test]
    fn fingerprints_distinguish_payloads() {
        let a = decision_fingerprint(&Decision::Clarification {
            answer: "JWT".into(),
        });
        let b = decision_fingerprint(&Decision::Clarification {
            answer: "sessions".into(),
        });
        assert_ne!(a, b);
    }
}
