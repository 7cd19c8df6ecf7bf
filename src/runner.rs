//! Per-session execution loop.
//!
//! The runner is the single writer of a session's state. One call to
//! [`Runner::drive`] loads the latest checkpoint, then loops: route to the
//! next stage, publish its progress target, execute the node under its
//! wall-clock budget with inline retries, merge the patch, assert the
//! state invariants, and persist a checkpoint. The loop exits when the
//! router reaches the end, a waiting stage suspends the session, the
//! checkpoint store stays unavailable, cancellation is observed at a node
//! boundary, or an unrecoverable fault fails the session.
//!
//! Interrupt/resume is deliberately not coroutine suspension: a
//! `wait_for_user` node makes `drive` return
//! [`RunOutcome::AwaitingUser`], and all progress lives in the checkpoint
//! — never on a stack. Because the checkpoint write follows node success,
//! a crash re-executes at most the most recent node on resume.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use miette::Diagnostic;
use thiserror::Error;
use tracing::instrument;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, WORKFLOW_NAMESPACE};
use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::domain::{ErrorKind, ErrorRecord};
use crate::events::{EventFanout, EventPayload, SessionPublisher};
use crate::node::{Control, NodeContext, NodeOutcome};
use crate::registry::{NodeBinding, NodeRegistry};
use crate::router::{Next, research_progress, route};
use crate::state::SessionState;
use crate::types::{SessionStatus, Stage};

/// How one `drive` call ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The notify stage ran; the session is terminal and successful.
    Completed,
    /// Suspended at a waiting stage; resumable through the interrupt
    /// controller.
    AwaitingUser(Stage),
    /// The checkpoint store stayed unavailable; the last node run counts
    /// as not completed and the scheduler should requeue the session.
    StoragePaused,
    /// Unrecoverable fault; the session is terminal.
    Failed(ErrorKind),
    /// Cancellation observed at a node boundary.
    Cancelled,
}

#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error("session not found: {session_id}")]
    #[diagnostic(code(specloom::runner::session_not_found))]
    SessionNotFound { session_id: String },

    #[error(transparent)]
    #[diagnostic(code(specloom::runner::checkpoint))]
    Checkpoint(#[from] CheckpointError),
}

/// Executes sessions against a node registry. Cheap to clone.
#[derive(Clone)]
pub struct Runner {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn CheckpointStore>,
    fanout: Arc<EventFanout>,
    collaborators: Arc<Collaborators>,
    config: Arc<Config>,
}

impl Runner {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<dyn CheckpointStore>,
        fanout: Arc<EventFanout>,
        collaborators: Arc<Collaborators>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            store,
            fanout,
            collaborators,
            config,
        }
    }

    /// Run a session forward from its latest checkpoint until it
    /// completes, suspends, fails or is cancelled.
    #[instrument(skip(self, cancel), err)]
    pub async fn drive(
        &self,
        session_id: &str,
        cancel: &AtomicBool,
    ) -> Result<RunOutcome, RunnerError> {
        let latest = self
            .store
            .latest(session_id, WORKFLOW_NAMESPACE)
            .await?
            .ok_or_else(|| RunnerError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let mut state = latest.state()?;
        let mut next_checkpoint_id = latest.checkpoint_id + 1;

        loop {
            if cancel.load(Ordering::Relaxed) {
                state.status = SessionStatus::Cancelled;
                state.errors.push(ErrorRecord::recovered(
                    state.current_stage.as_str(),
                    ErrorKind::Cancelled,
                    "cancelled at node boundary",
                ));
                let _ = self
                    .persist(session_id, &mut next_checkpoint_id, &state)
                    .await;
                tracing::info!(session = session_id, "session cancelled at node boundary");
                return Ok(RunOutcome::Cancelled);
            }

            let next = match route(&state, &self.config) {
                Ok(next) => next,
                Err(e) => {
                    return Ok(self
                        .fail(
                            session_id,
                            &mut next_checkpoint_id,
                            &mut state,
                            ErrorKind::InvalidState,
                            e.to_string(),
                        )
                        .await);
                }
            };

            let stage = match next {
                Next::End => {
                    return Ok(match state.status {
                        SessionStatus::Failed => RunOutcome::Failed(ErrorKind::InvalidState),
                        _ => RunOutcome::Completed,
                    });
                }
                Next::AwaitUser(stage) => return Ok(RunOutcome::AwaitingUser(stage)),
                Next::Run(stage) => stage,
            };

            // The directive routed us out of a waiting stage; it is spent.
            if state.current_stage.is_waiting() && state.resume_directive.is_some() {
                state.resume_directive = None;
            }

            let Some(binding) = self.registry.binding(stage) else {
                return Ok(self
                    .fail(
                        session_id,
                        &mut next_checkpoint_id,
                        &mut state,
                        ErrorKind::InvalidState,
                        format!("no node bound for stage {stage}"),
                    )
                    .await);
            };

            let progress = self.entry_progress(&state, stage, binding);
            self.fanout.publish(
                session_id,
                EventPayload::ProgressUpdate {
                    progress,
                    stage: stage.as_str().to_string(),
                    message: None,
                },
            );

            let (outcome, attempts) = match self.execute(session_id, stage, binding, &state).await {
                Ok(pair) => pair,
                Err((kind, message)) => {
                    state.current_stage = stage;
                    return Ok(self
                        .fail(session_id, &mut next_checkpoint_id, &mut state, kind, message)
                        .await);
                }
            };

            state.current_stage = stage;
            state.status = SessionStatus::InProgress;
            let NodeOutcome { mut patch, control } = outcome;
            if patch.progress.is_none() {
                patch.progress = Some(progress);
            }
            state.apply(patch);
            if attempts > 1 {
                state.errors.push(
                    ErrorRecord::recovered(
                        stage.as_str(),
                        ErrorKind::ExternalServiceError,
                        format!("{stage} succeeded after {} retries", attempts - 1),
                    )
                    .with_retries(attempts - 1),
                );
            }

            if let Err(violation) = state.check_invariants(self.config.trd_max_regenerations) {
                return Ok(self
                    .fail(
                        session_id,
                        &mut next_checkpoint_id,
                        &mut state,
                        ErrorKind::InvalidState,
                        violation.to_string(),
                    )
                    .await);
            }

            match control {
                Control::Fail => {
                    return Ok(self
                        .fail(
                            session_id,
                            &mut next_checkpoint_id,
                            &mut state,
                            ErrorKind::InvalidState,
                            format!("{stage} declared the session unrecoverable"),
                        )
                        .await);
                }
                Control::WaitForUser => {
                    state.status = SessionStatus::Paused;
                    if !self
                        .persist(session_id, &mut next_checkpoint_id, &state)
                        .await
                    {
                        return Ok(RunOutcome::StoragePaused);
                    }
                    return Ok(RunOutcome::AwaitingUser(stage));
                }
                Control::Continue => {
                    if !self
                        .persist(session_id, &mut next_checkpoint_id, &state)
                        .await
                    {
                        return Ok(RunOutcome::StoragePaused);
                    }
                }
            }
        }
    }

    /// Published progress on stage entry: the declared target, lifted by
    /// the research-loop interpolation, clamped non-decreasing against the
    /// session's progress so far.
    fn entry_progress(&self, state: &SessionState, stage: Stage, binding: &NodeBinding) -> f32 {
        let mut target = binding.progress_target;
        if matches!(
            stage,
            Stage::ResearchTechnologies
                | Stage::PresentOptions
                | Stage::WaitUserDecision
                | Stage::ValidateDecision
                | Stage::WarnUser
        ) {
            target = target.max(research_progress(state));
        }
        target.max(state.progress_percentage)
    }

    /// Execute one node under its budget with inline retries. Returns the
    /// outcome plus how many attempts it took, or the escalated failure.
    async fn execute(
        &self,
        session_id: &str,
        stage: Stage,
        binding: &NodeBinding,
        state: &SessionState,
    ) -> Result<(NodeOutcome, u32), (ErrorKind, String)> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let ctx = NodeContext {
                stage,
                attempt,
                events: SessionPublisher::new(self.fanout.clone(), session_id),
                collaborators: self.collaborators.clone(),
                config: self.config.clone(),
            };
            let run = tokio::time::timeout(binding.budget, binding.node.run(state, &ctx)).await;
            let failure: (ErrorKind, String, bool) = match run {
                Ok(Ok(outcome)) => return Ok((outcome, attempt)),
                Ok(Err(e)) => (e.kind(), e.to_string(), e.is_retryable()),
                Err(_) => (
                    ErrorKind::NodeTimeout,
                    format!("{stage} exceeded its {:?} budget", binding.budget),
                    true,
                ),
            };
            let (kind, message, retryable) = failure;
            if !retryable || attempt > binding.retry_limit {
                return Err((kind, message));
            }
            let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
            tracing::debug!(
                session = session_id,
                %stage,
                attempt,
                error = %message,
                "retrying node after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Persist a checkpoint with bounded backoff; `false` means the store
    /// stayed unavailable and the caller must treat the node run as not
    /// completed.
    async fn persist(
        &self,
        session_id: &str,
        next_checkpoint_id: &mut u64,
        state: &SessionState,
    ) -> bool {
        let id = *next_checkpoint_id;
        let parent = if id > 1 { Some(id - 1) } else { None };
        let Ok(checkpoint) = Checkpoint::snapshot(
            session_id,
            WORKFLOW_NAMESPACE,
            id,
            parent,
            state,
            state.current_stage.as_str(),
        ) else {
            return false;
        };

        for attempt in 0..=self.config.node_retry_limit {
            match self.store.put(checkpoint.clone()).await {
                Ok(()) => {
                    *next_checkpoint_id += 1;
                    self.maybe_compact(session_id, id).await;
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        session = session_id,
                        attempt,
                        error = %e,
                        "checkpoint persist failed"
                    );
                    if attempt == self.config.node_retry_limit {
                        break;
                    }
                    let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        false
    }

    async fn maybe_compact(&self, session_id: &str, chain_length_hint: u64) {
        let Some(compact_after) = self.config.checkpoint_compact_after else {
            return;
        };
        if chain_length_hint > compact_after {
            if let Err(e) = self
                .store
                .compact(session_id, WORKFLOW_NAMESPACE, compact_after)
                .await
            {
                tracing::debug!(session = session_id, error = %e, "chain compaction failed");
            }
        }
    }

    /// Unrecoverable fault: emit the error event, then persist the failed
    /// state. The event always precedes the `failed` transition.
    async fn fail(
        &self,
        session_id: &str,
        next_checkpoint_id: &mut u64,
        state: &mut SessionState,
        kind: ErrorKind,
        message: String,
    ) -> RunOutcome {
        tracing::error!(session = session_id, ?kind, %message, "session failed");
        self.fanout.publish(
            session_id,
            EventPayload::Error {
                error_kind: kind,
                message: message.clone(),
                recoverable: false,
            },
        );
        state
            .errors
            .push(ErrorRecord::fatal(state.current_stage.as_str(), kind, message));
        state.current_stage = Stage::Failed;
        state.status = SessionStatus::Failed;
        let _ = self.persist(session_id, next_checkpoint_id, state).await;
        RunOutcome::Failed(kind)
    }
}
