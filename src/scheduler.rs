//! Session lifecycle and the session-control surface.
//!
//! The scheduler owns everything long-lived: the node registry, the
//! checkpoint store, the event fan-out, the interrupt controller and the
//! collaborator bundle. It starts sessions (one lightweight task per
//! active session), re-enters the runner after external decisions,
//! enforces single-writer semantics per session via a run slot, answers
//! status queries from the latest checkpoint, and expires or collects
//! stale sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, WORKFLOW_NAMESPACE};
use crate::collaborators::{CollaboratorError, Collaborators};
use crate::config::Config;
use crate::domain::{ErrorKind, ErrorRecord, MessageType};
use crate::events::{EventFanout, EventPayload, EventStream};
use crate::interrupt::{DecisionRequest, InterruptController, InterruptError, SubmitReceipt};
use crate::registry::NodeRegistry;
use crate::runner::{RunOutcome, Runner, RunnerError};
use crate::state::{SessionIdentity, SessionInputs, SessionState};
use crate::types::{SessionStatus, Stage};

/// Identity fields supplied by the caller when starting a session.
#[derive(Clone, Debug)]
pub struct StartRequest {
    pub project_id: String,
    pub user_id: String,
    pub upstream_job_id: String,
}

/// Caller-facing session status snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub status: SessionStatus,
    pub current_stage: Stage,
    pub progress: f32,
    pub pending_decisions_count: usize,
    pub decisions_completed: usize,
    pub decisions_total: usize,
}

#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    /// Required upstream documents are missing; surfaced to the caller
    /// before any session state exists.
    #[error(transparent)]
    #[diagnostic(code(specloom::scheduler::upstream))]
    Upstream(#[from] CollaboratorError),

    #[error("session not found: {session_id}")]
    #[diagnostic(code(specloom::scheduler::session_not_found))]
    SessionNotFound { session_id: String },

    #[error(transparent)]
    #[diagnostic(code(specloom::scheduler::checkpoint))]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    #[diagnostic(code(specloom::scheduler::runner))]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    #[diagnostic(code(specloom::scheduler::interrupt))]
    Interrupt(#[from] InterruptError),
}

struct SessionSlot {
    cancel: Arc<AtomicBool>,
    /// Held by the runner task for the duration of a drive; guarantees a
    /// single writer per session.
    run_lock: Arc<tokio::sync::Mutex<()>>,
}

struct Inner {
    runner: Runner,
    store: Arc<dyn CheckpointStore>,
    fanout: Arc<EventFanout>,
    controller: InterruptController,
    collaborators: Arc<Collaborators>,
    config: Arc<Config>,
    sessions: Mutex<FxHashMap<String, Arc<SessionSlot>>>,
}

/// The orchestrator's entry point; everything external goes through here.
#[derive(Clone)]
pub struct SessionScheduler {
    inner: Arc<Inner>,
}

impl SessionScheduler {
    /// Wire a scheduler from its collaborators, checkpoint store and
    /// configuration, using the standard node registry.
    pub fn new(
        collaborators: Arc<Collaborators>,
        store: Arc<dyn CheckpointStore>,
        config: Config,
    ) -> Self {
        let config = Arc::new(config);
        let fanout = Arc::new(EventFanout::new(config.event_queue_capacity));
        let registry = Arc::new(NodeRegistry::standard(&config));
        let runner = Runner::new(
            registry,
            store.clone(),
            fanout.clone(),
            collaborators.clone(),
            config.clone(),
        );
        let controller = InterruptController::new(store.clone(), fanout.clone(), config.clone());
        Self {
            inner: Arc::new(Inner {
                runner,
                store,
                fanout,
                controller,
                collaborators,
                config,
                sessions: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Create a session and enqueue it; returns as soon as the initial
    /// checkpoint is durable. The upstream bundle is validated here so an
    /// incomplete job fails fast instead of failing the runner.
    #[instrument(skip(self, request), err)]
    pub async fn start(&self, request: StartRequest) -> Result<Uuid, SchedulerError> {
        self.inner
            .collaborators
            .upstream
            .load(&request.upstream_job_id)
            .await?;

        let identity = SessionIdentity::next(
            request.project_id,
            request.user_id,
            request.upstream_job_id,
        );
        let session_id = identity.session_id;
        let state = SessionState::new(identity, SessionInputs::default());
        let checkpoint = Checkpoint::snapshot(
            &session_id.to_string(),
            WORKFLOW_NAMESPACE,
            1,
            None,
            &state,
            Stage::Created.as_str(),
        )?;
        self.inner.store.put(checkpoint).await?;

        self.slot(&session_id.to_string());
        self.spawn_drive(session_id.to_string());
        Ok(session_id)
    }

    /// Resume every resumable session found in the checkpoint store.
    /// Called once after process restart.
    pub async fn resume_all(&self) -> Result<Vec<String>, SchedulerError> {
        let mut resumed = Vec::new();
        for session_id in self.inner.store.list_sessions().await? {
            let Some(latest) = self
                .inner
                .store
                .latest(&session_id, WORKFLOW_NAMESPACE)
                .await?
            else {
                continue;
            };
            let state = latest.state()?;
            match state.status {
                SessionStatus::InProgress => {
                    self.slot(&session_id);
                    self.spawn_drive(session_id.clone());
                    resumed.push(session_id);
                }
                SessionStatus::Paused | SessionStatus::Expired => {
                    // Stays parked until a decision arrives.
                    self.slot(&session_id);
                }
                _ => {}
            }
        }
        Ok(resumed)
    }

    /// Apply an external decision and re-enter the runner.
    pub async fn submit_decision(
        &self,
        request: DecisionRequest,
    ) -> Result<SubmitReceipt, SchedulerError> {
        let session_id = request.session_id.clone();
        let receipt = self.inner.controller.submit(request).await?;
        if receipt == SubmitReceipt::Applied {
            self.spawn_drive(session_id);
        }
        Ok(receipt)
    }

    /// Status derived from the latest checkpoint.
    pub async fn status(&self, session_id: &str) -> Result<StatusReport, SchedulerError> {
        let latest = self
            .inner
            .store
            .latest(session_id, WORKFLOW_NAMESPACE)
            .await?
            .ok_or_else(|| SchedulerError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let state = latest.state()?;
        Ok(StatusReport {
            status: state.status,
            current_stage: state.current_stage,
            progress: state.progress_percentage,
            pending_decisions_count: state.pending_decisions.len(),
            decisions_completed: state.user_decisions.len(),
            decisions_total: state.tech_gaps.len(),
        })
    }

    /// Subscribe to the session's event stream (backlog first, then
    /// live).
    pub fn subscribe(&self, session_id: &str) -> EventStream {
        self.inner.fanout.subscribe(session_id)
    }

    /// Answer a transport keepalive on the session's stream.
    pub fn pong(&self, session_id: &str) {
        self.inner.fanout.pong(session_id);
    }

    /// Request cancellation. A running session stops at the next node
    /// boundary; a parked one is cancelled immediately.
    pub async fn cancel(&self, session_id: &str) -> Result<(), SchedulerError> {
        let slot = self.slot(session_id);
        slot.cancel.store(true, Ordering::Relaxed);

        // If nothing is running, persist the cancellation right away.
        if let Ok(_guard) = slot.run_lock.clone().try_lock_owned() {
            let Some(latest) = self
                .inner
                .store
                .latest(session_id, WORKFLOW_NAMESPACE)
                .await?
            else {
                return Err(SchedulerError::SessionNotFound {
                    session_id: session_id.to_string(),
                });
            };
            let mut state = latest.state()?;
            if !state.status.is_terminal() {
                state.status = SessionStatus::Cancelled;
                let checkpoint = Checkpoint::snapshot(
                    session_id,
                    WORKFLOW_NAMESPACE,
                    latest.checkpoint_id + 1,
                    Some(latest.checkpoint_id),
                    &state,
                    state.current_stage.as_str(),
                )?;
                self.inner.store.put(checkpoint).await?;
            }
        }
        Ok(())
    }

    /// Mark paused sessions whose last activity is older than the session
    /// TTL as expired. Returns the ids that expired.
    pub async fn expire_stale(&self) -> Result<Vec<String>, SchedulerError> {
        let mut expired = Vec::new();
        for session_id in self.inner.store.list_sessions().await? {
            let Some(latest) = self
                .inner
                .store
                .latest(&session_id, WORKFLOW_NAMESPACE)
                .await?
            else {
                continue;
            };
            let mut state = latest.state()?;
            if state.status == SessionStatus::Paused
                && self
                    .inner
                    .controller
                    .is_expired(latest.metadata.created_at)
            {
                state.status = SessionStatus::Expired;
                state.errors.push(ErrorRecord::recovered(
                    state.current_stage.as_str(),
                    ErrorKind::UserTimeout,
                    "no decision within the session TTL",
                ));
                let checkpoint = Checkpoint::snapshot(
                    &session_id,
                    WORKFLOW_NAMESPACE,
                    latest.checkpoint_id + 1,
                    Some(latest.checkpoint_id),
                    &state,
                    state.current_stage.as_str(),
                )?;
                self.inner.store.put(checkpoint).await?;
                expired.push(session_id);
            }
        }
        Ok(expired)
    }

    /// Remove checkpoint chains and event channels of terminal sessions
    /// older than `horizon`.
    pub async fn gc_terminal(&self, horizon: Duration) -> Result<Vec<String>, SchedulerError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(horizon).unwrap_or_else(|_| chrono::Duration::days(30));
        let mut removed = Vec::new();
        for session_id in self.inner.store.list_sessions().await? {
            let Some(latest) = self
                .inner
                .store
                .latest(&session_id, WORKFLOW_NAMESPACE)
                .await?
            else {
                continue;
            };
            let state = latest.state()?;
            let collectable = state.status.is_terminal() || state.status == SessionStatus::Expired;
            if collectable && latest.metadata.created_at < cutoff {
                self.inner.store.remove_session(&session_id).await?;
                self.inner.fanout.remove_session(&session_id);
                self.inner.sessions.lock().remove(&session_id);
                removed.push(session_id);
            }
        }
        Ok(removed)
    }

    /// Block until the session's current drive finishes. Test and
    /// shutdown aid; production callers watch the event stream instead.
    pub async fn wait_idle(&self, session_id: &str) {
        let slot = self.slot(session_id);
        let _guard = slot.run_lock.lock().await;
    }

    fn slot(&self, session_id: &str) -> Arc<SessionSlot> {
        self.inner
            .sessions
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionSlot {
                    cancel: Arc::new(AtomicBool::new(false)),
                    run_lock: Arc::new(tokio::sync::Mutex::new(())),
                })
            })
            .clone()
    }

    /// Launch one runner task for the session, if none is active. The run
    /// slot makes this a no-op while a drive is in flight.
    fn spawn_drive(&self, session_id: String) {
        let inner = self.inner.clone();
        let slot = self.slot(&session_id);
        tokio::spawn(async move {
            // Serializes drives per session: a queued drive waits for the
            // active one, then re-routes from the latest checkpoint.
            // Driving a still-parked session is a harmless no-op.
            let guard = slot.run_lock.clone().lock_owned().await;
            let outcome = inner.runner.drive(&session_id, &slot.cancel).await;
            drop(guard);
            match outcome {
                Ok(RunOutcome::AwaitingUser(stage)) => {
                    tracing::info!(session = %session_id, %stage, "session awaiting user input");
                    Self::spawn_idle_reminder(inner.clone(), session_id.clone());
                }
                Ok(RunOutcome::Completed) => {
                    tracing::info!(session = %session_id, "session completed");
                }
                Ok(RunOutcome::StoragePaused) => {
                    tracing::warn!(session = %session_id, "checkpoint store unavailable; session paused");
                }
                Ok(RunOutcome::Failed(kind)) => {
                    tracing::error!(session = %session_id, ?kind, "session failed");
                }
                Ok(RunOutcome::Cancelled) => {
                    tracing::info!(session = %session_id, "session cancelled");
                }
                Err(e) => {
                    tracing::error!(session = %session_id, error = %e, "runner error");
                }
            }
        });
    }

    /// Publish a reminder if the session is still parked at the same
    /// checkpoint after the idle window.
    fn spawn_idle_reminder(inner: Arc<Inner>, session_id: String) {
        tokio::spawn(async move {
            let Ok(Some(before)) = inner.store.latest(&session_id, WORKFLOW_NAMESPACE).await
            else {
                return;
            };
            tokio::time::sleep(inner.config.user_idle_reminder).await;
            let Ok(Some(after)) = inner.store.latest(&session_id, WORKFLOW_NAMESPACE).await else {
                return;
            };
            if after.checkpoint_id == before.checkpoint_id {
                if let Ok(state) = after.state() {
                    if state.status == SessionStatus::Paused {
                        inner.fanout.publish(
                            &session_id,
                            EventPayload::AgentMessage {
                                message: "Still waiting on your decision to continue the session."
                                    .to_string(),
                                message_type: MessageType::Question,
                                data: None,
                            },
                        );
                    }
                }
            }
        });
    }
}
