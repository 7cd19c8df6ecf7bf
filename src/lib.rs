//! # Specloom: checkpointed technical-spec orchestration
//!
//! Specloom turns upstream design artifacts — a PRD, design documents and
//! an optional generated-UI code bundle — into a coherent package of
//! downstream technical-specification documents (TRD, OpenAPI spec,
//! database DDL, ER diagram, architecture diagram, tech-stack document).
//!
//! The heart of the crate is a resumable session state machine: a spine of
//! stages with five conditional predicates over a single typed state
//! record, checkpointed at every node boundary, with an
//! interrupt-and-resume contract for the steps that need a synchronous
//! user decision and a per-session event fan-out for live progress.
//!
//! ## Core concepts
//!
//! - **Session**: one run of the workflow for one upstream job, driven by
//!   exactly one writer (the runner).
//! - **Stage / Node**: one step of the graph; a function from state to a
//!   patch plus a control hint ([`node::WorkflowNode`]).
//! - **Router**: a pure function selecting the next stage
//!   ([`router::route`]); the two cycles (research, TRD retry) are bounded
//!   by iteration caps.
//! - **Checkpoint**: durable snapshot of state at a node boundary
//!   ([`checkpoint::CheckpointStore`]); resume re-executes at most the
//!   most recent node.
//! - **Wait-for-user**: a terminal runner return, not coroutine
//!   suspension — state lives in the checkpoint, never on a stack.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use specloom::checkpoint::InMemoryCheckpointStore;
//! use specloom::collaborators::Collaborators;
//! use specloom::config::Config;
//! use specloom::scheduler::{SessionScheduler, StartRequest};
//!
//! # async fn example(collaborators: Arc<Collaborators>) -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = SessionScheduler::new(
//!     collaborators,
//!     Arc::new(InMemoryCheckpointStore::new()),
//!     Config::default(),
//! );
//!
//! let session_id = scheduler
//!     .start(StartRequest {
//!         project_id: "proj-42".into(),
//!         user_id: "user-7".into(),
//!         upstream_job_id: "job-9".into(),
//!     })
//!     .await?;
//!
//! // Live progress, prompts and completion arrive on the event stream.
//! let mut events = scheduler.subscribe(&session_id.to_string());
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`types`] — stage and status identifiers
//! - [`domain`] — typed records carried by the session state
//! - [`state`] — the session state record, patch merging, invariants
//! - [`node`] — node trait, context and error taxonomy
//! - [`router`] — the stage table and its five predicates
//! - [`registry`] — stage-to-node binding with budgets and progress targets
//! - [`runner`] — the per-session execution loop
//! - [`interrupt`] — external decision intake and resume directives
//! - [`scheduler`] — session lifecycle and the control surface
//! - [`checkpoint`] / [`checkpoint_sqlite`] — durable snapshots
//! - [`events`] — per-session fan-out with backlog replay
//! - [`collaborators`] — trait seams for every external dependency
//! - [`nodes`] — the concrete node library
//! - [`config`] — recognized tuning keys
//! - [`telemetry`] — tracing bootstrap for hosts

pub mod checkpoint;
#[cfg(feature = "sqlite")]
pub mod checkpoint_sqlite;
pub mod collaborators;
pub mod config;
pub mod domain;
pub mod events;
pub mod interrupt;
pub mod node;
pub mod nodes;
pub mod registry;
pub mod router;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod telemetry;
pub mod types;
