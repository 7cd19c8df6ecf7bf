//! Checkpoint records and durable stores.
//!
//! Execution is made resumable by snapshotting the full session state at
//! every node boundary. A checkpoint is keyed by `(session_id, namespace,
//! checkpoint_id)`; `checkpoint_id` is a session-local strictly increasing
//! counter and parent pointers form a linear, non-branching chain per
//! namespace. After a node returns and `put` succeeds the effect is
//! durable; if `put` fails the node run counts as not completed and is
//! re-executed on resume.
//!
//! Two stores ship with the crate: [`InMemoryCheckpointStore`] (tests,
//! ephemeral runs) and a SQLite-backed store in
//! [`crate::checkpoint_sqlite`] (feature `sqlite`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::SessionState;

/// Default namespace used by the runner and the interrupt controller.
pub const WORKFLOW_NAMESPACE: &str = "workflow";

/// Descriptive metadata stored beside the payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Stage name that produced this snapshot.
    pub node_name: String,
    pub progress: f32,
    pub created_at: DateTime<Utc>,
}

/// A durable snapshot of session state at a node boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub namespace: String,
    /// Session-local, strictly increasing.
    pub checkpoint_id: u64,
    /// `None` only for the first checkpoint of a chain.
    pub parent_checkpoint_id: Option<u64>,
    /// Opaque serialized [`SessionState`].
    pub payload: String,
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Snapshot `state` as checkpoint `id` following `parent`.
    pub fn snapshot(
        session_id: &str,
        namespace: &str,
        id: u64,
        parent: Option<u64>,
        state: &SessionState,
        node_name: &str,
    ) -> Result<Self> {
        let payload = serde_json::to_string(state).map_err(|e| CheckpointError::Corrupt {
            message: format!("state serialization failed: {e}"),
        })?;
        Ok(Self {
            session_id: session_id.to_string(),
            namespace: namespace.to_string(),
            checkpoint_id: id,
            parent_checkpoint_id: parent,
            payload,
            metadata: CheckpointMetadata {
                node_name: node_name.to_string(),
                progress: state.progress_percentage,
                created_at: Utc::now(),
            },
        })
    }

    /// Deserialize the payload back into a session state.
    pub fn state(&self) -> Result<SessionState> {
        serde_json::from_str(&self.payload).map_err(|e| CheckpointError::Corrupt {
            message: format!("state deserialization failed: {e}"),
        })
    }
}

/// Errors from checkpoint store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    /// Backend storage error (database, filesystem…). Transient; the
    /// runner retries with backoff, then pauses the session.
    #[error("checkpoint backend error: {message}")]
    #[diagnostic(
        code(specloom::checkpoint::backend),
        help("Check backend connectivity and permissions.")
    )]
    Backend { message: String },

    /// Stored payload could not be (de)serialized.
    #[error("checkpoint payload corrupt: {message}")]
    #[diagnostic(code(specloom::checkpoint::corrupt))]
    Corrupt { message: String },

    /// A put would break the linear chain (id regression or parent
    /// mismatch).
    #[error("checkpoint chain conflict for {session_id}: {message}")]
    #[diagnostic(
        code(specloom::checkpoint::chain_conflict),
        help("checkpoint_id must strictly increase and parent the previous id")
    )]
    ChainConflict {
        session_id: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Durable storage of checkpoint chains.
///
/// Implementations must make `put` idempotent under retry with the same
/// `checkpoint_id` and keep chains linear per `(session_id, namespace)`.
/// Single-writer per chain is enforced by the scheduler, not the store.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint. Re-putting an identical `checkpoint_id` is a
    /// no-op; a conflicting id or parent is [`CheckpointError::ChainConflict`].
    async fn put(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Most recent checkpoint of a chain, or `None`.
    async fn latest(&self, session_id: &str, namespace: &str) -> Result<Option<Checkpoint>>;

    /// Oldest→newest walk of a chain, at most `limit` entries (0 = all).
    async fn chain(&self, session_id: &str, namespace: &str, limit: usize)
    -> Result<Vec<Checkpoint>>;

    /// Drop all but the newest `keep_last` checkpoints of a chain.
    /// Returns how many were removed. The survivor keeps its parent
    /// pointer; readers treat the oldest remaining entry as the chain
    /// root.
    async fn compact(&self, session_id: &str, namespace: &str, keep_last: u64) -> Result<u64>;

    /// Remove every chain of a session (GC of terminal/expired sessions).
    async fn remove_session(&self, session_id: &str) -> Result<()>;

    /// All session ids with at least one checkpoint.
    async fn list_sessions(&self) -> Result<Vec<String>>;
}

/// Volatile store for tests and ephemeral runs. Keeps full chains.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    chains: RwLock<FxHashMap<(String, String), Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(&self, checkpoint: Checkpoint) -> Result<()> {
        let key = (checkpoint.session_id.clone(), checkpoint.namespace.clone());
        let mut chains = self.chains.write();
        let chain = chains.entry(key).or_default();
        match chain.last() {
            None => chain.push(checkpoint),
            Some(last) if checkpoint.checkpoint_id == last.checkpoint_id => {
                // Idempotent retry of the same snapshot.
            }
            Some(last) if checkpoint.checkpoint_id > last.checkpoint_id => {
                if checkpoint.parent_checkpoint_id != Some(last.checkpoint_id) {
                    return Err(CheckpointError::ChainConflict {
                        session_id: checkpoint.session_id,
                        message: format!(
                            "parent {:?} does not reference previous id {}",
                            checkpoint.parent_checkpoint_id, last.checkpoint_id
                        ),
                    });
                }
                chain.push(checkpoint);
            }
            Some(last) => {
                return Err(CheckpointError::ChainConflict {
                    session_id: checkpoint.session_id,
                    message: format!(
                        "checkpoint_id {} regresses behind {}",
                        checkpoint.checkpoint_id, last.checkpoint_id
                    ),
                });
            }
        }
        Ok(())
    }

    async fn latest(&self, session_id: &str, namespace: &str) -> Result<Option<Checkpoint>> {
        let chains = self.chains.read();
        Ok(chains
            .get(&(session_id.to_string(), namespace.to_string()))
            .and_then(|chain| chain.last().cloned()))
    }

    async fn chain(
        &self,
        session_id: &str,
        namespace: &str,
        limit: usize,
    ) -> Result<Vec<Checkpoint>> {
        let chains = self.chains.read();
        let chain = chains
            .get(&(session_id.to_string(), namespace.to_string()))
            .cloned()
            .unwrap_or_default();
        if limit == 0 || chain.len() <= limit {
            Ok(chain)
        } else {
            Ok(chain[chain.len() - limit..].to_vec())
        }
    }

    async fn compact(&self, session_id: &str, namespace: &str, keep_last: u64) -> Result<u64> {
        let mut chains = self.chains.write();
        let Some(chain) = chains.get_mut(&(session_id.to_string(), namespace.to_string())) else {
            return Ok(0);
        };
        let keep = keep_last.max(1) as usize;
        if chain.len() <= keep {
            return Ok(0);
        }
        let removed = chain.len() - keep;
        chain.drain(..removed);
        Ok(removed as u64)
    }

    async fn remove_session(&self, session_id: &str) -> Result<()> {
        self.chains.write().retain(|(sid, _), _| sid != session_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let chains = self.chains.read();
        let mut ids: Vec<String> = chains.keys().map(|(sid, _)| sid.clone()).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SessionIdentity, SessionInputs};

    fn checkpoint(id: u64, parent: Option<u64>) -> Checkpoint {
        let state = SessionState::new(
            SessionIdentity::next("p", "u", "j"),
            SessionInputs::default(),
        );
        Checkpoint::snapshot("s1", WORKFLOW_NAMESPACE, id, parent, &state, "load_inputs").unwrap()
    }

    #[tokio::test]
    async fn put_is_idempotent_for_same_id() {
        let store = InMemoryCheckpointStore::new();
        store.put(checkpoint(1, None)).await.unwrap();
        store.put(checkpoint(1, None)).await.unwrap();
        let chain = store.chain("s1", WORKFLOW_NAMESPACE, 0).await.unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[tokio::test]
    async fn broken_parent_is_a_conflict() {
        let store = InMemoryCheckpointStore::new();
        store.put(checkpoint(1, None)).await.unwrap();
        let err = store.put(checkpoint(3, Some(2))).await.unwrap_err();
        assert!(matches!(err, CheckpointError::ChainConflict { .. }));
    }

    #[tokio::test]
    async fn compact_keeps_newest() {
        let store = InMemoryCheckpointStore::new();
        store.put(checkpoint(1, None)).await.unwrap();
        store.put(checkpoint(2, Some(1))).await.unwrap();
        store.put(checkpoint(3, Some(2))).await.unwrap();
        let removed = store.compact("s1", WORKFLOW_NAMESPACE, 1).await.unwrap();
        assert_eq!(removed, 2);
        let latest = store.latest("s1", WORKFLOW_NAMESPACE).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, 3);
    }
}
