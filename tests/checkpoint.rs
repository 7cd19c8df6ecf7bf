//! Checkpoint chain properties over real session traces, plus the SQLite
//! store behind its feature gate.

mod common;

use common::*;

use specloom::checkpoint::{CheckpointStore, WORKFLOW_NAMESPACE};

#[tokio::test]
async fn chain_is_linear_with_exact_parent_links() {
    let world = world();
    let session_id = world.scheduler.start(start_request()).await.unwrap().to_string();
    wait_until_completed(&world.scheduler, &session_id).await;

    let chain = world
        .store
        .chain(&session_id, WORKFLOW_NAMESPACE, 0)
        .await
        .unwrap();
    assert!(chain.len() > 10, "expected one checkpoint per stage");
    assert_eq!(chain[0].parent_checkpoint_id, None);
    for pair in chain.windows(2) {
        assert_eq!(
            pair[1].parent_checkpoint_id,
            Some(pair[0].checkpoint_id),
            "parent pointer must reference the immediately preceding checkpoint"
        );
        assert!(pair[1].checkpoint_id > pair[0].checkpoint_id);
    }
}

#[tokio::test]
async fn checkpoint_progress_metadata_is_monotone() {
    let world = world();
    let session_id = world.scheduler.start(start_request()).await.unwrap().to_string();
    wait_until_completed(&world.scheduler, &session_id).await;

    let chain = world
        .store
        .chain(&session_id, WORKFLOW_NAMESPACE, 0)
        .await
        .unwrap();
    let progress: Vec<f32> = chain.iter().map(|cp| cp.metadata.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*progress.last().unwrap(), 100.0);
}

#[tokio::test]
async fn chain_limit_returns_newest_entries() {
    let world = world();
    let session_id = world.scheduler.start(start_request()).await.unwrap().to_string();
    wait_until_completed(&world.scheduler, &session_id).await;

    let full = world
        .store
        .chain(&session_id, WORKFLOW_NAMESPACE, 0)
        .await
        .unwrap();
    let tail = world
        .store
        .chain(&session_id, WORKFLOW_NAMESPACE, 3)
        .await
        .unwrap();
    assert_eq!(tail.len(), 3);
    assert_eq!(
        tail.last().unwrap().checkpoint_id,
        full.last().unwrap().checkpoint_id
    );
}

#[tokio::test]
async fn gc_removes_terminal_sessions() {
    let world = world();
    let session_id = world.scheduler.start(start_request()).await.unwrap().to_string();
    wait_until_completed(&world.scheduler, &session_id).await;

    let removed = world
        .scheduler
        .gc_terminal(std::time::Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(removed, vec![session_id.clone()]);
    assert!(
        world
            .store
            .latest(&session_id, WORKFLOW_NAMESPACE)
            .await
            .unwrap()
            .is_none()
    );
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use specloom::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, WORKFLOW_NAMESPACE};
    use specloom::checkpoint_sqlite::SqliteCheckpointStore;
    use specloom::state::{SessionIdentity, SessionInputs, SessionState};

    async fn store() -> (SqliteCheckpointStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/checkpoints.db", dir.path().display());
        let store = SqliteCheckpointStore::connect(&url).await.unwrap();
        (store, dir)
    }

    fn checkpoint(id: u64, parent: Option<u64>) -> Checkpoint {
        let state = SessionState::new(
            SessionIdentity::next("p", "u", "j"),
            SessionInputs::default(),
        );
        Checkpoint::snapshot("s1", WORKFLOW_NAMESPACE, id, parent, &state, "load_inputs").unwrap()
    }

    #[tokio::test]
    async fn round_trip_and_latest() {
        let (store, _dir) = store().await;
        store.put(checkpoint(1, None)).await.unwrap();
        store.put(checkpoint(2, Some(1))).await.unwrap();

        let latest = store.latest("s1", WORKFLOW_NAMESPACE).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, 2);
        assert!(latest.state().is_ok());

        let chain = store.chain("s1", WORKFLOW_NAMESPACE, 0).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].checkpoint_id, 1);
    }

    #[tokio::test]
    async fn put_is_idempotent_and_guards_the_chain() {
        let (store, _dir) = store().await;
        store.put(checkpoint(1, None)).await.unwrap();
        store.put(checkpoint(1, None)).await.unwrap();
        assert_eq!(store.chain("s1", WORKFLOW_NAMESPACE, 0).await.unwrap().len(), 1);

        let err = store.put(checkpoint(3, Some(2))).await.unwrap_err();
        assert!(matches!(err, CheckpointError::ChainConflict { .. }));
    }

    #[tokio::test]
    async fn compact_and_remove() {
        let (store, _dir) = store().await;
        for id in 1..=5 {
            let parent = if id > 1 { Some(id - 1) } else { None };
            store.put(checkpoint(id, parent)).await.unwrap();
        }
        let removed = store.compact("s1", WORKFLOW_NAMESPACE, 2).await.unwrap();
        assert_eq!(removed, 3);
        let chain = store.chain("s1", WORKFLOW_NAMESPACE, 0).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.last().unwrap().checkpoint_id, 5);

        store.remove_session("s1").await.unwrap();
        assert!(store.latest("s1", WORKFLOW_NAMESPACE).await.unwrap().is_none());
        assert!(store.list_sessions().await.unwrap().is_empty());
    }
}
