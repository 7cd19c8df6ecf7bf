/*!
SQLite checkpoint store.

Durable implementation of [`CheckpointStore`](crate::checkpoint::CheckpointStore)
on `sqlx`/SQLite, gated behind the `sqlite` feature.

## Behavior

- The schema is bootstrapped on [`SqliteCheckpointStore::connect`]; no
  external migration step is required.
- `put` is idempotent for a repeated `checkpoint_id` and rejects chain
  regressions or parent mismatches, mirroring the in-memory store.
- Single-writer per `(session_id, namespace)` is guaranteed by the
  scheduler, so the read-validate-insert sequence here does not race.

## Schema

One row per checkpoint:

- `checkpoints(session_id, namespace, checkpoint_id)` — primary key
- `parent_checkpoint_id` — nullable, previous id in the chain
- `payload` — serialized session state (JSON text)
- `node_name`, `progress`, `created_at` — metadata
*/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::checkpoint::{
    Checkpoint, CheckpointError, CheckpointMetadata, CheckpointStore, Result,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    session_id            TEXT    NOT NULL,
    namespace             TEXT    NOT NULL,
    checkpoint_id         INTEGER NOT NULL,
    parent_checkpoint_id  INTEGER,
    payload               TEXT    NOT NULL,
    node_name             TEXT    NOT NULL,
    progress              REAL    NOT NULL,
    created_at            TEXT    NOT NULL,
    PRIMARY KEY (session_id, namespace, checkpoint_id)
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_session
    ON checkpoints (session_id, namespace, checkpoint_id DESC);
"#;

/// SQLite-backed checkpoint store.
///
/// Storage grows with `(sessions × checkpoints × state_size)`; use
/// [`compact`](CheckpointStore::compact) and
/// [`remove_session`](CheckpointStore::remove_session) to bound it.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore").finish()
    }
}

fn backend(e: sqlx::Error) -> CheckpointError {
    CheckpointError::Backend {
        message: e.to_string(),
    }
}

impl SqliteCheckpointStore {
    /// Connect to (or create) a SQLite database, e.g.
    /// `sqlite://checkpoints.db` or `sqlite::memory:`, and bootstrap the
    /// schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(backend)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(backend)?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(backend)?;
        }
        Ok(Self { pool })
    }

    fn row_to_checkpoint(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint> {
        let created_at: String = row.get("created_at");
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| CheckpointError::Corrupt {
                message: format!("bad created_at: {e}"),
            })?
            .with_timezone(&Utc);
        let checkpoint_id: i64 = row.get("checkpoint_id");
        let parent: Option<i64> = row.get("parent_checkpoint_id");
        Ok(Checkpoint {
            session_id: row.get("session_id"),
            namespace: row.get("namespace"),
            checkpoint_id: checkpoint_id as u64,
            parent_checkpoint_id: parent.map(|p| p as u64),
            payload: row.get("payload"),
            metadata: CheckpointMetadata {
                node_name: row.get("node_name"),
                progress: row.get::<f64, _>("progress") as f32,
                created_at,
            },
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(&self, checkpoint: Checkpoint) -> Result<()> {
        let last = self
            .latest(&checkpoint.session_id, &checkpoint.namespace)
            .await?;
        match last {
            None => {}
            Some(ref last) if checkpoint.checkpoint_id == last.checkpoint_id => {
                // Idempotent retry of the same snapshot.
                return Ok(());
            }
            Some(ref last) if checkpoint.checkpoint_id > last.checkpoint_id => {
                if checkpoint.parent_checkpoint_id != Some(last.checkpoint_id) {
                    return Err(CheckpointError::ChainConflict {
                        session_id: checkpoint.session_id,
                        message: format!(
                            "parent {:?} does not reference previous id {}",
                            checkpoint.parent_checkpoint_id, last.checkpoint_id
                        ),
                    });
                }
            }
            Some(ref last) => {
                return Err(CheckpointError::ChainConflict {
                    session_id: checkpoint.session_id,
                    message: format!(
                        "checkpoint_id {} regresses behind {}",
                        checkpoint.checkpoint_id, last.checkpoint_id
                    ),
                });
            }
        }

        sqlx::query(
            "INSERT OR IGNORE INTO checkpoints \
             (session_id, namespace, checkpoint_id, parent_checkpoint_id, payload, node_name, progress, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.session_id)
        .bind(&checkpoint.namespace)
        .bind(checkpoint.checkpoint_id as i64)
        .bind(checkpoint.parent_checkpoint_id.map(|p| p as i64))
        .bind(&checkpoint.payload)
        .bind(&checkpoint.metadata.node_name)
        .bind(f64::from(checkpoint.metadata.progress))
        .bind(checkpoint.metadata.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn latest(&self, session_id: &str, namespace: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE session_id = ? AND namespace = ? \
             ORDER BY checkpoint_id DESC LIMIT 1",
        )
        .bind(session_id)
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn chain(
        &self,
        session_id: &str,
        namespace: &str,
        limit: usize,
    ) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            "SELECT * FROM checkpoints WHERE session_id = ? AND namespace = ? \
             ORDER BY checkpoint_id ASC",
        )
        .bind(session_id)
        .bind(namespace)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        let mut chain: Vec<Checkpoint> = rows
            .iter()
            .map(Self::row_to_checkpoint)
            .collect::<Result<_>>()?;
        if limit > 0 && chain.len() > limit {
            chain.drain(..chain.len() - limit);
        }
        Ok(chain)
    }

    async fn compact(&self, session_id: &str, namespace: &str, keep_last: u64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM checkpoints WHERE session_id = ? AND namespace = ? \
             AND checkpoint_id NOT IN (\
                 SELECT checkpoint_id FROM checkpoints \
                 WHERE session_id = ? AND namespace = ? \
                 ORDER BY checkpoint_id DESC LIMIT ?)",
        )
        .bind(session_id)
        .bind(namespace)
        .bind(session_id)
        .bind(namespace)
        .bind(keep_last.max(1) as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn remove_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT session_id FROM checkpoints ORDER BY session_id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.iter().map(|r| r.get("session_id")).collect())
    }
}
