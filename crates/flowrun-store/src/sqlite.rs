use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::event::Event;
use flowrun_core::traits::ExecutionStore;
use flowrun_core::types::{Execution, ExecutionId, ExecutionStatus, ExecutionSummary};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        flow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT,
        ended_at TEXT,
        state TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_started
        ON executions(started_at);

    CREATE TABLE IF NOT EXISTS events (
        execution_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        kind TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (execution_id, seq)
    );";

fn db_err(e: rusqlite::Error) -> FlowError {
    FlowError::Database(e.to_string())
}

/// SQLite-backed execution and event store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

impl ExecutionStore for SqliteStore {
    fn save_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let state = serde_json::to_string(execution);
        let id = execution.id.to_string();
        let flow_id = execution.flow_id.clone();
        let status = execution.status.as_str();
        let started = execution.started_at.map(|t| t.to_rfc3339());
        let ended = execution.ended_at.map(|t| t.to_rfc3339());

        Box::pin(async move {
            let state = state?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            conn.execute(
                "INSERT INTO executions (id, flow_id, status, started_at, ended_at, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    started_at = excluded.started_at,
                    ended_at = excluded.ended_at,
                    state = excluded.state,
                    updated_at = excluded.updated_at",
                params![id, flow_id, status, started, ended, state, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.to_string();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            let state: Option<String> = conn
                .query_row(
                    "SELECT state FROM executions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            match state {
                Some(s) => Ok(Some(serde_json::from_str(&s)?)),
                None => Ok(None),
            }
        })
    }

    fn list_executions(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionSummary>>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT id, flow_id, status, started_at, ended_at FROM executions
                     ORDER BY started_at DESC, rowid DESC
                     LIMIT ?1",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })
                .map_err(db_err)?;

            let mut out = Vec::new();
            for row in rows {
                let (id, flow_id, status, started, ended) = row.map_err(db_err)?;
                out.push(ExecutionSummary {
                    id: ExecutionId::from_string(&id),
                    flow_id,
                    status: ExecutionStatus::parse(&status).unwrap_or_default(),
                    started_at: parse_ts(started),
                    ended_at: parse_ts(ended),
                });
            }
            Ok(out)
        })
    }

    fn append_event(&self, event: &Event) -> BoxFuture<'_, Result<()>> {
        let payload = serde_json::to_string(event);
        let id = event.execution_id.to_string();
        let seq = event.seq as i64;
        let kind = event.kind.name();
        let timestamp = event.timestamp.to_rfc3339();

        Box::pin(async move {
            let payload = payload?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            conn.execute(
                "INSERT INTO events (execution_id, seq, kind, timestamp, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, seq, kind, timestamp, payload],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_events(&self, id: &ExecutionId, after_seq: u64) -> BoxFuture<'_, Result<Vec<Event>>> {
        let id = id.to_string();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT payload FROM events
                     WHERE execution_id = ?1 AND seq > ?2
                     ORDER BY seq ASC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![id, after_seq as i64], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut events = Vec::new();
            for row in rows {
                let payload = row.map_err(db_err)?;
                events.push(serde_json::from_str(&payload)?);
            }
            Ok(events)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_core::event::EventKind;
    use flowrun_core::graph::{Flow, Step, StepKind};
    use flowrun_core::types::Variables;

    fn event(id: &ExecutionId, seq: u64, kind: EventKind) -> Event {
        Event {
            seq,
            execution_id: id.clone(),
            timestamp: Utc::now(),
            kind,
        }
    }

    fn flow() -> Flow {
        Flow::new(
            "f",
            "a",
            vec![Step::new("a", StepKind::Tool).with_param("tool", "echo")],
        )
    }

    #[tokio::test]
    async fn test_execution_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let id = ExecutionId::new();
        let mut exec = Execution::new(id.clone(), &flow());
        store.save_execution(&exec).await.unwrap();

        exec.apply(&event(
            &id,
            1,
            EventKind::ExecutionStarted {
                flow_id: "f".into(),
                variables: Variables::new(),
                steps: vec!["a".into()],
            },
        ));
        store.save_execution(&exec).await.unwrap();

        let loaded = store.load_execution(&id).await.unwrap().unwrap();
        assert_eq!(loaded, exec);
        assert_eq!(loaded.status, ExecutionStatus::Running);

        let list = store.list_executions(10).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, ExecutionStatus::Running);

        assert!(store
            .load_execution(&ExecutionId::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_events_after_seq() {
        let store = SqliteStore::in_memory().unwrap();
        let id = ExecutionId::new();
        for seq in 1..=4 {
            store
                .append_event(&event(
                    &id,
                    seq,
                    EventKind::StepSkipped {
                        step_id: format!("s{seq}"),
                    },
                ))
                .await
                .unwrap();
        }
        let events = store.load_events(&id, 2).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4]);

        // Sequence numbers are unique per execution.
        assert!(store
            .append_event(&event(&id, 4, EventKind::StepSkipped { step_id: "x".into() }))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowrun.db");
        let id = ExecutionId::new();
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .save_execution(&Execution::new(id.clone(), &flow()))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.load_execution(&id).await.unwrap().is_some());
    }
}
