//! SQLite-backed task store.
//!
//! One `background_tasks` table; timestamps are stored as Unix
//! milliseconds so the eligibility cut-off and the dispatch order are plain
//! integer comparisons. Every call runs on the blocking pool behind a
//! single shared connection.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::{NewTask, StoreError, TaskId, TaskRecord, TaskType};
use crate::ports::{Clock, EligibleQuery, IdGenerator, SystemClock, TaskStore, UlidGenerator};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS background_tasks (
    id            TEXT PRIMARY KEY NOT NULL,
    task_type     TEXT NOT NULL,
    created_ms    INTEGER NOT NULL,
    wait_until_ms INTEGER,
    payload       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_background_tasks_due
    ON background_tasks (wait_until_ms, created_ms);
CREATE INDEX IF NOT EXISTS idx_background_tasks_type
    ON background_tasks (task_type);
";

type RawRow = (String, String, i64, Option<i64>, String);

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
}

impl SqliteTaskStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let path = db_path.as_ref();
        info!("Opening task database at {:?}", path);
        let conn = Connection::open(path)?;
        Self::from_connection(conn, Arc::new(SystemClock))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, Arc::new(SystemClock))
    }

    /// Replace the clock used for `created` stamps and id timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Box::new(UlidGenerator::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    fn from_connection(mut conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ids: Box::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        })
    }

    fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
        let version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::Corrupt(format!(
                "task database version {version} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
        if version == SCHEMA_VERSION {
            return Ok(());
        }

        info!(
            "Migrating task database from version {} to {}",
            version, SCHEMA_VERSION
        );
        let tx = conn.transaction()?;
        tx.execute_batch(SCHEMA_V1)?;
        tx.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])?;
        tx.commit()?;
        Ok(())
    }

    async fn with_conn<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Assign id and `created`. Millisecond precision so the returned record
    /// equals what a later query reads back.
    fn materialize(&self, task: NewTask) -> TaskRecord {
        TaskRecord {
            id: self.ids.generate_task_id(),
            task_type: task.task_type,
            created: self.clock.now().trunc_subsecs(3),
            wait_until: task.wait_until.map(|at| at.trunc_subsecs(3)),
            payload: task.payload,
        }
    }
}

fn insert_row(conn: &Connection, record: &TaskRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO background_tasks (id, task_type, created_ms, wait_until_ms, payload)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.id.to_storage_string(),
            record.task_type.as_str(),
            record.created.timestamp_millis(),
            record.wait_until.map(|at| at.timestamp_millis()),
            serde_json::to_string(&record.payload)?,
        ],
    )?;
    Ok(())
}

fn delete_rows(conn: &Connection, ids: &HashSet<TaskId>) -> Result<(), StoreError> {
    let mut stmt = conn.prepare("DELETE FROM background_tasks WHERE id = ?1")?;
    for id in ids {
        stmt.execute(params![id.to_storage_string()])?;
    }
    Ok(())
}

fn millis_to_datetime(ms: i64, column: &str, id: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("{column} out of range for task {id}")))
}

fn parse_row(raw: RawRow) -> Result<TaskRecord, StoreError> {
    let (id, task_type, created_ms, wait_until_ms, payload) = raw;
    let task_id: TaskId = id
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("bad task id '{id}': {e}")))?;
    Ok(TaskRecord {
        id: task_id,
        task_type: TaskType::new(task_type),
        created: millis_to_datetime(created_ms, "created_ms", &id)?,
        wait_until: wait_until_ms
            .map(|ms| millis_to_datetime(ms, "wait_until_ms", &id))
            .transpose()?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| StoreError::Corrupt(format!("bad payload for task {id}: {e}")))?,
    })
}

/// Exclusion sets are bound as one JSON array parameter so their size is
/// not limited by SQLite's bound-variable cap.
fn json_list(values: impl Iterator<Item = String>) -> Result<String, StoreError> {
    Ok(serde_json::to_string(&values.collect::<Vec<_>>())?)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn query_eligible(&self, query: &EligibleQuery) -> Result<Vec<TaskRecord>, StoreError> {
        let mut sql = String::from(
            "SELECT id, task_type, created_ms, wait_until_ms, payload
             FROM background_tasks
             WHERE (wait_until_ms IS NULL OR wait_until_ms <= ?)",
        );
        let mut args: Vec<Value> = vec![Value::Integer(query.now.timestamp_millis())];

        if !query.exclude_types.is_empty() {
            sql.push_str(" AND task_type NOT IN (SELECT value FROM json_each(?))");
            args.push(Value::Text(json_list(
                query.exclude_types.iter().map(|t| t.as_str().to_owned()),
            )?));
        }
        if !query.exclude_ids.is_empty() {
            sql.push_str(" AND id NOT IN (SELECT value FROM json_each(?))");
            args.push(Value::Text(json_list(
                query.exclude_ids.iter().map(TaskId::to_storage_string),
            )?));
        }
        sql.push_str(
            " ORDER BY wait_until_ms IS NOT NULL, wait_until_ms, created_ms, id
              LIMIT ?",
        );
        args.push(Value::Integer(
            i64::try_from(query.limit).unwrap_or(i64::MAX),
        ));

        let raw = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(args), |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    })?
                    .collect::<Result<Vec<RawRow>, _>>()?;
                Ok(rows)
            })
            .await?;

        let records = raw.into_iter().map(parse_row).collect::<Result<Vec<_>, _>>()?;
        debug!(count = records.len(), "queried eligible tasks");
        Ok(records)
    }

    async fn delete_by_ids(&self, ids: &HashSet<TaskId>) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            delete_rows(&tx, &ids)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn insert(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
        let record = self.materialize(task);
        let row = record.clone();
        self.with_conn(move |conn| insert_row(conn, &row)).await?;
        Ok(record)
    }

    async fn complete_with_followups(
        &self,
        done: &HashSet<TaskId>,
        followups: Vec<NewTask>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let records: Vec<TaskRecord> = followups
            .into_iter()
            .map(|task| self.materialize(task))
            .collect();
        let done = done.clone();
        let rows = records.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            delete_rows(&tx, &done)?;
            for row in &rows {
                insert_row(&tx, row)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        Ok(records)
    }

    async fn count_pending(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM background_tasks", [], |row| row.get(0))?)
            })
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
