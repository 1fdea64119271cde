use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use waterflow_core::definition::FlowDefinition;
use waterflow_core::error::{FlowError, Result};
use waterflow_core::traits::{
    ContextRepository, DefinitionRepository, RetryRepository, TraceRepository,
};
use waterflow_core::types::{FlowContext, FlowData, FlowNodeStatus, FlowRetry, FlowTrace};

use crate::lock::SqliteLockProvider;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flow_contexts (
        id TEXT PRIMARY KEY,
        stream_id TEXT NOT NULL,
        position TEXT NOT NULL,
        status TEXT NOT NULL,
        to_batch TEXT,
        created_at INTEGER NOT NULL,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_contexts_batch ON flow_contexts(to_batch);

    CREATE TABLE IF NOT EXISTS flow_traces (
        id TEXT PRIMARY KEY,
        stream_id TEXT NOT NULL,
        body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS flow_retries (
        entity_id TEXT PRIMARY KEY,
        entity_type TEXT NOT NULL,
        next_retry_time INTEGER NOT NULL,
        last_retry_time INTEGER,
        retry_count INTEGER NOT NULL,
        max_retry INTEGER NOT NULL,
        version INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_retries_due ON flow_retries(next_retry_time);

    CREATE TABLE IF NOT EXISTS flow_definitions (
        stream_id TEXT PRIMARY KEY,
        body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS flow_locks (
        key TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        acquired_at INTEGER NOT NULL
    );";

fn db_err(e: rusqlite::Error) -> FlowError {
    FlowError::Database(e.to_string())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// SQLite-backed repositories. Records are kept as JSON bodies next to the
/// columns that queries filter on.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
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
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock provider sharing this database.
    pub fn lock_provider(&self) -> SqliteLockProvider {
        SqliteLockProvider::new(self.conn.clone())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))
    }
}

fn load_contexts(conn: &Connection, sql: &str, key: &str) -> Result<Vec<FlowContext>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params![key], |row| row.get::<_, String>(0))
        .map_err(db_err)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(serde_json::from_str(&row.map_err(db_err)?)?);
    }
    Ok(out)
}

fn write_context(conn: &Connection, ctx: &FlowContext) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO flow_contexts (id, stream_id, position, status, to_batch, created_at, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            ctx.id,
            ctx.stream_id,
            ctx.position,
            ctx.status.as_str(),
            ctx.to_batch,
            ctx.created_at.timestamp_millis(),
            serde_json::to_string(ctx)?,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

impl ContextRepository for SqliteStore {
    fn save(&self, contexts: Vec<FlowContext>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut conn = self.conn()?;
            let tx = conn.transaction().map_err(db_err)?;
            for ctx in &contexts {
                write_context(&tx, ctx)?;
            }
            tx.commit().map_err(db_err)
        })
    }

    fn update_status(
        &self,
        ids: Vec<String>,
        status: FlowNodeStatus,
        only_if: Option<FlowNodeStatus>,
    ) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let mut conn = self.conn()?;
            let tx = conn.transaction().map_err(db_err)?;
            let now = Utc::now();
            let mut updated = 0;
            for id in &ids {
                let mut found = load_contexts(&tx, "SELECT body FROM flow_contexts WHERE id = ?1", id)?;
                let Some(mut ctx) = found.pop() else {
                    continue;
                };
                if only_if.is_some_and(|expected| ctx.status != expected) {
                    continue;
                }
                ctx.status = status;
                ctx.updated_at = now;
                if status == FlowNodeStatus::Archived {
                    ctx.archived_at = Some(now);
                }
                write_context(&tx, &ctx)?;
                updated += 1;
            }
            tx.commit().map_err(db_err)?;
            Ok(updated)
        })
    }

    fn update_flow_data(&self, updates: Vec<(String, FlowData)>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut conn = self.conn()?;
            let tx = conn.transaction().map_err(db_err)?;
            for (id, data) in updates {
                let mut found = load_contexts(&tx, "SELECT body FROM flow_contexts WHERE id = ?1", &id)?;
                if let Some(mut ctx) = found.pop() {
                    ctx.data = data;
                    ctx.updated_at = Utc::now();
                    write_context(&tx, &ctx)?;
                }
            }
            tx.commit().map_err(db_err)
        })
    }

    fn get_by_to_batch(&self, batches: Vec<String>) -> BoxFuture<'_, Result<Vec<FlowContext>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut out = Vec::new();
            for batch in &batches {
                out.extend(load_contexts(
                    &conn,
                    "SELECT body FROM flow_contexts WHERE to_batch = ?1 ORDER BY created_at, id",
                    batch,
                )?);
            }
            Ok(out)
        })
    }

    fn find_by_context_id_list(&self, ids: Vec<String>) -> BoxFuture<'_, Result<Vec<FlowContext>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut out = Vec::new();
            for id in &ids {
                out.extend(load_contexts(&conn, "SELECT body FROM flow_contexts WHERE id = ?1", id)?);
            }
            Ok(out)
        })
    }
}

fn load_trace(conn: &Connection, id: &str) -> Result<Option<FlowTrace>> {
    let body: Option<String> = conn
        .query_row("SELECT body FROM flow_traces WHERE id = ?1", params![id], |row| row.get(0))
        .optional()
        .map_err(db_err)?;
    Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
}

fn write_trace(conn: &Connection, trace: &FlowTrace) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO flow_traces (id, stream_id, body) VALUES (?1, ?2, ?3)",
        params![trace.id, trace.stream_id, serde_json::to_string(trace)?],
    )
    .map_err(db_err)?;
    Ok(())
}

impl TraceRepository for SqliteStore {
    fn save(&self, trace: FlowTrace) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.conn()?;
            write_trace(&conn, &trace)
        })
    }

    fn find_trace_by_id_list(&self, ids: Vec<String>) -> BoxFuture<'_, Result<Vec<FlowTrace>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut out = Vec::new();
            for id in &ids {
                if let Some(trace) = load_trace(&conn, id)? {
                    out.push(trace);
                }
            }
            Ok(out)
        })
    }

    fn append_to_pool(
        &self,
        trace_ids: Vec<String>,
        context_ids: Vec<String>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut conn = self.conn()?;
            let tx = conn.transaction().map_err(db_err)?;
            for trace_id in &trace_ids {
                let mut trace = load_trace(&tx, trace_id)?
                    .ok_or_else(|| FlowError::TraceNotFound(trace_id.clone()))?;
                trace.context_pool.extend(context_ids.iter().cloned());
                write_trace(&tx, &trace)?;
            }
            tx.commit().map_err(db_err)
        })
    }
}

const RETRY_COLUMNS: &str =
    "entity_id, entity_type, next_retry_time, last_retry_time, retry_count, max_retry, version";

fn retry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowRetry> {
    Ok(FlowRetry {
        entity_id: row.get(0)?,
        entity_type: row.get(1)?,
        next_retry_time: from_millis(row.get(2)?),
        last_retry_time: row.get::<_, Option<i64>>(3)?.map(from_millis),
        retry_count: row.get(4)?,
        max_retry: row.get(5)?,
        version: row.get(6)?,
    })
}

impl RetryRepository for SqliteStore {
    fn save(&self, retry: FlowRetry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                &format!("INSERT OR REPLACE INTO flow_retries ({RETRY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    retry.entity_id,
                    retry.entity_type,
                    retry.next_retry_time.timestamp_millis(),
                    retry.last_retry_time.map(|t| t.timestamp_millis()),
                    retry.retry_count,
                    retry.max_retry,
                    retry.version,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn find(&self, entity_id: String) -> BoxFuture<'_, Result<Option<FlowRetry>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {RETRY_COLUMNS} FROM flow_retries WHERE entity_id = ?1"),
                params![entity_id],
                retry_from_row,
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn filter_by_next_retry_time(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<FlowRetry>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {RETRY_COLUMNS} FROM flow_retries
                     WHERE next_retry_time <= ?1 AND retry_count < max_retry
                     ORDER BY next_retry_time, entity_id
                     LIMIT ?2"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![now.timestamp_millis(), limit as i64], retry_from_row)
                .map_err(db_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(db_err)?);
            }
            Ok(out)
        })
    }

    fn update_retry_record(&self, retry: FlowRetry) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let changed = conn
                .execute(
                    "UPDATE flow_retries
                     SET next_retry_time = ?1, last_retry_time = ?2, retry_count = ?3,
                         max_retry = ?4, version = version + 1
                     WHERE entity_id = ?5 AND version = ?6",
                    params![
                        retry.next_retry_time.timestamp_millis(),
                        retry.last_retry_time.map(|t| t.timestamp_millis()),
                        retry.retry_count,
                        retry.max_retry,
                        retry.entity_id,
                        retry.version,
                    ],
                )
                .map_err(db_err)?;
            Ok(changed == 1)
        })
    }

    fn delete(&self, entity_ids: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.conn()?;
            for id in &entity_ids {
                conn.execute("DELETE FROM flow_retries WHERE entity_id = ?1", params![id])
                    .map_err(db_err)?;
            }
            Ok(())
        })
    }
}

impl DefinitionRepository for SqliteStore {
    fn save(&self, definition: FlowDefinition) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "INSERT OR REPLACE INTO flow_definitions (stream_id, body) VALUES (?1, ?2)",
                params![definition.stream_id, serde_json::to_string(&definition)?],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn find_by_stream_id(&self, stream_id: String) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM flow_definitions WHERE stream_id = ?1",
                    params![stream_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
        })
    }
}
