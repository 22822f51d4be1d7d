use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{
    AgentTask, DeliveryStatus, GroupMember, GroupTaskFilter, GroupTaskRecord, GroupTaskStatus,
    NewGroupTask, NewSpan, NewTask, SpanRecord, TaskDirection, TaskFilter, TaskStatus, TokenUsage,
};

/// Errors surfaced by [`LedgerDb`].
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Db(tokio_rusqlite::Error),

    #[error("idempotency key already recorded: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid status transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("corrupt row (column {column}): {reason}")]
    Corrupt { column: usize, reason: String },
}

impl From<tokio_rusqlite::Error> for LedgerError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(rusqlite::Error::FromSqlConversionFailure(
                column,
                _,
                source,
            )) => LedgerError::Corrupt {
                column,
                reason: source.to_string(),
            },
            other => LedgerError::Db(other),
        }
    }
}

/// Async SQLite-backed store for the task ledger, the persisted roster,
/// cooperative group tasks and spans.
///
/// All access goes through one background connection, so every call is
/// serialized and multi-statement operations run inside a transaction.
pub struct LedgerDb {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers – timestamps and text columns
// ---------------------------------------------------------------------------

/// Fixed-width UTC so that lexical order matches chronological order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn get_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn get_opt_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn get_enum<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn get_set(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<BTreeSet<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn set_to_sql(set: &BTreeSet<String>) -> String {
    serde_json::to_string(set).unwrap_or_else(|_| "[]".to_string())
}

/// Empty strings are stored as NULL.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

const TASK_COLUMNS: &str = "id, task_id, idempotency_key, trace_id, channel, chat_id, sender_id,
    message_kind, status, content_in, content_out, error_text,
    prompt_tokens, completion_tokens, total_tokens,
    delivery_status, delivery_attempts, delivery_next_at,
    created_at, updated_at, completed_at";

const MEMBER_COLUMNS: &str =
    "agent_id, agent_name, soul_summary, capabilities, channels, model, status, last_seen";

const GROUP_TASK_COLUMNS: &str = "id, task_id, description, content, direction, requester_id,
    responder_id, response_content, status, created_at, responded_at";

const SPAN_COLUMNS: &str = "id, trace_id, agent_id, span_id, parent_span_id, span_type, title,
    content, started_at, ended_at, duration_ms, created_at";

impl LedgerDb {
    /// Open (or create) a ledger at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory ledger (useful for tests).
    pub async fn new_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), LedgerError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS members (
                        agent_id     TEXT PRIMARY KEY,
                        agent_name   TEXT NOT NULL,
                        soul_summary TEXT NOT NULL DEFAULT '',
                        capabilities TEXT NOT NULL DEFAULT '[]',
                        channels     TEXT NOT NULL DEFAULT '[]',
                        model        TEXT NOT NULL DEFAULT '',
                        status       TEXT NOT NULL,
                        last_seen    TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_members_status ON members(status);

                    CREATE TABLE IF NOT EXISTS tasks (
                        id                INTEGER PRIMARY KEY AUTOINCREMENT,
                        task_id           TEXT NOT NULL UNIQUE,
                        idempotency_key   TEXT UNIQUE,
                        trace_id          TEXT,
                        channel           TEXT NOT NULL,
                        chat_id           TEXT NOT NULL,
                        sender_id         TEXT,
                        message_kind      TEXT NOT NULL,
                        status            TEXT NOT NULL,
                        content_in        TEXT NOT NULL DEFAULT '',
                        content_out       TEXT,
                        error_text        TEXT,
                        prompt_tokens     INTEGER NOT NULL DEFAULT 0,
                        completion_tokens INTEGER NOT NULL DEFAULT 0,
                        total_tokens      INTEGER NOT NULL DEFAULT 0,
                        delivery_status   TEXT NOT NULL,
                        delivery_attempts INTEGER NOT NULL DEFAULT 0,
                        delivery_next_at  TEXT,
                        created_at        TEXT NOT NULL,
                        updated_at        TEXT NOT NULL,
                        completed_at      TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_trace    ON tasks(trace_id);
                    CREATE INDEX IF NOT EXISTS idx_tasks_status   ON tasks(status);
                    CREATE INDEX IF NOT EXISTS idx_tasks_delivery ON tasks(delivery_status, delivery_next_at);

                    CREATE TABLE IF NOT EXISTS group_tasks (
                        id               INTEGER PRIMARY KEY AUTOINCREMENT,
                        task_id          TEXT NOT NULL UNIQUE,
                        description      TEXT NOT NULL DEFAULT '',
                        content          TEXT NOT NULL DEFAULT '',
                        direction        TEXT NOT NULL,
                        requester_id     TEXT NOT NULL,
                        responder_id     TEXT,
                        response_content TEXT,
                        status           TEXT NOT NULL,
                        created_at       TEXT NOT NULL,
                        responded_at     TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_group_tasks_direction ON group_tasks(direction);

                    CREATE TABLE IF NOT EXISTS spans (
                        id             INTEGER PRIMARY KEY AUTOINCREMENT,
                        trace_id       TEXT NOT NULL,
                        agent_id       TEXT NOT NULL,
                        span_id        TEXT,
                        parent_span_id TEXT,
                        span_type      TEXT NOT NULL,
                        title          TEXT NOT NULL DEFAULT '',
                        content        TEXT NOT NULL DEFAULT '',
                        started_at     TEXT,
                        ended_at       TEXT,
                        duration_ms    INTEGER NOT NULL DEFAULT 0,
                        created_at     TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans(trace_id);
                    CREATE UNIQUE INDEX IF NOT EXISTS idx_spans_identity
                        ON spans(trace_id, agent_id, span_id) WHERE span_id IS NOT NULL;
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Insert a new task in status `pending` / delivery `pending`.
    ///
    /// Fails with [`LedgerError::DuplicateIdempotencyKey`] when another task
    /// already holds the same non-empty key.
    pub async fn create_task(&self, new: NewTask) -> Result<AgentTask, LedgerError> {
        let task_id = non_empty(new.task_id).unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let key = non_empty(new.idempotency_key);
        let trace_id = non_empty(new.trace_id);
        let now = ts(&Utc::now());
        let kind = new.message_kind.as_str();
        let status = TaskStatus::Pending.as_str();
        let delivery = DeliveryStatus::Pending.as_str();

        let key_for_err = key.clone().unwrap_or_default();
        let created = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "INSERT INTO tasks (task_id, idempotency_key, trace_id, channel, chat_id,
                        sender_id, message_kind, status, content_in, delivery_status,
                        created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?11)
                     ON CONFLICT(idempotency_key) DO NOTHING",
                    rusqlite::params![
                        task_id,
                        key,
                        trace_id,
                        new.channel,
                        new.chat_id,
                        new.sender_id,
                        kind,
                        status,
                        new.content_in,
                        delivery,
                        now,
                    ],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                let task = conn
                    .query_row(
                        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                        rusqlite::params![task_id],
                        row_to_task,
                    )?;
                Ok(Some(task))
            })
            .await?;

        created.ok_or(LedgerError::DuplicateIdempotencyKey(key_for_err))
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<AgentTask>, LedgerError> {
        self.query_one_task("task_id", task_id).await
    }

    /// Returns the task holding `key`, if any. Empty keys never match.
    pub async fn get_task_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<AgentTask>, LedgerError> {
        if key.is_empty() {
            return Ok(None);
        }
        self.query_one_task("idempotency_key", key).await
    }

    /// The earliest task recorded under `trace_id`.
    pub async fn get_task_by_trace_id(
        &self,
        trace_id: &str,
    ) -> Result<Option<AgentTask>, LedgerError> {
        self.query_one_task("trace_id", trace_id).await
    }

    async fn query_one_task(
        &self,
        column: &'static str,
        value: &str,
    ) -> Result<Option<AgentTask>, LedgerError> {
        let value = value.to_string();
        let task = self
            .conn
            .call(move |conn| {
                let task = conn
                    .query_row(
                        &format!(
                            "SELECT {TASK_COLUMNS} FROM tasks WHERE {column} = ?1
                             ORDER BY id ASC LIMIT 1"
                        ),
                        rusqlite::params![value],
                        row_to_task,
                    )
                    .optional()?;
                Ok(task)
            })
            .await?;
        Ok(task)
    }

    /// Move a task forward. `output` and `error` overwrite only when given.
    /// Terminal statuses stamp `completed_at`.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<(), LedgerError> {
        let id = task_id.to_string();
        let now = ts(&Utc::now());
        let completed_at = status.is_terminal().then(|| now.clone());

        let current = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = tx
                    .query_row(
                        "SELECT status FROM tasks WHERE task_id = ?1",
                        rusqlite::params![id],
                        |r| r.get(0),
                    )
                    .optional()?;
                let Some(raw) = current else {
                    return Ok(None);
                };
                let from = TaskStatus::from_str(&raw).map_err(|e| conversion_err(0, e))?;
                if from.can_transition_to(&status) {
                    tx.execute(
                        "UPDATE tasks SET status = ?1,
                            content_out = COALESCE(?2, content_out),
                            error_text = COALESCE(?3, error_text),
                            updated_at = ?4,
                            completed_at = COALESCE(?5, completed_at)
                         WHERE task_id = ?6",
                        rusqlite::params![status.as_str(), output, error, now, completed_at, id],
                    )?;
                }
                tx.commit()?;
                Ok(Some(from))
            })
            .await?;

        match current {
            None => Err(LedgerError::TaskNotFound(task_id.to_string())),
            Some(from) if !from.can_transition_to(&status) => Err(LedgerError::InvalidTransition {
                task_id: task_id.to_string(),
                from,
                to: status,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Record one delivery attempt. The attempt counter is incremented on
    /// every call, whatever `status` is.
    pub async fn update_delivery(
        &self,
        task_id: &str,
        status: DeliveryStatus,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), LedgerError> {
        let id = task_id.to_string();
        let now = ts(&Utc::now());
        let next = next_retry_at.as_ref().map(ts);
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET delivery_status = ?1,
                        delivery_attempts = delivery_attempts + 1,
                        delivery_next_at = ?2,
                        updated_at = ?3
                     WHERE task_id = ?4",
                    rusqlite::params![status.as_str(), next, now, id],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(LedgerError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    /// Add token usage to a task's running totals.
    pub async fn add_token_usage(
        &self,
        task_id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) -> Result<(), LedgerError> {
        let id = task_id.to_string();
        let now = ts(&Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET prompt_tokens = prompt_tokens + ?1,
                        completion_tokens = completion_tokens + ?2,
                        total_tokens = total_tokens + ?1 + ?2,
                        updated_at = ?3
                     WHERE task_id = ?4",
                    rusqlite::params![prompt_tokens, completion_tokens, now, id],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(LedgerError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    /// Total tokens used by tasks created at or after `since`.
    pub async fn token_usage_since(&self, since: DateTime<Utc>) -> Result<i64, LedgerError> {
        let since = ts(&since);
        let total = self
            .conn
            .call(move |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(total_tokens), 0) FROM tasks WHERE created_at >= ?1",
                    rusqlite::params![since],
                    |r| r.get(0),
                )?;
                Ok(total)
            })
            .await?;
        Ok(total)
    }

    /// Total tokens used by tasks created since midnight UTC.
    pub async fn daily_token_usage(&self) -> Result<i64, LedgerError> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc())
            .unwrap_or_else(Utc::now);
        self.token_usage_since(midnight).await
    }

    /// Newest first.
    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<AgentTask>, LedgerError> {
        let tasks = self
            .conn
            .call(move |conn| {
                let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1");
                let mut args: Vec<Value> = Vec::new();
                if let Some(status) = filter.status {
                    args.push(Value::Text(status.as_str().to_string()));
                    sql.push_str(&format!(" AND status = ?{}", args.len()));
                }
                if let Some(channel) = filter.channel {
                    args.push(Value::Text(channel));
                    sql.push_str(&format!(" AND channel = ?{}", args.len()));
                }
                args.push(Value::Integer(filter.limit.map(i64::from).unwrap_or(-1)));
                sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{}", args.len()));
                args.push(Value::Integer(i64::from(filter.offset)));
                sql.push_str(&format!(" OFFSET ?{}", args.len()));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(args), row_to_task)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        Ok(tasks)
    }

    /// Finished tasks whose reply has not been delivered and whose retry time
    /// has come, oldest first.
    pub async fn list_pending_deliveries(&self, limit: u32) -> Result<Vec<AgentTask>, LedgerError> {
        let now = ts(&Utc::now());
        let tasks = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status IN ('completed', 'failed')
                       AND delivery_status = 'pending'
                       AND (delivery_next_at IS NULL OR delivery_next_at <= ?1)
                     ORDER BY id ASC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(rusqlite::params![now, limit], row_to_task)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        Ok(tasks)
    }

    // -----------------------------------------------------------------------
    // Members
    // -----------------------------------------------------------------------

    pub async fn upsert_member(&self, member: &GroupMember) -> Result<(), LedgerError> {
        let agent_id = member.agent_id.clone();
        let name = member.agent_name.clone();
        let summary = member.soul_summary.clone();
        let caps = set_to_sql(&member.capabilities);
        let channels = set_to_sql(&member.channels);
        let model = member.model.clone();
        let status = member.status.as_str();
        let last_seen = ts(&member.last_seen);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO members (agent_id, agent_name, soul_summary, capabilities,
                        channels, model, status, last_seen)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                     ON CONFLICT(agent_id) DO UPDATE SET
                        agent_name=excluded.agent_name, soul_summary=excluded.soul_summary,
                        capabilities=excluded.capabilities, channels=excluded.channels,
                        model=excluded.model, status=excluded.status,
                        last_seen=excluded.last_seen",
                    rusqlite::params![agent_id, name, summary, caps, channels, model, status, last_seen],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Returns `true` when a row was deleted.
    pub async fn remove_member(&self, agent_id: &str) -> Result<bool, LedgerError> {
        let agent_id = agent_id.to_string();
        let n = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM members WHERE agent_id = ?1",
                    rusqlite::params![agent_id],
                )?;
                Ok(n)
            })
            .await?;
        Ok(n > 0)
    }

    pub async fn get_member(&self, agent_id: &str) -> Result<Option<GroupMember>, LedgerError> {
        let agent_id = agent_id.to_string();
        let member = self
            .conn
            .call(move |conn| {
                let m = conn
                    .query_row(
                        &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE agent_id = ?1"),
                        rusqlite::params![agent_id],
                        row_to_member,
                    )
                    .optional()?;
                Ok(m)
            })
            .await?;
        Ok(member)
    }

    pub async fn list_members(&self) -> Result<Vec<GroupMember>, LedgerError> {
        let members = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MEMBER_COLUMNS} FROM members ORDER BY agent_id"
                ))?;
                let rows = stmt.query_map([], row_to_member)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        Ok(members)
    }

    /// Flip every `active` member last seen before `cutoff` to `stale` and
    /// return their ids. Rows are never deleted here.
    pub async fn mark_stale_members(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, LedgerError> {
        let cutoff = ts(&cutoff);
        let ids = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids = {
                    let mut stmt = tx.prepare(
                        "SELECT agent_id FROM members
                         WHERE status = 'active' AND last_seen < ?1 ORDER BY agent_id",
                    )?;
                    let rows = stmt.query_map(rusqlite::params![cutoff], |r| r.get::<_, String>(0))?;
                    let mut ids = Vec::new();
                    for row in rows {
                        ids.push(row?);
                    }
                    ids
                };
                tx.execute(
                    "UPDATE members SET status = 'stale'
                     WHERE status = 'active' AND last_seen < ?1",
                    rusqlite::params![cutoff],
                )?;
                tx.commit()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Group tasks
    // -----------------------------------------------------------------------

    /// Returns `false` when a record with the same task id already exists.
    pub async fn insert_group_task(&self, task: NewGroupTask) -> Result<bool, LedgerError> {
        let now = ts(&Utc::now());
        let n = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT INTO group_tasks (task_id, description, content, direction,
                        requester_id, status, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)
                     ON CONFLICT(task_id) DO NOTHING",
                    rusqlite::params![
                        task.task_id,
                        task.description,
                        task.content,
                        task.direction.as_str(),
                        task.requester_id,
                        GroupTaskStatus::Pending.as_str(),
                        now,
                    ],
                )?;
                Ok(n)
            })
            .await?;
        Ok(n > 0)
    }

    /// Record a response on the `direction` record for `task_id`. Returns
    /// `false` when there is no such record.
    pub async fn update_group_task_response(
        &self,
        task_id: &str,
        direction: TaskDirection,
        responder_id: &str,
        content: &str,
        status: GroupTaskStatus,
    ) -> Result<bool, LedgerError> {
        let task_id = task_id.to_string();
        let responder_id = responder_id.to_string();
        let content = content.to_string();
        let now = ts(&Utc::now());
        let n = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE group_tasks SET responder_id = ?1, response_content = ?2,
                        status = ?3, responded_at = ?4
                     WHERE task_id = ?5 AND direction = ?6",
                    rusqlite::params![
                        responder_id,
                        content,
                        status.as_str(),
                        now,
                        task_id,
                        direction.as_str(),
                    ],
                )?;
                Ok(n)
            })
            .await?;
        Ok(n > 0)
    }

    pub async fn get_group_task(
        &self,
        task_id: &str,
    ) -> Result<Option<GroupTaskRecord>, LedgerError> {
        let task_id = task_id.to_string();
        let rec = self
            .conn
            .call(move |conn| {
                let rec = conn
                    .query_row(
                        &format!("SELECT {GROUP_TASK_COLUMNS} FROM group_tasks WHERE task_id = ?1"),
                        rusqlite::params![task_id],
                        row_to_group_task,
                    )
                    .optional()?;
                Ok(rec)
            })
            .await?;
        Ok(rec)
    }

    /// Newest first.
    pub async fn list_group_tasks(
        &self,
        filter: GroupTaskFilter,
    ) -> Result<Vec<GroupTaskRecord>, LedgerError> {
        let recs = self
            .conn
            .call(move |conn| {
                let mut sql = format!("SELECT {GROUP_TASK_COLUMNS} FROM group_tasks WHERE 1=1");
                let mut args: Vec<Value> = Vec::new();
                if let Some(direction) = filter.direction {
                    args.push(Value::Text(direction.as_str().to_string()));
                    sql.push_str(&format!(" AND direction = ?{}", args.len()));
                }
                if let Some(status) = filter.status {
                    args.push(Value::Text(status.as_str().to_string()));
                    sql.push_str(&format!(" AND status = ?{}", args.len()));
                }
                args.push(Value::Integer(filter.limit.map(i64::from).unwrap_or(-1)));
                sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{}", args.len()));
                args.push(Value::Integer(i64::from(filter.offset)));
                sql.push_str(&format!(" OFFSET ?{}", args.len()));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(args), row_to_group_task)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        Ok(recs)
    }

    // -----------------------------------------------------------------------
    // Spans
    // -----------------------------------------------------------------------

    /// Append a span. A span whose (trace id, agent id, span id) is already
    /// stored is ignored and `false` is returned.
    pub async fn insert_span(&self, span: NewSpan) -> Result<bool, LedgerError> {
        let now = ts(&Utc::now());
        let started = span.started_at.as_ref().map(ts);
        let ended = span.ended_at.as_ref().map(ts);
        let span_id = non_empty(span.span_id);
        let parent = non_empty(span.parent_span_id);
        let n = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT INTO spans (trace_id, agent_id, span_id, parent_span_id, span_type,
                        title, content, started_at, ended_at, duration_ms, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                     ON CONFLICT DO NOTHING",
                    rusqlite::params![
                        span.trace_id,
                        span.agent_id,
                        span_id,
                        parent,
                        span.span_type,
                        span.title,
                        span.content,
                        started,
                        ended,
                        span.duration_ms,
                        now,
                    ],
                )?;
                Ok(n)
            })
            .await?;
        Ok(n > 0)
    }

    pub async fn spans_for_trace(&self, trace_id: &str) -> Result<Vec<SpanRecord>, LedgerError> {
        let trace_id = trace_id.to_string();
        let spans = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SPAN_COLUMNS} FROM spans WHERE trace_id = ?1 ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map(rusqlite::params![trace_id], row_to_span)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        Ok(spans)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentTask> {
    Ok(AgentTask {
        id: row.get(0)?,
        task_id: row.get(1)?,
        idempotency_key: row.get(2)?,
        trace_id: row.get(3)?,
        channel: row.get(4)?,
        chat_id: row.get(5)?,
        sender_id: row.get(6)?,
        message_kind: get_enum(row, 7)?,
        status: get_enum(row, 8)?,
        content_in: row.get(9)?,
        content_out: row.get(10)?,
        error_text: row.get(11)?,
        usage: TokenUsage {
            prompt_tokens: row.get(12)?,
            completion_tokens: row.get(13)?,
            total_tokens: row.get(14)?,
        },
        delivery_status: get_enum(row, 15)?,
        delivery_attempts: row.get(16)?,
        delivery_next_at: get_opt_ts(row, 17)?,
        created_at: get_ts(row, 18)?,
        updated_at: get_ts(row, 19)?,
        completed_at: get_opt_ts(row, 20)?,
    })
}

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupMember> {
    Ok(GroupMember {
        agent_id: row.get(0)?,
        agent_name: row.get(1)?,
        soul_summary: row.get(2)?,
        capabilities: get_set(row, 3)?,
        channels: get_set(row, 4)?,
        model: row.get(5)?,
        status: get_enum(row, 6)?,
        last_seen: get_ts(row, 7)?,
    })
}

fn row_to_group_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupTaskRecord> {
    Ok(GroupTaskRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        description: row.get(2)?,
        content: row.get(3)?,
        direction: get_enum(row, 4)?,
        requester_id: row.get(5)?,
        responder_id: row.get(6)?,
        response_content: row.get(7)?,
        status: get_enum(row, 8)?,
        created_at: get_ts(row, 9)?,
        responded_at: get_opt_ts(row, 10)?,
    })
}

fn row_to_span(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpanRecord> {
    Ok(SpanRecord {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        agent_id: row.get(2)?,
        span_id: row.get(3)?,
        parent_span_id: row.get(4)?,
        span_type: row.get(5)?,
        title: row.get(6)?,
        content: row.get(7)?,
        started_at: get_opt_ts(row, 8)?,
        ended_at: get_opt_ts(row, 9)?,
        duration_ms: row.get(10)?,
        created_at: get_ts(row, 11)?,
    })
}
