//! SQLite backend.
//!
//! One database file holds five tables:
//! - `owners` and `access_tokens` (token digests only)
//! - `sessions`, with a partial unique index allowing one active session
//!   per owner
//! - `chat_turns` and `memories`, each with an integer `seq` for stable
//!   insertion order
//!
//! Timestamps are stored as fixed-width RFC 3339 text so they sort
//! lexically.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tandem_core::{
    ChatHistory, ChatTurn, FocusSession, Identity, IdentityValidator, MemoryCategory, MemoryItem,
    MemoryStore, Owner, OwnerDirectory, Role, SessionStatus, SessionStore, SessionSummary,
    StoreError,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{TokenIssuer, generate_token, token_digest};

/// A SQLite-backed store implementing every storage trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryFailed(format!("bad timestamp {raw:?}: {e}")))
}

fn query_err(context: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::QueryFailed(format!("{context}: {e}"))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

impl SqliteStore {
    /// Open (creating if missing) a database file.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // An in-memory database lives and dies with its one connection.
        let ephemeral = path.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if ephemeral { 1 } else { 4 });
        if ephemeral {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;

        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Open a database at a filesystem path, creating parent directories.
    pub async fn open_file(path: &std::path::Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Storage(format!("{}: {e}", parent.display())))?;
        }
        Self::new(&format!("sqlite://{}", path.display())).await
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements: [(&str, &str); 8] = [
            (
                "owners table",
                r#"
                CREATE TABLE IF NOT EXISTS owners (
                    id            TEXT PRIMARY KEY,
                    name          TEXT NOT NULL,
                    email         TEXT NOT NULL,
                    work_context  TEXT,
                    interests     TEXT NOT NULL DEFAULT '[]',
                    created_at    TEXT NOT NULL
                )
                "#,
            ),
            (
                "access_tokens table",
                r#"
                CREATE TABLE IF NOT EXISTS access_tokens (
                    token_digest  TEXT PRIMARY KEY,
                    owner_id      TEXT NOT NULL REFERENCES owners(id) ON DELETE CASCADE,
                    created_at    TEXT NOT NULL,
                    expires_at    TEXT
                )
                "#,
            ),
            (
                "sessions table",
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    id               TEXT PRIMARY KEY,
                    owner_id         TEXT NOT NULL REFERENCES owners(id) ON DELETE CASCADE,
                    task             TEXT NOT NULL,
                    planned_minutes  INTEGER NOT NULL,
                    checkin_minutes  INTEGER NOT NULL,
                    status           TEXT NOT NULL,
                    started_at       TEXT NOT NULL,
                    ended_at         TEXT,
                    outcome          TEXT
                )
                "#,
            ),
            (
                "single active session index",
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active \
                 ON sessions(owner_id) WHERE status = 'active'",
            ),
            (
                "chat_turns table",
                r#"
                CREATE TABLE IF NOT EXISTS chat_turns (
                    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                    id          TEXT UNIQUE NOT NULL,
                    session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    role        TEXT NOT NULL,
                    content     TEXT NOT NULL,
                    created_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "chat_turns index",
                "CREATE INDEX IF NOT EXISTS idx_chat_turns_session ON chat_turns(session_id, seq)",
            ),
            (
                "memories table",
                r#"
                CREATE TABLE IF NOT EXISTS memories (
                    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
                    id                  TEXT UNIQUE NOT NULL,
                    owner_id            TEXT NOT NULL REFERENCES owners(id) ON DELETE CASCADE,
                    category            TEXT NOT NULL,
                    content             TEXT NOT NULL,
                    importance          INTEGER NOT NULL,
                    last_referenced_at  TEXT,
                    created_at          TEXT NOT NULL,
                    source              TEXT
                )
                "#,
            ),
            (
                "memories index",
                "CREATE INDEX IF NOT EXISTS idx_memories_owner_category \
                 ON memories(owner_id, category)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_owner(row: &SqliteRow) -> Result<Owner, StoreError> {
        let interests: String = column(row, "interests")?;
        Ok(Owner {
            id: column(row, "id")?,
            name: column(row, "name")?,
            email: column(row, "email")?,
            work_context: column(row, "work_context")?,
            interests: serde_json::from_str(&interests).unwrap_or_default(),
            created_at: parse_ts(&column::<String>(row, "created_at")?)?,
        })
    }

    fn row_to_session(row: &SqliteRow) -> Result<FocusSession, StoreError> {
        let status: String = column(row, "status")?;
        let ended_at: Option<String> = column(row, "ended_at")?;
        Ok(FocusSession {
            id: column(row, "id")?,
            owner_id: column(row, "owner_id")?,
            task: column(row, "task")?,
            planned_minutes: column::<i64>(row, "planned_minutes")? as u32,
            checkin_minutes: column::<i64>(row, "checkin_minutes")? as u32,
            status: SessionStatus::from_str(&status).map_err(StoreError::QueryFailed)?,
            started_at: parse_ts(&column::<String>(row, "started_at")?)?,
            ended_at: ended_at.as_deref().map(parse_ts).transpose()?,
            outcome: column(row, "outcome")?,
        })
    }

    fn row_to_turn(row: &SqliteRow) -> Result<ChatTurn, StoreError> {
        let role: String = column(row, "role")?;
        Ok(ChatTurn {
            id: column(row, "id")?,
            session_id: column(row, "session_id")?,
            role: Role::from_str(&role).map_err(StoreError::QueryFailed)?,
            content: column(row, "content")?,
            created_at: parse_ts(&column::<String>(row, "created_at")?)?,
        })
    }

    fn row_to_memory(row: &SqliteRow) -> Result<MemoryItem, StoreError> {
        let category: String = column(row, "category")?;
        let last_referenced_at: Option<String> = column(row, "last_referenced_at")?;
        Ok(MemoryItem {
            id: column(row, "id")?,
            owner_id: column(row, "owner_id")?,
            category: MemoryCategory::from_str(&category).map_err(StoreError::QueryFailed)?,
            content: column(row, "content")?,
            importance: column::<i64>(row, "importance")?.clamp(1, 5) as u8,
            last_referenced_at: last_referenced_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&column::<String>(row, "created_at")?)?,
            source: column(row, "source")?,
        })
    }
}

#[async_trait]
impl OwnerDirectory for SqliteStore {
    async fn create_owner(&self, owner: Owner) -> Result<Owner, StoreError> {
        let interests = serde_json::to_string(&owner.interests)
            .map_err(|e| StoreError::Storage(format!("interests serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO owners (id, name, email, work_context, interests, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&owner.id)
        .bind(&owner.name)
        .bind(&owner.email)
        .bind(&owner.work_context)
        .bind(&interests)
        .bind(ts(owner.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT owner failed: {e}")))?;

        debug!(owner_id = %owner.id, "Created owner");
        Ok(owner)
    }

    async fn find_owner(&self, owner_id: &str) -> Result<Option<Owner>, StoreError> {
        let row = sqlx::query("SELECT * FROM owners WHERE id = ?1")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("find owner"))?;
        row.as_ref().map(Self::row_to_owner).transpose()
    }
}

#[async_trait]
impl TokenIssuer for SqliteStore {
    async fn issue_token(
        &self,
        owner_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<String, StoreError> {
        if self.find_owner(owner_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("owner {owner_id}")));
        }

        let token = generate_token();
        sqlx::query(
            r#"
            INSERT INTO access_tokens (token_digest, owner_id, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(token_digest(&token))
        .bind(owner_id)
        .bind(ts(Utc::now()))
        .bind(expires_at.map(ts))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT token failed: {e}")))?;

        Ok(token)
    }
}

#[async_trait]
impl IdentityValidator for SqliteStore {
    async fn validate(&self, token: &str) -> Result<Option<Identity>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT o.id, o.name, o.email
            FROM access_tokens t
            JOIN owners o ON o.id = t.owner_id
            WHERE t.token_digest = ?1
              AND (t.expires_at IS NULL OR t.expires_at > ?2)
            "#,
        )
        .bind(token_digest(token))
        .bind(ts(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("validate token"))?;

        row.map(|row| {
            Ok(Identity {
                id: column(&row, "id")?,
                name: column(&row, "name")?,
                email: column(&row, "email")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(&self, session: FocusSession) -> Result<FocusSession, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions
                (id, owner_id, task, planned_minutes, checkin_minutes, status, started_at, ended_at, outcome)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&session.id)
        .bind(&session.owner_id)
        .bind(&session.task)
        .bind(session.planned_minutes as i64)
        .bind(session.checkin_minutes as i64)
        .bind(session.status.as_str())
        .bind(ts(session.started_at))
        .bind(session.ended_at.map(ts))
        .bind(&session.outcome)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(session),
            Err(e) if is_unique_violation(&e) => Err(StoreError::ActiveSessionExists {
                owner_id: session.owner_id,
            }),
            Err(e) => Err(StoreError::Storage(format!("INSERT session failed: {e}"))),
        }
    }

    async fn find_session(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<Option<FocusSession>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1 AND owner_id = ?2")
            .bind(session_id)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("find session"))?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn is_session_active(&self, session_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM sessions WHERE id = ?1 AND status = 'active'")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("session liveness"))?;
        Ok(row.is_some())
    }

    async fn active_session(&self, owner_id: &str) -> Result<Option<FocusSession>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE owner_id = ?1 AND status = 'active'")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("active session"))?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn update_session(&self, session: &FocusSession) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET status = ?1, ended_at = ?2, outcome = ?3
            WHERE id = ?4 AND owner_id = ?5
            "#,
        )
        .bind(session.status.as_str())
        .bind(session.ended_at.map(ts))
        .bind(&session.outcome)
        .bind(&session.id)
        .bind(&session.owner_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                Err(StoreError::NotFound(format!("session {}", session.id)))
            }
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::ActiveSessionExists {
                owner_id: session.owner_id.clone(),
            }),
            Err(e) => Err(StoreError::Storage(format!("UPDATE session failed: {e}"))),
        }
    }

    async fn recent_completed_sessions(
        &self,
        owner_id: &str,
        exclude_session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sessions
            WHERE owner_id = ?1
              AND status = 'completed'
              AND (?2 IS NULL OR id != ?2)
            ORDER BY started_at DESC
            LIMIT ?3
            "#,
        )
        .bind(owner_id)
        .bind(exclude_session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("recent sessions"))?;

        rows.iter()
            .map(|row| Self::row_to_session(row).map(|s| SessionSummary::from(&s)))
            .collect()
    }
}

#[async_trait]
impl ChatHistory for SqliteStore {
    async fn append_turn(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<ChatTurn, StoreError> {
        let turn = ChatTurn {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO chat_turns (id, session_id, role, content, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&turn.id)
        .bind(&turn.session_id)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(ts(turn.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT turn failed: {e}")))?;

        Ok(turn)
    }

    async fn list_turns(&self, session_id: &str) -> Result<Vec<ChatTurn>, StoreError> {
        let rows = sqlx::query("SELECT * FROM chat_turns WHERE session_id = ?1 ORDER BY seq")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("list turns"))?;
        rows.iter().map(Self::row_to_turn).collect()
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn add_memory(&self, item: MemoryItem) -> Result<MemoryItem, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO memories
                (id, owner_id, category, content, importance, last_referenced_at, created_at, source)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&item.id)
        .bind(&item.owner_id)
        .bind(item.category.as_str())
        .bind(&item.content)
        .bind(item.importance as i64)
        .bind(item.last_referenced_at.map(ts))
        .bind(ts(item.created_at))
        .bind(&item.source)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT memory failed: {e}")))?;

        debug!(memory_id = %item.id, category = item.category.as_str(), "Stored memory");
        Ok(item)
    }

    async fn update_memory(&self, owner_id: &str, item: &MemoryItem) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE memories SET category = ?1, content = ?2, importance = ?3
            WHERE id = ?4 AND owner_id = ?5
            "#,
        )
        .bind(item.category.as_str())
        .bind(&item.content)
        .bind(item.importance as i64)
        .bind(&item.id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE memory failed: {e}")))?;
        Ok(done.rows_affected() > 0)
    }

    async fn list_memories(&self, owner_id: &str) -> Result<Vec<MemoryItem>, StoreError> {
        let rows = sqlx::query("SELECT * FROM memories WHERE owner_id = ?1 ORDER BY seq")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("list memories"))?;
        rows.iter().map(Self::row_to_memory).collect()
    }

    async fn list_by_category(
        &self,
        owner_id: &str,
        category: MemoryCategory,
        limit: usize,
    ) -> Result<Vec<MemoryItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM memories
            WHERE owner_id = ?1 AND category = ?2
            ORDER BY importance DESC, created_at DESC, seq DESC
            LIMIT ?3
            "#,
        )
        .bind(owner_id)
        .bind(category.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("list by category"))?;
        rows.iter().map(Self::row_to_memory).collect()
    }

    async fn touch_memory(&self, owner_id: &str, memory_id: &str) -> Result<bool, StoreError> {
        let done =
            sqlx::query("UPDATE memories SET last_referenced_at = ?1 WHERE id = ?2 AND owner_id = ?3")
                .bind(ts(Utc::now()))
                .bind(memory_id)
                .bind(owner_id)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Storage(format!("touch memory failed: {e}")))?;
        Ok(done.rows_affected() > 0)
    }

    async fn delete_memory(&self, owner_id: &str, memory_id: &str) -> Result<bool, StoreError> {
        let done = sqlx::query("DELETE FROM memories WHERE id = ?1 AND owner_id = ?2")
            .bind(memory_id)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE memory failed: {e}")))?;
        Ok(done.rows_affected() > 0)
    }
}
