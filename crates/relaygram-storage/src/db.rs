use rusqlite::OptionalExtension;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use relaygram_core::error::RelayError;
use relaygram_core::token::{mask_token, random_token};

pub const DB_FILE_NAME: &str = "tokens.db";

const SCHEMA_VERSION_CURRENT: i64 = 2;
const TOKEN_ISSUE_ATTEMPTS: usize = 16;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_TOKENS_TABLE: &str = "CREATE TABLE IF NOT EXISTS tokens (
        token TEXT PRIMARY KEY,
        chat_id INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        deleted_at TEXT
    );
    CREATE UNIQUE INDEX IF NOT EXISTS ux_tokens_active_chat
        ON tokens(chat_id) WHERE deleted_at IS NULL;
    CREATE INDEX IF NOT EXISTS idx_tokens_chat_id ON tokens(chat_id);
    CREATE INDEX IF NOT EXISTS idx_tokens_created_at ON tokens(created_at);";

pub struct Database {
    conn: Mutex<Connection>,
}

pub async fn call_blocking<T, F>(db: std::sync::Arc<Database>, f: F) -> Result<T, RelayError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, RelayError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| RelayError::Task(format!("DB task join error: {e}")))?
}

/// One issued token. Rows are never removed; revocation only stamps
/// `deleted_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub token: String,
    pub chat_id: i64,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

impl TokenRecord {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Lookup key: the same table is addressed either by token value or by the
/// owning chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKey {
    Token(String),
    Chat(i64),
}

impl From<&str> for TokenKey {
    fn from(token: &str) -> Self {
        TokenKey::Token(token.to_string())
    }
}

impl From<i64> for TokenKey {
    fn from(chat_id: i64) -> Self {
        TokenKey::Chat(chat_id)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TokenRecord> {
    Ok(TokenRecord {
        token: row.get(0)?,
        chat_id: row.get(1)?,
        created_at: row.get(2)?,
        deleted_at: row.get(3)?,
    })
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, RelayError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn get_schema_version(conn: &Connection) -> Result<i64, RelayError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM db_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<(), RelayError> {
    conn.execute(
        "INSERT INTO db_meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )?;
    Ok(())
}

/// Version 1 is the unversioned layout: `chat_id UNIQUE` and unix-second
/// timestamps, which made a chat's revoked row block any new token. Rebuild
/// it so revoked rows become tombstones beside the active one.
fn migrate_to_tombstones(conn: &Connection) -> Result<(), RelayError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE TABLE tokens_v2 (
            token TEXT PRIMARY KEY,
            chat_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            deleted_at TEXT
        );
        INSERT INTO tokens_v2(token, chat_id, created_at, deleted_at)
            SELECT token,
                   chat_id,
                   CASE WHEN typeof(created_at) = 'integer'
                        THEN strftime('%Y-%m-%dT%H:%M:%S+00:00', created_at, 'unixepoch')
                        ELSE created_at END,
                   CASE WHEN typeof(deleted_at) = 'integer'
                        THEN strftime('%Y-%m-%dT%H:%M:%S+00:00', deleted_at, 'unixepoch')
                        ELSE deleted_at END
            FROM tokens;
        DROP TABLE tokens;
        ALTER TABLE tokens_v2 RENAME TO tokens;",
    )?;
    tx.execute_batch(CREATE_TOKENS_TABLE)?;
    tx.commit()?;
    Ok(())
}

fn apply_schema_migrations(conn: &Connection) -> Result<(), RelayError> {
    let mut version = get_schema_version(conn)?;
    if version < 1 {
        if !table_exists(conn, "tokens")? {
            conn.execute_batch(CREATE_TOKENS_TABLE)?;
            set_schema_version(conn, SCHEMA_VERSION_CURRENT)?;
            return Ok(());
        }
        set_schema_version(conn, 1)?;
        version = 1;
    }
    if version < 2 {
        info!("Migrating token table to tombstone layout");
        migrate_to_tombstones(conn)?;
        set_schema_version(conn, 2)?;
        version = 2;
    }
    if version != SCHEMA_VERSION_CURRENT {
        set_schema_version(conn, SCHEMA_VERSION_CURRENT)?;
    }
    Ok(())
}

impl Database {
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Opens `tokens.db` inside `storage_dir`. The directory has to exist
    /// already; a missing mount is a deployment mistake, not something to
    /// paper over by creating an ephemeral directory.
    pub fn new(storage_dir: &str) -> Result<Self, RelayError> {
        let dir = Path::new(storage_dir);
        if !dir.is_dir() {
            return Err(RelayError::Config(format!(
                "Storage directory '{storage_dir}' does not exist"
            )));
        }

        let conn = Connection::open(dir.join(DB_FILE_NAME))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        apply_schema_migrations(&conn)?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// Returns the chat's active token, creating one if there is none.
    ///
    /// The insert relies on the table's constraints rather than a prior
    /// read: the primary key rejects a colliding token value and the partial
    /// unique index rejects a second active row for the chat. A rejected
    /// insert is then resolved by reading back the winner, or by retrying
    /// with a fresh candidate if the rejection was a token collision.
    pub fn issue_token(&self, chat_id: i64) -> Result<TokenRecord, RelayError> {
        self.issue_token_with(chat_id, random_token)
    }

    /// [`Database::issue_token`] drawing candidates from `next_candidate`.
    pub fn issue_token_with<F>(
        &self,
        chat_id: i64,
        mut next_candidate: F,
    ) -> Result<TokenRecord, RelayError>
    where
        F: FnMut() -> String,
    {
        let conn = self.lock_conn();
        for attempt in 1..=TOKEN_ISSUE_ATTEMPTS {
            let candidate = next_candidate();
            let now = chrono::Utc::now().to_rfc3339();
            let inserted = conn.execute(
                "INSERT INTO tokens(token, chat_id, created_at, deleted_at)
                 VALUES(?1, ?2, ?3, NULL)
                 ON CONFLICT DO NOTHING",
                params![candidate, chat_id, now],
            )?;
            if inserted == 1 {
                info!(chat_id, token = %mask_token(&candidate), "Issued new token");
                return Ok(TokenRecord {
                    token: candidate,
                    chat_id,
                    created_at: now,
                    deleted_at: None,
                });
            }
            if let Some(existing) = Self::active_for_chat(&conn, chat_id)? {
                debug!(chat_id, "Chat already holds an active token");
                return Ok(existing);
            }
            debug!(chat_id, attempt, "Token candidate collided, retrying");
        }
        Err(RelayError::TokenSpaceExhausted(TOKEN_ISSUE_ATTEMPTS))
    }

    fn active_for_chat(conn: &Connection, chat_id: i64) -> Result<Option<TokenRecord>, RelayError> {
        let record = conn
            .query_row(
                "SELECT token, chat_id, created_at, deleted_at
                 FROM tokens
                 WHERE chat_id = ?1 AND deleted_at IS NULL",
                params![chat_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn lookup(&self, key: &TokenKey) -> Result<Option<TokenRecord>, RelayError> {
        match key {
            TokenKey::Token(token) => self.by_token(token),
            TokenKey::Chat(chat_id) => self.by_chat(*chat_id),
        }
    }

    pub fn by_token(&self, token: &str) -> Result<Option<TokenRecord>, RelayError> {
        let conn = self.lock_conn();
        let record = conn
            .query_row(
                "SELECT token, chat_id, created_at, deleted_at
                 FROM tokens
                 WHERE token = ?1",
                params![token],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// The chat's active record if it has one, otherwise its most recently
    /// issued (revoked) record.
    pub fn by_chat(&self, chat_id: i64) -> Result<Option<TokenRecord>, RelayError> {
        let conn = self.lock_conn();
        let record = conn
            .query_row(
                "SELECT token, chat_id, created_at, deleted_at
                 FROM tokens
                 WHERE chat_id = ?1
                 ORDER BY (deleted_at IS NULL) DESC, created_at DESC, rowid DESC
                 LIMIT 1",
                params![chat_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Soft-deletes an active token. Unknown or already revoked tokens are
    /// left alone and reported as `false`.
    pub fn revoke(&self, token: &str) -> Result<bool, RelayError> {
        let conn = self.lock_conn();
        let now = chrono::Utc::now().to_rfc3339();
        let rows = conn.execute(
            "UPDATE tokens
             SET deleted_at = ?2
             WHERE token = ?1 AND deleted_at IS NULL",
            params![token, now],
        )?;
        if rows > 0 {
            info!(token = %mask_token(token), "Revoked token");
        }
        Ok(rows > 0)
    }

    pub fn count_active(&self) -> Result<i64, RelayError> {
        let conn = self.lock_conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM tokens WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
