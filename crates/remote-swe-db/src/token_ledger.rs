use std::path::Path;

use remote_swe_common::{Error, Result, TokenUsage};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tracing::info;

/// Cumulative usage for one conversation on one model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenLedgerEntry {
    pub conversation_id: String,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

/// Per-(conversation, model) usage counters. Counters only ever grow.
pub struct TokenLedger {
    conn: Mutex<Connection>,
}

impl TokenLedger {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening token ledger at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS token_usage (
                conversation_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens INTEGER NOT NULL DEFAULT 0,
                cache_write_tokens INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (conversation_id, model_id)
            );",
        )
        .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Add one call's usage to the running totals.
    pub async fn record(
        &self,
        conversation_id: &str,
        model_id: &str,
        usage: &TokenUsage,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO token_usage
                (conversation_id, model_id, input_tokens, output_tokens, cache_read_tokens, cache_write_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(conversation_id, model_id) DO UPDATE SET
               input_tokens = input_tokens + excluded.input_tokens,
               output_tokens = output_tokens + excluded.output_tokens,
               cache_read_tokens = cache_read_tokens + excluded.cache_read_tokens,
               cache_write_tokens = cache_write_tokens + excluded.cache_write_tokens,
               updated_at = datetime('now')",
            params![
                conversation_id,
                model_id,
                to_sql_count(usage.input_tokens)?,
                to_sql_count(usage.output_tokens)?,
                to_sql_count(usage.cache_read_tokens)?,
                to_sql_count(usage.cache_write_tokens)?,
            ],
        )
        .map_err(|e| Error::Database(format!("failed to record token usage: {e}")))?;
        Ok(())
    }

    pub async fn entry(&self, conversation_id: &str, model_id: &str) -> Result<Option<TokenLedgerEntry>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT conversation_id, model_id, input_tokens, output_tokens, cache_read_tokens, cache_write_tokens
             FROM token_usage WHERE conversation_id = ?1 AND model_id = ?2",
            params![conversation_id, model_id],
            row_to_entry,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to read token usage: {e}")))
    }

    /// All models used by a conversation, ordered by model id.
    pub async fn entries(&self, conversation_id: &str) -> Result<Vec<TokenLedgerEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, model_id, input_tokens, output_tokens, cache_read_tokens, cache_write_tokens
                 FROM token_usage WHERE conversation_id = ?1 ORDER BY model_id",
            )
            .map_err(|e| Error::Database(format!("failed to prepare usage query: {e}")))?;
        let rows = stmt
            .query_map(params![conversation_id], row_to_entry)
            .map_err(|e| Error::Database(format!("failed to query token usage: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read token usage: {e}")))
    }
}

fn to_sql_count(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::Database(format!("token count {value} overflows")))
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenLedgerEntry> {
    let count = |idx: usize| -> rusqlite::Result<u64> {
        Ok(u64::try_from(row.get::<_, i64>(idx)?).unwrap_or(0))
    };
    Ok(TokenLedgerEntry {
        conversation_id: row.get(0)?,
        model_id: row.get(1)?,
        input_tokens: count(2)?,
        output_tokens: count(3)?,
        cache_read_tokens: count(4)?,
        cache_write_tokens: count(5)?,
    })
}
