use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use remote_swe_common::{
    ChatMessage, ChatRole, ContentBlock, Error, MessageRecord, MessageType, Result,
};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::content_codec::ContentCodec;

/// Width of a sequence key. Millisecond timestamps fit with room to spare.
const SEQUENCE_KEY_WIDTH: usize = 15;

const DEFAULT_PAGE_SIZE: usize = 100;

/// Durable, append-only log of conversation messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append one record and return it with its allocated sequence key.
    async fn append(
        &self,
        conversation_id: &str,
        message: &ChatMessage,
        token_count: i64,
        message_type: MessageType,
        author_user_id: Option<&str>,
    ) -> Result<MessageRecord>;

    /// Atomically append a tool-use record followed by its tool-result record.
    async fn append_pair(
        &self,
        conversation_id: &str,
        tool_use: &ChatMessage,
        tool_result: &ChatMessage,
        output_token_count: i64,
    ) -> Result<[MessageRecord; 2]>;

    async fn update_token_count(
        &self,
        conversation_id: &str,
        sequence_key: &str,
        token_count: i64,
    ) -> Result<()>;

    /// Full history in sequence-key order.
    async fn get_history(&self, conversation_id: &str) -> Result<Vec<MessageRecord>>;
}

/// [`MessageStore`] backed by SQLite.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
    codec: Arc<ContentCodec>,
    page_size: usize,
}

impl SqliteMessageStore {
    pub fn open(db_path: &Path, codec: Arc<ContentCodec>) -> Result<Self> {
        info!("opening message store at {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::from_connection(conn, codec)
    }

    pub fn in_memory(codec: Arc<ContentCodec>) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::from_connection(conn, codec)
    }

    fn from_connection(conn: Connection, codec: Arc<ContentCodec>) -> Result<Self> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            codec,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn codec(&self) -> &Arc<ContentCodec> {
        &self.codec
    }

    async fn prepare_content(
        &self,
        conversation_id: &str,
        content: &[ContentBlock],
    ) -> Result<String> {
        let content = self
            .codec
            .offload(conversation_id, content.to_vec())
            .await?;
        encode_content(&content)
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            conversation_id TEXT NOT NULL,
            sequence_key TEXT NOT NULL,
            role TEXT NOT NULL,
            message_type TEXT NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            author_user_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (conversation_id, sequence_key)
        );",
    )
    .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
    Ok(())
}

/// Serialize content for storage. Cache markers are dropped; inline bytes are refused.
fn encode_content(content: &[ContentBlock]) -> Result<String> {
    if content.iter().any(ContentBlock::has_inline_bytes) {
        return Err(Error::Database(
            "refusing to persist inline image bytes".into(),
        ));
    }
    let persisted: Vec<&ContentBlock> = content.iter().filter(|b| !b.is_cache_point()).collect();
    Ok(serde_json::to_string(&persisted)?)
}

fn decode_content(sequence_key: &str, raw: &str) -> Result<Vec<ContentBlock>> {
    serde_json::from_str(raw).map_err(|e| {
        Error::Database(format!(
            "record {sequence_key} has unparseable content: {e}"
        ))
    })
}

pub fn format_sequence_key(value: u64) -> String {
    format!("{value:0width$}", width = SEQUENCE_KEY_WIDTH)
}

/// Next key for a conversation: the current wall clock, bumped past the last
/// allocated key if the clock has not moved on.
fn allocate_sequence_key(tx: &Transaction<'_>, conversation_id: &str) -> Result<u64> {
    let last: Option<String> = tx
        .query_row(
            "SELECT MAX(sequence_key) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to read last sequence key: {e}")))?
        .flatten();

    let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
    match last {
        Some(key) => {
            let last = key.parse::<u64>().map_err(|e| {
                Error::Database(format!("corrupt sequence key '{key}': {e}"))
            })?;
            Ok(now.max(last + 1))
        }
        None => Ok(now),
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_record(
    tx: &Transaction<'_>,
    conversation_id: &str,
    sequence_key: &str,
    role: ChatRole,
    message_type: MessageType,
    content: &str,
    token_count: i64,
    author_user_id: Option<&str>,
) -> Result<()> {
    tx.execute(
        "INSERT INTO messages
            (conversation_id, sequence_key, role, message_type, content, token_count, author_user_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            conversation_id,
            sequence_key,
            role.as_str(),
            message_type.as_str(),
            content,
            token_count,
            author_user_id,
        ],
    )
    .map_err(|e| Error::Database(format!("failed to insert message: {e}")))?;
    Ok(())
}

fn record_from_parts(
    conversation_id: &str,
    sequence_key: String,
    message: &ChatMessage,
    message_type: MessageType,
    token_count: i64,
    author_user_id: Option<&str>,
    stored_json: &str,
) -> Result<MessageRecord> {
    Ok(MessageRecord {
        conversation_id: conversation_id.to_string(),
        content: decode_content(&sequence_key, stored_json)?,
        sequence_key,
        role: message.role,
        message_type,
        token_count,
        author_user_id: author_user_id.map(str::to_string),
    })
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(
        &self,
        conversation_id: &str,
        message: &ChatMessage,
        token_count: i64,
        message_type: MessageType,
        author_user_id: Option<&str>,
    ) -> Result<MessageRecord> {
        let content = self.prepare_content(conversation_id, &message.content).await?;

        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
        let key = format_sequence_key(allocate_sequence_key(&tx, conversation_id)?);
        insert_record(
            &tx,
            conversation_id,
            &key,
            message.role,
            message_type,
            &content,
            token_count,
            author_user_id,
        )?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit message: {e}")))?;
        drop(conn);

        debug!("appended {message_type} {key} to {conversation_id}");
        record_from_parts(
            conversation_id,
            key,
            message,
            message_type,
            token_count,
            author_user_id,
            &content,
        )
    }

    async fn append_pair(
        &self,
        conversation_id: &str,
        tool_use: &ChatMessage,
        tool_result: &ChatMessage,
        output_token_count: i64,
    ) -> Result<[MessageRecord; 2]> {
        let use_content = self.prepare_content(conversation_id, &tool_use.content).await?;
        let result_content = self
            .prepare_content(conversation_id, &tool_result.content)
            .await?;

        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
        let first = allocate_sequence_key(&tx, conversation_id)?;
        let use_key = format_sequence_key(first);
        let result_key = format_sequence_key(first + 1);
        insert_record(
            &tx,
            conversation_id,
            &use_key,
            tool_use.role,
            MessageType::ToolUse,
            &use_content,
            output_token_count,
            None,
        )?;
        insert_record(
            &tx,
            conversation_id,
            &result_key,
            tool_result.role,
            MessageType::ToolResult,
            &result_content,
            0,
            None,
        )?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit message pair: {e}")))?;
        drop(conn);

        debug!("appended tool pair {use_key}/{result_key} to {conversation_id}");
        Ok([
            record_from_parts(
                conversation_id,
                use_key,
                tool_use,
                MessageType::ToolUse,
                output_token_count,
                None,
                &use_content,
            )?,
            record_from_parts(
                conversation_id,
                result_key,
                tool_result,
                MessageType::ToolResult,
                0,
                None,
                &result_content,
            )?,
        ])
    }

    async fn update_token_count(
        &self,
        conversation_id: &str,
        sequence_key: &str,
        token_count: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE messages SET token_count = ?3
                 WHERE conversation_id = ?1 AND sequence_key = ?2",
                params![conversation_id, sequence_key, token_count],
            )
            .map_err(|e| Error::Database(format!("failed to update token count: {e}")))?;
        if updated == 0 {
            return Err(Error::Database(format!(
                "no message {sequence_key} in conversation {conversation_id}"
            )));
        }
        Ok(())
    }

    async fn get_history(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        let mut records = Vec::new();
        let mut cursor = String::new();
        loop {
            // Lock per page so long scans do not stall writers.
            let page = {
                let conn = self.conn.lock().await;
                read_page(&conn, conversation_id, &cursor, self.page_size)?
            };
            let fetched = page.len();
            if let Some(last) = page.last() {
                cursor = last.sequence_key.clone();
            }
            records.extend(page);
            if fetched < self.page_size {
                break;
            }
        }
        Ok(records)
    }
}

/// One page of records with keys after `cursor`.
fn read_page(
    conn: &Connection,
    conversation_id: &str,
    cursor: &str,
    page_size: usize,
) -> Result<Vec<MessageRecord>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT sequence_key, role, message_type, content, token_count, author_user_id
             FROM messages
             WHERE conversation_id = ?1 AND sequence_key > ?2
             ORDER BY sequence_key ASC
             LIMIT ?3",
        )
        .map_err(|e| Error::Database(format!("failed to prepare history query: {e}")))?;

    let limit = i64::try_from(page_size).unwrap_or(i64::MAX);
    let rows = stmt
        .query_map(params![conversation_id, cursor, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })
        .map_err(|e| Error::Database(format!("failed to query history: {e}")))?;

    let mut records = Vec::with_capacity(page_size.min(1024));
    for row in rows {
        let (sequence_key, role, message_type, content, token_count, author) =
            row.map_err(|e| Error::Database(format!("failed to read row: {e}")))?;
        records.push(MessageRecord {
            conversation_id: conversation_id.to_string(),
            content: decode_content(&sequence_key, &content)?,
            role: role.parse()?,
            message_type: message_type.parse()?,
            token_count,
            author_user_id: author,
            sequence_key,
        });
    }
    Ok(records)
}
