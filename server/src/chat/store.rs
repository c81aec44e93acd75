//! Append-only chat transcripts keyed by (order, thread).
//!
//! Calls are synchronous; async callers go through `spawn_blocking`.

use chrono::Utc;
use khanasathi_proto::{ChatMessage, ChatThread, Role};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use uuid::Uuid;

use crate::db::{parse_column, DbPool};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("attachment encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("transcript store lock poisoned")]
    LockPoisoned,
}

/// A message about to be persisted; id and timestamp are assigned on append.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub order_id: String,
    pub thread: ChatThread,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: Role,
    pub content: String,
    pub attachments: Vec<String>,
}

/// One conversation summary for the chat inbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveChat {
    pub order_id: String,
    pub thread: ChatThread,
    pub last_message: ChatMessage,
    pub unread_count: u64,
}

pub trait TranscriptStore: Send + Sync {
    /// Persist a message and return it with its server-assigned id and timestamp.
    fn append(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError>;

    /// Messages of an order in insertion order, optionally limited to one thread.
    fn transcript(
        &self,
        order_id: &str,
        thread: Option<ChatThread>,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Conversations the user is a member of, most recent activity first.
    fn list_active(&self, user_id: &str) -> Result<Vec<ActiveChat>, StoreError>;

    /// Mark a thread read for `reader_id`. Messages the reader authored are
    /// never touched. Returns how many messages flipped.
    fn mark_read(
        &self,
        order_id: &str,
        thread: ChatThread,
        reader_id: &str,
    ) -> Result<usize, StoreError>;
}

pub struct SqliteTranscriptStore {
    db: DbPool,
}

impl SqliteTranscriptStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }
}

const MESSAGE_COLUMNS: &str = "m.id, m.order_id, m.thread, m.sender_id, m.sender_name,
     m.sender_role, m.content, m.attachments, m.created_at, m.read, m.read_at";

/// Maps the MESSAGE_COLUMNS prefix of a row.
fn map_message(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    let attachments_json: String = row.get(7)?;
    let attachments: Vec<String> = serde_json::from_str(&attachments_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ChatMessage {
        id: row.get(0)?,
        order_id: row.get(1)?,
        thread: parse_column(row, 2)?,
        sender_id: row.get(3)?,
        sender_name: row.get(4)?,
        sender_role: parse_column(row, 5)?,
        content: row.get(6)?,
        attachments,
        created_at: row.get(8)?,
        read: row.get(9)?,
        read_at: row.get(10)?,
    })
}

impl TranscriptStore for SqliteTranscriptStore {
    fn append(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError> {
        let attachments_json = serde_json::to_string(&message.attachments)?;
        self.with_conn(|conn| {
            let id = Uuid::now_v7().to_string();
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO chat_messages (id, order_id, thread, sender_id, sender_name,
                                            sender_role, content, attachments, created_at, read)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
                params![
                    id,
                    message.order_id,
                    message.thread.as_str(),
                    message.sender_id,
                    message.sender_name,
                    message.sender_role.as_str(),
                    message.content,
                    attachments_json,
                    created_at,
                ],
            )?;

            Ok(ChatMessage {
                id,
                order_id: message.order_id,
                thread: message.thread,
                sender_id: message.sender_id,
                sender_name: message.sender_name,
                sender_role: message.sender_role,
                content: message.content,
                attachments: message.attachments,
                created_at,
                read: false,
                read_at: None,
            })
        })
    }

    fn transcript(
        &self,
        order_id: &str,
        thread: Option<ChatThread>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages m
                 WHERE m.order_id = ?1 AND (?2 IS NULL OR m.thread = ?2)
                 ORDER BY m.seq ASC"
            ))?;
            let rows = stmt.query_map(
                params![order_id, thread.map(|t| t.as_str())],
                map_message,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn list_active(&self, user_id: &str) -> Result<Vec<ActiveChat>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "WITH latest AS (
                     SELECT order_id, thread, MAX(seq) AS last_seq
                     FROM chat_messages
                     GROUP BY order_id, thread
                 )
                 SELECT {MESSAGE_COLUMNS}, m.seq,
                        (SELECT COUNT(*) FROM chat_messages u
                         WHERE u.order_id = m.order_id AND u.thread = m.thread
                           AND u.read = 0 AND u.sender_id != ?1) AS unread,
                        o.customer_id, o.restaurant_id, o.delivery_staff_id
                 FROM latest l
                 JOIN chat_messages m ON m.seq = l.last_seq
                 JOIN orders o ON o.id = m.order_id
                 WHERE o.customer_id = ?1 OR o.restaurant_id = ?1 OR o.delivery_staff_id = ?1"
            ))?;

            let rows = stmt.query_map(params![user_id], |row| {
                let message = map_message(row)?;
                let seq: i64 = row.get(11)?;
                let unread: i64 = row.get(12)?;
                let participants = Participants {
                    customer_id: row.get(13)?,
                    restaurant_id: row.get(14)?,
                    delivery_staff_id: row.get(15)?,
                };
                Ok((message, seq, unread, participants))
            })?;

            let mut summaries: Vec<(ActiveChat, i64)> = Vec::new();
            for row in rows {
                let (message, seq, unread, participants) = row?;
                if !participants.is_thread_member(user_id, message.thread) {
                    continue;
                }
                summaries.push((
                    ActiveChat {
                        order_id: message.order_id.clone(),
                        thread: message.thread,
                        unread_count: unread.max(0) as u64,
                        last_message: message,
                    },
                    seq,
                ));
            }

            sort_by_recent_activity(&mut summaries);
            Ok(summaries.into_iter().map(|(chat, _)| chat).collect())
        })
    }

    fn mark_read(
        &self,
        order_id: &str,
        thread: ChatThread,
        reader_id: &str,
    ) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE chat_messages SET read = 1, read_at = ?4
                 WHERE order_id = ?1 AND thread = ?2 AND sender_id != ?3 AND read = 0",
                params![order_id, thread.as_str(), reader_id, Utc::now()],
            )?;
            Ok(changed)
        })
    }
}

/// Order participants as joined into the inbox query.
struct Participants {
    customer_id: String,
    restaurant_id: String,
    delivery_staff_id: Option<String>,
}

impl Participants {
    fn is_thread_member(&self, user_id: &str, thread: ChatThread) -> bool {
        thread.member_roles().into_iter().any(|role| {
            let member = match role {
                Role::Customer => Some(self.customer_id.as_str()),
                Role::Restaurant => Some(self.restaurant_id.as_str()),
                Role::DeliveryStaff => self.delivery_staff_id.as_deref(),
                Role::Admin => None,
            };
            member == Some(user_id)
        })
    }
}

/// Latest message timestamp descending; equal timestamps keep insertion
/// order of their latest message (earlier first).
fn sort_by_recent_activity(summaries: &mut [(ActiveChat, i64)]) {
    summaries.sort_by(|(a, a_seq), (b, b_seq)| {
        b.last_message
            .created_at
            .cmp(&a.last_message.created_at)
            .then(a_seq.cmp(b_seq))
    });
}
