//! SQLite-backed [`Store`].
//!
//! rusqlite is synchronous, so every call takes the connection lock inside
//! `spawn_blocking` and releases it before returning to the runtime.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{StatusAdvance, StatusTarget, Store, StoreError};
use crate::db::models::{
    Conversation, ConversationSummary, Message, MessageStatus, NewMessage, PresenceRecord,
};
use crate::db::DbPool;

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, receiver_id, text, media_ref, status, created_at";

#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut conn)
        })
        .await?
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

/// Raw column values; converted outside the rusqlite row closure so that
/// parse failures surface as [`StoreError::Corrupt`].
struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    receiver_id: String,
    text: Option<String>,
    media_ref: Option<String>,
    status: String,
    created_at: String,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            receiver_id: row.get(3)?,
            text: row.get(4)?,
            media_ref: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_message(self) -> Result<Message, StoreError> {
        let status = self
            .status
            .parse::<MessageStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            text: self.text,
            media_ref: self.media_ref,
            status,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn presence_from_parts(
    user_id: String,
    is_online: bool,
    last_seen: String,
) -> Result<PresenceRecord, StoreError> {
    Ok(PresenceRecord {
        user_id,
        is_online,
        last_seen: parse_timestamp(&last_seen)?,
    })
}

/// `SELECT <message columns> FROM messages <clause>`, rows left unconverted.
fn select_messages<P: rusqlite::Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> Result<Vec<MessageRow>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM messages {}", MESSAGE_COLUMNS, clause))?;
    let rows = stmt
        .query_map(params, MessageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn participants_of(conn: &Connection, conversation_id: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants
         WHERE conversation_id = ?1 ORDER BY user_id",
    )?;
    let participants = stmt
        .query_map(params![conversation_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(participants)
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_conversations_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id FROM conversation_participants
                 WHERE user_id = ?1 ORDER BY conversation_id",
            )?;
            let ids = stmt
                .query_map(params![user_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn conversation_participants(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
                params![conversation_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound(format!(
                    "conversation {}",
                    conversation_id
                )));
            }
            participants_of(conn, &conversation_id)
        })
        .await
    }

    async fn get_or_create_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<(Conversation, bool), StoreError> {
        let user_a = user_a.to_string();
        let user_b = user_b.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;

            let existing: Option<(String, String)> = tx
                .query_row(
                    "SELECT c.id, c.created_at FROM conversations c
                     JOIN conversation_participants pa
                       ON pa.conversation_id = c.id AND pa.user_id = ?1
                     JOIN conversation_participants pb
                       ON pb.conversation_id = c.id AND pb.user_id = ?2
                     WHERE (SELECT COUNT(*) FROM conversation_participants p
                            WHERE p.conversation_id = c.id) = 2
                     LIMIT 1",
                    params![user_a, user_b],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((id, created_at)) = existing {
                let participants = participants_of(&tx, &id)?;
                tx.commit()?;
                return Ok((
                    Conversation {
                        id,
                        participants,
                        created_at: parse_timestamp(&created_at)?,
                    },
                    false,
                ));
            }

            let id = Uuid::now_v7().to_string();
            let now = Utc::now();
            let now_str = format_timestamp(&now);
            tx.execute(
                "INSERT INTO conversations (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
                params![id, now_str],
            )?;
            for user in [&user_a, &user_b] {
                tx.execute(
                    "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id)
                     VALUES (?1, ?2)",
                    params![id, user],
                )?;
            }
            let participants = participants_of(&tx, &id)?;
            tx.commit()?;

            Ok((
                Conversation {
                    id,
                    participants,
                    created_at: now,
                },
                true,
            ))
        })
        .await
    }

    async fn set_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO users (id, is_online, last_seen) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    is_online = excluded.is_online,
                    last_seen = excluded.last_seen",
                params![user_id, is_online, format_timestamp(&last_seen)],
            )?;
            Ok(())
        })
        .await
    }

    async fn touch_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO users (id, is_online, last_seen) VALUES (?1, 0, ?2)
                 ON CONFLICT(id) DO UPDATE SET last_seen = excluded.last_seen",
                params![user_id, format_timestamp(&at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>, StoreError> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            let row: Option<(String, bool, String)> = conn
                .query_row(
                    "SELECT id, is_online, last_seen FROM users WHERE id = ?1",
                    params![user_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            row.map(|(id, online, last_seen)| presence_from_parts(id, online, last_seen))
                .transpose()
        })
        .await
    }

    async fn online_presence(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, is_online, last_seen FROM users WHERE is_online = 1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(id, online, last_seen)| presence_from_parts(id, online, last_seen))
                .collect()
        })
        .await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.blocking(move |conn| {
            let stored = Message {
                id: Uuid::now_v7().to_string(),
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                receiver_id: message.receiver_id,
                text: message.text,
                media_ref: message.media_ref,
                status: MessageStatus::Pending,
                created_at: Utc::now(),
            };
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages
                    (id, conversation_id, sender_id, receiver_id, text, media_ref, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    stored.id,
                    stored.conversation_id,
                    stored.sender_id,
                    stored.receiver_id,
                    stored.text,
                    stored.media_ref,
                    stored.status.as_str(),
                    format_timestamp(&stored.created_at),
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![format_timestamp(&stored.created_at), stored.conversation_id],
            )?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let message_id = message_id.to_string();
        self.blocking(move |conn| {
            select_messages(conn, "WHERE id = ?1", params![message_id])?
                .into_iter()
                .next()
                .map(MessageRow::into_message)
                .transpose()
        })
        .await
    }

    async fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |conn| {
            select_messages(
                conn,
                "WHERE conversation_id = ?1 ORDER BY created_at, id",
                params![conversation_id],
            )?
            .into_iter()
            .map(MessageRow::into_message)
            .collect()
        })
        .await
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>, StoreError> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.updated_at FROM conversations c
                 JOIN conversation_participants p
                   ON p.conversation_id = c.id AND p.user_id = ?1
                 ORDER BY c.updated_at DESC, c.id DESC",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut summaries = Vec::with_capacity(rows.len());
            for (id, updated_at) in rows {
                let last_message = select_messages(
                    conn,
                    "WHERE conversation_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
                    params![id],
                )?
                .into_iter()
                .next()
                .map(MessageRow::into_message)
                .transpose()?;
                summaries.push(ConversationSummary {
                    participants: participants_of(conn, &id)?,
                    updated_at: parse_timestamp(&updated_at)?,
                    last_message,
                    id,
                });
            }
            Ok(summaries)
        })
        .await
    }

    async fn advance_message_status(
        &self,
        target: &StatusTarget,
        status: MessageStatus,
    ) -> Result<StatusAdvance, StoreError> {
        let target = target.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;

            let rows = match &target {
                StatusTarget::Message {
                    message_id,
                    receiver_id: Some(receiver_id),
                } => select_messages(
                    &tx,
                    "WHERE id = ?1 AND receiver_id = ?2",
                    params![message_id, receiver_id],
                )?,
                StatusTarget::Message {
                    message_id,
                    receiver_id: None,
                } => select_messages(&tx, "WHERE id = ?1", params![message_id])?,
                StatusTarget::Outgoing {
                    message_id,
                    conversation_id,
                    sender_id,
                } => select_messages(
                    &tx,
                    "WHERE id = ?1 AND conversation_id = ?2 AND sender_id = ?3",
                    params![message_id, conversation_id, sender_id],
                )?,
                StatusTarget::Conversation {
                    conversation_id,
                    receiver_id,
                } => {
                    // Bulk advances only look at messages that can still move.
                    let lower = status
                        .predecessors()
                        .iter()
                        .map(|s| format!("'{}'", s.as_str()))
                        .collect::<Vec<_>>();
                    if lower.is_empty() {
                        Vec::new()
                    } else {
                        select_messages(
                            &tx,
                            &format!(
                                "WHERE conversation_id = ?1 AND receiver_id = ?2
                                   AND status IN ({})
                                 ORDER BY created_at, id",
                                lower.join(", ")
                            ),
                            params![conversation_id, receiver_id],
                        )?
                    }
                }
            };

            let mut outcome = StatusAdvance::default();
            for row in rows {
                let mut message = row.into_message()?;
                if message.status < status {
                    tx.execute(
                        "UPDATE messages SET status = ?1 WHERE id = ?2",
                        params![status.as_str(), message.id],
                    )?;
                    message.status = status;
                    outcome.advanced.push(message);
                } else {
                    outcome.unchanged.push(message);
                }
            }

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }
}
