use crate::conversations;
use crate::db::{now_ms, placeholders, uuid_col};
use anyhow::Result;
use platform_api::{ChatMessage, PlatformError};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use uuid::Uuid;

pub const MAX_MESSAGE_LEN: usize = 4000;

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, read, created_at";

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: uuid_col(row, 0)?,
        conversation_id: uuid_col(row, 1)?,
        sender_id: uuid_col(row, 2)?,
        content: row.get(3)?,
        read: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

/// Create a new message. The sender must participate in the conversation.
pub fn create_message(
    conn: &Connection,
    conversation_id: &Uuid,
    sender_id: &Uuid,
    content: &str,
) -> Result<ChatMessage> {
    let content = content.trim();
    if content.is_empty() {
        return Err(PlatformError::Invalid("empty_message".into()).into());
    }
    if content.chars().count() > MAX_MESSAGE_LEN {
        return Err(PlatformError::Invalid("message_too_long".into()).into());
    }
    if !conversations::is_participant(conn, conversation_id, sender_id)? {
        return Err(PlatformError::Unauthorized.into());
    }
    let msg = ChatMessage {
        id: Uuid::new_v4(),
        conversation_id: *conversation_id,
        sender_id: *sender_id,
        content: content.to_string(),
        read: false,
        created_at: now_ms(),
    };
    conn.execute(
        &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, 0, ?5)"),
        params![
            msg.id.to_string(),
            msg.conversation_id.to_string(),
            msg.sender_id.to_string(),
            msg.content,
            msg.created_at
        ],
    )?;
    Ok(msg)
}

/// All messages of a conversation, oldest first.
pub fn list_messages(conn: &Connection, conversation_id: &Uuid) -> Result<Vec<ChatMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC"
    ))?;
    let msgs = stmt
        .query_map([conversation_id.to_string()], row_to_msg)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(msgs)
}

/// Most recent message of a conversation.
pub fn last_message(conn: &Connection, conversation_id: &Uuid) -> Result<Option<ChatMessage>> {
    let msg = conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"
            ),
            [conversation_id.to_string()],
            row_to_msg,
        )
        .optional()?;
    Ok(msg)
}

/// Messages in a conversation the viewer did not send and has not read.
pub fn unread_count(conn: &Connection, conversation_id: &Uuid, viewer: &Uuid) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND read = 0 AND sender_id <> ?2",
        params![conversation_id.to_string(), viewer.to_string()],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Flip unread messages not sent by `viewer` to read. Already read messages
/// and the viewer's own messages are left alone, so re-running is a no-op.
/// Returns the messages that changed.
pub fn mark_read(conn: &mut Connection, ids: &[Uuid], viewer: &Uuid) -> Result<Vec<ChatMessage>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let tx = conn.transaction()?;
    let mut bound = vec![viewer.to_string()];
    bound.extend(ids.iter().map(|id| id.to_string()));
    let filter = format!(
        "read = 0 AND sender_id <> ?1 AND id IN ({}) AND conversation_id IN \
         (SELECT conversation_id FROM conversation_participants WHERE user_id = ?1)",
        placeholders(2, ids.len())
    );
    let changed = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {filter} ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(bound.iter()), row_to_msg)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    tx.execute(
        &format!("UPDATE messages SET read = 1 WHERE {filter}"),
        params_from_iter(bound.iter()),
    )?;
    tx.commit()?;
    Ok(changed
        .into_iter()
        .map(|mut m| {
            m.read = true;
            m
        })
        .collect())
}
