use crate::db::{now_ms, uuid_col};
use crate::messages;
use anyhow::Result;
use platform_api::{Conversation, ConversationRow, PlatformError};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

/// Deterministic UUID for the one-to-one conversation between two users.
pub fn direct_conversation_id(a: &Uuid, b: &Uuid) -> Uuid {
    let (min, max) = if a < b { (a, b) } else { (b, a) };
    let name = format!("direct:{}:{}", min, max);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Result of [`open_direct`]. `participants` holds the participant rows
/// created, empty when the conversation already existed.
pub struct OpenedConversation {
    pub row: ConversationRow,
    pub created: bool,
    pub participants: Vec<(Uuid, Uuid)>,
}

/// Fetch or create the conversation between `a` and `b`. Creation writes one
/// conversation row and exactly two participant rows.
pub fn open_direct(conn: &mut Connection, a: &Uuid, b: &Uuid) -> Result<OpenedConversation> {
    if a == b {
        return Err(PlatformError::Invalid("self_conversation".into()).into());
    }
    let id = direct_conversation_id(a, b);
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if let Some(row) = get_row(&tx, &id)? {
        tx.commit()?;
        return Ok(OpenedConversation {
            row,
            created: false,
            participants: Vec::new(),
        });
    }
    for user in [a, b] {
        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM profiles WHERE id = ?1", [user.to_string()], |r| {
                r.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(PlatformError::NotFound("profile".into()).into());
        }
    }
    let now = now_ms();
    tx.execute(
        "INSERT INTO conversations (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
        params![id.to_string(), now],
    )?;
    let mut participants = Vec::with_capacity(2);
    for user in [a, b] {
        let pid = Uuid::new_v4();
        tx.execute(
            "INSERT INTO conversation_participants (id, conversation_id, user_id) VALUES (?1, ?2, ?3)",
            params![pid.to_string(), id.to_string(), user.to_string()],
        )?;
        participants.push((pid, *user));
    }
    tx.commit()?;
    Ok(OpenedConversation {
        row: ConversationRow {
            id,
            created_at: now,
            updated_at: now,
        },
        created: true,
        participants,
    })
}

pub fn get_row(conn: &Connection, id: &Uuid) -> Result<Option<ConversationRow>> {
    let row = conn
        .query_row(
            "SELECT id, created_at, updated_at FROM conversations WHERE id = ?1",
            [id.to_string()],
            |row| {
                Ok(ConversationRow {
                    id: uuid_col(row, 0)?,
                    created_at: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Bump `updated_at` to now, never moving it backwards.
pub fn touch(conn: &Connection, id: &Uuid) -> Result<ConversationRow> {
    let changed = conn.execute(
        "UPDATE conversations SET updated_at = MAX(updated_at, ?2) WHERE id = ?1",
        params![id.to_string(), now_ms()],
    )?;
    if changed == 0 {
        return Err(PlatformError::NotFound("conversation".into()).into());
    }
    get_row(conn, id)?.ok_or_else(|| PlatformError::NotFound("conversation".into()).into())
}

pub fn is_participant(conn: &Connection, id: &Uuid, user: &Uuid) -> Result<bool> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
            params![id.to_string(), user.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(exists.is_some())
}

/// Fail with `NotFound` for an unknown conversation and `Unauthorized` when
/// `user` is not part of it.
pub fn require_participant(conn: &Connection, id: &Uuid, user: &Uuid) -> Result<()> {
    if get_row(conn, id)?.is_none() {
        return Err(PlatformError::NotFound("conversation".into()).into());
    }
    if !is_participant(conn, id, user)? {
        return Err(PlatformError::Unauthorized.into());
    }
    Ok(())
}

/// Participant ids of a conversation.
pub fn participant_ids(conn: &Connection, id: &Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY rowid",
    )?;
    let ids = stmt
        .query_map([id.to_string()], |row| uuid_col(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Project a conversation for `viewer`: the other participants, the latest
/// message and the viewer's unread count.
pub fn summary(conn: &Connection, id: &Uuid, viewer: &Uuid) -> Result<Conversation> {
    require_participant(conn, id, viewer)?;
    let row = get_row(conn, id)?.ok_or_else(|| PlatformError::NotFound("conversation".into()))?;
    let mut stmt = conn.prepare(
        "SELECT p.id, p.username FROM conversation_participants cp JOIN profiles p ON p.id = cp.user_id \
         WHERE cp.conversation_id = ?1 AND cp.user_id <> ?2 ORDER BY cp.rowid",
    )?;
    let others = stmt
        .query_map(params![id.to_string(), viewer.to_string()], |row| {
            Ok((uuid_col(row, 0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let (participant_ids, participant_usernames) = others.into_iter().unzip();
    Ok(Conversation {
        id: row.id,
        participant_ids,
        participant_usernames,
        last_message: messages::last_message(conn, id)?,
        unread_count: messages::unread_count(conn, id, viewer)?,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

/// Conversations the viewer takes part in, most recently active first.
pub fn list_for_user(conn: &Connection, viewer: &Uuid) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT c.id FROM conversations c JOIN conversation_participants cp ON cp.conversation_id = c.id \
         WHERE cp.user_id = ?1 ORDER BY c.updated_at DESC, c.id",
    )?;
    let ids = stmt
        .query_map([viewer.to_string()], |row| uuid_col(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    ids.iter().map(|id| summary(conn, id, viewer)).collect()
}
