use crate::db::{is_constraint_violation, uuid_col};
use anyhow::Result;
use once_cell::sync::Lazy;
use platform_api::{PlatformError, PublicProfile, User};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{3,32}$").expect("username regex"));

pub fn validate_username(username: &str) -> Result<(), PlatformError> {
    if USERNAME_RE.is_match(username) {
        Ok(())
    } else {
        Err(PlatformError::Invalid("invalid_username".into()))
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_col(row, 0)?,
        email: row.get(1)?,
        username: row.get(2)?,
        avatar_url: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_public(row: &rusqlite::Row<'_>) -> rusqlite::Result<PublicProfile> {
    Ok(PublicProfile {
        id: uuid_col(row, 0)?,
        username: row.get(1)?,
        avatar_url: row.get(2)?,
        created_at: row.get(3)?,
    })
}

pub fn get_profile(conn: &Connection, id: &Uuid) -> Result<User> {
    let user = conn
        .query_row(
            "SELECT id, email, username, avatar_url, created_at FROM profiles WHERE id = ?1",
            [id.to_string()],
            row_to_user,
        )
        .optional()?;
    user.ok_or_else(|| PlatformError::NotFound("profile".into()).into())
}

/// Case-insensitive check, optionally ignoring one user (for renames).
pub fn username_taken(conn: &Connection, username: &str, except: Option<&Uuid>) -> Result<bool> {
    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM profiles WHERE lower(username) = lower(?1)",
            [username],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match (taken, except) {
        (Some(id), Some(except)) => id != except.to_string(),
        (Some(_), None) => true,
        (None, _) => false,
    })
}

fn escape_like(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Usernames containing `fragment`, case-insensitively.
pub fn search_profiles(
    conn: &Connection,
    fragment: &str,
    exclude: Option<&Uuid>,
    limit: usize,
) -> Result<Vec<PublicProfile>> {
    let pattern = format!("%{}%", escape_like(fragment.trim()));
    let exclude = exclude.map(|u| u.to_string()).unwrap_or_default();
    let mut stmt = conn.prepare(
        "SELECT id, username, avatar_url, created_at FROM profiles \
         WHERE username LIKE ?1 ESCAPE '\\' AND id <> ?2 ORDER BY lower(username) LIMIT ?3",
    )?;
    let users = stmt
        .query_map(params![pattern, exclude, limit.min(50) as i64], row_to_public)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

pub fn update_profile(
    conn: &Connection,
    id: &Uuid,
    username: &str,
    avatar_url: Option<&str>,
) -> Result<User> {
    let username = username.trim();
    validate_username(username)?;
    if username_taken(conn, username, Some(id))? {
        return Err(PlatformError::UsernameTaken.into());
    }
    let res = conn.execute(
        "UPDATE profiles SET username = ?2, avatar_url = COALESCE(?3, avatar_url) WHERE id = ?1",
        params![id.to_string(), username, avatar_url],
    );
    match res {
        Ok(0) => Err(PlatformError::NotFound("profile".into()).into()),
        Ok(_) => get_profile(conn, id),
        Err(e) if is_constraint_violation(&e) => Err(PlatformError::UsernameTaken.into()),
        Err(e) => Err(e.into()),
    }
}
