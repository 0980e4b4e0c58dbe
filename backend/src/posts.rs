use crate::db::{now_ms, placeholders, uuid_col};
use anyhow::Result;
use platform_api::{
    LikeState, NewPost, PlatformError, PollOption, Post, PostBody, PostKind, PostOrder,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use uuid::Uuid;

pub const MIN_POLL_OPTIONS: usize = 2;
pub const MAX_POLL_OPTIONS: usize = 5;

const POST_COLUMNS: &str =
    "id, title, content, type, media_url, media_type, likes_count, comments_count, created_at";

fn row_to_post(row: &rusqlite::Row<'_>) -> rusqlite::Result<Post> {
    let kind: String = row.get(3)?;
    let kind = PostKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown post type {kind}").into(),
        )
    })?;
    Ok(Post {
        id: uuid_col(row, 0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        kind,
        media_url: row.get(4)?,
        media_type: row.get(5)?,
        likes_count: row.get(6)?,
        comments_count: row.get(7)?,
        created_at: row.get(8)?,
        has_liked: false,
    })
}

fn row_to_option(row: &rusqlite::Row<'_>) -> rusqlite::Result<PollOption> {
    Ok(PollOption {
        id: uuid_col(row, 0)?,
        post_id: uuid_col(row, 1)?,
        option_text: row.get(2)?,
        votes_count: row.get(3)?,
        has_voted: false,
    })
}

/// Create a post, and its options when it is a poll, in one transaction.
pub fn create_post(conn: &mut Connection, new: &NewPost) -> Result<(Post, Vec<PollOption>)> {
    let content = new.content.trim();
    // media posts may go without a caption
    if content.is_empty() && !matches!(new.body, PostBody::Media { .. }) {
        return Err(PlatformError::Invalid("empty_content".into()).into());
    }
    let title = new
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let (media_url, media_type) = match &new.body {
        PostBody::Media {
            media_url,
            media_type,
        } => {
            if media_url.trim().is_empty()
                || !(media_type.starts_with("image/") || media_type.starts_with("video/"))
            {
                return Err(PlatformError::Invalid("invalid_media".into()).into());
            }
            (Some(media_url.clone()), Some(media_type.clone()))
        }
        _ => (None, None),
    };
    let options: Vec<String> = match &new.body {
        PostBody::Poll { options } => {
            let valid: Vec<String> = options
                .iter()
                .map(|o| o.trim())
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
            if !(MIN_POLL_OPTIONS..=MAX_POLL_OPTIONS).contains(&valid.len()) {
                return Err(PlatformError::Invalid("poll_option_count".into()).into());
            }
            valid
        }
        _ => Vec::new(),
    };

    let post = Post {
        id: Uuid::new_v4(),
        title,
        content: content.to_string(),
        kind: new.body.kind(),
        media_url,
        media_type,
        likes_count: 0,
        comments_count: 0,
        created_at: now_ms(),
        has_liked: false,
    };
    let tx = conn.transaction()?;
    tx.execute(
        &format!("INSERT INTO posts ({POST_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7)"),
        params![
            post.id.to_string(),
            post.title,
            post.content,
            post.kind.as_str(),
            post.media_url,
            post.media_type,
            post.created_at
        ],
    )?;
    let mut created = Vec::with_capacity(options.len());
    for (position, text) in options.into_iter().enumerate() {
        let option = PollOption {
            id: Uuid::new_v4(),
            post_id: post.id,
            option_text: text,
            votes_count: 0,
            has_voted: false,
        };
        tx.execute(
            "INSERT INTO poll_options (id, post_id, option_text, votes_count, position) VALUES (?1, ?2, ?3, 0, ?4)",
            params![
                option.id.to_string(),
                post.id.to_string(),
                option.option_text,
                position as i64
            ],
        )?;
        created.push(option);
    }
    tx.commit()?;
    Ok((post, created))
}

pub fn get_post(conn: &Connection, id: &Uuid) -> Result<Post> {
    let post = conn
        .query_row(
            &format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1"),
            [id.to_string()],
            row_to_post,
        )
        .optional()?;
    post.ok_or_else(|| PlatformError::NotFound("post".into()).into())
}

pub fn list_posts(conn: &Connection, order: PostOrder) -> Result<Vec<Post>> {
    let order_by = match order {
        PostOrder::Latest => "created_at DESC, rowid DESC",
        PostOrder::Popular => "likes_count DESC, created_at DESC, rowid DESC",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {POST_COLUMNS} FROM posts ORDER BY {order_by} LIMIT 200"
    ))?;
    let posts = stmt
        .query_map([], row_to_post)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(posts)
}

/// Poll options for the given posts, in creation order.
pub fn poll_options(conn: &Connection, post_ids: &[Uuid]) -> Result<Vec<PollOption>> {
    if post_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT id, post_id, option_text, votes_count FROM poll_options WHERE post_id IN ({}) ORDER BY post_id, position",
        placeholders(1, post_ids.len())
    ))?;
    let options = stmt
        .query_map(
            params_from_iter(post_ids.iter().map(|id| id.to_string())),
            row_to_option,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(options)
}

pub fn get_option(conn: &Connection, id: &Uuid) -> Result<PollOption> {
    let option = conn
        .query_row(
            "SELECT id, post_id, option_text, votes_count FROM poll_options WHERE id = ?1",
            [id.to_string()],
            row_to_option,
        )
        .optional()?;
    option.ok_or_else(|| PlatformError::NotFound("poll_option".into()).into())
}

fn ids_in(conn: &Connection, sql: &str, user: &Uuid, ids: &[Uuid]) -> Result<Vec<Uuid>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = sql.replace("{ids}", &placeholders(2, ids.len()));
    let mut stmt = conn.prepare(&sql)?;
    let mut bound = vec![user.to_string()];
    bound.extend(ids.iter().map(|id| id.to_string()));
    let found = stmt
        .query_map(params_from_iter(bound), |row| uuid_col(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(found)
}

/// Subset of `post_ids` the user has liked.
pub fn liked_post_ids(conn: &Connection, user: &Uuid, post_ids: &[Uuid]) -> Result<Vec<Uuid>> {
    ids_in(
        conn,
        "SELECT post_id FROM post_likes WHERE user_id = ?1 AND post_id IN ({ids})",
        user,
        post_ids,
    )
}

/// Subset of `option_ids` the user has voted for.
pub fn voted_option_ids(conn: &Connection, user: &Uuid, option_ids: &[Uuid]) -> Result<Vec<Uuid>> {
    ids_in(
        conn,
        "SELECT poll_option_id FROM poll_votes WHERE user_id = ?1 AND poll_option_id IN ({ids})",
        user,
        option_ids,
    )
}

/// Outcome of [`set_like`]: the new state and the like row id if one was
/// inserted or deleted.
pub struct LikeChange {
    pub state: LikeState,
    pub changed: Option<Uuid>,
}

/// Bring the like row for (post, user) to `liked`, keeping `likes_count` in
/// step. Resubmitting the same desired state is a no-op.
pub fn set_like(conn: &mut Connection, post_id: &Uuid, user: &Uuid, liked: bool) -> Result<LikeChange> {
    let tx = conn.transaction()?;
    get_post(&tx, post_id)?;
    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM post_likes WHERE post_id = ?1 AND user_id = ?2",
            params![post_id.to_string(), user.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let changed = match (existing, liked) {
        (None, true) => {
            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO post_likes (id, post_id, user_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), post_id.to_string(), user.to_string(), now_ms()],
            )?;
            tx.execute(
                "UPDATE posts SET likes_count = likes_count + 1 WHERE id = ?1",
                [post_id.to_string()],
            )?;
            Some(id)
        }
        (Some(id), false) => {
            tx.execute("DELETE FROM post_likes WHERE id = ?1", [&id])?;
            tx.execute(
                "UPDATE posts SET likes_count = MAX(likes_count - 1, 0) WHERE id = ?1",
                [post_id.to_string()],
            )?;
            Some(Uuid::parse_str(&id)?)
        }
        _ => None,
    };
    let likes_count: i64 = tx.query_row(
        "SELECT likes_count FROM posts WHERE id = ?1",
        [post_id.to_string()],
        |row| row.get(0),
    )?;
    tx.commit()?;
    Ok(LikeChange {
        state: LikeState {
            post_id: *post_id,
            liked,
            likes_count,
        },
        changed,
    })
}

/// Record a vote for an option. A user votes at most once per poll and the
/// first vote is final. Returns the updated option and the vote row id.
pub fn cast_vote(conn: &mut Connection, option_id: &Uuid, user: &Uuid) -> Result<(PollOption, Uuid)> {
    let tx = conn.transaction()?;
    let option = get_option(&tx, option_id)?;
    let already: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM poll_votes WHERE post_id = ?1 AND user_id = ?2",
            params![option.post_id.to_string(), user.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if already.is_some() {
        return Err(PlatformError::AlreadyVoted.into());
    }
    let vote_id = Uuid::new_v4();
    tx.execute(
        "INSERT INTO poll_votes (id, poll_option_id, post_id, user_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            vote_id.to_string(),
            option_id.to_string(),
            option.post_id.to_string(),
            user.to_string(),
            now_ms()
        ],
    )?;
    tx.execute(
        "UPDATE poll_options SET votes_count = votes_count + 1 WHERE id = ?1",
        [option_id.to_string()],
    )?;
    let mut updated = get_option(&tx, option_id)?;
    tx.commit()?;
    updated.has_voted = true;
    Ok((updated, vote_id))
}

/// Recompute denormalized counters from the join tables. Returns how many
/// rows had drifted.
pub fn recompute_counters(conn: &mut Connection) -> Result<usize> {
    let tx = conn.transaction()?;
    let likes = tx.execute(
        "UPDATE posts SET likes_count = (SELECT COUNT(*) FROM post_likes l WHERE l.post_id = posts.id) \
         WHERE likes_count <> (SELECT COUNT(*) FROM post_likes l WHERE l.post_id = posts.id)",
        [],
    )?;
    let votes = tx.execute(
        "UPDATE poll_options SET votes_count = (SELECT COUNT(*) FROM poll_votes v WHERE v.poll_option_id = poll_options.id) \
         WHERE votes_count <> (SELECT COUNT(*) FROM poll_votes v WHERE v.poll_option_id = poll_options.id)",
        [],
    )?;
    tx.commit()?;
    Ok(likes + votes)
}
