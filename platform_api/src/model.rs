use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Profile of a registered user.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub created_at: i64,
}

/// What other users may see of a profile.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PublicProfile {
    pub id: Uuid,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub created_at: i64,
}

impl From<User> for PublicProfile {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            avatar_url: user.avatar_url,
            created_at: user.created_at,
        }
    }
}

/// An authenticated session issued by the platform.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub user_id: Uuid,
    pub email: String,
    pub expires_at: i64,
}

/// Identity change pushed by the platform.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "session", rename_all = "snake_case")]
pub enum AuthChange {
    SignedIn(Session),
    SignedOut,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    Text,
    Poll,
    Media,
}

impl PostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostKind::Text => "text",
            PostKind::Poll => "poll",
            PostKind::Media => "media",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(PostKind::Text),
            "poll" => Some(PostKind::Poll),
            "media" => Some(PostKind::Media),
            _ => None,
        }
    }
}

/// A feed item. `has_liked` is projected for the viewing user and never stored.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: Uuid,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: PostKind,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    pub likes_count: i64,
    pub comments_count: i64,
    pub created_at: i64,
    #[serde(default)]
    pub has_liked: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PollOption {
    pub id: Uuid,
    pub post_id: Uuid,
    pub option_text: String,
    pub votes_count: i64,
    #[serde(default)]
    pub has_voted: bool,
}

/// Ordering of the post listing.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PostOrder {
    #[default]
    Latest,
    Popular,
}

/// Payload for creating a post.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NewPost {
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    pub body: PostBody,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PostBody {
    Text,
    Poll { options: Vec<String> },
    Media { media_url: String, media_type: String },
}

impl PostBody {
    pub fn kind(&self) -> PostKind {
        match self {
            PostBody::Text => PostKind::Text,
            PostBody::Poll { .. } => PostKind::Poll,
            PostBody::Media { .. } => PostKind::Media,
        }
    }
}

/// Authoritative like state after a like/unlike.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct LikeState {
    pub post_id: Uuid,
    pub liked: bool,
    pub likes_count: i64,
}

/// Raw conversation row.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConversationRow {
    pub id: Uuid,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Conversation projected for one viewer. Participant lists exclude the viewer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub participant_ids: Vec<Uuid>,
    pub participant_usernames: Vec<String>,
    #[serde(default)]
    pub last_message: Option<ChatMessage>,
    pub unread_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub read: bool,
    pub created_at: i64,
}

/// Metadata of an object written to storage.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub path: String,
    pub content_type: String,
    pub size: u64,
    pub etag: String,
    pub public_url: String,
}
