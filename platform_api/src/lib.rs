//! Records, realtime events and the client-facing surface of the murmur
//! platform. Both the local backend and the client reconcilers build on this
//! crate.

pub mod error;
pub mod events;
pub mod model;

pub use error::{PlatformError, PlatformResult};
pub use events::{ChangeEvent, ChangeKind, ChannelScope, Filter, Guard, Subscription, Table};
pub use model::*;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Storage bucket for post media.
pub const MEDIA_BUCKET: &str = "media";
/// Storage bucket for profile pictures.
pub const AVATAR_BUCKET: &str = "avatars";

/// Everything the client is allowed to ask of the platform.
#[async_trait]
pub trait Platform: Send + Sync {
    // -- Auth --

    /// Current session, if signed in.
    async fn session(&self) -> PlatformResult<Option<Session>>;

    /// Stream of identity changes for this client.
    fn auth_changes(&self) -> broadcast::Receiver<AuthChange>;

    async fn sign_in(&self, email: &str, password: &str) -> PlatformResult<Session>;

    async fn sign_up(&self, email: &str, password: &str, username: &str)
        -> PlatformResult<Session>;

    async fn sign_out(&self) -> PlatformResult<()>;

    // -- Profiles --

    /// The signed-in user's own profile, email included.
    async fn profile(&self, user_id: Uuid) -> PlatformResult<User>;

    /// Case-insensitive username containment search.
    async fn search_profiles(
        &self,
        fragment: &str,
        exclude: Option<Uuid>,
        limit: usize,
    ) -> PlatformResult<Vec<PublicProfile>>;

    async fn update_profile(
        &self,
        user_id: Uuid,
        username: &str,
        avatar_url: Option<&str>,
    ) -> PlatformResult<User>;

    // -- Posts --

    async fn list_posts(&self, order: PostOrder) -> PlatformResult<Vec<Post>>;

    async fn create_post(&self, post: NewPost) -> PlatformResult<(Post, Vec<PollOption>)>;

    async fn poll_options(&self, post_ids: &[Uuid]) -> PlatformResult<Vec<PollOption>>;

    async fn liked_post_ids(&self, user_id: Uuid, post_ids: &[Uuid]) -> PlatformResult<Vec<Uuid>>;

    async fn voted_option_ids(
        &self,
        user_id: Uuid,
        option_ids: &[Uuid],
    ) -> PlatformResult<Vec<Uuid>>;

    /// Bring the like row for (post, user) to the desired state in one step.
    async fn set_like(&self, post_id: Uuid, user_id: Uuid, liked: bool)
        -> PlatformResult<LikeState>;

    /// Record a vote. Fails with `AlreadyVoted` if the user voted in this poll.
    async fn cast_vote(&self, option_id: Uuid, user_id: Uuid) -> PlatformResult<PollOption>;

    // -- Conversations --

    async fn conversations(&self, viewer: Uuid) -> PlatformResult<Vec<Conversation>>;

    async fn conversation(&self, id: Uuid, viewer: Uuid) -> PlatformResult<Conversation>;

    /// Reuse the one-to-one conversation between the two users or create it.
    async fn open_direct_conversation(
        &self,
        viewer: Uuid,
        other: Uuid,
    ) -> PlatformResult<(Conversation, bool)>;

    async fn touch_conversation(&self, id: Uuid) -> PlatformResult<()>;

    // -- Messages --

    /// Messages of a conversation in ascending chronological order.
    async fn messages(&self, conversation_id: Uuid) -> PlatformResult<Vec<ChatMessage>>;

    async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> PlatformResult<ChatMessage>;

    /// Mark messages not sent by `viewer` as read. Returns how many changed.
    async fn mark_read(&self, ids: &[Uuid], viewer: Uuid) -> PlatformResult<usize>;

    // -- Realtime --

    fn subscribe(&self, scope: ChannelScope) -> Subscription;

    // -- Storage --

    async fn upload(&self, bucket: &str, path: &str, data: Vec<u8>)
        -> PlatformResult<StoredObject>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}
