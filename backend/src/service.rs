use crate::auth::{self, Claims, LoginRateLimiter};
use crate::db::{to_platform, Database};
use crate::realtime::Hub;
use crate::storage::ObjectStore;
use crate::{conversations, messages, posts, profiles};
use anyhow::Result;
use bytes::Bytes;
use platform_api::{
    ChangeEvent, ChangeKind, ChannelScope, ChatMessage, Conversation, LikeState, NewPost,
    PlatformError, PlatformResult, PollOption, Post, PostOrder, PublicProfile, Session,
    StoredObject, Subscription, Table, User, AVATAR_BUCKET,
};
use rusqlite::Connection;
use serde_json::json;
use std::time::Duration as StdDuration;
use time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// The platform proper: storage, auth, realtime and objects behind one
/// handle. Every write publishes the rows it changed on the hub.
#[derive(Clone)]
pub struct Service {
    db: Database,
    hub: Hub,
    store: ObjectStore,
    secret: Vec<u8>,
    session_ttl: Duration,
    limiter: LoginRateLimiter,
}

impl Service {
    pub fn new(db: Database, store: ObjectStore) -> Result<Self> {
        let secret = auth::signing_secret(&*db.conn()?)?;
        Ok(Self {
            db,
            hub: Hub::default(),
            store,
            secret,
            session_ttl: Duration::hours(24),
            limiter: LoginRateLimiter::new(5, StdDuration::from_secs(60)),
        })
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> PlatformResult<T> {
        let mut conn = self.db.conn().map_err(to_platform)?;
        f(&mut *conn).map_err(to_platform)
    }

    // -- Auth --

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> PlatformResult<(User, Session)> {
        let db = self.db.clone();
        let (email, password, username) =
            (email.to_string(), password.to_string(), username.to_string());
        // argon2 is deliberately slow; keep it off the async workers
        let user = tokio::task::spawn_blocking(move || -> Result<User> {
            let mut conn = db.conn()?;
            auth::create_account(&mut conn, &email, &password, &username)
        })
        .await
        .map_err(|e| PlatformError::Backend(e.to_string()))?
        .map_err(to_platform)?;
        info!(user = %user.id, "account created");
        self.hub
            .emit(Table::Profiles, ChangeKind::Insert, &PublicProfile::from(user.clone()));
        let session = self.issue(&user)?;
        Ok((user, session))
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> PlatformResult<(User, Session)> {
        if !self.limiter.check(email).await {
            warn!(email, "sign-in rate limited");
            return Err(PlatformError::RateLimited);
        }
        let db = self.db.clone();
        let (email, password) = (email.to_string(), password.to_string());
        let user = tokio::task::spawn_blocking(move || -> Result<User> {
            let conn = db.conn()?;
            auth::authenticate(&conn, &email, &password)
        })
        .await
        .map_err(|e| PlatformError::Backend(e.to_string()))?
        .map_err(to_platform)?;
        let session = self.issue(&user)?;
        Ok((user, session))
    }

    fn issue(&self, user: &User) -> PlatformResult<Session> {
        auth::issue_session(&self.secret, user, self.session_ttl).map_err(to_platform)
    }

    /// Validate a bearer token.
    pub fn verify(&self, token: &str) -> PlatformResult<Claims> {
        auth::verify_token(&self.secret, token).map_err(|_| PlatformError::Unauthorized)
    }

    // -- Profiles --

    pub fn profile(&self, id: &Uuid) -> PlatformResult<User> {
        self.with_conn(|conn| profiles::get_profile(conn, id))
    }

    pub fn search_profiles(
        &self,
        fragment: &str,
        exclude: Option<&Uuid>,
        limit: usize,
    ) -> PlatformResult<Vec<PublicProfile>> {
        self.with_conn(|conn| profiles::search_profiles(conn, fragment, exclude, limit))
    }

    pub fn update_profile(
        &self,
        id: &Uuid,
        username: &str,
        avatar_url: Option<&str>,
    ) -> PlatformResult<User> {
        let user = self.with_conn(|conn| profiles::update_profile(conn, id, username, avatar_url))?;
        self.hub
            .emit(Table::Profiles, ChangeKind::Update, &PublicProfile::from(user.clone()));
        Ok(user)
    }

    // -- Posts --

    pub fn list_posts(&self, order: PostOrder) -> PlatformResult<Vec<Post>> {
        self.with_conn(|conn| posts::list_posts(conn, order))
    }

    pub fn create_post(&self, new: &NewPost) -> PlatformResult<(Post, Vec<PollOption>)> {
        let (post, options) = self.with_conn(|conn| posts::create_post(conn, new))?;
        self.hub.emit(Table::Posts, ChangeKind::Insert, &post);
        for option in &options {
            self.hub.emit(Table::PollOptions, ChangeKind::Insert, option);
        }
        Ok((post, options))
    }

    pub fn poll_options(&self, post_ids: &[Uuid]) -> PlatformResult<Vec<PollOption>> {
        self.with_conn(|conn| posts::poll_options(conn, post_ids))
    }

    pub fn liked_post_ids(&self, user: &Uuid, post_ids: &[Uuid]) -> PlatformResult<Vec<Uuid>> {
        self.with_conn(|conn| posts::liked_post_ids(conn, user, post_ids))
    }

    pub fn voted_option_ids(&self, user: &Uuid, option_ids: &[Uuid]) -> PlatformResult<Vec<Uuid>> {
        self.with_conn(|conn| posts::voted_option_ids(conn, user, option_ids))
    }

    pub fn set_like(&self, post_id: &Uuid, user: &Uuid, liked: bool) -> PlatformResult<LikeState> {
        let (change, post) = self.with_conn(|conn| {
            let change = posts::set_like(conn, post_id, user, liked)?;
            let post = posts::get_post(conn, post_id)?;
            Ok((change, post))
        })?;
        if let Some(like_id) = change.changed {
            let kind = if liked {
                ChangeKind::Insert
            } else {
                ChangeKind::Delete
            };
            self.hub.emit(
                Table::PostLikes,
                kind,
                &json!({"id": like_id, "post_id": post_id, "user_id": user}),
            );
            self.hub.emit(Table::Posts, ChangeKind::Update, &post);
        }
        Ok(change.state)
    }

    pub fn cast_vote(&self, option_id: &Uuid, user: &Uuid) -> PlatformResult<PollOption> {
        let (option, vote_id) = self.with_conn(|conn| posts::cast_vote(conn, option_id, user))?;
        self.hub.emit(
            Table::PollVotes,
            ChangeKind::Insert,
            &json!({"id": vote_id, "poll_option_id": option_id, "post_id": option.post_id, "user_id": user}),
        );
        let mut public = option.clone();
        public.has_voted = false;
        self.hub.emit(Table::PollOptions, ChangeKind::Update, &public);
        Ok(option)
    }

    /// Recompute like and vote counters from their join tables.
    pub fn recompute_counters(&self) -> PlatformResult<usize> {
        self.with_conn(posts::recompute_counters)
    }

    // -- Conversations --

    pub fn conversations(&self, viewer: &Uuid) -> PlatformResult<Vec<Conversation>> {
        self.with_conn(|conn| conversations::list_for_user(conn, viewer))
    }

    pub fn conversation(&self, id: &Uuid, viewer: &Uuid) -> PlatformResult<Conversation> {
        self.with_conn(|conn| conversations::summary(conn, id, viewer))
    }

    pub fn open_direct_conversation(
        &self,
        viewer: &Uuid,
        other: &Uuid,
    ) -> PlatformResult<(Conversation, bool)> {
        let (opened, summary) = self.with_conn(|conn| {
            let opened = conversations::open_direct(conn, viewer, other)?;
            let summary = conversations::summary(conn, &opened.row.id, viewer)?;
            Ok((opened, summary))
        })?;
        if opened.created {
            info!(conversation = %opened.row.id, "conversation created");
            self.hub
                .emit(Table::Conversations, ChangeKind::Insert, &opened.row);
            for (id, user) in &opened.participants {
                self.hub.emit(
                    Table::ConversationParticipants,
                    ChangeKind::Insert,
                    &json!({"id": id, "conversation_id": opened.row.id, "user_id": user}),
                );
            }
        }
        Ok((summary, opened.created))
    }

    pub fn touch_conversation(&self, id: &Uuid, viewer: &Uuid) -> PlatformResult<()> {
        let row = self.with_conn(|conn| {
            conversations::require_participant(conn, id, viewer)?;
            conversations::touch(conn, id)
        })?;
        self.hub.emit(Table::Conversations, ChangeKind::Update, &row);
        Ok(())
    }

    // -- Messages --

    pub fn messages(&self, conversation_id: &Uuid, viewer: &Uuid) -> PlatformResult<Vec<ChatMessage>> {
        self.with_conn(|conn| {
            conversations::require_participant(conn, conversation_id, viewer)?;
            messages::list_messages(conn, conversation_id)
        })
    }

    pub fn send_message(
        &self,
        conversation_id: &Uuid,
        sender: &Uuid,
        content: &str,
    ) -> PlatformResult<ChatMessage> {
        let msg =
            self.with_conn(|conn| messages::create_message(conn, conversation_id, sender, content))?;
        self.hub.emit(Table::Messages, ChangeKind::Insert, &msg);
        Ok(msg)
    }

    pub fn mark_read(&self, ids: &[Uuid], viewer: &Uuid) -> PlatformResult<usize> {
        let changed = self.with_conn(|conn| messages::mark_read(conn, ids, viewer))?;
        for msg in &changed {
            self.hub.emit(Table::Messages, ChangeKind::Update, msg);
        }
        Ok(changed.len())
    }

    /// Whether `viewer` may see a change. Conversation rows and messages are
    /// only visible to participants, likes and votes only to the user who
    /// cast them. Everything else is public.
    pub fn visible_to(&self, viewer: Option<&Uuid>, event: &ChangeEvent) -> bool {
        let column = match event.table {
            Table::Messages | Table::ConversationParticipants => "conversation_id",
            Table::Conversations => "id",
            Table::PostLikes | Table::PollVotes => {
                return viewer.is_some() && record_id(event, "user_id").as_ref() == viewer;
            }
            _ => return true,
        };
        let (Some(viewer), Some(id)) = (viewer, record_id(event, column)) else {
            return false;
        };
        self.with_conn(|conn| conversations::is_participant(conn, &id, viewer))
            .unwrap_or(false)
    }

    /// Subscribe on behalf of `viewer`, hiding rows they may not see.
    pub fn subscribe_as(&self, viewer: Option<Uuid>, scope: ChannelScope) -> Subscription {
        let service = self.clone();
        self.hub
            .subscribe(scope)
            .with_guard(Box::new(move |event| service.visible_to(viewer.as_ref(), event)))
    }

    // -- Storage --

    /// Upload an object. Avatars must live under the uploader's own prefix.
    pub async fn upload(
        &self,
        uploader: &Uuid,
        bucket: &str,
        path: &str,
        data: Bytes,
    ) -> PlatformResult<StoredObject> {
        if bucket == AVATAR_BUCKET {
            let owner = path.split('/').next().unwrap_or_default();
            if owner != uploader.to_string() {
                return Err(PlatformError::Unauthorized);
            }
        }
        let obj = self
            .store
            .upload(bucket, path, data)
            .await
            .map_err(to_platform)?;
        info!(bucket, path, size = obj.size, "object stored");
        Ok(obj)
    }

    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        self.store.public_url(bucket, path)
    }
}

fn record_id(event: &ChangeEvent, column: &str) -> Option<Uuid> {
    event
        .record
        .get(column)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}
