use crate::db::now_ms;
use crate::service::Service;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use platform_api::{
    AuthChange, ChannelScope, ChatMessage, Conversation, LikeState, NewPost, Platform,
    PlatformError, PlatformResult, PollOption, Post, PostOrder, Session, StoredObject,
    PublicProfile, Subscription, User,
};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// In-process platform handle for one client. Several handles may share a
/// [`Service`], each holding its own session the way separate devices would.
pub struct LocalPlatform {
    service: Service,
    session: Mutex<Option<Session>>,
    auth_tx: broadcast::Sender<AuthChange>,
}

impl LocalPlatform {
    pub fn new(service: Service) -> Self {
        let (auth_tx, _rx) = broadcast::channel(16);
        Self {
            service,
            session: Mutex::new(None),
            auth_tx,
        }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    fn set_session(&self, session: Option<Session>) {
        *self.session.lock() = session.clone();
        let change = match session {
            Some(s) => AuthChange::SignedIn(s),
            None => AuthChange::SignedOut,
        };
        let _ = self.auth_tx.send(change);
    }

    /// Current session, dropping it once expired.
    fn current(&self) -> Option<Session> {
        let mut guard = self.session.lock();
        let expired = guard.as_ref().map_or(false, |s| s.expires_at <= now_ms());
        if !expired {
            return guard.clone();
        }
        *guard = None;
        drop(guard);
        debug!("session expired");
        let _ = self.auth_tx.send(AuthChange::SignedOut);
        None
    }

    fn viewer(&self) -> PlatformResult<Uuid> {
        self.current()
            .map(|s| s.user_id)
            .ok_or(PlatformError::Unauthorized)
    }

    /// Only the signed-in user may act as `user`.
    fn act_as(&self, user: Uuid) -> PlatformResult<()> {
        if self.viewer()? != user {
            return Err(PlatformError::Unauthorized);
        }
        Ok(())
    }
}

#[async_trait]
impl Platform for LocalPlatform {
    async fn session(&self) -> PlatformResult<Option<Session>> {
        Ok(self.current())
    }

    fn auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.auth_tx.subscribe()
    }

    async fn sign_in(&self, email: &str, password: &str) -> PlatformResult<Session> {
        let (_, session) = self.service.sign_in(email, password).await?;
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> PlatformResult<Session> {
        let (_, session) = self.service.sign_up(email, password, username).await?;
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> PlatformResult<()> {
        self.set_session(None);
        Ok(())
    }

    async fn profile(&self, user_id: Uuid) -> PlatformResult<User> {
        self.act_as(user_id)?;
        self.service.profile(&user_id)
    }

    async fn search_profiles(
        &self,
        fragment: &str,
        exclude: Option<Uuid>,
        limit: usize,
    ) -> PlatformResult<Vec<PublicProfile>> {
        self.viewer()?;
        self.service.search_profiles(fragment, exclude.as_ref(), limit)
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        username: &str,
        avatar_url: Option<&str>,
    ) -> PlatformResult<User> {
        self.act_as(user_id)?;
        self.service.update_profile(&user_id, username, avatar_url)
    }

    async fn list_posts(&self, order: PostOrder) -> PlatformResult<Vec<Post>> {
        self.service.list_posts(order)
    }

    async fn create_post(&self, post: NewPost) -> PlatformResult<(Post, Vec<PollOption>)> {
        self.viewer()?;
        self.service.create_post(&post)
    }

    async fn poll_options(&self, post_ids: &[Uuid]) -> PlatformResult<Vec<PollOption>> {
        self.service.poll_options(post_ids)
    }

    async fn liked_post_ids(&self, user_id: Uuid, post_ids: &[Uuid]) -> PlatformResult<Vec<Uuid>> {
        self.act_as(user_id)?;
        self.service.liked_post_ids(&user_id, post_ids)
    }

    async fn voted_option_ids(
        &self,
        user_id: Uuid,
        option_ids: &[Uuid],
    ) -> PlatformResult<Vec<Uuid>> {
        self.act_as(user_id)?;
        self.service.voted_option_ids(&user_id, option_ids)
    }

    async fn set_like(
        &self,
        post_id: Uuid,
        user_id: Uuid,
        liked: bool,
    ) -> PlatformResult<LikeState> {
        self.act_as(user_id)?;
        self.service.set_like(&post_id, &user_id, liked)
    }

    async fn cast_vote(&self, option_id: Uuid, user_id: Uuid) -> PlatformResult<PollOption> {
        self.act_as(user_id)?;
        self.service.cast_vote(&option_id, &user_id)
    }

    async fn conversations(&self, viewer: Uuid) -> PlatformResult<Vec<Conversation>> {
        self.act_as(viewer)?;
        self.service.conversations(&viewer)
    }

    async fn conversation(&self, id: Uuid, viewer: Uuid) -> PlatformResult<Conversation> {
        self.act_as(viewer)?;
        self.service.conversation(&id, &viewer)
    }

    async fn open_direct_conversation(
        &self,
        viewer: Uuid,
        other: Uuid,
    ) -> PlatformResult<(Conversation, bool)> {
        self.act_as(viewer)?;
        self.service.open_direct_conversation(&viewer, &other)
    }

    async fn touch_conversation(&self, id: Uuid) -> PlatformResult<()> {
        let viewer = self.viewer()?;
        self.service.touch_conversation(&id, &viewer)
    }

    async fn messages(&self, conversation_id: Uuid) -> PlatformResult<Vec<ChatMessage>> {
        let viewer = self.viewer()?;
        self.service.messages(&conversation_id, &viewer)
    }

    async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> PlatformResult<ChatMessage> {
        self.act_as(sender_id)?;
        self.service.send_message(&conversation_id, &sender_id, content)
    }

    async fn mark_read(&self, ids: &[Uuid], viewer: Uuid) -> PlatformResult<usize> {
        self.act_as(viewer)?;
        self.service.mark_read(ids, &viewer)
    }

    fn subscribe(&self, scope: ChannelScope) -> Subscription {
        let viewer = self.current().map(|s| s.user_id);
        self.service.subscribe_as(viewer, scope)
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Vec<u8>,
    ) -> PlatformResult<StoredObject> {
        let viewer = self.viewer()?;
        self.service
            .upload(&viewer, bucket, path, Bytes::from(data))
            .await
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        self.service.public_url(bucket, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::storage::ObjectStore;

    fn platform() -> (LocalPlatform, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(tmp.path(), "http://localhost:8787").unwrap();
        let svc = Service::new(Database::in_memory().unwrap(), store).unwrap();
        (LocalPlatform::new(svc), tmp)
    }

    #[tokio::test]
    async fn auth_changes_follow_sign_in_and_out() {
        let (p, _tmp) = platform();
        let mut changes = p.auth_changes();
        assert!(p.session().await.unwrap().is_none());
        let session = p.sign_up("a@x.io", "hunter22", "alice").await.unwrap();
        assert_eq!(changes.recv().await.unwrap(), AuthChange::SignedIn(session.clone()));
        assert_eq!(p.session().await.unwrap(), Some(session));
        p.sign_out().await.unwrap();
        assert_eq!(changes.recv().await.unwrap(), AuthChange::SignedOut);
        assert!(p.session().await.unwrap().is_none());
        let err = p.sign_in("a@x.io", "wrong-pass").await.unwrap_err();
        assert_eq!(err, PlatformError::InvalidCredentials);
    }

    #[tokio::test]
    async fn cannot_act_for_someone_else() {
        let (p, _tmp) = platform();
        let session = p.sign_up("a@x.io", "hunter22", "alice").await.unwrap();
        let stranger = Uuid::new_v4();
        assert_eq!(
            p.conversations(stranger).await.unwrap_err(),
            PlatformError::Unauthorized
        );
        assert!(p.conversations(session.user_id).await.unwrap().is_empty());
        p.sign_out().await.unwrap();
        assert_eq!(
            p.conversations(session.user_id).await.unwrap_err(),
            PlatformError::Unauthorized
        );
    }

    #[tokio::test]
    async fn likes_votes_and_profiles_are_private() {
        let (p, _tmp) = platform();
        let alice = p.sign_up("a@x.io", "hunter22", "alice").await.unwrap();
        let other = LocalPlatform::new(p.service().clone());
        let bob = other.sign_up("b@x.io", "hunter22", "bob").await.unwrap();
        let post = Uuid::new_v4();
        assert_eq!(
            p.liked_post_ids(bob.user_id, &[post]).await.unwrap_err(),
            PlatformError::Unauthorized
        );
        assert_eq!(
            p.voted_option_ids(bob.user_id, &[post]).await.unwrap_err(),
            PlatformError::Unauthorized
        );
        assert_eq!(
            p.profile(bob.user_id).await.unwrap_err(),
            PlatformError::Unauthorized
        );
        assert!(p.liked_post_ids(alice.user_id, &[post]).await.unwrap().is_empty());
        assert_eq!(p.profile(alice.user_id).await.unwrap().email, "a@x.io");
        let found = p.search_profiles("bob", Some(alice.user_id), 5).await.unwrap();
        assert_eq!(found[0].id, bob.user_id);
    }

    #[tokio::test]
    async fn expired_sessions_are_dropped() {
        let (p, _tmp) = platform();
        let mut session = p.sign_up("a@x.io", "hunter22", "alice").await.unwrap();
        session.expires_at = now_ms() - 1;
        *p.session.lock() = Some(session);
        assert!(p.session().await.unwrap().is_none());
    }
}
