use crate::error::{ClientError, ClientResult};
use crate::notify::Notifier;
use crate::session::SessionState;
use platform_api::{
    NewPost, Platform, PlatformError, PollOption, Post, PostBody, PostKind, PostOrder,
    MEDIA_BUCKET,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// Flip the local like state, keeping the counter in step. A no-op when the
/// post is already in the desired state.
pub fn apply_like(post: &mut Post, liked: bool) {
    if post.has_liked == liked {
        return;
    }
    post.has_liked = liked;
    post.likes_count = if liked {
        post.likes_count + 1
    } else {
        (post.likes_count - 1).max(0)
    };
}

/// Whether the viewer already voted on any option of a poll.
pub fn has_voted_in(options: &[PollOption]) -> bool {
    options.iter().any(|o| o.has_voted)
}

/// Group options by post id, keeping their order.
pub fn group_options(options: Vec<PollOption>) -> HashMap<Uuid, Vec<PollOption>> {
    let mut grouped: HashMap<Uuid, Vec<PollOption>> = HashMap::new();
    for option in options {
        grouped.entry(option.post_id).or_default().push(option);
    }
    grouped
}

/// Posts with their poll options, projected for the signed-in viewer.
pub struct Feed {
    platform: Arc<dyn Platform>,
    session: watch::Receiver<SessionState>,
    notifier: Notifier,
    order: PostOrder,
    posts: Vec<Post>,
    options: HashMap<Uuid, Vec<PollOption>>,
}

impl Feed {
    pub fn new(
        platform: Arc<dyn Platform>,
        session: watch::Receiver<SessionState>,
        notifier: Notifier,
    ) -> Self {
        Self {
            platform,
            session,
            notifier,
            order: PostOrder::default(),
            posts: Vec::new(),
            options: HashMap::new(),
        }
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn post(&self, id: &Uuid) -> Option<&Post> {
        self.posts.iter().find(|p| p.id == *id)
    }

    pub fn options(&self, post_id: &Uuid) -> &[PollOption] {
        self.options.get(post_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn order(&self) -> PostOrder {
        self.order
    }

    fn viewer(&self) -> Option<Uuid> {
        self.session.borrow().user_id()
    }

    fn post_mut(&mut self, id: &Uuid) -> Option<&mut Post> {
        self.posts.iter_mut().find(|p| p.id == *id)
    }

    pub async fn load(&mut self, order: PostOrder) -> ClientResult<()> {
        let res = self.try_load(order).await;
        self.notifier.report("Could not load posts", res)
    }

    async fn try_load(&mut self, order: PostOrder) -> ClientResult<()> {
        let mut posts = self.platform.list_posts(order).await?;
        let poll_ids: Vec<Uuid> = posts
            .iter()
            .filter(|p| p.kind == PostKind::Poll)
            .map(|p| p.id)
            .collect();
        let mut options = if poll_ids.is_empty() {
            Vec::new()
        } else {
            self.platform.poll_options(&poll_ids).await?
        };
        if let Some(viewer) = self.viewer() {
            let post_ids: Vec<Uuid> = posts.iter().map(|p| p.id).collect();
            let liked: HashSet<Uuid> = self
                .platform
                .liked_post_ids(viewer, &post_ids)
                .await?
                .into_iter()
                .collect();
            for post in &mut posts {
                post.has_liked = liked.contains(&post.id);
            }
            if !options.is_empty() {
                let option_ids: Vec<Uuid> = options.iter().map(|o| o.id).collect();
                let voted: HashSet<Uuid> = self
                    .platform
                    .voted_option_ids(viewer, &option_ids)
                    .await?
                    .into_iter()
                    .collect();
                for option in &mut options {
                    option.has_voted = voted.contains(&option.id);
                }
            }
        }
        debug!(posts = posts.len(), ?order, "feed loaded");
        self.order = order;
        self.posts = posts;
        self.options = group_options(options);
        Ok(())
    }

    /// Like or unlike a post. The change shows immediately and is replaced by
    /// the platform's count, or rolled back if the platform refuses.
    pub async fn toggle_like(&mut self, post_id: Uuid) -> ClientResult<()> {
        let res = self.try_toggle_like(post_id).await;
        self.notifier.report("Could not update like", res)
    }

    async fn try_toggle_like(&mut self, post_id: Uuid) -> ClientResult<()> {
        let viewer = self.viewer().ok_or(ClientError::NotSignedIn)?;
        let post = self.post_mut(&post_id).ok_or(ClientError::NotLoaded("post"))?;
        let before = (post.has_liked, post.likes_count);
        let desired = !post.has_liked;
        apply_like(post, desired);
        match self.platform.set_like(post_id, viewer, desired).await {
            Ok(state) => {
                if let Some(post) = self.post_mut(&post_id) {
                    post.has_liked = state.liked;
                    post.likes_count = state.likes_count;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(post) = self.post_mut(&post_id) {
                    (post.has_liked, post.likes_count) = before;
                }
                Err(e.into())
            }
        }
    }

    /// Vote for an option. Only the first vote in a poll counts.
    pub async fn vote(&mut self, post_id: Uuid, option_id: Uuid) -> ClientResult<()> {
        let res = self.try_vote(post_id, option_id).await;
        self.notifier.report("Could not vote", res)
    }

    async fn try_vote(&mut self, post_id: Uuid, option_id: Uuid) -> ClientResult<()> {
        let viewer = self.viewer().ok_or(ClientError::NotSignedIn)?;
        let options = self
            .options
            .get_mut(&post_id)
            .ok_or(ClientError::NotLoaded("poll"))?;
        if has_voted_in(options) {
            return Err(ClientError::AlreadyVoted);
        }
        let option = options
            .iter_mut()
            .find(|o| o.id == option_id)
            .ok_or(ClientError::NotLoaded("poll option"))?;
        option.votes_count += 1;
        option.has_voted = true;
        match self.platform.cast_vote(option_id, viewer).await {
            Ok(confirmed) => {
                if let Some(option) = self.option_mut(&post_id, &option_id) {
                    option.votes_count = confirmed.votes_count;
                    option.has_voted = true;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(option) = self.option_mut(&post_id, &option_id) {
                    option.votes_count = (option.votes_count - 1).max(0);
                    option.has_voted = false;
                }
                if e == PlatformError::AlreadyVoted {
                    // voted elsewhere; pick up which option it was
                    self.refresh_poll(post_id, viewer).await?;
                    return Err(ClientError::AlreadyVoted);
                }
                Err(e.into())
            }
        }
    }

    fn option_mut(&mut self, post_id: &Uuid, option_id: &Uuid) -> Option<&mut PollOption> {
        self.options
            .get_mut(post_id)?
            .iter_mut()
            .find(|o| o.id == *option_id)
    }

    async fn refresh_poll(&mut self, post_id: Uuid, viewer: Uuid) -> ClientResult<()> {
        let mut options = self.platform.poll_options(&[post_id]).await?;
        let ids: Vec<Uuid> = options.iter().map(|o| o.id).collect();
        let voted: HashSet<Uuid> = self
            .platform
            .voted_option_ids(viewer, &ids)
            .await?
            .into_iter()
            .collect();
        for option in &mut options {
            option.has_voted = voted.contains(&option.id);
        }
        self.options.insert(post_id, options);
        Ok(())
    }

    /// Publish a post and show it at the top of the feed.
    pub async fn create_post(&mut self, draft: NewPost) -> ClientResult<Post> {
        let res = self.try_create_post(draft).await;
        let post = self.notifier.report("Could not publish", res)?;
        self.notifier.success("Posted", "Your post is live");
        Ok(post)
    }

    async fn try_create_post(&mut self, draft: NewPost) -> ClientResult<Post> {
        self.viewer().ok_or(ClientError::NotSignedIn)?;
        let (post, options) = self.platform.create_post(draft).await?;
        if !options.is_empty() {
            self.options.insert(post.id, options);
        }
        self.posts.retain(|p| p.id != post.id);
        self.posts.insert(0, post.clone());
        Ok(post)
    }

    /// Upload an image or video to the media bucket, then post it.
    pub async fn publish_media(
        &mut self,
        title: Option<String>,
        caption: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> ClientResult<Post> {
        let res = self.try_publish_media(title, caption, file_name, data).await;
        let post = self.notifier.report("Could not publish", res)?;
        self.notifier.success("Posted", "Your media is live");
        Ok(post)
    }

    async fn try_publish_media(
        &mut self,
        title: Option<String>,
        caption: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> ClientResult<Post> {
        let viewer = self.viewer().ok_or(ClientError::NotSignedIn)?;
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| "bin".into());
        let path = format!("{}/{}.{}", viewer, Uuid::new_v4(), ext);
        let obj = self.platform.upload(MEDIA_BUCKET, &path, data).await?;
        self.try_create_post(NewPost {
            title,
            content: caption.to_string(),
            body: PostBody::Media {
                media_url: obj.public_url,
                media_type: obj.content_type,
            },
        })
        .await
    }
}
