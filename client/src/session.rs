use crate::error::{ClientError, ClientResult};
use crate::notify::Notifier;
use platform_api::{AuthChange, Platform, PlatformResult, Session, User, AVATAR_BUCKET};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

pub const MIN_USERNAME_LEN: usize = 3;

/// Who is signed in. `loading` stays set until the first session read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub loading: bool,
    pub session: Option<Session>,
    pub user: Option<User>,
}

impl SessionState {
    pub fn user_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.user_id)
    }
}

/// New profile picture for [`SessionStore::update_profile`].
#[derive(Debug, Clone)]
pub struct Avatar {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Observable identity for the views. Follows the platform's auth changes
/// until dropped.
pub struct SessionStore {
    platform: Arc<dyn Platform>,
    notifier: Notifier,
    state: Arc<watch::Sender<SessionState>>,
    follower: JoinHandle<()>,
}

async fn resolve(platform: &dyn Platform, session: Option<Session>) -> PlatformResult<SessionState> {
    let Some(session) = session else {
        return Ok(SessionState::default());
    };
    let user = platform.profile(session.user_id).await?;
    Ok(SessionState {
        loading: false,
        session: Some(session),
        user: Some(user),
    })
}

async fn follow(
    platform: Arc<dyn Platform>,
    state: Arc<watch::Sender<SessionState>>,
    mut changes: broadcast::Receiver<AuthChange>,
    notifier: Notifier,
) {
    loop {
        let session = match changes.recv().await {
            Ok(AuthChange::SignedIn(session)) => Some(session),
            Ok(AuthChange::SignedOut) => None,
            Err(RecvError::Lagged(_)) => match platform.session().await {
                Ok(session) => session,
                Err(e) => {
                    notifier.failure("Session refresh failed", &e.into());
                    continue;
                }
            },
            Err(RecvError::Closed) => break,
        };
        debug!(signed_in = session.is_some(), "auth change");
        match resolve(&*platform, session.clone()).await {
            Ok(next) => {
                state.send_replace(next);
            }
            Err(e) => {
                notifier.failure("Could not load profile", &e.into());
                state.send_replace(SessionState {
                    loading: false,
                    session,
                    user: None,
                });
            }
        }
    }
}

impl SessionStore {
    /// Read the current session once, then keep following auth changes.
    pub async fn start(platform: Arc<dyn Platform>, notifier: Notifier) -> Self {
        let (tx, _rx) = watch::channel(SessionState {
            loading: true,
            ..Default::default()
        });
        let state = Arc::new(tx);
        // listen first so a change during the initial read is not missed
        let changes = platform.auth_changes();
        let initial = match platform.session().await {
            Ok(session) => resolve(&*platform, session).await,
            Err(e) => Err(e),
        };
        match initial {
            Ok(s) => {
                state.send_replace(s);
            }
            Err(e) => {
                notifier.failure("Could not restore session", &e.into());
                state.send_replace(SessionState::default());
            }
        }
        let follower = tokio::spawn(follow(
            platform.clone(),
            state.clone(),
            changes,
            notifier.clone(),
        ));
        Self {
            platform,
            notifier,
            state,
            follower,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver to inject into views and reconcilers.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn viewer(&self) -> Option<Uuid> {
        self.state.borrow().user_id()
    }

    async fn adopt(&self, session: Session) -> ClientResult<User> {
        let next = resolve(&*self.platform, Some(session)).await?;
        let user = next.user.clone().ok_or(ClientError::NotSignedIn)?;
        self.state.send_replace(next);
        Ok(user)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> ClientResult<User> {
        let res = self.try_sign_in(email, password).await;
        let user = self.notifier.report("Sign in failed", res)?;
        info!(user = %user.id, "signed in");
        Ok(user)
    }

    async fn try_sign_in(&self, email: &str, password: &str) -> ClientResult<User> {
        let session = self.platform.sign_in(email, password).await?;
        self.adopt(session).await
    }

    pub async fn sign_up(&self, email: &str, password: &str, username: &str) -> ClientResult<User> {
        let res = self.try_sign_up(email, password, username).await;
        let user = self.notifier.report("Sign up failed", res)?;
        self.notifier
            .success("Welcome", format!("Signed up as {}", user.username));
        Ok(user)
    }

    async fn try_sign_up(&self, email: &str, password: &str, username: &str) -> ClientResult<User> {
        let username = checked_username(username)?;
        let session = self.platform.sign_up(email, password, username).await?;
        self.adopt(session).await
    }

    pub async fn sign_out(&self) -> ClientResult<()> {
        let res = self.platform.sign_out().await.map_err(ClientError::from);
        self.notifier.report("Sign out failed", res)?;
        self.state.send_replace(SessionState::default());
        Ok(())
    }

    /// Rename the viewer and optionally replace their avatar. The picture is
    /// stored under the viewer's own prefix in the avatar bucket.
    pub async fn update_profile(&self, username: &str, avatar: Option<Avatar>) -> ClientResult<User> {
        let res = self.try_update_profile(username, avatar).await;
        let user = self.notifier.report("Profile update failed", res)?;
        self.notifier.success("Profile updated", "");
        Ok(user)
    }

    async fn try_update_profile(&self, username: &str, avatar: Option<Avatar>) -> ClientResult<User> {
        let viewer = self.viewer().ok_or(ClientError::NotSignedIn)?;
        let username = checked_username(username)?;
        let avatar_url = match avatar {
            Some(avatar) => {
                let path = avatar_path(&viewer, &avatar.file_name);
                let obj = self.platform.upload(AVATAR_BUCKET, &path, avatar.data).await?;
                Some(obj.public_url)
            }
            None => None,
        };
        let user = self
            .platform
            .update_profile(viewer, username, avatar_url.as_deref())
            .await?;
        self.state.send_modify(|s| s.user = Some(user.clone()));
        Ok(user)
    }
}

fn checked_username(username: &str) -> ClientResult<&str> {
    let username = username.trim();
    if username.chars().count() < MIN_USERNAME_LEN {
        return Err(ClientError::UsernameTooShort(MIN_USERNAME_LEN));
    }
    Ok(username)
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

/// `<user>/<random>.<ext>`, keeping the upload's extension.
pub fn avatar_path(user: &Uuid, file_name: &str) -> String {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "png".into());
    format!("{}/{}.{}", user, Uuid::new_v4(), ext)
}
