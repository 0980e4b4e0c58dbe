use murmur_backend::db::Database;
use murmur_backend::storage::ObjectStore;
use murmur_backend::{LocalPlatform, Service};
use murmur_client::{
    Avatar, ChatStream, ClientError, Conversations, Feed, Level, Merge, Notifier, SessionState,
    SessionStore,
};
use platform_api::{NewPost, Platform, PostBody, PostOrder};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

fn service() -> (Service, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let store = ObjectStore::new(tmp.path(), "http://localhost:8787").unwrap();
    let svc = Service::new(Database::in_memory().unwrap(), store).unwrap();
    (svc, tmp)
}

/// One signed-in client with its own session.
struct Device {
    platform: Arc<dyn Platform>,
    store: SessionStore,
    notifier: Notifier,
}

impl Device {
    async fn new(service: &Service) -> Self {
        let platform: Arc<dyn Platform> = Arc::new(LocalPlatform::new(service.clone()));
        let notifier = Notifier::new();
        let store = SessionStore::start(platform.clone(), notifier.clone()).await;
        Self {
            platform,
            store,
            notifier,
        }
    }

    async fn signed_up(service: &Service, name: &str) -> Self {
        let device = Self::new(service).await;
        device
            .store
            .sign_up(&format!("{name}@example.com"), "hunter22", name)
            .await
            .unwrap();
        device
    }

    fn id(&self) -> Uuid {
        self.store.viewer().unwrap()
    }

    fn session(&self) -> watch::Receiver<SessionState> {
        self.store.subscribe()
    }

    fn feed(&self) -> Feed {
        Feed::new(self.platform.clone(), self.session(), self.notifier.clone())
    }

    fn inbox(&self) -> Conversations {
        Conversations::new(self.platform.clone(), self.session(), self.notifier.clone())
    }

    async fn chat(&self, conversation: Uuid) -> ChatStream {
        ChatStream::open(
            self.platform.clone(),
            &self.session(),
            self.notifier.clone(),
            conversation,
        )
        .await
        .unwrap()
    }
}

async fn wait_for(rx: &mut watch::Receiver<SessionState>, pred: impl Fn(&SessionState) -> bool) {
    timeout(Duration::from_secs(5), async {
        while !pred(&rx.borrow_and_update()) {
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn session_store_follows_auth_changes() {
    let (svc, _tmp) = service();
    let device = Device::new(&svc).await;
    let state = device.store.state();
    assert!(!state.loading);
    assert!(state.user.is_none());

    let user = device
        .store
        .sign_up("alice@example.com", "hunter22", "alice")
        .await
        .unwrap();
    assert_eq!(device.store.state().user.unwrap().id, user.id);

    let mut rx = device.session();
    device.platform.sign_out().await.unwrap();
    wait_for(&mut rx, |s| s.session.is_none()).await;
    assert!(device.store.state().user.is_none());

    device
        .platform
        .sign_in("alice@example.com", "hunter22")
        .await
        .unwrap();
    wait_for(&mut rx, |s| s.user.is_some()).await;
    assert_eq!(device.store.viewer(), Some(user.id));
}

#[tokio::test]
async fn restores_an_existing_session_on_start() {
    let (svc, _tmp) = service();
    let platform: Arc<dyn Platform> = Arc::new(LocalPlatform::new(svc.clone()));
    platform
        .sign_up("alice@example.com", "hunter22", "alice")
        .await
        .unwrap();
    let store = SessionStore::start(platform, Notifier::new()).await;
    assert_eq!(store.state().user.unwrap().username, "alice");
}

#[tokio::test]
async fn failures_become_notices() {
    let (svc, _tmp) = service();
    let device = Device::signed_up(&svc, "alice").await;
    let mut notices = device.notifier.subscribe();
    let err = device
        .store
        .sign_in("alice@example.com", "wrong-password")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ClientError::Platform(platform_api::PlatformError::InvalidCredentials)
    );
    let notice = notices.recv().await.unwrap();
    assert_eq!(notice.level, Level::Error);
    assert_eq!(notice.title, "Sign in failed");
}

#[tokio::test]
async fn profile_update_with_avatar() {
    let (svc, _tmp) = service();
    let device = Device::signed_up(&svc, "alice").await;
    let err = device.store.update_profile(" al ", None).await.unwrap_err();
    assert_eq!(err, ClientError::UsernameTooShort(3));

    let user = device
        .store
        .update_profile(
            "alicia",
            Some(Avatar {
                file_name: "me.png".into(),
                data: PNG.to_vec(),
            }),
        )
        .await
        .unwrap();
    assert_eq!(user.username, "alicia");
    let url = user.avatar_url.unwrap();
    assert!(url.starts_with(&format!("http://localhost:8787/storage/avatars/{}/", device.id())));
    assert_eq!(device.store.state().user.unwrap().username, "alicia");

    let bob = Device::signed_up(&svc, "bob").await;
    let err = bob.store.update_profile("ALICIA", None).await.unwrap_err();
    assert_eq!(
        err,
        ClientError::Platform(platform_api::PlatformError::UsernameTaken)
    );
}

#[tokio::test]
async fn likes_are_viewer_relative_and_reversible() {
    let (svc, _tmp) = service();
    let alice = Device::signed_up(&svc, "alice").await;
    let bob = Device::signed_up(&svc, "bob").await;

    let mut feed = alice.feed();
    let post = feed
        .create_post(NewPost {
            title: Some("hello".into()),
            content: "first!".into(),
            body: PostBody::Text,
        })
        .await
        .unwrap();
    assert_eq!(feed.posts()[0].id, post.id);

    feed.toggle_like(post.id).await.unwrap();
    assert!(feed.post(&post.id).unwrap().has_liked);
    assert_eq!(feed.post(&post.id).unwrap().likes_count, 1);

    let mut bobs = bob.feed();
    bobs.load(PostOrder::Latest).await.unwrap();
    let seen = bobs.post(&post.id).unwrap();
    assert!(!seen.has_liked);
    assert_eq!(seen.likes_count, 1);

    feed.toggle_like(post.id).await.unwrap();
    let after = feed.post(&post.id).unwrap();
    assert!(!after.has_liked);
    assert_eq!(after.likes_count, 0);

    feed.load(PostOrder::Popular).await.unwrap();
    assert_eq!(feed.order(), PostOrder::Popular);
    assert!(!feed.post(&post.id).unwrap().has_liked);
}

#[tokio::test]
async fn like_rolls_back_when_platform_refuses() {
    let (svc, _tmp) = service();
    let alice = Device::signed_up(&svc, "alice").await;
    let mut feed = alice.feed();
    let post = feed
        .create_post(NewPost {
            title: None,
            content: "hi".into(),
            body: PostBody::Text,
        })
        .await
        .unwrap();
    // the platform session ends but the view still believes it is signed in
    alice.platform.sign_out().await.unwrap();
    let err = feed.toggle_like(post.id).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::NotSignedIn | ClientError::Platform(platform_api::PlatformError::Unauthorized)
    ));
    let p = feed.post(&post.id).unwrap();
    assert!(!p.has_liked);
    assert_eq!(p.likes_count, 0);
}

#[tokio::test]
async fn one_vote_per_poll() {
    let (svc, _tmp) = service();
    let alice = Device::signed_up(&svc, "alice").await;
    let mut feed = alice.feed();
    let poll = feed
        .create_post(NewPost {
            title: None,
            content: "Tabs or spaces?".into(),
            body: PostBody::Poll {
                options: vec!["tabs".into(), "spaces".into()],
            },
        })
        .await
        .unwrap();
    let options: Vec<Uuid> = feed.options(&poll.id).iter().map(|o| o.id).collect();
    assert_eq!(options.len(), 2);

    feed.vote(poll.id, options[0]).await.unwrap();
    assert_eq!(feed.options(&poll.id)[0].votes_count, 1);
    assert!(feed.options(&poll.id)[0].has_voted);

    let err = feed.vote(poll.id, options[1]).await.unwrap_err();
    assert_eq!(err, ClientError::AlreadyVoted);
    assert_eq!(feed.options(&poll.id)[1].votes_count, 0);

    // the vote shows on every device of the same account
    let other = Device::new(&svc).await;
    other
        .store
        .sign_in("alice@example.com", "hunter22")
        .await
        .unwrap();
    let mut second = other.feed();
    second.load(PostOrder::Latest).await.unwrap();
    assert!(second.options(&poll.id)[0].has_voted);

    // a view that missed a vote made elsewhere is refused and refreshed
    let bob = Device::signed_up(&svc, "bob").await;
    let mut bobs = bob.feed();
    bobs.load(PostOrder::Latest).await.unwrap();
    svc.cast_vote(&options[1], &bob.id()).unwrap();
    let err = bobs.vote(poll.id, options[0]).await.unwrap_err();
    assert_eq!(err, ClientError::AlreadyVoted);
    let refreshed = bobs.options(&poll.id);
    assert!(refreshed[1].has_voted);
    assert!(!refreshed[0].has_voted);
    assert_eq!(refreshed[0].votes_count, 1);
}

#[tokio::test]
async fn media_posts_upload_then_publish() {
    let (svc, _tmp) = service();
    let alice = Device::signed_up(&svc, "alice").await;
    let mut feed = alice.feed();
    let post = feed
        .publish_media(Some("cat".into()), "", "cat.PNG", PNG.to_vec())
        .await
        .unwrap();
    assert_eq!(post.media_type.as_deref(), Some("image/png"));
    assert!(post
        .media_url
        .unwrap()
        .starts_with("http://localhost:8787/storage/media/"));
    assert_eq!(feed.posts()[0].id, post.id);
}

#[tokio::test]
async fn starting_a_conversation_is_reused_from_both_sides() {
    let (svc, _tmp) = service();
    let alice = Device::signed_up(&svc, "alice").await;
    let bob = Device::signed_up(&svc, "bob").await;

    let mut a = alice.inbox();
    a.load().await.unwrap();
    assert!(a.list().is_empty());
    let id = a.start_conversation(bob.id()).await.unwrap();
    assert_eq!(a.selected(), Some(id));
    assert_eq!(a.list().len(), 1);
    assert_eq!(a.start_conversation(bob.id()).await.unwrap(), id);

    let mut b = bob.inbox();
    b.load().await.unwrap();
    assert_eq!(b.list().len(), 1);
    assert_eq!(b.start_conversation(alice.id()).await.unwrap(), id);
    assert_eq!(b.get(&id).unwrap().participant_usernames, vec!["alice".to_string()]);

    let conn = svc.database().conn().unwrap();
    let conversations: i64 = conn
        .query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))
        .unwrap();
    let participants: i64 = conn
        .query_row("SELECT COUNT(*) FROM conversation_participants", [], |r| r.get(0))
        .unwrap();
    assert_eq!((conversations, participants), (1, 2));
}

#[tokio::test]
async fn user_search_rules() {
    let (svc, _tmp) = service();
    let alice = Device::signed_up(&svc, "alice").await;
    for name in ["bob", "bobby", "bobcat", "bobo", "bobbie", "bobsled"] {
        svc.sign_up(&format!("{name}@example.com"), "hunter22", name)
            .await
            .unwrap();
    }
    let inbox = alice.inbox();
    assert!(inbox.search_users("bo").await.unwrap().is_empty());
    let found = inbox.search_users("BOB").await.unwrap();
    assert_eq!(found.len(), 5);
    assert!(inbox.search_users("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn inbox_merges_realtime_messages() {
    let (svc, _tmp) = service();
    let alice = Device::signed_up(&svc, "alice").await;
    let bob = Device::signed_up(&svc, "bob").await;
    let carol = Device::signed_up(&svc, "carol").await;

    let (ab, _) = bob
        .platform
        .open_direct_conversation(bob.id(), alice.id())
        .await
        .unwrap();
    let mut inbox = alice.inbox();
    inbox.load().await.unwrap();
    assert_eq!(inbox.list().len(), 1);

    let msg = bob
        .platform
        .send_message(ab.id, bob.id(), "hey alice")
        .await
        .unwrap();
    let merge = timeout(Duration::from_secs(2), inbox.pump())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merge, Some(Merge::Applied));
    let conv = inbox.get(&ab.id).unwrap();
    assert_eq!(conv.unread_count, 1);
    assert_eq!(conv.last_message.as_ref().unwrap().id, msg.id);
    assert_eq!(inbox.apply_message(&msg).await.unwrap(), Merge::Duplicate);
    assert_eq!(inbox.get(&ab.id).unwrap().unread_count, 1);

    // a conversation alice has never loaded shows up with its first message
    let (ac, _) = carol
        .platform
        .open_direct_conversation(carol.id(), alice.id())
        .await
        .unwrap();
    carol
        .platform
        .send_message(ac.id, carol.id(), "hi from carol")
        .await
        .unwrap();
    let merge = timeout(Duration::from_secs(2), inbox.pump())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merge, Some(Merge::Unknown(ac.id)));
    assert_eq!(inbox.list()[0].id, ac.id);
    assert_eq!(inbox.list()[0].unread_count, 1);
    let times: Vec<i64> = inbox.list().iter().map(|c| c.updated_at).collect();
    assert!(times.windows(2).all(|w| w[0] >= w[1]));

    // bob and carol talking privately never reaches alice
    let (bc, _) = bob
        .platform
        .open_direct_conversation(bob.id(), carol.id())
        .await
        .unwrap();
    bob.platform
        .send_message(bc.id, bob.id(), "secret")
        .await
        .unwrap();
    assert_eq!(inbox.drain().await.unwrap(), 0);
    assert!(inbox.get(&bc.id).is_none());

    inbox.mark_seen(&ab.id);
    assert_eq!(inbox.get(&ab.id).unwrap().unread_count, 0);
}

#[tokio::test]
async fn chat_stream_reads_sends_and_follows() {
    let (svc, _tmp) = service();
    let alice = Device::signed_up(&svc, "alice").await;
    let bob = Device::signed_up(&svc, "bob").await;
    let (conv, _) = alice
        .platform
        .open_direct_conversation(alice.id(), bob.id())
        .await
        .unwrap();
    for text in ["one", "two"] {
        alice
            .platform
            .send_message(conv.id, alice.id(), text)
            .await
            .unwrap();
    }

    let mut chat = bob.chat(conv.id).await;
    let texts: Vec<&str> = chat.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(texts, vec!["one", "two"]);
    assert!(chat.messages().iter().all(|m| m.read));
    let summary = bob.platform.conversation(conv.id, bob.id()).await.unwrap();
    assert_eq!(summary.unread_count, 0);

    // reopening sweeps nothing new
    let ids: Vec<Uuid> = chat.messages().iter().map(|m| m.id).collect();
    assert_eq!(svc.mark_read(&ids, &bob.id()).unwrap(), 0);

    chat.set_input("   ");
    assert_eq!(chat.send().await.unwrap_err(), ClientError::EmptyMessage);
    assert_eq!(svc.messages(&conv.id, &bob.id()).unwrap().len(), 2);

    chat.set_input("  three ");
    let sent = chat.send().await.unwrap();
    assert_eq!(sent.content, "three");
    assert_eq!(chat.input(), "");
    assert_eq!(chat.messages().last().unwrap().id, sent.id);
    // our own insert comes back on the channel and is deduplicated
    assert_eq!(
        timeout(Duration::from_secs(2), chat.pump())
            .await
            .unwrap()
            .unwrap(),
        Some(false)
    );

    let four = alice
        .platform
        .send_message(conv.id, alice.id(), "four")
        .await
        .unwrap();
    assert_eq!(
        timeout(Duration::from_secs(2), chat.pump())
            .await
            .unwrap()
            .unwrap(),
        Some(true)
    );
    let last = chat.messages().last().unwrap();
    assert_eq!(last.id, four.id);
    assert!(last.read);
    let stored = svc.messages(&conv.id, &alice.id()).unwrap();
    assert!(stored.iter().find(|m| m.id == four.id).unwrap().read);
    // what bob sent stays unread until alice sees it
    assert!(!stored.iter().find(|m| m.id == sent.id).unwrap().read);

    chat.close();
    assert!(!chat.is_open());
    assert_eq!(chat.pump().await.unwrap(), None);
}

#[tokio::test]
async fn chat_requires_participation() {
    let (svc, _tmp) = service();
    let alice = Device::signed_up(&svc, "alice").await;
    let bob = Device::signed_up(&svc, "bob").await;
    let carol = Device::signed_up(&svc, "carol").await;
    let (conv, _) = alice
        .platform
        .open_direct_conversation(alice.id(), bob.id())
        .await
        .unwrap();
    let err = ChatStream::open(
        carol.platform.clone(),
        &carol.session(),
        carol.notifier.clone(),
        conv.id,
    )
    .await
    .err()
    .unwrap();
    assert_eq!(
        err,
        ClientError::Platform(platform_api::PlatformError::Unauthorized)
    );
}
