use crate::error::{ClientError, ClientResult};
use crate::notify::Notifier;
use crate::session::SessionState;
use platform_api::{
    ChangeEvent, ChannelScope, ChatMessage, Conversation, Platform, PublicProfile, Subscription,
    Table,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MIN_SEARCH_LEN: usize = 3;
pub const MAX_SEARCH_RESULTS: usize = 5;

/// What merging one inbound message did to the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Applied,
    /// Already merged this message.
    Duplicate,
    /// Already counted by the summary the list was loaded with.
    Stale,
    /// The message belongs to a conversation not in the list.
    Unknown(Uuid),
}

/// Conversations ordered by last activity, newest first.
#[derive(Debug, Default, Clone)]
pub struct ConversationList {
    items: Vec<Conversation>,
    seen: HashSet<Uuid>,
    /// Per conversation, the newest message its fetched summary accounts for.
    baselines: HashMap<Uuid, i64>,
}

impl ConversationList {
    pub fn new(items: Vec<Conversation>) -> Self {
        let mut list = Self::default();
        list.replace(items);
        list
    }

    pub fn items(&self) -> &[Conversation] {
        &self.items
    }

    pub fn get(&self, id: &Uuid) -> Option<&Conversation> {
        self.items.iter().find(|c| c.id == *id)
    }

    pub fn replace(&mut self, items: Vec<Conversation>) {
        self.items = items;
        self.seen.clear();
        self.baselines.clear();
        self.remember_last_messages();
        self.sort();
    }

    /// Insert a conversation, replacing any copy with the same id.
    pub fn upsert(&mut self, conversation: Conversation) {
        match &conversation.last_message {
            Some(msg) => {
                self.seen.insert(msg.id);
                self.baselines.insert(conversation.id, msg.created_at);
            }
            None => {
                self.baselines.remove(&conversation.id);
            }
        }
        match self.items.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation,
            None => self.items.push(conversation),
        }
        self.sort();
    }

    /// Local one-to-one conversation with `other`, if any.
    pub fn direct_with(&self, other: &Uuid) -> Option<&Conversation> {
        self.items
            .iter()
            .find(|c| c.participant_ids.len() == 1 && c.participant_ids[0] == *other)
    }

    /// Merge an inbound message. Safe against duplicate and out-of-order
    /// delivery: a message is counted at most once, messages the loaded
    /// summary already covers are not counted again, and the last message
    /// never moves backwards.
    pub fn apply_message(&mut self, viewer: &Uuid, msg: &ChatMessage) -> Merge {
        if self.seen.contains(&msg.id) {
            return Merge::Duplicate;
        }
        let Some(conv) = self.items.iter_mut().find(|c| c.id == msg.conversation_id) else {
            return Merge::Unknown(msg.conversation_id);
        };
        if let Some(baseline) = self.baselines.get(&conv.id) {
            if msg.created_at <= *baseline {
                return Merge::Stale;
            }
        }
        self.seen.insert(msg.id);
        let newest = conv
            .last_message
            .as_ref()
            .map_or(true, |last| msg.created_at >= last.created_at);
        if newest {
            conv.last_message = Some(msg.clone());
        }
        conv.updated_at = conv.updated_at.max(msg.created_at);
        if msg.sender_id != *viewer && !msg.read {
            conv.unread_count += 1;
        }
        self.sort();
        Merge::Applied
    }

    pub fn clear_unread(&mut self, id: &Uuid) -> bool {
        match self.items.iter_mut().find(|c| c.id == *id) {
            Some(c) => {
                c.unread_count = 0;
                true
            }
            None => false,
        }
    }

    fn remember_last_messages(&mut self) {
        for conv in &self.items {
            if let Some(msg) = &conv.last_message {
                self.seen.insert(msg.id);
                self.baselines.insert(conv.id, msg.created_at);
            }
        }
    }

    fn sort(&mut self) {
        self.items
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
    }
}

/// The viewer's inbox: conversation summaries kept current from the
/// realtime message stream.
pub struct Conversations {
    platform: Arc<dyn Platform>,
    session: watch::Receiver<SessionState>,
    notifier: Notifier,
    list: ConversationList,
    selected: Option<Uuid>,
    inbox: Option<Subscription>,
}

impl Conversations {
    pub fn new(
        platform: Arc<dyn Platform>,
        session: watch::Receiver<SessionState>,
        notifier: Notifier,
    ) -> Self {
        Self {
            platform,
            session,
            notifier,
            list: ConversationList::default(),
            selected: None,
            inbox: None,
        }
    }

    pub fn list(&self) -> &[Conversation] {
        self.list.items()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Conversation> {
        self.list.get(id)
    }

    pub fn selected(&self) -> Option<Uuid> {
        self.selected
    }

    fn viewer(&self) -> ClientResult<Uuid> {
        self.session
            .borrow()
            .user_id()
            .ok_or(ClientError::NotSignedIn)
    }

    /// Subscribe to new messages, then fetch the summaries. Messages that
    /// arrive in between are merged on the next pump and deduplicated.
    pub async fn load(&mut self) -> ClientResult<()> {
        let res = self.try_load().await;
        self.notifier.report("Could not load conversations", res)
    }

    async fn try_load(&mut self) -> ClientResult<()> {
        let viewer = self.viewer()?;
        self.inbox = Some(self.platform.subscribe(ChannelScope::inserts(Table::Messages)));
        let items = self.platform.conversations(viewer).await?;
        debug!(count = items.len(), "conversations loaded");
        self.list.replace(items);
        Ok(())
    }

    /// Merge one message into the list, fetching its conversation if it is
    /// not known yet.
    pub async fn apply_message(&mut self, msg: &ChatMessage) -> ClientResult<Merge> {
        let viewer = self.viewer()?;
        let merge = self.list.apply_message(&viewer, msg);
        if let Merge::Unknown(id) = merge {
            let res = self
                .platform
                .conversation(id, viewer)
                .await
                .map_err(ClientError::from);
            let conv = self.notifier.report("Could not load conversation", res)?;
            self.list.upsert(conv);
        }
        Ok(merge)
    }

    async fn handle(&mut self, event: ChangeEvent) -> ClientResult<Merge> {
        let msg: ChatMessage = match event.decode() {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping malformed message event");
                return Err(e.into());
            }
        };
        self.apply_message(&msg).await
    }

    /// Wait for the next inbound message and merge it. `None` once the
    /// channel closed or before [`load`](Self::load).
    pub async fn pump(&mut self) -> ClientResult<Option<Merge>> {
        let Some(inbox) = self.inbox.as_mut() else {
            return Ok(None);
        };
        match inbox.recv().await {
            Some(event) => self.handle(event).await.map(Some),
            None => Ok(None),
        }
    }

    /// Merge every message already delivered without waiting.
    pub async fn drain(&mut self) -> ClientResult<usize> {
        let mut applied = 0;
        loop {
            let Some(event) = self.inbox.as_mut().and_then(Subscription::try_recv) else {
                return Ok(applied);
            };
            if self.handle(event).await? == Merge::Applied {
                applied += 1;
            }
        }
    }

    /// Open the one-to-one conversation with `other` and select it, reusing
    /// a local one when present.
    pub async fn start_conversation(&mut self, other: Uuid) -> ClientResult<Uuid> {
        let res = self.try_start(other).await;
        self.notifier.report("Could not start conversation", res)
    }

    async fn try_start(&mut self, other: Uuid) -> ClientResult<Uuid> {
        let viewer = self.viewer()?;
        if let Some(existing) = self.list.direct_with(&other) {
            let id = existing.id;
            self.selected = Some(id);
            return Ok(id);
        }
        let (conv, created) = self
            .platform
            .open_direct_conversation(viewer, other)
            .await?;
        debug!(conversation = %conv.id, created, "conversation opened");
        let id = conv.id;
        self.list.upsert(conv);
        self.selected = Some(id);
        Ok(id)
    }

    /// Users whose name contains `fragment`, never the viewer. Short
    /// fragments return nothing.
    pub async fn search_users(&self, fragment: &str) -> ClientResult<Vec<PublicProfile>> {
        let fragment = fragment.trim();
        if fragment.chars().count() < MIN_SEARCH_LEN {
            return Ok(Vec::new());
        }
        let res = self.try_search(fragment).await;
        self.notifier.report("Search failed", res)
    }

    async fn try_search(&self, fragment: &str) -> ClientResult<Vec<PublicProfile>> {
        let viewer = self.viewer()?;
        Ok(self
            .platform
            .search_profiles(fragment, Some(viewer), MAX_SEARCH_RESULTS)
            .await?)
    }

    pub fn select(&mut self, id: Option<Uuid>) {
        self.selected = id;
    }

    /// Zero the unread badge once the chat swept the conversation.
    pub fn mark_seen(&mut self, id: &Uuid) {
        self.list.clear_unread(id);
    }

    pub fn close(&mut self) {
        self.inbox = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(id: Uuid, updated_at: i64) -> Conversation {
        Conversation {
            id,
            participant_ids: vec![Uuid::new_v4()],
            participant_usernames: vec!["bob".into()],
            last_message: None,
            unread_count: 0,
            created_at: updated_at,
            updated_at,
        }
    }

    fn msg(conversation_id: Uuid, sender_id: Uuid, created_at: i64) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            content: "hi".into(),
            read: false,
            created_at,
        }
    }

    fn is_sorted(list: &ConversationList) -> bool {
        list.items()
            .windows(2)
            .all(|w| w[0].updated_at >= w[1].updated_at)
    }

    #[test]
    fn merge_moves_conversation_to_top() {
        let (viewer, other) = (Uuid::new_v4(), Uuid::new_v4());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut list = ConversationList::new(vec![conv(a, 10), conv(b, 20)]);
        assert_eq!(list.items()[0].id, b);

        let m = msg(a, other, 30);
        assert_eq!(list.apply_message(&viewer, &m), Merge::Applied);
        assert_eq!(list.items()[0].id, a);
        assert_eq!(list.items()[0].unread_count, 1);
        assert_eq!(list.items()[0].updated_at, 30);
        assert!(is_sorted(&list));
    }

    #[test]
    fn late_deliveries_still_count_as_unread() {
        let (viewer, other) = (Uuid::new_v4(), Uuid::new_v4());
        let a = Uuid::new_v4();
        let mut list = ConversationList::new(vec![conv(a, 10)]);
        let newer = msg(a, other, 11);
        let older = msg(a, other, 10);
        assert_eq!(list.apply_message(&viewer, &newer), Merge::Applied);
        assert_eq!(list.apply_message(&viewer, &older), Merge::Applied);
        assert_eq!(list.apply_message(&viewer, &newer), Merge::Duplicate);
        assert_eq!(list.apply_message(&viewer, &older), Merge::Duplicate);
        let c = &list.items()[0];
        assert_eq!(c.unread_count, 2);
        assert_eq!(c.last_message.as_ref().unwrap().id, newer.id);
        assert_eq!(c.updated_at, 11);
    }

    #[test]
    fn messages_covered_by_the_summary_are_not_recounted() {
        let (viewer, other) = (Uuid::new_v4(), Uuid::new_v4());
        let a = Uuid::new_v4();
        let earlier = msg(a, other, 40);
        let last = msg(a, other, 50);
        let mut loaded = conv(a, 50);
        loaded.last_message = Some(last.clone());
        loaded.unread_count = 2;
        let mut list = ConversationList::new(vec![loaded]);

        // inserts published before the fetch arrive afterwards
        assert_eq!(list.apply_message(&viewer, &earlier), Merge::Stale);
        assert_eq!(list.apply_message(&viewer, &last), Merge::Duplicate);
        assert_eq!(list.items()[0].unread_count, 2);

        assert_eq!(list.apply_message(&viewer, &msg(a, other, 60)), Merge::Applied);
        assert_eq!(list.apply_message(&viewer, &msg(a, other, 55)), Merge::Applied);
        let c = &list.items()[0];
        assert_eq!(c.unread_count, 4);
        assert_eq!(c.last_message.as_ref().unwrap().created_at, 60);
    }

    #[test]
    fn own_and_read_messages_do_not_count() {
        let (viewer, other) = (Uuid::new_v4(), Uuid::new_v4());
        let a = Uuid::new_v4();
        let mut list = ConversationList::new(vec![conv(a, 10)]);
        list.apply_message(&viewer, &msg(a, viewer, 20));
        let mut read = msg(a, other, 30);
        read.read = true;
        list.apply_message(&viewer, &read);
        assert_eq!(list.items()[0].unread_count, 0);
        list.apply_message(&viewer, &msg(a, other, 40));
        assert_eq!(list.items()[0].unread_count, 1);
        assert!(list.clear_unread(&a));
        assert_eq!(list.items()[0].unread_count, 0);
    }

    #[test]
    fn updated_at_never_moves_backwards() {
        let (viewer, other) = (Uuid::new_v4(), Uuid::new_v4());
        let a = Uuid::new_v4();
        // touched after the last message was sent
        let mut list = ConversationList::new(vec![conv(a, 100)]);
        list.apply_message(&viewer, &msg(a, other, 60));
        assert_eq!(list.items()[0].updated_at, 100);
    }

    #[test]
    fn unknown_conversations_are_reported() {
        let viewer = Uuid::new_v4();
        let mut list = ConversationList::new(vec![conv(Uuid::new_v4(), 1)]);
        let stray = msg(Uuid::new_v4(), Uuid::new_v4(), 5);
        assert_eq!(
            list.apply_message(&viewer, &stray),
            Merge::Unknown(stray.conversation_id)
        );
        // a later delivery of the same message is not swallowed as a duplicate
        assert_eq!(
            list.apply_message(&viewer, &stray),
            Merge::Unknown(stray.conversation_id)
        );
    }

    #[test]
    fn order_is_stable_under_any_delivery_order() {
        let (viewer, other) = (Uuid::new_v4(), Uuid::new_v4());
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let msgs: Vec<ChatMessage> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| msg(*id, other, 100 + i as i64))
            .collect();
        let mut forward = ConversationList::new(ids.iter().map(|id| conv(*id, 0)).collect());
        let mut backward = forward.clone();
        for m in &msgs {
            forward.apply_message(&viewer, m);
        }
        for m in msgs.iter().rev().chain(msgs.iter()) {
            backward.apply_message(&viewer, m);
        }
        let order = |l: &ConversationList| l.items().iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(order(&forward), order(&backward));
        assert!(is_sorted(&forward));
        assert!(backward.items().iter().all(|c| c.unread_count == 1));
    }

    #[test]
    fn direct_lookup() {
        let a = Uuid::new_v4();
        let c = conv(a, 1);
        let other = c.participant_ids[0];
        let list = ConversationList::new(vec![c]);
        assert_eq!(list.direct_with(&other).unwrap().id, a);
        assert!(list.direct_with(&Uuid::new_v4()).is_none());
    }
}
