use crate::error::{ClientError, ClientResult};
use crate::notify::Notifier;
use crate::session::SessionState;
use platform_api::{ChannelScope, ChatMessage, Filter, Platform, Subscription, Table};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Insert a message at its chronological position, after any message with
/// the same timestamp. Returns false for a message already present.
pub fn insert_chronological(messages: &mut Vec<ChatMessage>, msg: ChatMessage) -> bool {
    if messages.iter().any(|m| m.id == msg.id) {
        return false;
    }
    let at = messages.partition_point(|m| m.created_at <= msg.created_at);
    messages.insert(at, msg);
    true
}

/// Ids of unread messages someone else sent.
pub fn unread_from_others(messages: &[ChatMessage], viewer: &Uuid) -> Vec<Uuid> {
    messages
        .iter()
        .filter(|m| !m.read && m.sender_id != *viewer)
        .map(|m| m.id)
        .collect()
}

/// One open conversation: its messages in order, the draft being typed and
/// a channel of new inserts for this conversation only.
pub struct ChatStream {
    platform: Arc<dyn Platform>,
    notifier: Notifier,
    viewer: Uuid,
    conversation_id: Uuid,
    messages: Vec<ChatMessage>,
    input: String,
    channel: Option<Subscription>,
}

impl ChatStream {
    /// Subscribe, load the history and mark what others sent as read.
    pub async fn open(
        platform: Arc<dyn Platform>,
        session: &watch::Receiver<SessionState>,
        notifier: Notifier,
        conversation_id: Uuid,
    ) -> ClientResult<Self> {
        let viewer = session.borrow().user_id();
        let res = match viewer {
            Some(viewer) => Self::try_open(platform, notifier.clone(), viewer, conversation_id).await,
            None => Err(ClientError::NotSignedIn),
        };
        notifier.report("Could not open conversation", res)
    }

    async fn try_open(
        platform: Arc<dyn Platform>,
        notifier: Notifier,
        viewer: Uuid,
        conversation_id: Uuid,
    ) -> ClientResult<Self> {
        let channel = platform.subscribe(
            ChannelScope::inserts(Table::Messages)
                .with_filter(Filter::eq("conversation_id", conversation_id)),
        );
        let messages = platform.messages(conversation_id).await?;
        let mut chat = Self {
            platform,
            notifier,
            viewer,
            conversation_id,
            messages,
            input: String::new(),
            channel: Some(channel),
        };
        let unread = unread_from_others(&chat.messages, &viewer);
        chat.mark_read(unread).await?;
        debug!(conversation = %conversation_id, count = chat.messages.len(), "chat opened");
        Ok(chat)
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    async fn mark_read(&mut self, ids: Vec<Uuid>) -> ClientResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.platform.mark_read(&ids, self.viewer).await?;
        for msg in self.messages.iter_mut().filter(|m| ids.contains(&m.id)) {
            msg.read = true;
        }
        Ok(())
    }

    /// Add an inbound message. Messages from others are marked read since
    /// the conversation is on screen. Returns false for duplicates.
    pub async fn apply_insert(&mut self, msg: ChatMessage) -> ClientResult<bool> {
        if msg.conversation_id != self.conversation_id {
            return Ok(false);
        }
        let from_other = msg.sender_id != self.viewer && !msg.read;
        let id = msg.id;
        if !insert_chronological(&mut self.messages, msg) {
            return Ok(false);
        }
        if from_other {
            let res = self.mark_read(vec![id]).await;
            self.notifier.report("Could not mark message read", res)?;
        }
        Ok(true)
    }

    /// Wait for the next insert and apply it. `None` once closed.
    pub async fn pump(&mut self) -> ClientResult<Option<bool>> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(None);
        };
        let Some(event) = channel.recv().await else {
            return Ok(None);
        };
        let msg = event.decode::<ChatMessage>().map_err(|e| {
            warn!(error = %e, "dropping malformed message event");
            ClientError::from(e)
        })?;
        self.apply_insert(msg).await.map(Some)
    }

    /// Apply every insert already delivered without waiting.
    pub async fn drain(&mut self) -> ClientResult<usize> {
        let mut added = 0;
        loop {
            let Some(event) = self.channel.as_mut().and_then(Subscription::try_recv) else {
                return Ok(added);
            };
            let msg = event.decode::<ChatMessage>()?;
            if self.apply_insert(msg).await? {
                added += 1;
            }
        }
    }

    /// Send the current draft. Blank drafts never reach the platform.
    pub async fn send(&mut self) -> ClientResult<ChatMessage> {
        if self.input.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let res = self
            .platform
            .send_message(self.conversation_id, self.viewer, self.input.trim())
            .await
            .map_err(ClientError::from);
        let msg = self.notifier.report("Could not send message", res)?;
        insert_chronological(&mut self.messages, msg.clone());
        self.input.clear();
        // resorts the conversation for everyone watching the list
        if let Err(e) = self.platform.touch_conversation(self.conversation_id).await {
            self.notifier
                .failure("Could not update conversation", &e.into());
        }
        Ok(msg)
    }

    /// Stop listening for inserts. Dropping the stream does the same.
    pub fn close(&mut self) {
        self.channel = None;
    }
}
