//! Client-side state for murmur: the session store and the reconcilers
//! that keep the feed, the inbox and open chats in step with the platform.
//! Views hold these and render their state; every write goes through the
//! [`Platform`](platform_api::Platform) handed in at construction.

pub mod chat;
pub mod conversations;
pub mod error;
pub mod feed;
pub mod notify;
pub mod session;

pub use chat::ChatStream;
pub use conversations::{ConversationList, Conversations, Merge};
pub use error::{ClientError, ClientResult};
pub use feed::Feed;
pub use notify::{Level, Notice, Notifier};
pub use session::{Avatar, SessionState, SessionStore};
