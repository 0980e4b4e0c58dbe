use crate::error::{PlatformError, PlatformResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

/// Tables whose row changes are published on realtime channels.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Profiles,
    Posts,
    PollOptions,
    PollVotes,
    PostLikes,
    Conversations,
    ConversationParticipants,
    Messages,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::Posts => "posts",
            Table::PollOptions => "poll_options",
            Table::PollVotes => "poll_votes",
            Table::PostLikes => "post_likes",
            Table::Conversations => "conversations",
            Table::ConversationParticipants => "conversation_participants",
            Table::Messages => "messages",
        }
    }
}

impl FromStr for Table {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let table = match s {
            "profiles" => Table::Profiles,
            "posts" => Table::Posts,
            "poll_options" => Table::PollOptions,
            "poll_votes" => Table::PollVotes,
            "post_likes" => Table::PostLikes,
            "conversations" => Table::Conversations,
            "conversation_participants" => Table::ConversationParticipants,
            "messages" => Table::Messages,
            other => return Err(PlatformError::Invalid(format!("unknown_table:{other}"))),
        };
        Ok(table)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single row change.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub record: Value,
    #[serde(default)]
    pub old: Option<Value>,
}

impl ChangeEvent {
    pub fn new<T: Serialize>(table: Table, kind: ChangeKind, record: &T) -> PlatformResult<Self> {
        let record =
            serde_json::to_value(record).map_err(|e| PlatformError::Decode(e.to_string()))?;
        Ok(Self {
            table,
            kind,
            record,
            old: None,
        })
    }

    /// Decode the record into a typed row, validating its shape.
    pub fn decode<T: DeserializeOwned>(&self) -> PlatformResult<T> {
        serde_json::from_value(self.record.clone()).map_err(|e| {
            PlatformError::Decode(format!("{}: {}", self.table.name(), e))
        })
    }

    fn column(&self, column: &str) -> Option<String> {
        match self.record.get(column)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Row filter for a channel, written `column=eq.value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq { column: String, value: String },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            Filter::Eq { column, value } => event.column(column).as_deref() == Some(value),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Eq { column, value } => write!(f, "{column}=eq.{value}"),
        }
    }
}

impl FromStr for Filter {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, rest) = s
            .split_once('=')
            .ok_or_else(|| PlatformError::Invalid("invalid_filter".into()))?;
        let value = rest
            .strip_prefix("eq.")
            .ok_or_else(|| PlatformError::Invalid("unsupported_filter".into()))?;
        if column.is_empty() || value.is_empty() {
            return Err(PlatformError::Invalid("invalid_filter".into()));
        }
        Ok(Filter::eq(column, value))
    }
}

/// What a realtime channel listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelScope {
    pub table: Table,
    /// Empty means every kind of change.
    pub kinds: Vec<ChangeKind>,
    pub filter: Option<Filter>,
}

impl ChannelScope {
    pub fn table(table: Table) -> Self {
        Self {
            table,
            kinds: Vec::new(),
            filter: None,
        }
    }

    pub fn inserts(table: Table) -> Self {
        Self {
            table,
            kinds: vec![ChangeKind::Insert],
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.table == self.table
            && (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && self.filter.as_ref().map_or(true, |f| f.matches(event))
    }
}

/// Per-event visibility check applied on top of the scope.
pub type Guard = Box<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// A live realtime channel. Dropping it unsubscribes.
pub struct Subscription {
    scope: ChannelScope,
    guard: Option<Guard>,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(scope: ChannelScope, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            scope,
            guard: None,
            rx,
        }
    }

    /// Only deliver events the guard accepts.
    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn scope(&self) -> &ChannelScope {
        &self.scope
    }

    fn wants(&self, event: &ChangeEvent) -> bool {
        self.scope.matches(event) && self.guard.as_ref().map_or(true, |g| g(event))
    }

    /// Wait for the next event in scope. Returns `None` once the channel closed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(table = self.scope.table.name(), skipped, "realtime channel lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered event in scope, without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(table = self.scope.table.name(), skipped, "realtime channel lagged");
                }
                Err(_) => return None,
            }
        }
    }
}
