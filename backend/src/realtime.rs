use platform_api::{ChangeEvent, ChangeKind, ChannelScope, Subscription, Table};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Fan-out of row changes to every open realtime channel.
#[derive(Clone)]
pub struct Hub {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        debug!(table = event.table.name(), kind = ?event.kind, "publish change");
        // no receivers is fine
        let _ = self.tx.send(event);
    }

    /// Serialize a row and publish it.
    pub fn emit<T: Serialize>(&self, table: Table, kind: ChangeKind, record: &T) {
        match ChangeEvent::new(table, kind, record) {
            Ok(event) => self.publish(event),
            Err(e) => warn!(table = table.name(), error = %e, "dropping unserializable change"),
        }
    }

    pub fn subscribe(&self, scope: ChannelScope) -> Subscription {
        Subscription::new(scope, self.tx.subscribe())
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(1024)
    }
}
