use crate::error::ClientError;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Error,
}

/// A transient message for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: Level,
    pub title: String,
    pub description: String,
}

/// Fan-out of user-facing notices. Views subscribe and render toasts.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    fn publish(&self, level: Level, title: &str, description: String) {
        // nobody listening is fine
        let _ = self.tx.send(Notice {
            level,
            title: title.to_string(),
            description,
        });
    }

    pub fn success(&self, title: &str, description: impl Into<String>) {
        let description = description.into();
        info!(title, %description, "notice");
        self.publish(Level::Success, title, description);
    }

    pub fn info(&self, title: &str, description: impl Into<String>) {
        self.publish(Level::Info, title, description.into());
    }

    /// Log a failure and tell the user about it.
    pub fn failure(&self, title: &str, err: &ClientError) {
        warn!(title, error = %err, "operation failed");
        self.publish(Level::Error, title, err.to_string());
    }

    /// Pass a result through, reporting it if it failed.
    pub fn report<T>(&self, title: &str, res: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(e) = &res {
            self.failure(title, e);
        }
        res
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_published() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        let res: Result<(), _> = notifier.report("Could not send", Err(ClientError::EmptyMessage));
        assert!(res.is_err());
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.level, Level::Error);
        assert_eq!(notice.title, "Could not send");
        assert_eq!(notice.description, "message is empty");
        assert!(notifier.report("fine", Ok::<_, ClientError>(1)).is_ok());
        assert!(rx.try_recv().is_err());
    }
}
