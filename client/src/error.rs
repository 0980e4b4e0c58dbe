use platform_api::PlatformError;
use thiserror::Error;

/// Failures reported by the client reconcilers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("sign in required")]
    NotSignedIn,
    #[error("message is empty")]
    EmptyMessage,
    #[error("you already voted in this poll")]
    AlreadyVoted,
    #[error("username must be at least {0} characters")]
    UsernameTooShort(usize),
    #[error("{0} is not loaded")]
    NotLoaded(&'static str),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

pub type ClientResult<T> = Result<T, ClientError>;
