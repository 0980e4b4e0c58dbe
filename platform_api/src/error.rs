use thiserror::Error;

/// Errors reported across the platform boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("username already taken")]
    UsernameTaken,
    #[error("email already registered")]
    EmailTaken,
    #[error("already voted in this poll")]
    AlreadyVoted,
    #[error("rate limited")]
    RateLimited,
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("object exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("malformed record: {0}")]
    Decode(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

impl PlatformError {
    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PlatformError::NotFound(_) => "not_found",
            PlatformError::Unauthorized => "unauthorized",
            PlatformError::InvalidCredentials => "invalid_credentials",
            PlatformError::UsernameTaken => "username_taken",
            PlatformError::EmailTaken => "email_taken",
            PlatformError::AlreadyVoted => "already_voted",
            PlatformError::RateLimited => "rate_limited",
            PlatformError::Invalid(_) => "invalid",
            PlatformError::TooLarge { .. } => "too_large",
            PlatformError::Decode(_) => "decode",
            PlatformError::Backend(_) => "backend",
        }
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;
