use crate::db::{is_constraint_violation, now_ms};
use crate::profiles;
use anyhow::Result;
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use platform_api::{PlatformError, Session, User};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration as StdDuration, Instant},
};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"));

const MIN_PASSWORD_LEN: usize = 6;

/// Hash a password using argon2id.
pub fn hash_password(pass: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(pass.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!(e))?
        .to_string();
    Ok(hash)
}

/// Verify a password against an encoded hash.
pub fn verify_password(pass: &str, hash: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        Argon2::default()
            .verify_password(pass.as_bytes(), &parsed)
            .is_ok()
    } else {
        false
    }
}

/// Claims stored within issued session tokens.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub exp: usize,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid, PlatformError> {
        Uuid::parse_str(&self.sub).map_err(|_| PlatformError::Unauthorized)
    }
}

/// Issue a session token for a user valid for the provided duration.
pub fn issue_session(secret: &[u8], user: &User, valid_for: Duration) -> Result<Session> {
    let expires = OffsetDateTime::now_utc() + valid_for;
    let claims = Claims {
        sub: user.id.to_string(),
        email: user.email.clone(),
        exp: expires.unix_timestamp() as usize,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(Session {
        access_token: token,
        user_id: user.id,
        email: user.email.clone(),
        expires_at: expires.unix_timestamp() * 1000,
    })
}

/// Verify a session token and return its claims if valid.
pub fn verify_token(secret: &[u8], token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    if data.claims.exp < OffsetDateTime::now_utc().unix_timestamp() as usize {
        anyhow::bail!("expired");
    }
    Ok(data.claims)
}

/// Load the token signing secret, generating it on first use.
pub fn signing_secret(conn: &Connection) -> Result<Vec<u8>> {
    let existing: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = 'jwt_secret'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(secret) = existing {
        return Ok(secret);
    }
    use rand::RngCore;
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    conn.execute(
        "INSERT OR IGNORE INTO settings (key, value) VALUES ('jwt_secret', ?1)",
        params![secret],
    )?;
    // another process may have won the insert
    let stored: Vec<u8> = conn.query_row(
        "SELECT value FROM settings WHERE key = 'jwt_secret'",
        [],
        |row| row.get(0),
    )?;
    Ok(stored)
}

pub fn validate_email(email: &str) -> Result<(), PlatformError> {
    if EMAIL_RE.is_match(email) {
        Ok(())
    } else {
        Err(PlatformError::Invalid("invalid_email".into()))
    }
}

/// Create credentials and profile for a new user in one transaction.
pub fn create_account(
    conn: &mut Connection,
    email: &str,
    password: &str,
    username: &str,
) -> Result<User> {
    let email = email.trim().to_lowercase();
    let username = username.trim();
    validate_email(&email)?;
    profiles::validate_username(username)?;
    if password.len() < MIN_PASSWORD_LEN {
        return Err(PlatformError::Invalid("weak_password".into()).into());
    }
    let hash = hash_password(password)?;
    let tx = conn.transaction()?;
    if profiles::username_taken(&tx, username, None)? {
        return Err(PlatformError::UsernameTaken.into());
    }
    let user = User {
        id: Uuid::new_v4(),
        email: email.clone(),
        username: username.to_string(),
        avatar_url: None,
        created_at: now_ms(),
    };
    let res = tx.execute(
        "INSERT INTO profiles (id, email, username, avatar_url, created_at) VALUES (?1, ?2, ?3, NULL, ?4)",
        params![user.id.to_string(), user.email, user.username, user.created_at],
    );
    if let Err(e) = res {
        if is_constraint_violation(&e) {
            return Err(PlatformError::EmailTaken.into());
        }
        return Err(e.into());
    }
    tx.execute(
        "INSERT INTO credentials (user_id, password_hash) VALUES (?1, ?2)",
        params![user.id.to_string(), hash],
    )?;
    tx.commit()?;
    Ok(user)
}

/// Check an email/password pair, returning the matching profile.
pub fn authenticate(conn: &Connection, email: &str, password: &str) -> Result<User> {
    let email = email.trim().to_lowercase();
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT p.id, c.password_hash FROM profiles p JOIN credentials c ON c.user_id = p.id WHERE p.email = ?1",
            [email],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((id, hash)) = row else {
        return Err(PlatformError::InvalidCredentials.into());
    };
    if !verify_password(password, &hash) {
        return Err(PlatformError::InvalidCredentials.into());
    }
    let id = Uuid::parse_str(&id)?;
    profiles::get_profile(conn, &id)
}

/// Simple in-memory login rate limiter.
#[derive(Clone)]
pub struct LoginRateLimiter {
    inner: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
    max: usize,
    window: StdDuration,
}

impl LoginRateLimiter {
    pub fn new(max: usize, window: StdDuration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max,
            window,
        }
    }

    /// Returns true if the attempt is allowed, false if rate limited.
    pub async fn check(&self, key: &str) -> bool {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        guard.retain(|_, hits| {
            hits.retain(|t| now.duration_since(*t) < self.window);
            !hits.is_empty()
        });
        let entry = guard.entry(key.to_lowercase()).or_default();
        if entry.len() >= self.max {
            return false;
        }
        entry.push(now);
        true
    }
}
