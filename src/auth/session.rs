use std::{sync::Arc, time::Duration as StdDuration};

use rand::{rngs::OsRng, RngCore};
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::oauth::OAuthLinker;
use super::repo::{RepoError, SessionRepository};
use super::repo_types::Session;

/// Lifetime of every issued session.
pub const SESSION_TTL: Duration = Duration::hours(24);

/// Random bytes per token; hex encoding doubles the length.
const TOKEN_BYTES: usize = 32;
pub const TOKEN_LEN: usize = TOKEN_BYTES * 2;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("secure random source unavailable: {0}")]
    Entropy(#[from] rand::Error),
    #[error(transparent)]
    Storage(#[from] RepoError),
}

/// Draws a 256-bit token from the OS RNG, hex encoded.
pub fn generate_token() -> Result<String, SessionError> {
    let mut buf = [0u8; TOKEN_BYTES];
    OsRng.try_fill_bytes(&mut buf).map_err(|e| {
        error!(error = %e, "OS random source failed");
        SessionError::Entropy(e)
    })?;
    Ok(hex::encode(buf))
}

/// Issues, validates and revokes sessions on top of a `SessionRepository`.
#[derive(Clone)]
pub struct SessionManager {
    repo: Arc<dyn SessionRepository>,
}

impl SessionManager {
    pub fn new(repo: Arc<dyn SessionRepository>) -> Self {
        Self { repo }
    }

    pub async fn create_session(&self, user_id: i64) -> Result<Session, SessionError> {
        let token = generate_token()?;
        let now = OffsetDateTime::now_utc();
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            token,
            expires_at: now + SESSION_TTL,
            created_at: now,
        };
        self.repo.insert(&session).await?;
        debug!(user_id, session_id = %session.id, "session created");
        Ok(session)
    }

    /// Expired and unknown tokens both come back as `None`.
    pub async fn get_valid_session(&self, token: &str) -> Result<Option<Session>, SessionError> {
        Ok(self.repo.find_valid_by_token(token).await?)
    }

    pub async fn delete_session(&self, token: &str) -> Result<(), SessionError> {
        self.repo.delete_by_token(token).await?;
        Ok(())
    }

    // Not wired to any handler yet; a password change is the obvious caller.
    pub async fn delete_all_sessions_for_user(&self, user_id: i64) -> Result<u64, SessionError> {
        let removed = self.repo.delete_all_for_user(user_id).await?;
        info!(user_id, removed, "revoked all sessions for user");
        Ok(removed)
    }

    pub async fn purge_expired(&self) -> Result<u64, SessionError> {
        Ok(self.repo.delete_expired().await?)
    }
}

/// One sweep over expired sessions and abandoned OAuth states. Failures are
/// logged and left for the next tick.
pub async fn sweep_once(sessions: &SessionManager, oauth: &OAuthLinker) {
    match sessions.purge_expired().await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "purged expired sessions"),
        Err(e) => error!(error = %e, "session sweep failed"),
    }
    match oauth.purge_expired_states().await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "purged expired oauth states"),
        Err(e) => error!(error = %e, "oauth state sweep failed"),
    }
}

/// Periodically deletes expired rows. Validity never depends on this
/// running; it only bounds table growth.
pub fn spawn_sweeper(
    sessions: SessionManager,
    oauth: OAuthLinker,
    interval: StdDuration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep_once(&sessions, &oauth).await;
        }
    })
}
