use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::auth::repo_types::{AuthProvider, Session, User};

const USER_COLUMNS: &str = "id, email, password_hash, full_name, telephone, auth_provider, \
                            external_id, created_at, updated_at";
const EMAIL_CONSTRAINT: &str = "users_email_key";

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("email already exists")]
    EmailExists,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Maps a violation of the unique email constraint to `EmailExists`.
fn map_user_write(err: sqlx::Error) -> RepoError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() && db.constraint() == Some(EMAIL_CONSTRAINT) {
            return RepoError::EmailExists;
        }
    }
    RepoError::Database(err)
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create_local(&self, email: &str, password_hash: &str) -> Result<User, RepoError>;
    async fn create_from_provider(
        &self,
        email: &str,
        external_id: &str,
        display_name: &str,
    ) -> Result<User, RepoError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepoError>;
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>, RepoError>;
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, RepoError>;
    async fn update_profile(
        &self,
        id: i64,
        full_name: &str,
        telephone: &str,
        email: &str,
    ) -> Result<User, RepoError>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert(&self, session: &Session) -> Result<(), RepoError>;
    /// Only returns sessions whose expiry is still in the future.
    async fn find_valid_by_token(&self, token: &str) -> Result<Option<Session>, RepoError>;
    async fn delete_by_token(&self, token: &str) -> Result<(), RepoError>;
    async fn delete_all_for_user(&self, user_id: i64) -> Result<u64, RepoError>;
    async fn delete_expired(&self) -> Result<u64, RepoError>;
}

/// Server-side store for OAuth anti-forgery state values.
#[async_trait]
pub trait OAuthStateRepository: Send + Sync {
    async fn insert(&self, state: &str, expires_at: OffsetDateTime) -> Result<(), RepoError>;
    /// Removes the state and reports whether it existed and was unexpired.
    async fn consume(&self, state: &str) -> Result<bool, RepoError>;
    /// Drops states whose flow was abandoned.
    async fn delete_expired(&self) -> Result<u64, RepoError>;
}

#[derive(Clone)]
pub struct PgUserRepository {
    db: PgPool,
}

impl PgUserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create_local(&self, email: &str, password_hash: &str) -> Result<User, RepoError> {
        sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, password_hash, auth_provider)
            VALUES ($1, $2, $3)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(email)
        .bind(password_hash)
        .bind(AuthProvider::Local.as_str())
        .fetch_one(&self.db)
        .await
        .map_err(map_user_write)
    }

    async fn create_from_provider(
        &self,
        email: &str,
        external_id: &str,
        display_name: &str,
    ) -> Result<User, RepoError> {
        sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, external_id, full_name, auth_provider)
            VALUES ($1, $2, $3, $4)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(email)
        .bind(external_id)
        .bind(display_name)
        .bind(AuthProvider::Google.as_str())
        .fetch_one(&self.db)
        .await
        .map_err(map_user_write)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepoError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>, RepoError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, RepoError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn update_profile(
        &self,
        id: i64,
        full_name: &str,
        telephone: &str,
        email: &str,
    ) -> Result<User, RepoError> {
        sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
               SET full_name = $1, telephone = $2, email = $3, updated_at = NOW()
             WHERE id = $4
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(full_name)
        .bind(telephone)
        .bind(email)
        .bind(id)
        .fetch_one(&self.db)
        .await
        .map_err(map_user_write)
    }
}

#[derive(Clone)]
pub struct PgSessionRepository {
    db: PgPool,
}

impl PgSessionRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn insert(&self, session: &Session) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, token, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.token)
        .bind(session.expires_at)
        .bind(session.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn find_valid_by_token(&self, token: &str) -> Result<Option<Session>, RepoError> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, user_id, token, expires_at, created_at
              FROM sessions
             WHERE token = $1 AND expires_at > NOW()
            "#,
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        Ok(session)
    }

    async fn delete_by_token(&self, token: &str) -> Result<(), RepoError> {
        sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_all_for_user(&self, user_id: i64) -> Result<u64, RepoError> {
        let res = sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }

    async fn delete_expired(&self) -> Result<u64, RepoError> {
        let res = sqlx::query("DELETE FROM sessions WHERE expires_at <= NOW()")
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }
}

#[derive(Clone)]
pub struct PgOAuthStateRepository {
    db: PgPool,
}

impl PgOAuthStateRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OAuthStateRepository for PgOAuthStateRepository {
    async fn insert(&self, state: &str, expires_at: OffsetDateTime) -> Result<(), RepoError> {
        sqlx::query("INSERT INTO oauth_states (state, expires_at) VALUES ($1, $2)")
            .bind(state)
            .bind(expires_at)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn consume(&self, state: &str) -> Result<bool, RepoError> {
        // Delete unconditionally so a state can never be replayed.
        let row: Option<(OffsetDateTime,)> =
            sqlx::query_as("DELETE FROM oauth_states WHERE state = $1 RETURNING expires_at")
                .bind(state)
                .fetch_optional(&self.db)
                .await?;
        Ok(matches!(row, Some((expires_at,)) if expires_at > OffsetDateTime::now_utc()))
    }

    async fn delete_expired(&self) -> Result<u64, RepoError> {
        let res = sqlx::query("DELETE FROM oauth_states WHERE expires_at <= NOW()")
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }
}
