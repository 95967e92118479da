//! In-memory repositories and a scripted identity provider used by the
//! handler, guard and OAuth tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use time::OffsetDateTime;
use url::Url;

use super::oauth::{IdentityProvider, ProviderError, ProviderProfile, TokenSet};
use super::repo::{OAuthStateRepository, RepoError, SessionRepository, UserRepository};
use super::repo_types::{AuthProvider, Session, User};

fn unavailable() -> RepoError {
    RepoError::Database(sqlx::Error::PoolTimedOut)
}

#[derive(Default)]
pub struct MemoryUsers {
    rows: Mutex<Vec<User>>,
    failing: AtomicBool,
}

impl MemoryUsers {
    /// Makes every subsequent call fail like an unreachable database.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RepoError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(())
    }

    fn insert(&self, mut user: User) -> Result<User, RepoError> {
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|u| u.email == user.email) {
            return Err(RepoError::EmailExists);
        }
        user.id = rows.iter().map(|u| u.id).max().unwrap_or(0) + 1;
        rows.push(user.clone());
        Ok(user)
    }

    fn find(&self, pred: impl Fn(&User) -> bool) -> Result<Option<User>, RepoError> {
        self.check()?;
        Ok(self.rows.lock().unwrap().iter().find(|u| pred(u)).cloned())
    }

    /// Removes a user without touching sessions, leaving them dangling.
    pub fn remove(&self, id: i64) {
        self.rows.lock().unwrap().retain(|u| u.id != id);
    }
}

fn new_user(email: &str, provider: AuthProvider) -> User {
    let now = OffsetDateTime::now_utc();
    User {
        id: 0,
        email: email.to_string(),
        password_hash: None,
        full_name: String::new(),
        telephone: String::new(),
        auth_provider: provider,
        external_id: None,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl UserRepository for MemoryUsers {
    async fn create_local(&self, email: &str, password_hash: &str) -> Result<User, RepoError> {
        self.check()?;
        let mut user = new_user(email, AuthProvider::Local);
        user.password_hash = Some(password_hash.to_string());
        self.insert(user)
    }

    async fn create_from_provider(
        &self,
        email: &str,
        external_id: &str,
        display_name: &str,
    ) -> Result<User, RepoError> {
        self.check()?;
        let mut user = new_user(email, AuthProvider::Google);
        user.external_id = Some(external_id.to_string());
        user.full_name = display_name.to_string();
        self.insert(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepoError> {
        self.find(|u| u.email == email)
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>, RepoError> {
        self.find(|u| u.external_id.as_deref() == Some(external_id))
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, RepoError> {
        self.find(|u| u.id == id)
    }

    async fn update_profile(
        &self,
        id: i64,
        full_name: &str,
        telephone: &str,
        email: &str,
    ) -> Result<User, RepoError> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|u| u.email == email && u.id != id) {
            return Err(RepoError::EmailExists);
        }
        let user = rows
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(RepoError::Database(sqlx::Error::RowNotFound))?;
        user.full_name = full_name.to_string();
        user.telephone = telephone.to_string();
        user.email = email.to_string();
        user.updated_at = OffsetDateTime::now_utc();
        Ok(user.clone())
    }
}

#[derive(Default)]
pub struct MemorySessions {
    rows: Mutex<HashMap<String, Session>>,
    failing: AtomicBool,
}

impl MemorySessions {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RepoError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionRepository for MemorySessions {
    async fn insert(&self, session: &Session) -> Result<(), RepoError> {
        self.check()?;
        self.rows
            .lock()
            .unwrap()
            .insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn find_valid_by_token(&self, token: &str) -> Result<Option<Session>, RepoError> {
        self.check()?;
        let now = OffsetDateTime::now_utc();
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(token)
            .filter(|s| s.is_valid_at(now))
            .cloned())
    }

    async fn delete_by_token(&self, token: &str) -> Result<(), RepoError> {
        self.check()?;
        self.rows.lock().unwrap().remove(token);
        Ok(())
    }

    async fn delete_all_for_user(&self, user_id: i64) -> Result<u64, RepoError> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, s| s.user_id != user_id);
        Ok((before - rows.len()) as u64)
    }

    async fn delete_expired(&self) -> Result<u64, RepoError> {
        self.check()?;
        let now = OffsetDateTime::now_utc();
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, s| s.is_valid_at(now));
        Ok((before - rows.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryOAuthStates {
    rows: Mutex<HashMap<String, OffsetDateTime>>,
}

impl MemoryOAuthStates {
    pub fn count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl OAuthStateRepository for MemoryOAuthStates {
    async fn insert(&self, state: &str, expires_at: OffsetDateTime) -> Result<(), RepoError> {
        self.rows
            .lock()
            .unwrap()
            .insert(state.to_string(), expires_at);
        Ok(())
    }

    async fn consume(&self, state: &str) -> Result<bool, RepoError> {
        let removed = self.rows.lock().unwrap().remove(state);
        Ok(matches!(removed, Some(exp) if exp > OffsetDateTime::now_utc()))
    }

    async fn delete_expired(&self) -> Result<u64, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, exp| *exp > now);
        Ok((before - rows.len()) as u64)
    }
}

/// Accepts the code `good-code` and answers with `profile`; any other code
/// fails the exchange. The userinfo call can be made to fail separately.
pub struct FakeProvider {
    pub profile: ProviderProfile,
    profile_failing: AtomicBool,
}

impl FakeProvider {
    pub fn set_profile_failing(&self, failing: bool) {
        self.profile_failing.store(failing, Ordering::SeqCst);
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            profile: ProviderProfile {
                external_id: "google-123".into(),
                email: "g@example.com".into(),
                display_name: "Gee User".into(),
            },
            profile_failing: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    fn authorization_url(&self, state: &str) -> Url {
        let mut url = Url::parse("https://idp.test/authorize").unwrap();
        url.query_pairs_mut().append_pair("state", state);
        url
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, ProviderError> {
        if code != "good-code" {
            return Err(ProviderError::Status {
                status: 400,
                body: "invalid_grant".into(),
            });
        }
        Ok(TokenSet {
            access_token: "provider-access-token".into(),
            token_type: Some("Bearer".into()),
            expires_in: Some(3600),
        })
    }

    async fn fetch_profile(&self, _tokens: &TokenSet) -> Result<ProviderProfile, ProviderError> {
        if self.profile_failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 401,
                body: "invalid_token".into(),
            });
        }
        Ok(self.profile.clone())
    }
}
