use std::sync::Arc;

use sqlx::PgPool;

use crate::auth::oauth::{GoogleProvider, IdentityProvider, OAuthLinker};
use crate::auth::repo::{
    OAuthStateRepository, PgOAuthStateRepository, PgSessionRepository, PgUserRepository,
    SessionRepository, UserRepository,
};
use crate::auth::session::SessionManager;
use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserRepository>,
    pub sessions: SessionManager,
    pub oauth: OAuthLinker,
}

impl AppState {
    /// Wires the Postgres repositories and the Google client.
    pub fn postgres(config: Arc<AppConfig>, db: PgPool) -> anyhow::Result<Self> {
        let provider = Arc::new(GoogleProvider::new(config.google.clone())?) as Arc<dyn IdentityProvider>;
        Ok(Self::from_parts(
            config,
            Arc::new(PgUserRepository::new(db.clone())),
            Arc::new(PgSessionRepository::new(db.clone())),
            Arc::new(PgOAuthStateRepository::new(db)),
            provider,
        ))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        users: Arc<dyn UserRepository>,
        sessions: Arc<dyn SessionRepository>,
        oauth_states: Arc<dyn OAuthStateRepository>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        let oauth = OAuthLinker::new(provider, users.clone(), oauth_states);
        Self {
            config,
            users,
            sessions: SessionManager::new(sessions),
            oauth,
        }
    }
}

/// State over in-memory repositories, with handles kept for assertions.
#[cfg(test)]
pub struct FakeState {
    pub state: AppState,
    pub users: Arc<crate::auth::memory::MemoryUsers>,
    pub sessions: Arc<crate::auth::memory::MemorySessions>,
    pub provider: Arc<crate::auth::memory::FakeProvider>,
}

#[cfg(test)]
impl AppState {
    pub fn fake() -> FakeState {
        use crate::auth::memory::{FakeProvider, MemoryOAuthStates, MemorySessions, MemoryUsers};

        let users = Arc::new(MemoryUsers::default());
        let sessions = Arc::new(MemorySessions::default());
        let provider = Arc::new(FakeProvider::default());
        let state = Self::from_parts(
            Arc::new(AppConfig::for_tests()),
            users.clone(),
            sessions.clone(),
            Arc::new(MemoryOAuthStates::default()),
            provider.clone(),
        );
        FakeState {
            state,
            users,
            sessions,
            provider,
        }
    }
}
