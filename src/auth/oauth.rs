//! Google sign-in: authorization redirect, callback verification, code
//! exchange and mapping of the provider identity onto a local user.
//!
//! A flow moves through `begin` (state issued) and `complete` (state
//! consumed, code exchanged, profile fetched, user linked or created). The
//! handler issues the session afterwards.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use url::Url;

use super::repo::{OAuthStateRepository, RepoError, UserRepository};
use super::repo_types::User;
use super::session::{generate_token, SessionError};
use crate::config::GoogleOAuthConfig;

const STATE_TTL: Duration = Duration::minutes(10);
const GOOGLE_SCOPES: &str = "openid email profile";

#[derive(Debug, Clone, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Identity asserted by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub external_id: String,
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request to identity provider failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("identity provider answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("identity provider response is missing `{0}`")]
    MissingField(&'static str),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn authorization_url(&self, state: &str) -> Url;
    async fn exchange_code(&self, code: &str) -> Result<TokenSet, ProviderError>;
    async fn fetch_profile(&self, tokens: &TokenSet) -> Result<ProviderProfile, ProviderError>;
}

pub struct GoogleProvider {
    http: reqwest::Client,
    config: GoogleOAuthConfig,
    auth_url: Url,
}

impl GoogleProvider {
    pub fn new(config: GoogleOAuthConfig) -> anyhow::Result<Self> {
        let auth_url = Url::parse(&config.auth_url).context("parse GOOGLE_AUTH_URL")?;
        Url::parse(&config.token_url).context("parse GOOGLE_TOKEN_URL")?;
        Url::parse(&config.userinfo_url).context("parse GOOGLE_USERINFO_URL")?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("build http client")?;
        Ok(Self::with_client(config, auth_url, http))
    }

    fn with_client(config: GoogleOAuthConfig, auth_url: Url, http: reqwest::Client) -> Self {
        Self {
            http,
            config,
            auth_url,
        }
    }
}

#[derive(Deserialize)]
struct GoogleUserInfo {
    #[serde(default)]
    id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    name: String,
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn authorization_url(&self, state: &str) -> Url {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", GOOGLE_SCOPES)
            .append_pair("access_type", "online")
            .append_pair("state", state);
        url
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, ProviderError> {
        let resp = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.redirect_url.as_str()),
            ])
            .send()
            .await?;
        let tokens: TokenSet = error_for_status(resp).await?.json().await?;
        if tokens.access_token.is_empty() {
            return Err(ProviderError::MissingField("access_token"));
        }
        debug!(token_type = ?tokens.token_type, expires_in = ?tokens.expires_in, "google code exchanged");
        Ok(tokens)
    }

    async fn fetch_profile(&self, tokens: &TokenSet) -> Result<ProviderProfile, ProviderError> {
        let resp = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(&tokens.access_token)
            .send()
            .await?;
        let info: GoogleUserInfo = error_for_status(resp).await?.json().await?;
        if info.id.is_empty() {
            return Err(ProviderError::MissingField("id"));
        }
        if info.email.is_empty() {
            return Err(ProviderError::MissingField("email"));
        }
        Ok(ProviderProfile {
            external_id: info.id,
            email: info.email,
            display_name: info.name,
        })
    }
}

/// Query string the provider sends back to the callback.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: String,
}

#[derive(Debug)]
pub enum LinkOutcome {
    Linked(User),
    Created(User),
}

impl LinkOutcome {
    pub fn into_user(self) -> User {
        match self {
            LinkOutcome::Linked(u) | LinkOutcome::Created(u) => u,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("provider returned error `{0}`")]
    Denied(String),
    #[error("callback carried no authorization code")]
    MissingCode,
    #[error("state parameter missing, mismatched or expired")]
    InvalidState,
    #[error("could not generate state: {0}")]
    StateGeneration(#[from] SessionError),
    #[error("state store failed: {0}")]
    StateStore(RepoError),
    #[error("code exchange failed: {0}")]
    Exchange(ProviderError),
    #[error("profile fetch failed: {0}")]
    Profile(ProviderError),
    #[error("user lookup failed: {0}")]
    Lookup(RepoError),
    #[error("email is already registered to another account")]
    EmailConflict,
    #[error("user creation failed: {0}")]
    Create(RepoError),
}

impl OAuthError {
    /// Message safe to show on the login page.
    pub fn user_message(&self) -> &'static str {
        match self {
            OAuthError::Denied(_) => "Google login was cancelled",
            OAuthError::MissingCode => "Code not found",
            OAuthError::InvalidState => "Invalid OAuth state",
            OAuthError::StateGeneration(_) | OAuthError::StateStore(_) => {
                "Failed to start Google login"
            }
            OAuthError::Exchange(_) => "Failed to exchange token",
            OAuthError::Profile(_) => "Failed to get user info",
            OAuthError::Lookup(_) => "Failed to get user",
            OAuthError::EmailConflict => "Email already registered",
            OAuthError::Create(_) => "Failed to create user",
        }
    }
}

#[derive(Clone)]
pub struct OAuthLinker {
    provider: Arc<dyn IdentityProvider>,
    users: Arc<dyn UserRepository>,
    states: Arc<dyn OAuthStateRepository>,
}

impl OAuthLinker {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        users: Arc<dyn UserRepository>,
        states: Arc<dyn OAuthStateRepository>,
    ) -> Self {
        Self {
            provider,
            users,
            states,
        }
    }

    /// Issues a fresh single-use state and the URL to send the browser to.
    pub async fn begin(&self) -> Result<AuthorizationRequest, OAuthError> {
        let state = generate_token()?;
        self.states
            .insert(&state, OffsetDateTime::now_utc() + STATE_TTL)
            .await
            .map_err(OAuthError::StateStore)?;
        let url = self.provider.authorization_url(&state);
        Ok(AuthorizationRequest { url, state })
    }

    /// Deletes states whose flow was never completed.
    pub async fn purge_expired_states(&self) -> Result<u64, RepoError> {
        self.states.delete_expired().await
    }

    /// Verifies the callback and resolves the local user. `cookie_state` is
    /// the value the browser got from `begin`.
    pub async fn complete(
        &self,
        params: CallbackParams,
        cookie_state: Option<&str>,
    ) -> Result<LinkOutcome, OAuthError> {
        if let Some(err) = params.error {
            return Err(OAuthError::Denied(err));
        }
        self.verify_state(params.state.as_deref(), cookie_state)
            .await?;
        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or(OAuthError::MissingCode)?;

        let tokens = self
            .provider
            .exchange_code(&code)
            .await
            .map_err(OAuthError::Exchange)?;
        let profile = self
            .provider
            .fetch_profile(&tokens)
            .await
            .map_err(OAuthError::Profile)?;

        self.link_or_create(&profile).await
    }

    async fn verify_state(
        &self,
        returned: Option<&str>,
        cookie_state: Option<&str>,
    ) -> Result<(), OAuthError> {
        let returned = returned.filter(|s| !s.is_empty()).ok_or(OAuthError::InvalidState)?;
        if cookie_state != Some(returned) {
            warn!("oauth state does not match browser cookie");
            return Err(OAuthError::InvalidState);
        }
        let fresh = self
            .states
            .consume(returned)
            .await
            .map_err(OAuthError::StateStore)?;
        if !fresh {
            warn!("oauth state unknown or expired");
            return Err(OAuthError::InvalidState);
        }
        Ok(())
    }

    /// Finds the user owning this provider identity or creates one. An email
    /// that already belongs to another account is a conflict, never a merge.
    pub async fn link_or_create(&self, profile: &ProviderProfile) -> Result<LinkOutcome, OAuthError> {
        if let Some(user) = self
            .users
            .find_by_external_id(&profile.external_id)
            .await
            .map_err(OAuthError::Lookup)?
        {
            info!(user_id = user.id, "google identity linked to existing user");
            return Ok(LinkOutcome::Linked(user));
        }

        match self
            .users
            .create_from_provider(&profile.email, &profile.external_id, &profile.display_name)
            .await
        {
            Ok(user) => {
                info!(user_id = user.id, email = %user.email, "user created from google identity");
                Ok(LinkOutcome::Created(user))
            }
            Err(RepoError::EmailExists) => {
                warn!(email = %profile.email, "google email collides with existing account");
                Err(OAuthError::EmailConflict)
            }
            Err(e) => Err(OAuthError::Create(e)),
        }
    }
}
