//! Twitch OAuth token lifecycle (§4.10).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::twitch::token_store::{PersistedTokens, TokenStore};

const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const VALIDATE_INTERVAL: Duration = Duration::from_secs(15 * 60);
const REFRESH_ERROR_RETRY: Duration = Duration::from_secs(60);
const REFRESH_MARGIN: ChronoDuration = ChronoDuration::minutes(5);

/// Scope a subscription declared as required that the current token lacks. `user:read:chat` is
/// escalated to an error because chat-driven features silently degrade without it (§4.10).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScopeCheckSeverity {
    /// A normal missing-scope warning.
    Warning,
    /// `user:read:chat` specifically absent.
    Error,
}

/// Current validated state of the OAuth token, as last confirmed with Twitch.
#[derive(Clone, Debug)]
pub struct TokenState {
    /// Current access token.
    pub access_token: String,
    /// Current refresh token.
    pub refresh_token: String,
    /// Authorized user id, once validated at least once.
    pub user_id: Option<String>,
    /// Client id the token was issued to.
    pub client_id: Option<String>,
    /// Login name of the authorized user.
    pub login: Option<String>,
    /// Scopes granted to `access_token`.
    pub scopes: Vec<String>,
    /// Absolute expiry.
    pub expires_at: DateTime<Utc>,
}

impl TokenState {
    /// Whether every scope in `required` is present.
    #[must_use]
    pub fn has_scopes(&self, required: &[&str]) -> bool {
        required.iter().all(|r| self.scopes.iter().any(|s| s == r))
    }

    /// Whether this token is within the refresh buffer (§3 "treated as *expired* when
    /// `now ≥ expires_at − refresh_buffer`"), meaning a refresh should fire immediately rather
    /// than waiting for the next scheduled validate.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.expires_at - Utc::now() <= REFRESH_MARGIN
    }

    /// Check a subscription's required scopes, flagging `user:read:chat` absence as an error.
    #[must_use]
    pub fn check_scopes(&self, required: &[&str]) -> Option<(ScopeCheckSeverity, Vec<String>)> {
        let missing: Vec<String> = required.iter().filter(|r| !self.scopes.iter().any(|s| s == *r)).map(|s| (*s).to_owned()).collect();
        if missing.is_empty() {
            return None;
        }
        let severity = if missing.iter().any(|s| s == "user:read:chat") {
            ScopeCheckSeverity::Error
        } else {
            ScopeCheckSeverity::Warning
        };
        Some((severity, missing))
    }
}

#[derive(Deserialize)]
struct ValidateResponse {
    user_id: String,
    client_id: String,
    login: String,
    #[serde(default)]
    scopes: Vec<String>,
    expires_in: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

/// Errors surfaced by the token manager.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No token has ever been loaded from the store or set explicitly.
    #[error("no oauth token available")]
    NoToken,
    /// The validate endpoint reported the token invalid (401).
    #[error("access token invalid")]
    InvalidToken,
    /// Refresh failed.
    #[error("refresh failed: {0}")]
    RefreshFailed(String),
    /// Transport-level failure talking to Twitch.
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

impl Error {
    /// Bucket this error for dashboard-facing reporting (§7).
    #[must_use]
    pub fn kind(&self) -> crate::error::ErrorKind {
        use crate::error::ErrorKind;
        match self {
            Self::NoToken | Self::InvalidToken | Self::RefreshFailed(_) => ErrorKind::Auth,
            Self::Request(_) => ErrorKind::Transient,
        }
    }
}

/// Drives validate/refresh against Twitch's OAuth endpoints, coalescing concurrent triggers and
/// persisting every successful refresh to a [`TokenStore`].
pub struct TokenManager {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    store: Arc<dyn TokenStore>,
    state: watch::Sender<Option<TokenState>>,
    validate_lock: Mutex<()>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    /// Load any persisted token and start the periodic validate/refresh loops.
    pub async fn start(
        http: reqwest::Client,
        client_id: String,
        client_secret: String,
        store: Arc<dyn TokenStore>,
    ) -> (Arc<Self>, watch::Receiver<Option<TokenState>>) {
        let (tx, rx) = watch::channel(None);
        let manager = Arc::new(Self {
            http,
            client_id,
            client_secret,
            store,
            state: tx,
            validate_lock: Mutex::new(()),
            refresh_lock: Mutex::new(()),
        });

        if let Ok(Some(persisted)) = manager.store.load().await {
            manager.state.send_replace(Some(TokenState {
                access_token: persisted.access_token,
                refresh_token: persisted.refresh_token,
                user_id: None,
                client_id: None,
                login: None,
                scopes: persisted.scopes.unwrap_or_default(),
                expires_at: persisted.expires_at,
            }));
        }

        let validator = manager.clone();
        tokio::spawn(async move { validator.run_validate_loop().await });

        (manager, rx)
    }

    /// Current validated token state, if any.
    pub fn current(&self) -> Option<TokenState> {
        self.state.borrow().clone()
    }

    async fn run_validate_loop(self: Arc<Self>) {
        loop {
            match self.validate().await {
                Ok(state) if state.needs_refresh() => {
                    info!("token validated within the refresh buffer; refreshing immediately");
                    if let Err(e) = self.refresh().await {
                        error!(error = %e, "twitch token refresh failed after near-expiry validate");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "twitch token validate failed");
                    if matches!(e, Error::InvalidToken) {
                        if let Err(e) = self.refresh().await {
                            error!(error = %e, "twitch token refresh failed after invalid validate");
                        }
                    }
                }
            }
            tokio::time::sleep(VALIDATE_INTERVAL).await;
        }
    }

    /// Validate the current access token against Twitch, updating `user_id`/`scopes`/`expires_at`
    /// on success. At most one validation runs at a time; concurrent callers wait for it.
    pub async fn validate(&self) -> Result<TokenState, Error> {
        let _guard = self.validate_lock.lock().await;

        let Some(current) = self.current() else { return Err(Error::NoToken) };

        let response = self
            .http
            .get(VALIDATE_URL)
            .header("Authorization", format!("OAuth {}", current.access_token))
            .send()
            .await?;

        if response.status().as_u16() == 401 {
            return Err(Error::InvalidToken);
        }
        let body: ValidateResponse = response.error_for_status()?.json().await?;

        let updated = TokenState {
            access_token: current.access_token,
            refresh_token: current.refresh_token,
            user_id: Some(body.user_id.clone()),
            client_id: Some(body.client_id),
            login: Some(body.login),
            scopes: body.scopes,
            expires_at: Utc::now() + ChronoDuration::seconds(body.expires_in),
        };
        info!(user_id = %body.user_id, expires_in = body.expires_in, "twitch token validated");
        self.state.send_replace(Some(updated.clone()));
        Ok(updated)
    }

    /// Refresh the access token. At most one refresh runs at a time; a failure schedules the
    /// caller to retry in 60 s rather than retrying here, matching §4.10's stated cadence.
    pub async fn refresh(self: &Arc<Self>) -> Result<TokenState, Error> {
        let _guard = self.refresh_lock.lock().await;

        let Some(current) = self.current() else { return Err(Error::NoToken) };

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", current.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self.http.post(TOKEN_URL).form(&params).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(REFRESH_ERROR_RETRY).await;
                if let Err(e) = this.refresh().await {
                    warn!(error = %e, "scheduled twitch token refresh retry failed");
                }
            });
            return Err(Error::RefreshFailed(format!("{status} {body}")));
        }

        let body: TokenResponse = response.json().await?;
        let expires_at = Utc::now() + ChronoDuration::seconds(body.expires_in);

        self.store
            .save(&PersistedTokens {
                access_token: body.access_token.clone(),
                refresh_token: body.refresh_token.clone(),
                expires_at,
                scopes: Some(current.scopes.clone()),
            })
            .await
            .map_err(|e| Error::RefreshFailed(e.to_string()))?;

        let updated = TokenState {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            user_id: current.user_id,
            client_id: current.client_id,
            login: current.login,
            scopes: current.scopes,
            expires_at,
        };
        info!(expires_at = %expires_at, "twitch token refreshed");
        self.state.send_replace(Some(updated.clone()));

        let next_refresh = (expires_at - REFRESH_MARGIN - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(next_refresh).await;
            if let Err(e) = this.refresh().await {
                warn!(error = %e, "scheduled twitch token refresh failed");
            }
        });

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(scopes: Vec<&str>) -> TokenState {
        TokenState {
            access_token: "at".to_owned(),
            refresh_token: "rt".to_owned(),
            user_id: Some("1".to_owned()),
            client_id: Some("c".to_owned()),
            login: Some("user".to_owned()),
            scopes: scopes.into_iter().map(str::to_owned).collect(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn has_scopes_requires_every_scope_present() {
        let t = token(vec!["channel:read:subscriptions", "bits:read"]);
        assert!(t.has_scopes(&["bits:read"]));
        assert!(!t.has_scopes(&["user:read:chat"]));
    }

    #[test]
    fn check_scopes_escalates_missing_read_chat_to_error() {
        let t = token(vec!["bits:read"]);
        let (severity, missing) = t.check_scopes(&["user:read:chat"]).unwrap();
        assert_eq!(severity, ScopeCheckSeverity::Error);
        assert_eq!(missing, vec!["user:read:chat".to_owned()]);
    }

    #[test]
    fn check_scopes_is_a_plain_warning_otherwise() {
        let t = token(vec!["bits:read"]);
        let (severity, _) = t.check_scopes(&["channel:read:subscriptions"]).unwrap();
        assert_eq!(severity, ScopeCheckSeverity::Warning);
    }

    #[test]
    fn check_scopes_returns_none_when_satisfied() {
        let t = token(vec!["bits:read"]);
        assert!(t.check_scopes(&["bits:read"]).is_none());
    }

    #[test]
    fn needs_refresh_when_inside_the_buffer() {
        let mut t = token(vec!["bits:read"]);
        t.expires_at = Utc::now() + ChronoDuration::minutes(2);
        assert!(t.needs_refresh());
    }

    #[test]
    fn does_not_need_refresh_well_before_expiry() {
        let mut t = token(vec!["bits:read"]);
        t.expires_at = Utc::now() + ChronoDuration::hours(1);
        assert!(!t.needs_refresh());
    }
}
