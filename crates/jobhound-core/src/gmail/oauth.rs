use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accounts::{AccountConfig, AccountError, AccountRepository};

pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::minutes(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl OAuthTokens {
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now + buffer >= self.expires_at
    }
}

/// OAuth client registration used for the refresh grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("missing refresh token")]
    MissingRefreshToken,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error("invalid expires_in value: {0}")]
    InvalidExpires(i64),
}

impl OAuthError {
    /// 4xx from the token endpoint means the grant itself was rejected.
    pub fn is_revoked(&self) -> bool {
        matches!(self, OAuthError::MissingRefreshToken)
            || matches!(self, OAuthError::TokenEndpoint { status, .. } if (400..500).contains(status))
    }
}

/// Where refreshed tokens are written back to.
#[async_trait]
pub trait TokenStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error>;
}

/// Persists refreshed tokens into the account's stored Gmail config.
#[derive(Clone)]
pub struct AccountTokenStore {
    accounts: AccountRepository,
    account_id: String,
}

impl AccountTokenStore {
    pub fn new(accounts: AccountRepository, account_id: impl Into<String>) -> Self {
        Self {
            accounts,
            account_id: account_id.into(),
        }
    }
}

#[async_trait]
impl TokenStore for AccountTokenStore {
    type Error = AccountError;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error> {
        let account = self.accounts.get_by_id(&self.account_id).await?;
        let config = match account.config {
            AccountConfig::Gmail {
                client_id,
                client_secret,
                ..
            } => AccountConfig::Gmail {
                client_id,
                client_secret,
                oauth: tokens.clone(),
            },
            other => other,
        };
        self.accounts
            .update_config(&self.account_id, &config, None)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl RefreshResponse {
    /// Google omits `refresh_token` when the old one stays valid.
    fn into_tokens(self, previous: &OAuthTokens) -> Result<OAuthTokens, OAuthError> {
        if self.expires_in <= 0 {
            return Err(OAuthError::InvalidExpires(self.expires_in));
        }
        Ok(OAuthTokens {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .unwrap_or_else(|| previous.refresh_token.clone()),
            expires_at: Utc::now() + Duration::seconds(self.expires_in),
        })
    }
}

/// Exchanges the refresh token for a new access token.
pub async fn refresh_tokens(
    http: &reqwest::Client,
    credentials: &ClientCredentials,
    tokens: &OAuthTokens,
    endpoint: &str,
) -> Result<OAuthTokens, OAuthError> {
    if tokens.refresh_token.is_empty() {
        return Err(OAuthError::MissingRefreshToken);
    }

    let response = http
        .post(endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", tokens.refresh_token.as_str()),
        ])
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(OAuthError::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }

    serde_json::from_str::<RefreshResponse>(&body)?.into_tokens(tokens)
}
