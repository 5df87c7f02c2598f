use std::sync::Arc;

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::gmail::{
    oauth::{
        ClientCredentials, DEFAULT_REFRESH_BUFFER, OAuthError, OAuthTokens, TOKEN_ENDPOINT,
        TokenStore, refresh_tokens,
    },
    types::{ListMessagesResponse, Message, MessagePartBody},
};

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users";

#[derive(Debug, Error)]
pub enum GmailClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("token persistence error: {0}")]
    TokenStore(String),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unauthorized after refresh")]
    Unauthorized,
}

/// Read-only Gmail REST client for one mailbox. Refreshes the access token
/// ahead of expiry and once more on a 401.
pub struct GmailClient<S: TokenStore> {
    http: Client,
    user_id: String,
    credentials: ClientCredentials,
    api_base: String,
    token_endpoint: String,
    tokens: RwLock<OAuthTokens>,
    refresh_lock: Mutex<()>,
    token_store: Arc<S>,
}

impl<S: TokenStore> GmailClient<S> {
    pub fn new(
        http: Client,
        user_id: impl Into<String>,
        credentials: ClientCredentials,
        initial_tokens: OAuthTokens,
        token_store: Arc<S>,
    ) -> Self {
        Self {
            http,
            user_id: user_id.into(),
            credentials,
            api_base: DEFAULT_API_BASE.to_string(),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            tokens: RwLock::new(initial_tokens),
            refresh_lock: Mutex::new(()),
            token_store,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_token_endpoint(mut self, token_endpoint: impl Into<String>) -> Self {
        self.token_endpoint = token_endpoint.into();
        self
    }

    /// One page of message ids matching `query` (Gmail search syntax).
    pub async fn list_messages(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<ListMessagesResponse, GmailClientError> {
        let url = format!("{}/{}/messages", self.api_base, self.user_id);
        self.send_json(|| {
            let mut builder = self.http.get(&url);
            if let Some(q) = query {
                builder = builder.query(&[("q", q)]);
            }
            if let Some(token) = page_token {
                builder = builder.query(&[("pageToken", token)]);
            }
            if let Some(max) = max_results {
                builder = builder.query(&[("maxResults", max)]);
            }
            builder
        })
        .await
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Message, GmailClientError> {
        let url = format!("{}/{}/messages/{}", self.api_base, self.user_id, message_id);
        self.send_json(|| self.http.get(&url).query(&[("format", "full")]))
            .await
    }

    pub async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<MessagePartBody, GmailClientError> {
        let url = format!(
            "{}/{}/messages/{}/attachments/{}",
            self.api_base, self.user_id, message_id, attachment_id
        );
        self.send_json(|| self.http.get(&url)).await
    }

    async fn send_json<T, B>(&self, build: B) -> Result<T, GmailClientError>
    where
        T: DeserializeOwned,
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let response = self.perform_authenticated(build).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn perform_authenticated<B>(
        &self,
        build: B,
    ) -> Result<reqwest::Response, GmailClientError>
    where
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let tokens = self.current_tokens(false).await?;
        let mut response = build().bearer_auth(&tokens.access_token).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let tokens = self.current_tokens(true).await?;
            response = build().bearer_auth(&tokens.access_token).send().await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(GmailClientError::Unauthorized);
            }
        }

        Ok(response.error_for_status()?)
    }

    /// Returns usable tokens, refreshing under a lock so concurrent requests
    /// trigger one refresh between them.
    async fn current_tokens(&self, force_refresh: bool) -> Result<OAuthTokens, GmailClientError> {
        let fresh_enough =
            |tokens: &OAuthTokens| !force_refresh && !tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER);

        {
            let tokens = self.tokens.read().await;
            if fresh_enough(&tokens) {
                return Ok(tokens.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;
        let current = self.tokens.read().await.clone();
        if fresh_enough(&current) {
            return Ok(current);
        }

        let refreshed = refresh_tokens(
            &self.http,
            &self.credentials,
            &current,
            &self.token_endpoint,
        )
        .await?;
        *self.tokens.write().await = refreshed.clone();

        self.token_store
            .save_tokens(&refreshed)
            .await
            .map_err(|err| GmailClientError::TokenStore(err.to_string()))?;

        Ok(refreshed)
    }
}
