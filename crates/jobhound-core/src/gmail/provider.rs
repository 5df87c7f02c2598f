use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::accounts::AccountRepository;
use crate::sync::{MailProvider, ProviderError, RawMessage, cursor_time};

use super::client::{GmailClient, GmailClientError};
use super::oauth::{AccountTokenStore, ClientCredentials, OAuthTokens};
use super::parser::{decode_base64, to_raw_message};

const PAGE_SIZE: u32 = 100;

/// Gmail mailbox of one stored account. Refreshed tokens are written back to
/// the account's config.
pub struct GmailProvider {
    client: GmailClient<AccountTokenStore>,
}

impl GmailProvider {
    pub fn new(
        http: Client,
        account_id: String,
        client_id: String,
        client_secret: String,
        tokens: OAuthTokens,
        accounts: AccountRepository,
    ) -> Self {
        let store = Arc::new(AccountTokenStore::new(accounts, account_id));
        Self {
            client: GmailClient::new(
                http,
                "me",
                ClientCredentials {
                    client_id,
                    client_secret,
                },
                tokens,
                store,
            ),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.client = self.client.with_api_base(api_base);
        self
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.client = self.client.with_token_endpoint(endpoint);
        self
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    async fn fetch_since(&self, cursor: Option<&str>) -> Result<Vec<RawMessage>, ProviderError> {
        // `after:` has one-second resolution; the sync worker drops repeats.
        let query = cursor_time(cursor).map(|after| format!("after:{}", after.timestamp()));

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_messages(query.as_deref(), page_token.as_deref(), Some(PAGE_SIZE))
                .await
                .map_err(|err| map_gmail_error("list messages", err))?;
            ids.extend(page.messages.into_iter().map(|m| m.id));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!(count = ids.len(), "gmail listed messages");

        let fetched_at = Utc::now();
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let message = self
                .client
                .get_message(&id)
                .await
                .map_err(|err| map_gmail_error("get message", err))?;
            messages.push(to_raw_message(&message, fetched_at));
        }
        messages.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.remote_id.cmp(&b.remote_id))
        });
        Ok(messages)
    }

    async fn fetch_attachment(
        &self,
        remote_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let body = self
            .client
            .get_attachment(remote_id, attachment_id)
            .await
            .map_err(|err| map_gmail_error("get attachment", err))?;
        let data = body
            .data
            .ok_or_else(|| ProviderError::Permanent("attachment has no data".into()))?;
        decode_base64(&data)
            .ok_or_else(|| ProviderError::Permanent("attachment data is not base64".into()))
    }
}

/// Rate limits, auth hiccups, server errors and network failures are worth
/// retrying; anything else is not.
pub(crate) fn map_gmail_error(context: &str, err: GmailClientError) -> ProviderError {
    match err {
        GmailClientError::Unauthorized => {
            ProviderError::Transient(format!("{context}: unauthorized"))
        }
        GmailClientError::Http(http_err) => match http_err.status() {
            Some(StatusCode::NOT_FOUND) => {
                ProviderError::NotFound(format!("{context}: resource not found (404)"))
            }
            Some(status @ (StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN)) => {
                // 403 is how Gmail reports userRateLimitExceeded.
                ProviderError::Transient(format!("{context}: rate limited ({status})"))
            }
            Some(StatusCode::UNAUTHORIZED) => {
                ProviderError::Transient(format!("{context}: unauthorized (401)"))
            }
            Some(status) if status.is_server_error() => {
                ProviderError::Transient(format!("{context}: server error {status}"))
            }
            Some(status) => ProviderError::Permanent(format!("{context}: http status {status}")),
            None => ProviderError::Transient(format!("{context}: network error {http_err}")),
        },
        GmailClientError::OAuth(err) if err.is_revoked() => {
            ProviderError::Permanent(format!("{context}: oauth grant rejected: {err}"))
        }
        GmailClientError::OAuth(err) => {
            ProviderError::Transient(format!("{context}: oauth error {err}"))
        }
        GmailClientError::TokenStore(err) => ProviderError::Permanent(format!("{context}: {err}")),
        GmailClientError::Decode(err) => ProviderError::Permanent(format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountConfig;
    use crate::db::Database;
    use crate::migrations::run_migrations;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn provider(server: &MockServer) -> (GmailProvider, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("db.sqlite"))
            .await
            .expect("db");
        run_migrations(&db).await.expect("migrations");
        let tokens = OAuthTokens {
            access_token: "token".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        let accounts = AccountRepository::new(db);
        let account = accounts
            .create(
                "me@gmail.test",
                None,
                AccountConfig::Gmail {
                    client_id: "c".into(),
                    client_secret: "s".into(),
                    oauth: tokens.clone(),
                },
            )
            .await
            .expect("account");

        let provider = GmailProvider::new(
            Client::new(),
            account.id,
            "c".into(),
            "s".into(),
            tokens,
            accounts,
        )
        .with_api_base(format!("{}/gmail/v1/users", server.uri()))
        .with_token_endpoint(format!("{}/token", server.uri()));
        (provider, dir)
    }

    fn gmail_message(id: &str, subject: &str, internal_ms: i64) -> serde_json::Value {
        json!({
            "id": id,
            "internalDate": internal_ms.to_string(),
            "payload": {
                "mimeType": "text/plain",
                "headers": [
                    {"name": "From", "value": "Acme HR <hr@acme.test>"},
                    {"name": "Subject", "value": subject}
                ],
                "body": {"size": 5, "data": URL_SAFE_NO_PAD.encode("hello")}
            }
        })
    }

    #[tokio::test]
    async fn fetch_since_follows_pages_and_orders_by_time() {
        let server = MockServer::start().await;
        let cursor_at = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
        let after = format!("after:{}", cursor_at.timestamp());
        let base_ms = cursor_at.timestamp_millis();

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("q", after.as_str()))
            .and(query_param("pageToken", "next"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"messages": [{"id": "older"}]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("q", after.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{"id": "newer"}],
                "nextPageToken": "next"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/newer"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(gmail_message("newer", "Interview", base_ms + 120_000)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/older"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(gmail_message("older", "Newsletter", base_ms + 60_000)),
            )
            .mount(&server)
            .await;

        let (provider, _dir) = provider(&server).await;
        let cursor = crate::sync::cursor_for(cursor_at);
        let messages = provider.fetch_since(Some(&cursor)).await.expect("fetch");

        let ids: Vec<&str> = messages.iter().map(|m| m.remote_id.as_str()).collect();
        assert_eq!(ids, vec!["older", "newer"]);
        assert_eq!(messages[1].subject.as_deref(), Some("Interview"));
        assert_eq!(messages[1].body_text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_404_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m1/attachments/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (provider, _dir) = provider(&server).await;
        assert!(provider.fetch_since(None).await.expect_err("503").is_transient());
        assert!(matches!(
            provider.fetch_attachment("m1", "gone").await,
            Err(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn bad_request_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let (provider, _dir) = provider(&server).await;
        assert!(matches!(
            provider.fetch_since(None).await,
            Err(ProviderError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn attachment_bytes_are_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m1/attachments/a1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "size": 3,
                "data": URL_SAFE_NO_PAD.encode("pdf")
            })))
            .mount(&server)
            .await;

        let (provider, _dir) = provider(&server).await;
        assert_eq!(
            provider.fetch_attachment("m1", "a1").await.expect("bytes"),
            b"pdf".to_vec()
        );
    }
}
