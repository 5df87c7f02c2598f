use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::accounts::{Account, AccountConfig, AccountRepository};
use crate::config::SyncConfig;
use crate::db::Database;
use crate::gmail::GmailProvider;
use crate::messages::{AttachmentRef, NewEmailMessage};

use super::cursor_time;

/// A message as handed over by a provider, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub remote_id: String,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<AttachmentRef>,
}

impl From<RawMessage> for NewEmailMessage {
    fn from(raw: RawMessage) -> Self {
        NewEmailMessage {
            remote_id: raw.remote_id,
            from_email: raw.from_email,
            from_name: raw.from_name,
            subject: raw.subject,
            body_text: raw.body_text,
            received_at: raw.received_at,
            attachments: raw.attachments,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network hiccup, rate limit, or server error. Worth retrying.
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("permanent provider error: {0}")]
    Permanent(String),
    #[error("not found at provider: {0}")]
    NotFound(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Messages received strictly after `cursor`, oldest first.
    async fn fetch_since(&self, cursor: Option<&str>) -> Result<Vec<RawMessage>, ProviderError>;

    async fn fetch_attachment(
        &self,
        remote_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError>;
}

/// Maps an account to the provider that serves its mailbox.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    async fn resolve(&self, account: &Account) -> Result<Arc<dyn MailProvider>, ProviderError>;
}

/// Builds Gmail providers from stored credentials and serves `static`
/// accounts from registered in-memory mailboxes.
#[derive(Clone)]
pub struct AccountProviderResolver {
    http: Client,
    accounts: AccountRepository,
    gmail_api_base: Option<String>,
    gmail_token_endpoint: Option<String>,
    statics: Arc<RwLock<HashMap<String, Arc<StaticMailProvider>>>>,
}

impl AccountProviderResolver {
    pub fn new(db: Database, config: &SyncConfig) -> Self {
        Self {
            http: Client::new(),
            accounts: AccountRepository::new(db),
            gmail_api_base: config.gmail_api_base.clone(),
            gmail_token_endpoint: config.gmail_token_endpoint.clone(),
            statics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register_static(&self, account_id: impl Into<String>, provider: StaticMailProvider) {
        self.statics
            .write()
            .await
            .insert(account_id.into(), Arc::new(provider));
    }
}

#[async_trait]
impl ProviderResolver for AccountProviderResolver {
    async fn resolve(&self, account: &Account) -> Result<Arc<dyn MailProvider>, ProviderError> {
        match &account.config {
            AccountConfig::Gmail {
                client_id,
                client_secret,
                oauth,
            } => {
                let mut provider = GmailProvider::new(
                    self.http.clone(),
                    account.id.clone(),
                    client_id.clone(),
                    client_secret.clone(),
                    oauth.clone(),
                    self.accounts.clone(),
                );
                if let Some(base) = &self.gmail_api_base {
                    provider = provider.with_api_base(base.clone());
                }
                if let Some(endpoint) = &self.gmail_token_endpoint {
                    provider = provider.with_token_endpoint(endpoint.clone());
                }
                Ok(Arc::new(provider))
            }
            AccountConfig::Static => {
                let registered = self.statics.read().await.get(&account.id).cloned();
                Ok(registered.unwrap_or_default() as Arc<dyn MailProvider>)
            }
        }
    }
}

#[derive(Debug, Default)]
struct StaticMailbox {
    messages: Vec<RawMessage>,
    attachments: HashMap<(String, String), Vec<u8>>,
    failures: VecDeque<ProviderError>,
    fetch_delay: Option<Duration>,
}

/// In-memory mailbox. Failures can be scripted ahead of fetches.
#[derive(Debug, Default, Clone)]
pub struct StaticMailProvider {
    mailbox: Arc<Mutex<StaticMailbox>>,
    fetch_calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl StaticMailProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_message(&self, message: RawMessage) {
        self.mailbox.lock().await.messages.push(message);
    }

    pub async fn add_attachment(
        &self,
        remote_id: impl Into<String>,
        attachment_id: impl Into<String>,
        bytes: Vec<u8>,
    ) {
        self.mailbox
            .lock()
            .await
            .attachments
            .insert((remote_id.into(), attachment_id.into()), bytes);
    }

    /// The next fetch fails with `error` instead of reading the mailbox.
    pub async fn fail_next(&self, error: ProviderError) {
        self.mailbox.lock().await.failures.push_back(error);
    }

    /// Every fetch sleeps this long before answering.
    pub async fn set_fetch_delay(&self, delay: Duration) {
        self.mailbox.lock().await.fetch_delay = Some(delay);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Most fetches that were running at the same time, across clones.
    pub fn peak_concurrent_fetches(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailProvider for StaticMailProvider {
    async fn fetch_since(&self, cursor: Option<&str>) -> Result<Vec<RawMessage>, ProviderError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let _in_flight = InFlight(self.in_flight.clone());

        let delay = {
            let mut mailbox = self.mailbox.lock().await;
            if let Some(err) = mailbox.failures.pop_front() {
                return Err(err);
            }
            mailbox.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let after = cursor_time(cursor);
        let mailbox = self.mailbox.lock().await;
        let mut messages: Vec<RawMessage> = mailbox
            .messages
            .iter()
            .filter(|m| after.is_none_or(|after| m.received_at > after))
            .cloned()
            .collect();
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
        self.mailbox
            .lock()
            .await
            .attachments
            .get(&(remote_id.to_string(), attachment_id.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("{remote_id}/{attachment_id}")))
    }
}
