use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use libsql::TransactionBehavior;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::accounts::{Account, AccountError, AccountRepository, AccountState, write_state};
use crate::allocation::{AllocationError, classify_pending};
use crate::backoff::backoff_with_jitter;
use crate::bus::{CoreEvent, EventBus};
use crate::calendar::{CalendarRepository, NewCompanyEvent};
use crate::config::SyncConfig;
use crate::db::{Database, DbError};
use crate::error::ErrorKind;
use crate::extraction::EventExtractor;
use crate::messages::{InsertOutcome, MessageError, MessageRepository, insert_if_new};
use crate::patterns::{PatternError, PatternRepository};

use super::provider::{MailProvider, ProviderError, ProviderResolver, RawMessage};
use super::{SyncState, cursor_for, cursor_time};

const MAX_FETCH_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("sync already running for account {0}")]
    InProgress(String),
    #[error("account {0} is disabled")]
    Disabled(String),
    #[error("sync task for account {0} panicked")]
    Panicked(String),
    #[error("attachment {attachment_id} not found on message {message_id}")]
    AttachmentNotFound {
        message_id: String,
        attachment_id: String,
    },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Account(err) => err.kind(),
            SyncError::Message(err) => err.kind(),
            SyncError::Pattern(err) => err.kind(),
            SyncError::Allocation(err) => err.kind(),
            SyncError::Provider(ProviderError::Transient(_)) => ErrorKind::TransientIo,
            SyncError::Provider(ProviderError::Permanent(_)) => ErrorKind::Validation,
            SyncError::Provider(ProviderError::NotFound(_)) => ErrorKind::NotFound,
            SyncError::AttachmentNotFound { .. } => ErrorKind::NotFound,
            SyncError::InProgress(_) => ErrorKind::Conflict,
            SyncError::Disabled(_) => ErrorKind::Validation,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub account_id: String,
    pub fetched: usize,
    pub inserted: usize,
    pub allocated: usize,
    pub cursor: Option<String>,
}

/// Pulls new mail for an account, stores it, and classifies it.
///
/// Insert, classification and the cursor advance commit in one transaction, so
/// an interrupted run leaves either the whole batch or nothing behind.
#[derive(Clone)]
pub struct SyncWorker {
    db: Database,
    accounts: AccountRepository,
    messages: MessageRepository,
    patterns: PatternRepository,
    calendar: CalendarRepository,
    resolver: Arc<dyn ProviderResolver>,
    extractor: Option<Arc<dyn EventExtractor>>,
    extraction_template: String,
    bus: EventBus,
    config: SyncConfig,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SyncWorker {
    pub fn new(
        db: Database,
        resolver: Arc<dyn ProviderResolver>,
        bus: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            accounts: AccountRepository::new(db.clone()),
            messages: MessageRepository::new(db.clone()),
            patterns: PatternRepository::new(db.clone()),
            calendar: CalendarRepository::new(db.clone()),
            db,
            resolver,
            extractor: None,
            extraction_template: "interview".to_string(),
            bus,
            config,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_extractor(
        mut self,
        extractor: Arc<dyn EventExtractor>,
        template: impl Into<String>,
    ) -> Self {
        self.extractor = Some(extractor);
        self.extraction_template = template.into();
        self
    }

    /// Runs one sync for the account. A second call while one is running gets
    /// `InProgress` rather than queueing behind it.
    #[instrument(skip(self))]
    pub async fn sync_account(&self, account_id: &str) -> Result<SyncReport, SyncError> {
        let account = self.accounts.get_by_id(account_id).await?;
        if !account.enabled {
            return Err(SyncError::Disabled(account.id));
        }

        let lock = self.lock_for(account_id).await;
        let Ok(_guard) = lock.try_lock() else {
            return Err(SyncError::InProgress(account_id.to_string()));
        };

        let mut state = account.state.clone();
        match self.run(&account, &mut state).await {
            Ok(report) => {
                state.sync_state = SyncState::Idle;
                self.record_state(&account.id, &state, None).await;
                Ok(report)
            }
            Err(err) => {
                warn!(error = %err, "sync failed; cursor left in place");
                state.sync_state = SyncState::Error;
                state.last_error = Some(err.to_string());
                self.record_state(&account.id, &state, Some(err.to_string()))
                    .await;
                state.sync_state = SyncState::Idle;
                self.record_state(&account.id, &state, None).await;
                Err(err)
            }
        }
    }

    /// Syncs every enabled account, at most `max_concurrent_accounts` at a time.
    /// One account failing never stops the others.
    pub async fn sync_all(&self) -> Result<Vec<(String, Result<SyncReport, SyncError>)>, SyncError> {
        let accounts = self.accounts.list_enabled().await?;
        let limit = self.config.max_concurrent_accounts.max(1);

        let results = futures::stream::iter(accounts)
            .map(|account| async move {
                let outcome = AssertUnwindSafe(self.sync_account(&account.id))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(SyncError::Panicked(account.id.clone())));
                (account.id, outcome)
            })
            .buffer_unordered(limit)
            .collect::<Vec<_>>()
            .await;
        Ok(results)
    }

    /// Downloads an attachment after checking the message belongs to the account.
    pub async fn fetch_attachment(
        &self,
        account_id: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, SyncError> {
        let message = self.messages.get(message_id).await?;
        if message.account_id != account_id {
            return Err(MessageError::NotFound(message_id.to_string()).into());
        }
        if !message
            .attachments
            .iter()
            .any(|a| a.attachment_id == attachment_id)
        {
            return Err(SyncError::AttachmentNotFound {
                message_id: message_id.to_string(),
                attachment_id: attachment_id.to_string(),
            });
        }

        let account = self.accounts.get_by_id(account_id).await?;
        let provider = self.resolver.resolve(&account).await?;
        Ok(provider
            .fetch_attachment(&message.remote_id, attachment_id)
            .await?)
    }

    /// Same as [`Self::fetch_attachment`], with the account taken from the message.
    pub async fn fetch_message_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, SyncError> {
        let message = self.messages.get(message_id).await?;
        self.fetch_attachment(&message.account_id, message_id, attachment_id)
            .await
    }

    async fn run(
        &self,
        account: &Account,
        state: &mut AccountState,
    ) -> Result<SyncReport, SyncError> {
        state.sync_state = SyncState::Fetching;
        self.record_state(&account.id, state, None).await;

        let provider = self.resolver.resolve(account).await?;
        let cursor = state.cursor.clone();
        let mut batch = self.fetch_with_retry(provider.as_ref(), cursor.as_deref()).await?;

        // Providers with coarse time filters may repeat the cursor message.
        let after = cursor_time(cursor.as_deref());
        batch.retain(|m| after.is_none_or(|after| m.received_at > after));
        batch.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.remote_id.cmp(&b.remote_id))
        });
        let fetched = batch.len();
        let new_cursor = batch
            .iter()
            .map(|m| m.received_at)
            .max()
            .map(cursor_for)
            .or(cursor);

        state.sync_state = SyncState::Classifying;
        self.bus.publish(CoreEvent::SyncStateChanged {
            account_id: account.id.clone(),
            state: SyncState::Classifying,
            detail: Some(format!("{fetched} fetched")),
        });

        let set = self.patterns.load_pattern_set().await?;
        let conn = self.db.connection().await?;
        // Take the write lock up front; a deferred transaction that reads
        // first can fail to upgrade while another account commits.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;

        let mut inserted = 0;
        for raw in batch {
            if let InsertOutcome::Inserted(_) = insert_if_new(&tx, &account.id, &raw.into()).await? {
                inserted += 1;
            }
        }

        // Covers this batch plus anything a previous interrupted run inserted.
        let allocations = classify_pending(&tx, &account.id, &set).await?;

        let committed = AccountState {
            cursor: new_cursor.clone(),
            last_sync_at: Some(Utc::now()),
            sync_state: SyncState::Committed,
            last_error: None,
        };
        write_state(&tx, &account.id, &committed).await?;
        tx.commit().await?;
        *state = committed;

        info!(
            fetched,
            inserted,
            allocated = allocations.len(),
            cursor = new_cursor.as_deref().unwrap_or(""),
            "sync batch committed"
        );
        self.bus.publish(CoreEvent::SyncStateChanged {
            account_id: account.id.clone(),
            state: SyncState::Committed,
            detail: None,
        });
        for (message_id, company_id) in &allocations {
            self.bus.publish(CoreEvent::MessageAllocated {
                message_id: message_id.clone(),
                company_id: Some(company_id.clone()),
                manual: false,
            });
        }

        self.enrich(&allocations).await;

        Ok(SyncReport {
            account_id: account.id.clone(),
            fetched,
            inserted,
            allocated: allocations.len(),
            cursor: new_cursor,
        })
    }

    async fn fetch_with_retry(
        &self,
        provider: &dyn MailProvider,
        cursor: Option<&str>,
    ) -> Result<Vec<RawMessage>, SyncError> {
        let attempts = self.config.fetch_attempts.max(1);
        let base = Duration::from_millis(self.config.fetch_retry_base_ms);
        let mut attempt = 1;
        loop {
            match provider.fetch_since(cursor).await {
                Ok(batch) => return Ok(batch),
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = backoff_with_jitter(base, MAX_FETCH_BACKOFF, attempt);
                    debug!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Offers newly allocated messages to the extractor. Never fails the sync.
    async fn enrich(&self, allocations: &[(String, String)]) {
        let Some(extractor) = &self.extractor else {
            return;
        };

        for (message_id, company_id) in allocations {
            let message = match self.messages.get(message_id).await {
                Ok(message) => message,
                Err(err) => {
                    warn!(message_id, error = %err, "could not load message for extraction");
                    continue;
                }
            };
            let Some(body) = message.body_text.as_deref().filter(|b| !b.trim().is_empty()) else {
                continue;
            };

            match extractor.extract_event(body, &self.extraction_template).await {
                Ok(Some(event)) => {
                    let stored = self
                        .calendar
                        .record_extracted_event(NewCompanyEvent {
                            company_id: company_id.clone(),
                            title: event.title,
                            starts_at: event.starts_at,
                            location: event.location,
                            source_message_id: Some(message_id.clone()),
                        })
                        .await;
                    match stored {
                        Ok(Some(event)) => {
                            info!(message_id, event_id = %event.id, "event extracted from message")
                        }
                        Ok(None) => debug!(message_id, "event already recorded for message"),
                        Err(err) => warn!(message_id, error = %err, "failed to store extracted event"),
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(message_id, error = %err, "event extraction failed"),
            }
        }
    }

    async fn lock_for(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(account_id.to_string())
            .or_default()
            .clone()
    }

    /// Persists and publishes a state transition. Write failures are logged;
    /// the committed batch is what matters.
    async fn record_state(&self, account_id: &str, state: &AccountState, detail: Option<String>) {
        if let Err(err) = self.accounts.update_state(account_id, state).await {
            warn!(account_id, error = %err, "failed to record sync state");
        }
        self.bus.publish(CoreEvent::SyncStateChanged {
            account_id: account_id.to_string(),
            state: state.sync_state,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountConfig;
    use crate::companies::CompanyRepository;
    use crate::migrations::run_migrations;
    use crate::sync::provider::{AccountProviderResolver, StaticMailProvider};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn raw(remote_id: &str, subject: &str, minute: u32) -> RawMessage {
        RawMessage {
            remote_id: remote_id.into(),
            from_email: Some("hr@acme.test".into()),
            from_name: Some("Acme HR".into()),
            subject: Some(subject.into()),
            body_text: Some("Details inside".into()),
            received_at: Utc.with_ymd_and_hms(2026, 5, 1, 9, minute, 0).unwrap(),
            attachments: vec![],
        }
    }

    async fn setup() -> (SyncWorker, AccountProviderResolver, String, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("db.sqlite"))
            .await
            .expect("create db");
        run_migrations(&db).await.expect("migrations");
        CompanyRepository::new(db.clone())
            .create_with_id("acme", "Acme")
            .await
            .expect("company");
        let account = AccountRepository::new(db.clone())
            .create("me@example.com", None, AccountConfig::Static)
            .await
            .expect("account");

        let config = SyncConfig {
            fetch_retry_base_ms: 1,
            ..SyncConfig::default()
        };
        let resolver = AccountProviderResolver::new(db.clone(), &config);
        let worker = SyncWorker::new(db, Arc::new(resolver.clone()), EventBus::default(), config);
        (worker, resolver, account.id, dir)
    }

    #[tokio::test]
    async fn second_run_without_new_mail_inserts_nothing() {
        let (worker, resolver, account_id, _dir) = setup().await;
        let provider = StaticMailProvider::new();
        provider.push_message(raw("r1", "Hello", 1)).await;
        resolver.register_static(&account_id, provider.clone()).await;

        let first = worker.sync_account(&account_id).await.expect("first");
        assert_eq!(first.inserted, 1);
        let second = worker.sync_account(&account_id).await.expect("second");
        assert_eq!(second.fetched, 0);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.cursor, first.cursor);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_within_a_run() {
        let (worker, resolver, account_id, _dir) = setup().await;
        let provider = StaticMailProvider::new();
        provider
            .fail_next(ProviderError::Transient("timeout".into()))
            .await;
        provider.push_message(raw("r1", "Hello", 1)).await;
        resolver.register_static(&account_id, provider.clone()).await;

        let report = worker.sync_account(&account_id).await.expect("sync");
        assert_eq!(report.inserted, 1);
        assert_eq!(provider.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn permanent_error_records_last_error_and_keeps_cursor() {
        let (worker, resolver, account_id, _dir) = setup().await;
        let provider = StaticMailProvider::new();
        provider
            .fail_next(ProviderError::Permanent("revoked".into()))
            .await;
        resolver.register_static(&account_id, provider.clone()).await;

        let err = worker.sync_account(&account_id).await.expect_err("fails");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(provider.fetch_calls(), 1);

        let account = worker.accounts.get_by_id(&account_id).await.expect("account");
        assert!(account.state.cursor.is_none());
        assert_eq!(account.state.sync_state, SyncState::Idle);
        assert!(account.state.last_error.as_deref().unwrap_or("").contains("revoked"));
    }

    #[tokio::test]
    async fn concurrent_run_for_same_account_is_rejected() {
        let (worker, resolver, account_id, _dir) = setup().await;
        let provider = StaticMailProvider::new();
        provider.set_fetch_delay(Duration::from_millis(200)).await;
        resolver.register_static(&account_id, provider).await;

        let background = {
            let worker = worker.clone();
            let account_id = account_id.clone();
            tokio::spawn(async move { worker.sync_account(&account_id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = worker.sync_account(&account_id).await.expect_err("busy");
        assert!(matches!(err, SyncError::InProgress(_)));
        background.await.expect("join").expect("first run");
    }

    #[tokio::test]
    async fn disabled_accounts_are_skipped_by_sync_all() {
        let (worker, _resolver, account_id, _dir) = setup().await;
        worker
            .accounts
            .set_enabled(&account_id, false)
            .await
            .expect("disable");

        assert!(worker.sync_all().await.expect("sync all").is_empty());
        let err = worker.sync_account(&account_id).await.expect_err("disabled");
        assert!(matches!(err, SyncError::Disabled(_)));
    }

    #[tokio::test]
    async fn attachment_must_belong_to_message() {
        let (worker, resolver, account_id, _dir) = setup().await;
        let provider = StaticMailProvider::new();
        let mut with_cv = raw("r1", "CV", 1);
        with_cv.attachments.push(crate::messages::AttachmentRef {
            attachment_id: "att-1".into(),
            filename: Some("cv.pdf".into()),
            mime_type: Some("application/pdf".into()),
            size: 3,
        });
        provider.push_message(with_cv).await;
        provider.add_attachment("r1", "att-1", b"pdf".to_vec()).await;
        resolver.register_static(&account_id, provider).await;
        worker.sync_account(&account_id).await.expect("sync");

        let message = worker
            .messages
            .get_by_remote_id(&account_id, "r1")
            .await
            .expect("stored");
        let bytes = worker
            .fetch_message_attachment(&message.id, "att-1")
            .await
            .expect("bytes");
        assert_eq!(bytes, b"pdf".to_vec());

        let err = worker
            .fetch_attachment(&account_id, &message.id, "att-2")
            .await
            .expect_err("unknown attachment");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = worker
            .fetch_attachment("someone-else", &message.id, "att-1")
            .await
            .expect_err("wrong account");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
