use libsql::{Connection, params};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::bus::{CoreEvent, EventBus};
use crate::db::{Database, DbError, now_rfc3339};
use crate::error::ErrorKind;
use crate::messages::{
    Allocation, AllocationSource, EmailMessage, MessageError, MessageRepository, Page,
    all_for_account, fetch_message, unclassified_for_account,
};
use crate::patterns::{EvaluationContext, PatternError, PatternRepository, PatternSet, match_message};

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("company not found: {0}")]
    CompanyNotFound(String),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("allocation of message {message_id} changed concurrently (expected version {expected})")]
    Conflict { message_id: String, expected: i64 },
}

impl AllocationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocationError::Message(err) => err.kind(),
            AllocationError::Pattern(err) => err.kind(),
            AllocationError::CompanyNotFound(_) | AllocationError::AccountNotFound(_) => {
                ErrorKind::NotFound
            }
            AllocationError::Conflict { .. } => ErrorKind::Conflict,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReallocationReport {
    pub scanned: usize,
    pub changed: usize,
    pub unchanged: usize,
    /// Messages skipped because another writer moved them mid-scan.
    pub conflicts: usize,
}

/// The only writer of message allocation state.
#[derive(Clone)]
pub struct AllocationStore {
    db: Database,
    messages: MessageRepository,
    patterns: PatternRepository,
    bus: EventBus,
}

impl AllocationStore {
    pub fn new(db: Database, bus: EventBus) -> Self {
        Self {
            messages: MessageRepository::new(db.clone()),
            patterns: PatternRepository::new(db.clone()),
            db,
            bus,
        }
    }

    /// Manually places a message with a company. Allocating to the company it
    /// already belongs to changes nothing.
    pub async fn allocate(
        &self,
        message_id: &str,
        company_id: &str,
    ) -> Result<EmailMessage, AllocationError> {
        let conn = self.db.connection().await?;
        let message = fetch_message(&conn, message_id).await?;
        ensure_company(&conn, company_id).await?;

        if message.allocation.company_id() == Some(company_id) {
            return Ok(message);
        }

        self.write_manual(&conn, message, Some(company_id)).await
    }

    /// Returns the message to `unallocated`; a no-op when it already is.
    pub async fn unallocate(&self, message_id: &str) -> Result<EmailMessage, AllocationError> {
        let conn = self.db.connection().await?;
        let message = fetch_message(&conn, message_id).await?;
        if message.allocation == Allocation::Unallocated {
            return Ok(message);
        }
        self.write_manual(&conn, message, None).await
    }

    /// Compare-and-set variant for callers holding a previously read version.
    pub async fn allocate_if_version(
        &self,
        message_id: &str,
        company_id: Option<&str>,
        expected_version: i64,
    ) -> Result<EmailMessage, AllocationError> {
        let conn = self.db.connection().await?;
        fetch_message(&conn, message_id).await?;
        if let Some(company_id) = company_id {
            ensure_company(&conn, company_id).await?;
        }

        let source = company_id.map(|_| AllocationSource::Manual);
        if !apply_allocation(&conn, message_id, company_id, source, expected_version).await? {
            return Err(AllocationError::Conflict {
                message_id: message_id.to_string(),
                expected: expected_version,
            });
        }

        self.bus.publish(CoreEvent::MessageAllocated {
            message_id: message_id.to_string(),
            company_id: company_id.map(str::to_string),
            manual: true,
        });
        Ok(fetch_message(&conn, message_id).await?)
    }

    /// Re-runs the matcher over every message of the account using the current
    /// pattern set. Each write is a compare-and-set on the version read at scan
    /// time, so a concurrent manual change wins and is counted as a conflict.
    /// Messages inserted after the scan started keep `classified_at` unset and are
    /// picked up by the next sync.
    pub async fn reallocate_all(
        &self,
        account_id: &str,
    ) -> Result<ReallocationReport, AllocationError> {
        let conn = self.db.connection().await?;
        ensure_account(&conn, account_id).await?;

        let set = self.patterns.load_pattern_set().await?;
        let messages = all_for_account(&conn, account_id).await?;
        let mut ctx = EvaluationContext::new();
        let mut report = ReallocationReport::default();

        for message in messages {
            report.scanned += 1;
            let target = match_message(&message, &set, &mut ctx).map(|p| p.company_id.as_str());

            if message.allocation.company_id() == target {
                if message.classified_at.is_none() {
                    mark_classified(&conn, &message.id).await?;
                }
                report.unchanged += 1;
                continue;
            }

            let source = target.map(|_| AllocationSource::Pattern);
            if apply_allocation(&conn, &message.id, target, source, message.allocation_version)
                .await?
            {
                report.changed += 1;
                self.bus.publish(CoreEvent::MessageAllocated {
                    message_id: message.id.clone(),
                    company_id: target.map(str::to_string),
                    manual: false,
                });
            } else {
                debug!(message_id = %message.id, "allocation moved during reallocation");
                report.conflicts += 1;
            }
        }

        info!(
            account_id,
            scanned = report.scanned,
            changed = report.changed,
            conflicts = report.conflicts,
            "reallocation finished"
        );
        Ok(report)
    }

    pub async fn list_by_company(
        &self,
        company_id: &str,
        page: Page,
    ) -> Result<Vec<EmailMessage>, AllocationError> {
        Ok(self.messages.list_by_company(company_id, page).await?)
    }

    pub async fn list_by_account(
        &self,
        account_id: &str,
        page: Page,
    ) -> Result<Vec<EmailMessage>, AllocationError> {
        Ok(self.messages.list_by_account(account_id, page).await?)
    }

    pub async fn list_unallocated(
        &self,
        account_id: &str,
        page: Page,
    ) -> Result<Vec<EmailMessage>, AllocationError> {
        Ok(self.messages.list_unallocated(account_id, page).await?)
    }

    async fn write_manual(
        &self,
        conn: &Connection,
        message: EmailMessage,
        company_id: Option<&str>,
    ) -> Result<EmailMessage, AllocationError> {
        let source = company_id.map(|_| AllocationSource::Manual);
        if !apply_allocation(conn, &message.id, company_id, source, message.allocation_version)
            .await?
        {
            return Err(AllocationError::Conflict {
                message_id: message.id,
                expected: message.allocation_version,
            });
        }

        self.bus.publish(CoreEvent::MessageAllocated {
            message_id: message.id.clone(),
            company_id: company_id.map(str::to_string),
            manual: true,
        });
        Ok(fetch_message(conn, &message.id).await?)
    }
}

/// Classifies every message of the account that has never been classified.
/// Runs on the caller's connection so the sync worker can keep it inside the
/// batch transaction. Returns `(message_id, company_id)` for each allocation made.
pub(crate) async fn classify_pending(
    conn: &Connection,
    account_id: &str,
    set: &PatternSet,
) -> Result<Vec<(String, String)>, AllocationError> {
    let pending = unclassified_for_account(conn, account_id).await?;
    let mut ctx = EvaluationContext::new();
    let mut allocated = Vec::new();

    for message in pending {
        // A manual allocation made before classification is left alone.
        if message.allocation != Allocation::Unallocated {
            mark_classified(conn, &message.id).await?;
            continue;
        }
        match match_message(&message, set, &mut ctx) {
            Some(pattern) => {
                let applied = apply_allocation(
                    conn,
                    &message.id,
                    Some(&pattern.company_id),
                    Some(AllocationSource::Pattern),
                    message.allocation_version,
                )
                .await?;
                if applied {
                    allocated.push((message.id, pattern.company_id.clone()));
                }
            }
            None => mark_classified(conn, &message.id).await?,
        }
    }

    Ok(allocated)
}

/// Compare-and-set of a message's allocation. Returns false when the stored
/// version no longer equals `expected_version`.
pub(crate) async fn apply_allocation(
    conn: &Connection,
    message_id: &str,
    company_id: Option<&str>,
    source: Option<AllocationSource>,
    expected_version: i64,
) -> Result<bool, libsql::Error> {
    let now = now_rfc3339();
    let changed = conn
        .execute(
            "UPDATE messages
             SET company_id = ?1,
                 allocation_source = ?2,
                 allocation_version = allocation_version + 1,
                 classified_at = COALESCE(classified_at, ?3),
                 updated_at = ?3
             WHERE id = ?4 AND allocation_version = ?5",
            params![
                company_id,
                source.map(|s| s.as_str()),
                now,
                message_id,
                expected_version
            ],
        )
        .await?;
    Ok(changed == 1)
}

async fn mark_classified(conn: &Connection, message_id: &str) -> Result<(), libsql::Error> {
    conn.execute(
        "UPDATE messages SET classified_at = ?1 WHERE id = ?2 AND classified_at IS NULL",
        params![now_rfc3339(), message_id],
    )
    .await?;
    Ok(())
}

async fn ensure_company(conn: &Connection, company_id: &str) -> Result<(), AllocationError> {
    let mut rows = conn
        .query("SELECT 1 FROM companies WHERE id = ?1", params![company_id])
        .await?;
    match rows.next().await? {
        Some(_) => Ok(()),
        None => Err(AllocationError::CompanyNotFound(company_id.to_string())),
    }
}

async fn ensure_account(conn: &Connection, account_id: &str) -> Result<(), AllocationError> {
    let mut rows = conn
        .query("SELECT 1 FROM accounts WHERE id = ?1", params![account_id])
        .await?;
    match rows.next().await? {
        Some(_) => Ok(()),
        None => Err(AllocationError::AccountNotFound(account_id.to_string())),
    }
}
