use chrono::{DateTime, Utc};
use libsql::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_rfc3339, to_rfc3339};
use crate::error::ErrorKind;

pub(crate) const MESSAGE_COLUMNS: &str = "id, account_id, remote_id, from_email, from_name, subject, body_text, received_at, attachments_json, company_id, allocation_source, allocation_version, classified_at, created_at";

const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub attachment_id: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationSource {
    /// Placed by the pattern matcher.
    Pattern,
    /// Placed by an explicit allocate command.
    Manual,
}

impl AllocationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationSource::Pattern => "pattern",
            AllocationSource::Manual => "manual",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "pattern" => Some(AllocationSource::Pattern),
            "manual" => Some(AllocationSource::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Allocation {
    Unallocated,
    Allocated {
        company_id: String,
        source: AllocationSource,
    },
}

impl Allocation {
    pub fn company_id(&self) -> Option<&str> {
        match self {
            Allocation::Unallocated => None,
            Allocation::Allocated { company_id, .. } => Some(company_id),
        }
    }
}

/// Stored snapshot of a fetched message. Everything except the allocation
/// fields is written once and never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub id: String,
    pub account_id: String,
    pub remote_id: String,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<AttachmentRef>,
    pub allocation: Allocation,
    /// Bumped on every allocation change; used for compare-and-set writes.
    pub allocation_version: i64,
    pub classified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEmailMessage {
    pub remote_id: String,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(String),
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Page {
    fn clamped_limit(&self) -> i64 {
        i64::from(self.limit.clamp(1, MAX_PAGE_SIZE))
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("message not found: {0}")]
    NotFound(String),
    #[error("invalid allocation source {0}")]
    InvalidSource(String),
}

impl MessageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MessageError::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Clone)]
pub struct MessageRepository {
    db: Database,
}

impl MessageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert(
        &self,
        account_id: &str,
        message: &NewEmailMessage,
    ) -> Result<InsertOutcome, MessageError> {
        let conn = self.db.connection().await?;
        insert_if_new(&conn, account_id, message).await
    }

    pub async fn get(&self, id: &str) -> Result<EmailMessage, MessageError> {
        let conn = self.db.connection().await?;
        fetch_message(&conn, id).await
    }

    pub async fn get_by_remote_id(
        &self,
        account_id: &str,
        remote_id: &str,
    ) -> Result<EmailMessage, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE account_id = ?1 AND remote_id = ?2"
                ),
                params![account_id, remote_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_message(row),
            None => Err(MessageError::NotFound(remote_id.to_string())),
        }
    }

    /// Newest first; ties broken by id so pages never overlap.
    pub async fn list_by_account(
        &self,
        account_id: &str,
        page: Page,
    ) -> Result<Vec<EmailMessage>, MessageError> {
        self.list_where("account_id = ?1", account_id, page).await
    }

    pub async fn list_by_company(
        &self,
        company_id: &str,
        page: Page,
    ) -> Result<Vec<EmailMessage>, MessageError> {
        self.list_where("company_id = ?1", company_id, page).await
    }

    pub async fn list_unallocated(
        &self,
        account_id: &str,
        page: Page,
    ) -> Result<Vec<EmailMessage>, MessageError> {
        self.list_where("account_id = ?1 AND company_id IS NULL", account_id, page)
            .await
    }

    pub async fn count_by_account(&self, account_id: &str) -> Result<i64, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM messages WHERE account_id = ?1",
                params![account_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    async fn list_where(
        &self,
        predicate: &str,
        key: &str,
        page: Page,
    ) -> Result<Vec<EmailMessage>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE {predicate}
                     ORDER BY received_at DESC, id DESC
                     LIMIT ?2 OFFSET ?3"
                ),
                params![key, page.clamped_limit(), i64::from(page.offset)],
            )
            .await?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }
}

/// Inserts unless `(account_id, remote_id)` already exists. An existing row is
/// left untouched, including its allocation.
pub(crate) async fn insert_if_new(
    conn: &Connection,
    account_id: &str,
    message: &NewEmailMessage,
) -> Result<InsertOutcome, MessageError> {
    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let attachments_json = serde_json::to_string(&message.attachments)?;

    let mut rows = conn
        .query(
            "INSERT INTO messages (id, account_id, remote_id, from_email, from_name, subject, body_text, received_at, attachments_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(account_id, remote_id) DO NOTHING
             RETURNING id",
            params![
                id,
                account_id,
                message.remote_id.clone(),
                message.from_email.clone(),
                message.from_name.clone(),
                message.subject.clone(),
                message.body_text.clone(),
                to_rfc3339(message.received_at),
                attachments_json,
                now
            ],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(InsertOutcome::Inserted(row.get(0)?)),
        None => Ok(InsertOutcome::AlreadyPresent),
    }
}

pub(crate) async fn fetch_message(conn: &Connection, id: &str) -> Result<EmailMessage, MessageError> {
    let mut rows = conn
        .query(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => row_to_message(row),
        None => Err(MessageError::NotFound(id.to_string())),
    }
}

/// Messages of an account that no classification pass has looked at yet.
pub(crate) async fn unclassified_for_account(
    conn: &Connection,
    account_id: &str,
) -> Result<Vec<EmailMessage>, MessageError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE account_id = ?1 AND classified_at IS NULL
                 ORDER BY received_at, id"
            ),
            params![account_id],
        )
        .await?;
    let mut messages = Vec::new();
    while let Some(row) = rows.next().await? {
        messages.push(row_to_message(row)?);
    }
    Ok(messages)
}

pub(crate) async fn all_for_account(
    conn: &Connection,
    account_id: &str,
) -> Result<Vec<EmailMessage>, MessageError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE account_id = ?1 ORDER BY received_at, id"
            ),
            params![account_id],
        )
        .await?;
    let mut messages = Vec::new();
    while let Some(row) = rows.next().await? {
        messages.push(row_to_message(row)?);
    }
    Ok(messages)
}

pub(crate) fn row_to_message(row: Row) -> Result<EmailMessage, MessageError> {
    let received_at: String = row.get(7)?;
    let attachments_json: String = row.get(8)?;
    let company_id: Option<String> = row.get(9)?;
    let source: Option<String> = row.get(10)?;
    let classified_at: Option<String> = row.get(12)?;
    let created_at: String = row.get(13)?;

    let allocation = match company_id {
        Some(company_id) => {
            let raw = source.unwrap_or_else(|| "pattern".to_string());
            let source = AllocationSource::from_str(&raw).ok_or(MessageError::InvalidSource(raw))?;
            Allocation::Allocated { company_id, source }
        }
        None => Allocation::Unallocated,
    };

    Ok(EmailMessage {
        id: row.get(0)?,
        account_id: row.get(1)?,
        remote_id: row.get(2)?,
        from_email: row.get(3)?,
        from_name: row.get(4)?,
        subject: row.get(5)?,
        body_text: row.get(6)?,
        received_at: parse_rfc3339(&received_at)?,
        attachments: serde_json::from_str(&attachments_json)?,
        allocation,
        allocation_version: row.get(11)?,
        classified_at: classified_at.as_deref().map(parse_rfc3339).transpose()?,
        created_at: parse_rfc3339(&created_at)?,
    })
}
