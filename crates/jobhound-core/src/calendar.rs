use chrono::{DateTime, Utc};
use libsql::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_rfc3339, to_rfc3339};
use crate::error::ErrorKind;

const EVENT_COLUMNS: &str =
    "id, company_id, title, starts_at, location, source_message_id, created_at, updated_at";
const DEADLINE_COLUMNS: &str = "id, company_id, title, due_at, submitted_at, created_at, updated_at";

/// Interview, info session, or anything else with a start time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyEvent {
    pub id: String,
    pub company_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub location: Option<String>,
    pub source_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewCompanyEvent {
    pub company_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub location: Option<String>,
    #[serde(default)]
    pub source_message_id: Option<String>,
}

/// Entry sheet deadline. Pending until `submitted_at` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDeadline {
    pub id: String,
    pub company_id: String,
    pub title: String,
    pub due_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntryDeadline {
    pub fn is_pending(&self) -> bool {
        self.submitted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewEntryDeadline {
    pub company_id: String,
    pub title: String,
    pub due_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("company not found: {0}")]
    CompanyNotFound(String),
    #[error("event not found: {0}")]
    EventNotFound(String),
    #[error("deadline not found: {0}")]
    DeadlineNotFound(String),
    #[error("invalid entry: {0}")]
    Invalid(String),
}

impl CalendarError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CalendarError::CompanyNotFound(_)
            | CalendarError::EventNotFound(_)
            | CalendarError::DeadlineNotFound(_) => ErrorKind::NotFound,
            CalendarError::Invalid(_) => ErrorKind::Validation,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Clone)]
pub struct CalendarRepository {
    db: Database,
}

impl CalendarRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create_event(&self, event: NewCompanyEvent) -> Result<CompanyEvent, CalendarError> {
        let conn = self.db.connection().await?;
        insert_event(&conn, &event)
            .await?
            .ok_or_else(|| CalendarError::Invalid("event already recorded for message".into()))
    }

    /// Stores an event extracted from a message. Returns `None` when that
    /// message already produced one.
    pub async fn record_extracted_event(
        &self,
        event: NewCompanyEvent,
    ) -> Result<Option<CompanyEvent>, CalendarError> {
        if event.source_message_id.is_none() {
            return Err(CalendarError::Invalid(
                "extracted events need a source message".into(),
            ));
        }
        let conn = self.db.connection().await?;
        insert_event(&conn, &event).await
    }

    pub async fn get_event(&self, id: &str) -> Result<CompanyEvent, CalendarError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {EVENT_COLUMNS} FROM company_events WHERE id = ?1"),
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_event(row),
            None => Err(CalendarError::EventNotFound(id.to_string())),
        }
    }

    /// Moves an event. The new start time yields a new reminder occurrence.
    pub async fn reschedule_event(
        &self,
        id: &str,
        starts_at: DateTime<Utc>,
    ) -> Result<CompanyEvent, CalendarError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE company_events SET starts_at = ?1, updated_at = ?2 WHERE id = ?3
                     RETURNING {EVENT_COLUMNS}"
                ),
                params![to_rfc3339(starts_at), now_rfc3339(), id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_event(row),
            None => Err(CalendarError::EventNotFound(id.to_string())),
        }
    }

    /// Events with `after < starts_at <= until`, soonest first.
    pub async fn events_starting_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<CompanyEvent>, CalendarError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM company_events
                     WHERE starts_at > ?1 AND starts_at <= ?2
                     ORDER BY starts_at, id"
                ),
                params![to_rfc3339(after), to_rfc3339(until)],
            )
            .await?;
        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(row_to_event(row)?);
        }
        Ok(events)
    }

    pub async fn create_deadline(
        &self,
        deadline: NewEntryDeadline,
    ) -> Result<EntryDeadline, CalendarError> {
        if deadline.title.trim().is_empty() {
            return Err(CalendarError::Invalid("deadline title is required".into()));
        }
        let conn = self.db.connection().await?;
        ensure_company(&conn, &deadline.company_id).await?;

        let now = now_rfc3339();
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO entry_deadlines (id, company_id, title, due_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     RETURNING {DEADLINE_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    deadline.company_id,
                    deadline.title,
                    to_rfc3339(deadline.due_at),
                    now
                ],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_deadline(row),
            None => Err(CalendarError::Invalid("deadline insert returned no row".into())),
        }
    }

    pub async fn get_deadline(&self, id: &str) -> Result<EntryDeadline, CalendarError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {DEADLINE_COLUMNS} FROM entry_deadlines WHERE id = ?1"),
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_deadline(row),
            None => Err(CalendarError::DeadlineNotFound(id.to_string())),
        }
    }

    /// Stops further reminders for the deadline. Submitting twice keeps the
    /// first timestamp.
    pub async fn mark_submitted(&self, id: &str) -> Result<EntryDeadline, CalendarError> {
        let conn = self.db.connection().await?;
        let now = now_rfc3339();
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE entry_deadlines
                     SET submitted_at = COALESCE(submitted_at, ?1), updated_at = ?1
                     WHERE id = ?2
                     RETURNING {DEADLINE_COLUMNS}"
                ),
                params![now, id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_deadline(row),
            None => Err(CalendarError::DeadlineNotFound(id.to_string())),
        }
    }

    /// Unsubmitted deadlines with `after < due_at <= until`, soonest first.
    pub async fn pending_deadlines_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<EntryDeadline>, CalendarError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {DEADLINE_COLUMNS} FROM entry_deadlines
                     WHERE submitted_at IS NULL AND due_at > ?1 AND due_at <= ?2
                     ORDER BY due_at, id"
                ),
                params![to_rfc3339(after), to_rfc3339(until)],
            )
            .await?;
        let mut deadlines = Vec::new();
        while let Some(row) = rows.next().await? {
            deadlines.push(row_to_deadline(row)?);
        }
        Ok(deadlines)
    }
}

async fn insert_event(
    conn: &Connection,
    event: &NewCompanyEvent,
) -> Result<Option<CompanyEvent>, CalendarError> {
    if event.title.trim().is_empty() {
        return Err(CalendarError::Invalid("event title is required".into()));
    }
    ensure_company(conn, &event.company_id).await?;

    let now = now_rfc3339();
    let mut rows = conn
        .query(
            &format!(
                "INSERT INTO company_events (id, company_id, title, starts_at, location, source_message_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(source_message_id) DO NOTHING
                 RETURNING {EVENT_COLUMNS}"
            ),
            params![
                Uuid::new_v4().to_string(),
                event.company_id.clone(),
                event.title.clone(),
                to_rfc3339(event.starts_at),
                event.location.clone(),
                event.source_message_id.clone(),
                now
            ],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_event(row)?)),
        None => Ok(None),
    }
}

async fn ensure_company(conn: &Connection, company_id: &str) -> Result<(), CalendarError> {
    let mut rows = conn
        .query("SELECT 1 FROM companies WHERE id = ?1", params![company_id])
        .await?;
    match rows.next().await? {
        Some(_) => Ok(()),
        None => Err(CalendarError::CompanyNotFound(company_id.to_string())),
    }
}

fn row_to_event(row: Row) -> Result<CompanyEvent, CalendarError> {
    let starts_at: String = row.get(3)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(CompanyEvent {
        id: row.get(0)?,
        company_id: row.get(1)?,
        title: row.get(2)?,
        starts_at: parse_rfc3339(&starts_at)?,
        location: row.get(4)?,
        source_message_id: row.get(5)?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

fn row_to_deadline(row: Row) -> Result<EntryDeadline, CalendarError> {
    let due_at: String = row.get(3)?;
    let submitted_at: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(EntryDeadline {
        id: row.get(0)?,
        company_id: row.get(1)?,
        title: row.get(2)?,
        due_at: parse_rfc3339(&due_at)?,
        submitted_at: submitted_at.as_deref().map(parse_rfc3339).transpose()?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}
