use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::backoff_with_jitter;
use crate::bus::{CoreEvent, EventBus};
use crate::config::DeliveryConfig;
use crate::db::{Database, DbError, now_rfc3339, parse_rfc3339, to_rfc3339};
use crate::error::ErrorKind;

const NOTIFICATION_COLUMNS: &str = "id, source_kind, source_id, occurrence_key, payload_json, state, retry_count, terminal, next_retry_at, last_error, sending_since, delivered_at, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sending,
    Delivered,
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sending => "sending",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryState::Pending),
            "sending" => Some(DeliveryState::Sending),
            "delivered" => Some(DeliveryState::Delivered),
            "failed" => Some(DeliveryState::Failed),
            _ => None,
        }
    }
}

/// What fired the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Event,
    Deadline,
    Test,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Event => "event",
            SourceKind::Deadline => "deadline",
            SourceKind::Test => "test",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "event" => Some(SourceKind::Event),
            "deadline" => Some(SourceKind::Deadline),
            "test" => Some(SourceKind::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub company_id: Option<String>,
    /// When the event starts or the deadline falls due.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

impl NotificationPayload {
    /// One-line message for chat-style channels.
    pub fn message_text(&self) -> String {
        if self.text.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n{}", self.title, self.text)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationItem {
    pub id: String,
    pub source_kind: SourceKind,
    pub source_id: String,
    pub occurrence_key: String,
    pub payload: NotificationPayload,
    pub state: DeliveryState,
    pub retry_count: i64,
    /// Set once automatic retries are exhausted or the channel rejected the
    /// item outright. Only `retry_manual` clears it.
    pub terminal: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sending_since: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub source_kind: SourceKind,
    pub source_id: String,
    pub occurrence_key: String,
    pub payload: NotificationPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Created,
    /// An undelivered item for the same occurrence took the new payload.
    Updated,
    Unchanged,
}

/// Automatic retry budget and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_secs(config.base_backoff_secs),
            cap: Duration::from_secs(config.max_backoff_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("payload json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("notification not found: {0}")]
    NotFound(String),
    #[error("notification {id} is {state:?}")]
    Conflict { id: String, state: DeliveryState },
}

impl NotificationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NotificationError::NotFound(_) => ErrorKind::NotFound,
            NotificationError::Conflict { .. } => ErrorKind::Conflict,
            _ => ErrorKind::Internal,
        }
    }
}

/// Durable outbox of notifications. Every state change is a single
/// conditional `UPDATE`, so two callers racing on one item cannot both win.
#[derive(Clone)]
pub struct NotificationQueue {
    db: Database,
    bus: EventBus,
    policy: RetryPolicy,
}

impl NotificationQueue {
    pub fn new(db: Database, bus: EventBus, policy: RetryPolicy) -> Self {
        Self { db, bus, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Inserts one item per `(source_kind, source_id, occurrence_key)`.
    /// An existing pending or failed item gets the new payload instead.
    pub async fn enqueue(
        &self,
        new: NewNotification,
    ) -> Result<(NotificationItem, EnqueueOutcome), NotificationError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let payload_json = serde_json::to_string(&new.payload)?;
        let conn = self.db.connection().await?;

        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO notifications (id, source_kind, source_id, occurrence_key, payload_json, state, retry_count, terminal, next_retry_at, last_error, sending_since, delivered_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, 0, NULL, NULL, NULL, NULL, ?6, ?6)
                     ON CONFLICT(source_kind, source_id, occurrence_key) DO NOTHING
                     RETURNING {NOTIFICATION_COLUMNS}"
                ),
                params![
                    id,
                    new.source_kind.as_str(),
                    new.source_id.as_str(),
                    new.occurrence_key.as_str(),
                    payload_json.as_str(),
                    now.as_str()
                ],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            let item = row_to_notification(row)?;
            debug!(notification_id = %item.id, occurrence = %item.occurrence_key, "notification enqueued");
            self.publish(&item);
            return Ok((item, EnqueueOutcome::Created));
        }

        let mut rows = conn
            .query(
                &format!(
                    "UPDATE notifications
                     SET payload_json = ?4, updated_at = ?5
                     WHERE source_kind = ?1 AND source_id = ?2 AND occurrence_key = ?3
                       AND state IN ('pending', 'failed')
                       AND payload_json != ?4
                     RETURNING {NOTIFICATION_COLUMNS}"
                ),
                params![
                    new.source_kind.as_str(),
                    new.source_id.as_str(),
                    new.occurrence_key.as_str(),
                    payload_json.as_str(),
                    now.as_str()
                ],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            return Ok((row_to_notification(row)?, EnqueueOutcome::Updated));
        }

        let existing = fetch_by_occurrence(&conn, &new)
            .await?
            .ok_or_else(|| NotificationError::NotFound(new.occurrence_key.clone()))?;
        Ok((existing, EnqueueOutcome::Unchanged))
    }

    /// Claims up to `limit` pending items, oldest first, moving each to
    /// `sending`. An item is handed to at most one caller.
    pub async fn claim_due(&self, limit: usize) -> Result<Vec<NotificationItem>, NotificationError> {
        let conn = self.db.connection().await?;
        let mut claimed = Vec::new();
        while claimed.len() < limit {
            let now = now_rfc3339();
            let mut rows = conn
                .query(
                    &format!(
                        "UPDATE notifications
                         SET state = 'sending', sending_since = ?1, updated_at = ?1
                         WHERE id = (
                             SELECT id FROM notifications
                             WHERE state = 'pending'
                             ORDER BY created_at, id
                             LIMIT 1
                         ) AND state = 'pending'
                         RETURNING {NOTIFICATION_COLUMNS}"
                    ),
                    params![now],
                )
                .await?;
            match rows.next().await? {
                Some(row) => {
                    let item = row_to_notification(row)?;
                    self.publish(&item);
                    claimed.push(item);
                }
                None => break,
            }
        }
        Ok(claimed)
    }

    pub async fn mark_delivered(&self, id: &str) -> Result<NotificationItem, NotificationError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE notifications
                     SET state = 'delivered', delivered_at = ?2, sending_since = NULL,
                         next_retry_at = NULL, last_error = NULL, updated_at = ?2
                     WHERE id = ?1 AND state = 'sending'
                     RETURNING {NOTIFICATION_COLUMNS}"
                ),
                params![id, now],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let item = row_to_notification(row)?;
                info!(notification_id = %item.id, retry_count = item.retry_count, "notification delivered");
                self.publish(&item);
                Ok(item)
            }
            None => Err(self.unexpected_state(&conn, id).await),
        }
    }

    /// Records a failed send. A transient failure consumes one retry and
    /// schedules the next attempt; a permanent one, or running out of
    /// attempts, leaves the item terminally failed.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        transient: bool,
    ) -> Result<NotificationItem, NotificationError> {
        let conn = self.db.connection().await?;
        let current = fetch_notification(&conn, id).await?;
        if current.state != DeliveryState::Sending {
            return Err(NotificationError::Conflict {
                id: id.to_string(),
                state: current.state,
            });
        }

        let retry_count = if transient {
            current.retry_count + 1
        } else {
            current.retry_count
        };
        let terminal = !transient || retry_count >= i64::from(self.policy.max_attempts);
        let next_retry_at = if terminal {
            None
        } else {
            let attempt = u32::try_from(retry_count).unwrap_or(u32::MAX);
            let delay = backoff_with_jitter(self.policy.base, self.policy.cap, attempt);
            let delay = chrono::Duration::from_std(delay)
                .map_err(|err| NotificationError::InvalidValue(err.to_string()))?;
            Some(to_rfc3339(Utc::now() + delay))
        };

        let now = now_rfc3339();
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE notifications
                     SET state = 'failed', retry_count = ?2, terminal = ?3, next_retry_at = ?4,
                         last_error = ?5, sending_since = NULL, updated_at = ?6
                     WHERE id = ?1 AND state = 'sending' AND retry_count = ?7
                     RETURNING {NOTIFICATION_COLUMNS}"
                ),
                params![
                    id,
                    retry_count,
                    terminal as i64,
                    next_retry_at,
                    error,
                    now,
                    current.retry_count
                ],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let item = row_to_notification(row)?;
                if item.terminal {
                    warn!(notification_id = %item.id, retry_count = item.retry_count, error, "notification failed permanently");
                } else {
                    info!(notification_id = %item.id, retry_count = item.retry_count, next_retry_at = ?item.next_retry_at, error, "notification failed, retry scheduled");
                }
                self.publish(&item);
                Ok(item)
            }
            None => Err(self.unexpected_state(&conn, id).await),
        }
    }

    /// Moves failed, non-terminal items whose backoff has elapsed back to
    /// `pending`.
    pub async fn promote_due_retries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationItem>, NotificationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE notifications
                     SET state = 'pending', updated_at = ?2
                     WHERE state = 'failed' AND terminal = 0
                       AND next_retry_at IS NOT NULL AND next_retry_at <= ?1
                     RETURNING {NOTIFICATION_COLUMNS}"
                ),
                params![to_rfc3339(now), now_rfc3339()],
            )
            .await?;
        let mut promoted = Vec::new();
        while let Some(row) = rows.next().await? {
            let item = row_to_notification(row)?;
            self.publish(&item);
            promoted.push(item);
        }
        Ok(promoted)
    }

    /// Puts a failed item back in line with a fresh retry budget.
    pub async fn retry_manual(&self, id: &str) -> Result<NotificationItem, NotificationError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE notifications
                     SET state = 'pending', retry_count = 0, terminal = 0, next_retry_at = NULL,
                         updated_at = ?2
                     WHERE id = ?1 AND state = 'failed'
                     RETURNING {NOTIFICATION_COLUMNS}"
                ),
                params![id, now],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let item = row_to_notification(row)?;
                info!(notification_id = %item.id, "notification requeued manually");
                self.publish(&item);
                Ok(item)
            }
            None => Err(self.unexpected_state(&conn, id).await),
        }
    }

    /// Returns items stuck in `sending` since before `older_than` to
    /// `pending`. Such items were claimed by a process that went away.
    pub async fn requeue_stale_sending(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<usize, NotificationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE notifications
                     SET state = 'pending', sending_since = NULL, updated_at = ?2
                     WHERE state = 'sending' AND (sending_since IS NULL OR sending_since <= ?1)
                     RETURNING {NOTIFICATION_COLUMNS}"
                ),
                params![to_rfc3339(older_than), now_rfc3339()],
            )
            .await?;
        let mut count = 0;
        while let Some(row) = rows.next().await? {
            let item = row_to_notification(row)?;
            self.publish(&item);
            count += 1;
        }
        if count > 0 {
            warn!(count, "requeued notifications left in sending");
        }
        Ok(count)
    }

    pub async fn get(&self, id: &str) -> Result<NotificationItem, NotificationError> {
        let conn = self.db.connection().await?;
        fetch_notification(&conn, id).await
    }

    /// Most recently touched first.
    pub async fn list(
        &self,
        state: Option<DeliveryState>,
        limit: u32,
    ) -> Result<Vec<NotificationItem>, NotificationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                     WHERE (?1 IS NULL OR state = ?1)
                     ORDER BY updated_at DESC, id
                     LIMIT ?2"
                ),
                params![state.map(|s| s.as_str()), i64::from(limit)],
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_notification(row)?);
        }
        Ok(items)
    }

    async fn unexpected_state(&self, conn: &Connection, id: &str) -> NotificationError {
        match fetch_notification(conn, id).await {
            Ok(item) => NotificationError::Conflict {
                id: id.to_string(),
                state: item.state,
            },
            Err(err) => err,
        }
    }

    fn publish(&self, item: &NotificationItem) {
        self.bus.publish(CoreEvent::NotificationStateChanged {
            notification_id: item.id.clone(),
            state: item.state,
            retry_count: item.retry_count,
            terminal: item.terminal,
        });
    }
}

async fn fetch_notification(
    conn: &Connection,
    id: &str,
) -> Result<NotificationItem, NotificationError> {
    let mut rows = conn
        .query(
            &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
            params![id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => row_to_notification(row),
        None => Err(NotificationError::NotFound(id.to_string())),
    }
}

async fn fetch_by_occurrence(
    conn: &Connection,
    new: &NewNotification,
) -> Result<Option<NotificationItem>, NotificationError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE source_kind = ?1 AND source_id = ?2 AND occurrence_key = ?3"
            ),
            params![
                new.source_kind.as_str(),
                new.source_id.as_str(),
                new.occurrence_key.as_str()
            ],
        )
        .await?;
    rows.next().await?.map(row_to_notification).transpose()
}

fn row_to_notification(row: Row) -> Result<NotificationItem, NotificationError> {
    let id: String = row.get(0)?;
    let source_kind: String = row.get(1)?;
    let source_id: String = row.get(2)?;
    let occurrence_key: String = row.get(3)?;
    let payload_json: String = row.get(4)?;
    let state: String = row.get(5)?;
    let retry_count: i64 = row.get(6)?;
    let terminal: i64 = row.get(7)?;
    let next_retry_at: Option<String> = row.get(8)?;
    let last_error: Option<String> = row.get(9)?;
    let sending_since: Option<String> = row.get(10)?;
    let delivered_at: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(NotificationItem {
        id,
        source_kind: SourceKind::parse(&source_kind)
            .ok_or(NotificationError::InvalidValue(source_kind))?,
        source_id,
        occurrence_key,
        payload: serde_json::from_str(&payload_json)?,
        state: DeliveryState::parse(&state).ok_or(NotificationError::InvalidValue(state))?,
        retry_count,
        terminal: terminal != 0,
        next_retry_at: next_retry_at.as_deref().map(parse_rfc3339).transpose()?,
        last_error,
        sending_since: sending_since.as_deref().map(parse_rfc3339).transpose()?,
        delivered_at: delivered_at.as_deref().map(parse_rfc3339).transpose()?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}
