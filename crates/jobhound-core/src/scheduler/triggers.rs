use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::calendar::{CalendarError, CalendarRepository, CompanyEvent, EntryDeadline};
use crate::config::SchedulerConfig;
use crate::db::to_rfc3339;
use crate::error::ErrorKind;
use crate::notifications::{
    EnqueueOutcome, NewNotification, NotificationError, NotificationPayload, NotificationQueue,
    SourceKind,
};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error(transparent)]
    Notification(#[from] NotificationError),
}

impl TriggerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TriggerError::Calendar(err) => err.kind(),
            TriggerError::Notification(err) => err.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TriggerReport {
    pub created: usize,
    pub updated: usize,
    /// Reminders that could not be queued this pass.
    pub failed: usize,
}

/// `<kind>:<id>:<timestamp>`. Moving an event or deadline changes the key.
pub fn occurrence_key(kind: SourceKind, source_id: &str, at: DateTime<Utc>) -> String {
    format!("{}:{}:{}", kind.as_str(), source_id, to_rfc3339(at))
}

/// Turns upcoming events and pending deadlines into queued notifications.
#[derive(Clone)]
pub struct TriggerEvaluator {
    calendar: CalendarRepository,
    queue: NotificationQueue,
    event_lead: Duration,
    deadline_lead: Duration,
}

impl TriggerEvaluator {
    pub fn new(calendar: CalendarRepository, queue: NotificationQueue, config: &SchedulerConfig) -> Self {
        Self {
            calendar,
            queue,
            event_lead: Duration::hours(config.event_lead_hours),
            deadline_lead: Duration::hours(config.deadline_lead_hours),
        }
    }

    /// A reminder that fails to queue is logged and skipped; the rest of the
    /// pass still runs and the next tick tries it again.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<TriggerReport, TriggerError> {
        let mut report = TriggerReport::default();

        for event in self
            .calendar
            .events_starting_between(now, now + self.event_lead)
            .await?
        {
            self.enqueue(event_reminder(&event), &mut report).await;
        }

        for deadline in self
            .calendar
            .pending_deadlines_between(now, now + self.deadline_lead)
            .await?
        {
            self.enqueue(deadline_reminder(&deadline), &mut report).await;
        }

        debug!(
            created = report.created,
            updated = report.updated,
            failed = report.failed,
            "triggers evaluated"
        );
        Ok(report)
    }

    async fn enqueue(&self, reminder: NewNotification, report: &mut TriggerReport) {
        let source_id = reminder.source_id.clone();
        match self.queue.enqueue(reminder).await {
            Ok((_, outcome)) => report.count(outcome),
            Err(err) => {
                warn!(%source_id, error = %err, "could not queue reminder");
                report.failed += 1;
            }
        }
    }
}

impl TriggerReport {
    fn count(&mut self, outcome: EnqueueOutcome) {
        match outcome {
            EnqueueOutcome::Created => self.created += 1,
            EnqueueOutcome::Updated => self.updated += 1,
            EnqueueOutcome::Unchanged => {}
        }
    }
}

fn event_reminder(event: &CompanyEvent) -> NewNotification {
    let when = event.starts_at.format("%Y-%m-%d %H:%M UTC");
    let text = match &event.location {
        Some(location) => format!("Starts {when} at {location}"),
        None => format!("Starts {when}"),
    };
    NewNotification {
        source_kind: SourceKind::Event,
        source_id: event.id.clone(),
        occurrence_key: occurrence_key(SourceKind::Event, &event.id, event.starts_at),
        payload: NotificationPayload {
            title: format!("Upcoming: {}", event.title),
            text,
            company_id: Some(event.company_id.clone()),
            at: Some(event.starts_at),
        },
    }
}

fn deadline_reminder(deadline: &EntryDeadline) -> NewNotification {
    NewNotification {
        source_kind: SourceKind::Deadline,
        source_id: deadline.id.clone(),
        occurrence_key: occurrence_key(SourceKind::Deadline, &deadline.id, deadline.due_at),
        payload: NotificationPayload {
            title: format!("Deadline: {}", deadline.title),
            text: format!("Due {}", deadline.due_at.format("%Y-%m-%d %H:%M UTC")),
            company_id: Some(deadline.company_id.clone()),
            at: Some(deadline.due_at),
        },
    }
}
