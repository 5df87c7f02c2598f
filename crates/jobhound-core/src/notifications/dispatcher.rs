use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{FutureExt, future};
use reqwest::{Client, StatusCode, redirect};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use crate::error::ErrorKind;

use super::queue::{
    DeliveryState, NotificationError, NotificationItem, NotificationPayload, NotificationQueue,
    SourceKind,
};

/// Items sent at the same time during one dispatch pass.
const DISPATCH_CONCURRENCY: usize = 4;
/// Slack for the outer timeout on top of the client's own request timeout.
const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::Transient(_) => ErrorKind::TransientIo,
            DeliveryError::Permanent(_) => ErrorKind::PermanentDelivery,
        }
    }
}

/// Outbound channel for one notification.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, endpoint: &str, item: &NotificationItem) -> Result<(), DeliveryError>;
}

/// Slack-compatible incoming webhook.
#[derive(Clone)]
pub struct WebhookChannel {
    http: Client,
    timeout: Duration,
}

impl WebhookChannel {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self { http, timeout })
    }
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    async fn send(&self, endpoint: &str, item: &NotificationItem) -> Result<(), DeliveryError> {
        let request = self.http.post(endpoint).json(&webhook_body(item)).send();

        let response = match tokio::time::timeout(self.timeout + TIMEOUT_GRACE, request).await {
            Ok(result) => result.map_err(map_request_error)?,
            Err(_) => {
                return Err(DeliveryError::Transient(format!(
                    "no response within {:?}",
                    self.timeout
                )));
            }
        };
        classify_status(response.status())
    }
}

fn map_request_error(err: reqwest::Error) -> DeliveryError {
    if err.is_builder() {
        DeliveryError::Permanent(format!("invalid webhook request: {err}"))
    } else if err.is_timeout() {
        DeliveryError::Transient(format!("webhook timed out: {err}"))
    } else {
        DeliveryError::Transient(format!("webhook unreachable: {err}"))
    }
}

/// 2xx is success. Throttling, request timeouts and server errors are worth
/// another try; any other answer means the endpoint is misconfigured.
pub fn classify_status(status: StatusCode) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        408 | 425 | 429 | 500..=599 => {
            Err(DeliveryError::Transient(format!("webhook returned {status}")))
        }
        300..=399 => Err(DeliveryError::Permanent(format!(
            "webhook redirected ({status}); configure the final url"
        ))),
        _ => Err(DeliveryError::Permanent(format!("webhook returned {status}"))),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Drains the queue through a [`DeliveryChannel`].
#[derive(Clone)]
pub struct Dispatcher {
    queue: NotificationQueue,
    channel: Arc<dyn DeliveryChannel>,
}

impl Dispatcher {
    pub fn new(queue: NotificationQueue, channel: Arc<dyn DeliveryChannel>) -> Self {
        Self { queue, channel }
    }

    pub fn queue(&self) -> &NotificationQueue {
        &self.queue
    }

    /// Sends up to `limit` pending items to `endpoint`. A failure of one item
    /// never stops the others.
    pub async fn dispatch_due(
        &self,
        endpoint: &str,
        limit: usize,
    ) -> Result<DispatchReport, NotificationError> {
        self.dispatch_due_until(endpoint, limit, &CancellationToken::new())
            .await
    }

    /// Like [`Dispatcher::dispatch_due`], but stops claiming once `token` is
    /// cancelled. Workers claim one item at a time, so no more than
    /// `DISPATCH_CONCURRENCY` items are in `sending` at once.
    #[instrument(skip(self, token))]
    pub async fn dispatch_due_until(
        &self,
        endpoint: &str,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<DispatchReport, NotificationError> {
        let budget = AtomicUsize::new(limit);
        let workers = (0..DISPATCH_CONCURRENCY.min(limit.max(1)))
            .map(|_| self.dispatch_worker(endpoint, &budget, token));

        let mut report = DispatchReport::default();
        let mut claim_error = None;
        for (worker, err) in future::join_all(workers).await {
            report.delivered += worker.delivered;
            report.failed += worker.failed;
            if claim_error.is_none() {
                claim_error = err;
            }
        }

        match claim_error {
            Some(err) if report.delivered + report.failed == 0 => Err(err),
            Some(err) => {
                warn!(error = %err, "dispatch pass cut short");
                Ok(report)
            }
            None => Ok(report),
        }
    }

    async fn dispatch_worker(
        &self,
        endpoint: &str,
        budget: &AtomicUsize,
        token: &CancellationToken,
    ) -> (DispatchReport, Option<NotificationError>) {
        let mut report = DispatchReport::default();
        while !token.is_cancelled() && take_one(budget) {
            let item = match self.queue.claim_due(1).await {
                Ok(mut claimed) => match claimed.pop() {
                    Some(item) => item,
                    None => break,
                },
                Err(err) => return (report, Some(err)),
            };
            if self.deliver_claimed(endpoint, item).await {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        (report, None)
    }

    async fn deliver_claimed(&self, endpoint: &str, item: NotificationItem) -> bool {
        let sent = AssertUnwindSafe(self.channel.send(endpoint, &item))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(DeliveryError::Transient("delivery task panicked".into())));

        let recorded = match &sent {
            Ok(()) => self.queue.mark_delivered(&item.id).await,
            Err(err) => {
                self.queue
                    .mark_failed(&item.id, &err.to_string(), err.is_transient())
                    .await
            }
        };
        if let Err(err) = recorded {
            error!(notification_id = %item.id, error = %err, "failed to record delivery result");
        }
        if let Err(err) = &sent {
            warn!(notification_id = %item.id, error = %err, "notification send failed");
        }
        sent.is_ok()
    }

    /// Sends a throwaway notification to `endpoint` without touching the
    /// queue.
    pub async fn send_test(&self, endpoint: &str) -> Result<(), DeliveryError> {
        let now = Utc::now();
        let item = NotificationItem {
            id: format!("test-{}", now.timestamp_millis()),
            source_kind: SourceKind::Test,
            source_id: "test".into(),
            occurrence_key: format!("test:{}", now.timestamp_millis()),
            payload: NotificationPayload {
                title: "jobhound test notification".into(),
                text: "Notifications from jobhound will arrive here.".into(),
                company_id: None,
                at: Some(now),
            },
            state: DeliveryState::Sending,
            retry_count: 0,
            terminal: false,
            next_retry_at: None,
            last_error: None,
            sending_since: Some(now),
            delivered_at: None,
            created_at: now,
            updated_at: now,
        };
        self.channel.send(endpoint, &item).await
    }
}

fn take_one(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

/// JSON the webhook receives for `item`.
pub fn webhook_body(item: &NotificationItem) -> serde_json::Value {
    json!({
        "text": item.payload.message_text(),
        "notification": item,
    })
}
