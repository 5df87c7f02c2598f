pub mod triggers;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use reqwest::Url;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{CoreEvent, EventBus};
use crate::config::SchedulerConfig;
use crate::error::ErrorKind;
use crate::notifications::{DeliveryError, Dispatcher, NotificationError, NotificationItem};
use crate::sync::{SyncError, SyncReport, SyncWorker};

pub use triggers::{TriggerError, TriggerEvaluator, TriggerReport, occurrence_key};

/// Most items sent per tick.
const DISPATCH_BATCH: usize = 100;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid delivery endpoint: {0}")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Notification(#[from] NotificationError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::InvalidEndpoint(_) => ErrorKind::Validation,
            SchedulerError::Delivery(err) => err.kind(),
            SchedulerError::Notification(err) => err.kind(),
            SchedulerError::Sync(err) => err.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub endpoint: Option<String>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub accounts_synced: usize,
    pub accounts_failed: usize,
    pub notifications_enqueued: usize,
    pub retries_promoted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Accepts `http` and `https` URLs with a host.
pub fn validate_endpoint(endpoint: &str) -> Result<String, SchedulerError> {
    let trimmed = endpoint.trim();
    let url = Url::parse(trimmed)
        .map_err(|err| SchedulerError::InvalidEndpoint(format!("{trimmed}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SchedulerError::InvalidEndpoint(format!(
            "{trimmed}: scheme must be http or https"
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(SchedulerError::InvalidEndpoint(format!(
            "{trimmed}: missing host"
        )));
    }
    Ok(trimmed.to_string())
}

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    sync: SyncWorker,
    dispatcher: Dispatcher,
    triggers: TriggerEvaluator,
    bus: EventBus,
    config: SchedulerConfig,
    running: Mutex<Option<RunningLoop>>,
    tick_lock: Mutex<()>,
    endpoint: RwLock<Option<String>>,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
}

/// Background control loop. Constructed once by the process and shared by
/// handle; `start` and `stop` are safe to call in any order and repeatedly.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        sync: SyncWorker,
        dispatcher: Dispatcher,
        triggers: TriggerEvaluator,
        bus: EventBus,
        config: SchedulerConfig,
        endpoint: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sync,
                dispatcher,
                triggers,
                bus,
                config,
                running: Mutex::new(None),
                tick_lock: Mutex::new(()),
                endpoint: RwLock::new(endpoint),
                last_tick_at: RwLock::new(None),
            }),
        }
    }

    /// Starts the loop, or only updates the endpoint when it already runs.
    pub async fn start(&self, endpoint: Option<&str>) -> Result<SchedulerStatus, SchedulerError> {
        if let Some(endpoint) = endpoint {
            self.set_endpoint(Some(endpoint)).await?;
        }

        let mut running = self.inner.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("scheduler already running");
            drop(running);
            return Ok(self.status().await);
        }

        self.requeue_sending(self.stale_before(Utc::now())).await;

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(self.clone(), token.clone()));
        *running = Some(RunningLoop { token, handle });
        drop(running);

        let endpoint = self.inner.endpoint.read().await.clone();
        info!(interval_secs = self.inner.config.interval_secs, endpoint = ?endpoint, "scheduler started");
        self.inner.bus.publish(CoreEvent::SchedulerStarted {
            interval_secs: self.inner.config.interval_secs,
            endpoint,
        });
        Ok(self.status().await)
    }

    /// Cancels the loop and waits for the in-flight tick, up to the drain
    /// timeout. Returns `false` when nothing was running.
    pub async fn stop(&self) -> bool {
        let Some(RunningLoop { token, mut handle }) = self.inner.running.lock().await.take() else {
            return false;
        };
        token.cancel();

        let drain = self.inner.config.drain_timeout();
        if tokio::time::timeout(drain, &mut handle).await.is_err() {
            warn!(?drain, "scheduler tick did not finish in time; aborting");
            handle.abort();
            let _ = handle.await;

            // Nothing else dispatches while the tick lock is held, so any
            // item still in `sending` belonged to the aborted tick.
            let _guard = self.inner.tick_lock.lock().await;
            self.requeue_sending(Utc::now()).await;
        }

        info!("scheduler stopped");
        self.inner.bus.publish(CoreEvent::SchedulerStopped);
        true
    }

    pub async fn set_endpoint(&self, endpoint: Option<&str>) -> Result<(), SchedulerError> {
        let validated = endpoint.map(validate_endpoint).transpose()?;
        info!(endpoint = ?validated, "delivery endpoint updated");
        *self.inner.endpoint.write().await = validated;
        Ok(())
    }

    /// Runs one tick now. The periodic timer keeps its schedule.
    pub async fn check_now(&self) -> TickReport {
        self.run_tick(&CancellationToken::new()).await
    }

    pub async fn status(&self) -> SchedulerStatus {
        let running = self
            .inner
            .running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished());
        SchedulerStatus {
            running,
            interval_secs: self.inner.config.interval_secs,
            endpoint: self.inner.endpoint.read().await.clone(),
            last_tick_at: *self.inner.last_tick_at.read().await,
        }
    }

    pub async fn sync_now(&self, account_id: &str) -> Result<SyncReport, SchedulerError> {
        Ok(self.inner.sync.sync_account(account_id).await?)
    }

    pub async fn sync_all(&self) -> Result<Vec<(String, Result<SyncReport, SyncError>)>, SchedulerError> {
        Ok(self.inner.sync.sync_all().await?)
    }

    pub async fn retry_notification(&self, id: &str) -> Result<NotificationItem, SchedulerError> {
        Ok(self.inner.dispatcher.queue().retry_manual(id).await?)
    }

    pub async fn send_test(&self, endpoint: &str) -> Result<(), SchedulerError> {
        let endpoint = validate_endpoint(endpoint)?;
        Ok(self.inner.dispatcher.send_test(&endpoint).await?)
    }

    /// Sync, trigger evaluation, retry promotion and delivery, in that order.
    /// Failures are logged per unit and never abort the tick.
    #[instrument(skip_all)]
    async fn run_tick(&self, token: &CancellationToken) -> TickReport {
        let _guard = self.inner.tick_lock.lock().await;
        let now = Utc::now();
        let mut report = TickReport::default();

        match self.inner.sync.sync_all().await {
            Ok(results) => {
                for (account_id, outcome) in results {
                    match outcome {
                        Ok(_) => report.accounts_synced += 1,
                        Err(SyncError::InProgress(_)) => {
                            debug!(%account_id, "sync already running; skipped");
                        }
                        Err(err) => {
                            warn!(%account_id, error = %err, "account sync failed");
                            report.accounts_failed += 1;
                        }
                    }
                }
            }
            Err(err) => error!(error = %err, "could not list accounts to sync"),
        }

        if token.is_cancelled() {
            debug!("scheduler stopping; skipping notification phase");
            return self.finish_tick(now, report).await;
        }

        match self.inner.triggers.evaluate(now).await {
            Ok(triggered) => report.notifications_enqueued = triggered.created,
            Err(err) => warn!(error = %err, "trigger evaluation failed"),
        }

        self.requeue_sending(self.stale_before(now)).await;
        let queue = self.inner.dispatcher.queue();
        match queue.promote_due_retries(now).await {
            Ok(promoted) => report.retries_promoted = promoted.len(),
            Err(err) => warn!(error = %err, "could not promote retries"),
        }

        let endpoint = self.inner.endpoint.read().await.clone();
        match endpoint {
            Some(endpoint) if !token.is_cancelled() => {
                match self
                    .inner
                    .dispatcher
                    .dispatch_due_until(&endpoint, DISPATCH_BATCH, token)
                    .await
                {
                    Ok(dispatched) => {
                        report.delivered = dispatched.delivered;
                        report.failed = dispatched.failed;
                    }
                    Err(err) => warn!(error = %err, "notification dispatch failed"),
                }
            }
            Some(_) => {}
            None => debug!("no delivery endpoint configured; notifications stay queued"),
        }

        self.finish_tick(now, report).await
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::seconds(self.inner.config.stale_sending_secs)
    }

    async fn requeue_sending(&self, older_than: DateTime<Utc>) {
        if let Err(err) = self
            .inner
            .dispatcher
            .queue()
            .requeue_stale_sending(older_than)
            .await
        {
            warn!(error = %err, "could not requeue stale notifications");
        }
    }

    async fn finish_tick(&self, at: DateTime<Utc>, report: TickReport) -> TickReport {
        *self.inner.last_tick_at.write().await = Some(at);
        self.inner.bus.publish(CoreEvent::TickCompleted {
            at,
            accounts_synced: report.accounts_synced,
            accounts_failed: report.accounts_failed,
            delivered: report.delivered,
            failed: report.failed,
        });
        report
    }
}

async fn run_loop(scheduler: Scheduler, token: CancellationToken) {
    let mut ticker = tokio::time::interval(scheduler.inner.config.interval().max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let tick = AssertUnwindSafe(scheduler.run_tick(&token)).catch_unwind().await;
        match tick {
            Ok(report) => debug!(?report, "scheduler tick finished"),
            Err(_) => error!("scheduler tick panicked"),
        }
    }
}
