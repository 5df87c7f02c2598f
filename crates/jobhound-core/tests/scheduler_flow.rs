use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use jobhound_core::calendar::{CalendarRepository, NewCompanyEvent};
use jobhound_core::migrations::run_migrations;
use jobhound_core::notifications::{
    DeliveryChannel, DeliveryState, Dispatcher, ScriptedChannel, WebhookChannel,
};
use jobhound_core::sync::{AccountProviderResolver, RawMessage, StaticMailProvider};
use jobhound_core::{
    AccountConfig, AccountRepository, CompanyRepository, CoreEvent, Database,
    EventBus, MessageRepository, NotificationQueue, Page, RetryPolicy, Scheduler, SchedulerConfig,
    SyncConfig, SyncWorker, TriggerEvaluator,
};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    scheduler: Scheduler,
    db: Database,
    queue: NotificationQueue,
    provider: StaticMailProvider,
    bus: EventBus,
    account_id: String,
    _dir: TempDir,
}

async fn harness(
    config: SchedulerConfig,
    channel: Arc<dyn DeliveryChannel>,
    endpoint: Option<String>,
) -> Harness {
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

    let bus = EventBus::default();
    let sync_config = SyncConfig {
        fetch_retry_base_ms: 1,
        ..SyncConfig::default()
    };
    let resolver = AccountProviderResolver::new(db.clone(), &sync_config);
    let provider = StaticMailProvider::new();
    resolver
        .register_static(account.id.clone(), provider.clone())
        .await;
    let sync = SyncWorker::new(db.clone(), Arc::new(resolver), bus.clone(), sync_config);

    let queue = NotificationQueue::new(
        db.clone(),
        bus.clone(),
        RetryPolicy {
            max_attempts: 3,
            base: Duration::ZERO,
            cap: Duration::ZERO,
        },
    );
    let dispatcher = Dispatcher::new(queue.clone(), channel);
    let triggers = TriggerEvaluator::new(CalendarRepository::new(db.clone()), queue.clone(), &config);
    let scheduler = Scheduler::new(sync, dispatcher, triggers, bus.clone(), config, endpoint);

    Harness {
        scheduler,
        db,
        queue,
        provider,
        bus,
        account_id: account.id,
        _dir: dir,
    }
}

fn raw(remote_id: &str, minute: u32) -> RawMessage {
    RawMessage {
        remote_id: remote_id.into(),
        from_email: Some("hr@acme.test".into()),
        from_name: Some("Acme HR".into()),
        subject: Some("Interview".into()),
        body_text: Some("Please pick a slot".into()),
        received_at: Utc.with_ymd_and_hms(2026, 5, 1, 9, minute, 0).unwrap(),
        attachments: Vec::new(),
    }
}

#[tokio::test]
async fn stop_during_fetch_leaves_no_half_classified_mail() {
    let config = SchedulerConfig {
        interval_secs: 3600,
        drain_timeout_secs: 5,
        ..SchedulerConfig::default()
    };
    let h = harness(config, Arc::new(ScriptedChannel::new()), None).await;
    h.provider.push_message(raw("m1", 1)).await;
    h.provider.push_message(raw("m2", 2)).await;
    h.provider.set_fetch_delay(Duration::from_millis(300)).await;

    h.scheduler.start(None).await.expect("start");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.provider.fetch_calls(), 1);

    assert!(h.scheduler.stop().await);
    assert!(!h.scheduler.status().await.running);

    let messages = MessageRepository::new(h.db.clone())
        .list_by_account(&h.account_id, Page::default())
        .await
        .expect("list");
    assert!(messages.len() == 2 || messages.is_empty());
    assert!(messages.iter().all(|m| m.classified_at.is_some()));

    // The loop is gone: no further fetches happen.
    let calls = h.provider.fetch_calls();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.provider.fetch_calls(), calls);
}

#[tokio::test]
async fn stop_aborts_a_tick_that_outlives_the_drain_timeout() {
    let config = SchedulerConfig {
        interval_secs: 3600,
        drain_timeout_secs: 0,
        ..SchedulerConfig::default()
    };
    let h = harness(config, Arc::new(ScriptedChannel::new()), None).await;
    h.provider.push_message(raw("m1", 1)).await;
    h.provider.set_fetch_delay(Duration::from_secs(30)).await;

    h.scheduler.start(None).await.expect("start");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stopped = tokio::time::timeout(Duration::from_secs(5), h.scheduler.stop())
        .await
        .expect("stop returns promptly");
    assert!(stopped);

    let messages = MessageRepository::new(h.db.clone())
        .list_by_account(&h.account_id, Page::default())
        .await
        .expect("list");
    assert!(messages.is_empty());
    let account = AccountRepository::new(h.db.clone())
        .get_by_id(&h.account_id)
        .await
        .expect("account");
    assert_eq!(account.state.cursor, None);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let config = SchedulerConfig {
        interval_secs: 3600,
        drain_timeout_secs: 2,
        ..SchedulerConfig::default()
    };
    let h = harness(config, Arc::new(ScriptedChannel::new()), None).await;
    let mut events = h.bus.subscribe();

    let first = h.scheduler.start(None).await.expect("start");
    let second = h.scheduler.start(None).await.expect("start again");
    assert!(first.running && second.running);

    assert!(h.scheduler.stop().await);
    assert!(!h.scheduler.stop().await);

    let mut started = 0;
    let mut stopped = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            CoreEvent::SchedulerStarted { .. } => started += 1,
            CoreEvent::SchedulerStopped => stopped += 1,
            _ => {}
        }
    }
    assert_eq!(started, 1);
    assert_eq!(stopped, 1);

    // A stopped scheduler can be started again.
    assert!(h.scheduler.start(None).await.expect("restart").running);
    assert!(h.scheduler.stop().await);
}

#[tokio::test]
async fn check_now_delivers_upcoming_event_reminders_to_the_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .and(body_partial_json(json!({
            "notification": {"payload": {"title": "Upcoming: Final interview"}}
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let channel = WebhookChannel::new(Duration::from_secs(2)).expect("client");
    let h = harness(
        SchedulerConfig {
            interval_secs: 3600,
            ..SchedulerConfig::default()
        },
        Arc::new(channel),
        Some(format!("{}/notify", server.uri())),
    )
    .await;

    CalendarRepository::new(h.db.clone())
        .create_event(NewCompanyEvent {
            company_id: "acme".into(),
            title: "Final interview".into(),
            starts_at: Utc::now() + chrono::Duration::hours(2),
            location: None,
            source_message_id: None,
        })
        .await
        .expect("event");

    let report = h.scheduler.check_now().await;
    assert_eq!(report.notifications_enqueued, 1);
    assert_eq!(report.delivered, 1);

    // A second tick finds the same occurrence already delivered.
    let again = h.scheduler.check_now().await;
    assert_eq!(again.notifications_enqueued, 0);
    assert_eq!(again.delivered, 0);

    let items = h.queue.list(Some(DeliveryState::Delivered), 10).await.expect("list");
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn without_an_endpoint_reminders_wait_in_the_queue() {
    let h = harness(
        SchedulerConfig::default(),
        Arc::new(ScriptedChannel::new()),
        None,
    )
    .await;
    CalendarRepository::new(h.db.clone())
        .create_event(NewCompanyEvent {
            company_id: "acme".into(),
            title: "Coffee chat".into(),
            starts_at: Utc::now() + chrono::Duration::hours(1),
            location: Some("Cafe".into()),
            source_message_id: None,
        })
        .await
        .expect("event");

    let report = h.scheduler.check_now().await;
    assert_eq!(report.notifications_enqueued, 1);
    assert_eq!(report.delivered, 0);
    let pending = h.queue.list(Some(DeliveryState::Pending), 10).await.expect("list");
    assert_eq!(pending.len(), 1);

    h.scheduler
        .set_endpoint(Some("https://hooks.example.com/x"))
        .await
        .expect("endpoint");
    let report = h.scheduler.check_now().await;
    assert_eq!(report.delivered, 1);
}
