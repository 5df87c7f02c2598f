use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use jobhound_core::config::{AppConfig, PathsConfig, TelemetryConfig};
use jobhound_core::notifications::ScriptedChannel;
use jobhound_core::sync::{RawMessage, StaticMailProvider};
use jobhound_core::{
    AccountConfig, AccountProviderResolver, AccountRepository, CompanyRepository, Config,
    Database, DeliveryConfig, ExtractionConfig, SchedulerConfig, SyncConfig, migrations,
};
use tempfile::TempDir;

use crate::AppState;

pub struct Harness {
    pub state: AppState,
    pub provider: StaticMailProvider,
    pub channel: ScriptedChannel,
    pub account_id: String,
    _dir: TempDir,
}

pub async fn harness() -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("db.sqlite");
    let db = Database::new(&db_path).await.expect("db");
    migrations::run_migrations(&db).await.expect("migrations");

    let config = Config {
        app: AppConfig {
            service_name: "jobhound-test".into(),
            port: 0,
            env: "dev".into(),
        },
        paths: PathsConfig { database: db_path },
        telemetry: TelemetryConfig {
            otlp_endpoint: None,
            export_traces: false,
        },
        sync: SyncConfig {
            fetch_retry_base_ms: 1,
            ..SyncConfig::default()
        },
        scheduler: SchedulerConfig {
            interval_secs: 3600,
            drain_timeout_secs: 1,
            ..SchedulerConfig::default()
        },
        delivery: DeliveryConfig {
            webhook_url: Some("https://hooks.example.com/notify".into()),
            ..DeliveryConfig::default()
        },
        extraction: ExtractionConfig::default(),
    };

    let account = AccountRepository::new(db.clone())
        .create("me@example.com", None, AccountConfig::Static)
        .await
        .expect("account");
    CompanyRepository::new(db.clone())
        .create_with_id("acme", "Acme")
        .await
        .expect("company");

    let resolver = AccountProviderResolver::new(db.clone(), &config.sync);
    let provider = StaticMailProvider::new();
    resolver
        .register_static(account.id.clone(), provider.clone())
        .await;
    let channel = ScriptedChannel::new();
    let state = AppState::build(db, &config, Arc::new(resolver), Arc::new(channel.clone()));

    Harness {
        state,
        provider,
        channel,
        account_id: account.id,
        _dir: dir,
    }
}

pub fn received(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 9, minute, 0).unwrap()
}

pub fn raw_message(remote_id: &str, from: &str, subject: &str, minute: u32) -> RawMessage {
    RawMessage {
        remote_id: remote_id.into(),
        from_email: Some(from.into()),
        from_name: None,
        subject: Some(subject.into()),
        body_text: Some(format!("{subject} body")),
        received_at: received(minute),
        attachments: Vec::new(),
    }
}
