mod api;
#[cfg(test)]
mod test_support;

use std::{env, net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use jobhound_core::notifications::DeliveryChannel;
use jobhound_core::sync::ProviderResolver;
use jobhound_core::{
    AccountProviderResolver, AllocationStore, CalendarRepository, Config, Database, Dispatcher,
    EventBus, HttpEventExtractor, NotificationQueue, RetryPolicy, Scheduler, SyncWorker,
    TriggerEvaluator, WebhookChannel, init_telemetry, migrations,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything the handlers reach for. Cheap to clone; all members are handles.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub scheduler: Scheduler,
    pub sync: SyncWorker,
    pub allocation: AllocationStore,
    pub notifications: NotificationQueue,
}

impl AppState {
    pub fn build(
        db: Database,
        config: &Config,
        resolver: Arc<dyn ProviderResolver>,
        channel: Arc<dyn DeliveryChannel>,
    ) -> Self {
        let bus = EventBus::default();

        let mut sync = SyncWorker::new(db.clone(), resolver, bus.clone(), config.sync.clone());
        if let Some(extractor) = HttpEventExtractor::from_config(&config.extraction) {
            sync = sync.with_extractor(Arc::new(extractor), config.extraction.template.clone());
        }

        let notifications = NotificationQueue::new(
            db.clone(),
            bus.clone(),
            RetryPolicy::from_config(&config.delivery),
        );
        let dispatcher = Dispatcher::new(notifications.clone(), channel);
        let triggers = TriggerEvaluator::new(
            CalendarRepository::new(db.clone()),
            notifications.clone(),
            &config.scheduler,
        );
        let scheduler = Scheduler::new(
            sync.clone(),
            dispatcher,
            triggers,
            bus.clone(),
            config.scheduler.clone(),
            config.delivery.webhook_url.clone(),
        );

        Self {
            allocation: AllocationStore::new(db.clone(), bus),
            db,
            scheduler,
            sync,
            notifications,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let db = Database::new(&config.paths.database).await?;
    let applied = migrations::run_migrations(&db).await?;
    info!(applied, "migrations complete");

    let resolver = Arc::new(AccountProviderResolver::new(db.clone(), &config.sync));
    let channel = Arc::new(WebhookChannel::new(config.delivery.timeout())?);
    let state = AppState::build(db, &config, resolver, channel);

    if config.scheduler.autostart {
        if let Err(err) = state.scheduler.start(None).await {
            error!(error = %err, "scheduler failed to start");
        }
    }

    let shutdown = CancellationToken::new();
    let scheduler = state.scheduler.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("jobhound listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    scheduler.stop().await;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api::router())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    database: String,
    scheduler_running: bool,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_status = match state.db.health_check().await {
        Ok(_) => "ok",
        Err(_) => "unhealthy",
    };

    let status = if db_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if db_status == "ok" {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: db_status.to_string(),
            scheduler_running: state.scheduler.status().await.running,
        }),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
    }

    shutdown.cancel();
}
