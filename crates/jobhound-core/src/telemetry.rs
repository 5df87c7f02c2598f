use std::fmt as StdFmt;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{TraceContextExt, TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracerProvider};
use opentelemetry_sdk::{Resource, trace};
use serde_json::json;
use thiserror::Error;
use tracing::Subscriber;
use tracing_opentelemetry::{OpenTelemetrySpanExt, OtelData};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{self, FmtContext};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{AppConfig, TelemetryConfig};

static SUBSCRIBER_INSTALLED: OnceLock<()> = OnceLock::new();

/// Keeps the tracer provider alive; pending spans are flushed when dropped.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to set tracing subscriber: {0}")]
    SubscriberInit(String),
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn for_env(env: &str) -> Self {
        if env.eq_ignore_ascii_case("dev") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

/// Installs the global subscriber: `RUST_LOG` filtering, pretty output in dev and
/// one JSON object per line elsewhere, plus OTLP export when configured.
///
/// Only the first call installs anything; later calls return an inert guard.
pub fn init_telemetry(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    if SUBSCRIBER_INSTALLED.get().is_some() {
        return Ok(TelemetryGuard { provider: None });
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let provider = build_provider(app, telemetry)?;
    let tracer = provider
        .as_ref()
        .map(|provider| provider.tracer(app.service_name.clone()));

    match LogFormat::for_env(&app.env) {
        LogFormat::Json => {
            let fmt_layer = fmt::layer().event_format(JsonTraceFormatter::new(&app.service_name));
            install_subscriber(fmt_layer, env_filter, tracer)?;
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .with_target(true)
                .pretty()
                .with_writer(std::io::stderr);
            install_subscriber(fmt_layer, env_filter, tracer)?;
        }
    }

    let _ = SUBSCRIBER_INSTALLED.set(());
    Ok(TelemetryGuard { provider })
}

/// Logging without trace export, for tools and tests that have no config file.
pub fn init_logging(env: &str) -> Result<(), TelemetryError> {
    let app = AppConfig {
        service_name: "jobhound".to_string(),
        port: 0,
        env: env.to_string(),
    };
    let telemetry = TelemetryConfig {
        otlp_endpoint: None,
        export_traces: false,
    };
    init_telemetry(&app, &telemetry).map(|_guard| ())
}

fn build_provider(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<Option<SdkTracerProvider>, TelemetryError> {
    if !telemetry.export_traces {
        return Ok(None);
    }

    let Some(endpoint) = telemetry
        .otlp_endpoint
        .as_deref()
        .filter(|endpoint| !endpoint.is_empty())
    else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_timeout(Duration::from_secs(3))
        .with_endpoint(endpoint)
        .build()
        .map_err(|err| TelemetryError::ExporterBuild(err.to_string()))?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", app.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment", app.env.clone()),
        ])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::builder(exporter).build())
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(opentelemetry_sdk::propagation::TraceContextPropagator::new());

    Ok(Some(provider))
}

fn install_subscriber<L>(
    fmt_layer: L,
    env_filter: EnvFilter,
    tracer: Option<trace::Tracer>,
) -> Result<(), TelemetryError>
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    let otel_layer = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let subscriber = Registry::default()
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))
}

struct JsonTraceFormatter {
    service: String,
}

impl JsonTraceFormatter {
    fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for JsonTraceFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> StdFmt::Result {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let current = ctx.lookup_current();
        let trace_id = current
            .as_ref()
            .and_then(|span| {
                span.extensions()
                    .get::<OtelData>()
                    .and_then(|data| data.trace_id())
            })
            .or_else(|| {
                let otel_ctx = tracing::Span::current().context();
                let span_ctx = otel_ctx.span().span_context().clone();
                span_ctx.is_valid().then(|| span_ctx.trace_id())
            })
            .map(|id| id.to_string());

        let payload = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "service": self.service,
            "level": event.metadata().level().as_str().to_lowercase(),
            "target": event.metadata().target(),
            "span": current.map(|span| span.name().to_string()),
            "trace_id": trace_id,
            "fields": visitor.fields,
        });

        let serialized = serde_json::to_string(&payload).map_err(|_| StdFmt::Error)?;
        writer.write_str(&serialized)?;
        writer.write_str("\n")
    }
}

#[derive(Default)]
struct JsonVisitor {
    fields: serde_json::Map<String, serde_json::Value>,
}

impl tracing_subscriber::field::Visit for JsonVisitor {
    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields
            .insert(field.name().to_string(), value.to_string().into());
    }

    fn record_error(
        &mut self,
        field: &tracing::field::Field,
        value: &(dyn std::error::Error + 'static),
    ) {
        self.fields
            .insert(field.name().to_string(), value.to_string().into());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn StdFmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}").into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    static INIT_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    #[test]
    fn log_format_follows_environment() {
        assert_eq!(LogFormat::for_env("dev"), LogFormat::Pretty);
        assert_eq!(LogFormat::for_env("DEV"), LogFormat::Pretty);
        assert_eq!(LogFormat::for_env("prod"), LogFormat::Json);
    }

    #[test]
    fn telemetry_init_is_idempotent_and_handles_missing_endpoint() {
        let _guard = INIT_GUARD.lock().expect("lock init");
        let app = AppConfig {
            service_name: "jobhound".into(),
            port: 0,
            env: "prod".into(),
        };
        let telemetry = TelemetryConfig {
            otlp_endpoint: None,
            export_traces: true,
        };

        let first = init_telemetry(&app, &telemetry).expect("initializes without endpoint");
        assert!(!first.exporting());
        let second = init_telemetry(&app, &telemetry).expect("second init is a no-op");
        assert!(!second.exporting());
    }

    #[test]
    fn json_formatter_includes_service_trace_id_and_fields() {
        #[derive(Clone)]
        struct BufferWriter {
            buf: Arc<Mutex<Vec<u8>>>,
        }

        impl Write for BufferWriter {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.buf.lock().expect("lock buffer").extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = {
            let buffer = buffer.clone();
            move || BufferWriter {
                buf: buffer.clone(),
            }
        };

        let provider = SdkTracerProvider::builder().build();
        let tracer = provider.tracer("test");

        let subscriber = Registry::default()
            .with(
                fmt::layer()
                    .event_format(JsonTraceFormatter::new("jobhound-test"))
                    .with_writer(writer),
            )
            .with(tracing_opentelemetry::layer().with_tracer(tracer));

        let mut recorded_trace_id = None;
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("sync_account");
            recorded_trace_id = Some(span.context().span().span_context().trace_id().to_string());
            let _entered = span.enter();
            tracing::info!(account_id = "acc-1", inserted = 3, "sync committed");
        });

        let output =
            String::from_utf8(buffer.lock().expect("lock buffer").clone()).expect("utf8 output");
        let line = output.lines().next().expect("log line");
        let payload: serde_json::Value = serde_json::from_str(line).expect("json line");

        assert_eq!(payload["service"], "jobhound-test");
        assert_eq!(payload["level"], "info");
        assert_eq!(payload["span"], "sync_account");
        assert_eq!(payload["fields"]["account_id"], "acc-1");
        assert_eq!(payload["fields"]["inserted"], 3);
        assert_eq!(payload["fields"]["message"], "sync committed");
        assert_eq!(
            payload["trace_id"].as_str(),
            recorded_trace_id.as_deref(),
            "trace id should match the active span"
        );
    }
}
