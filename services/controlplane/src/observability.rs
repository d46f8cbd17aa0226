//! Logging, request tracing and the Prometheus endpoint.
//!
//! # Purpose
//! Installs the `tracing` subscriber (env filter and fmt output, plus OTLP
//! span export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set), names the service
//! counters and serves `/metrics` on its own listener.
//!
//! # Notes
//! Initialization is guarded by `OnceLock` so tests can call it repeatedly.
//! Incoming `traceparent` headers become the parent of the `http.request`
//! span built in [`crate::app`].
use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const RECORD_WRITES: &str = "nimbus_record_writes_total";
pub const CAS_CONFLICTS: &str = "nimbus_cas_conflicts_total";
pub const RETRIES: &str = "nimbus_retries_total";
pub const WATCH_EVENTS: &str = "nimbus_watch_events_total";
pub const SCHEDULING_ATTEMPTS: &str = "nimbus_scheduling_attempts_total";
pub const QUOTA_REJECTIONS: &str = "nimbus_quota_rejections_total";

const COUNTERS: [(&str, &str); 6] = [
    (RECORD_WRITES, "Successful record writes by table and operation"),
    (CAS_CONFLICTS, "Compare-and-swap writes that matched no row"),
    (RETRIES, "Retried attempts by operation"),
    (WATCH_EVENTS, "Change feed events delivered by table and type"),
    (SCHEDULING_ATTEMPTS, "Calls made to the instance scheduler"),
    (QUOTA_REJECTIONS, "Instance creates rejected by quota"),
];

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static SUBSCRIBER_INIT: OnceLock<()> = OnceLock::new();
static PROPAGATOR_INIT: OnceLock<()> = OnceLock::new();

pub fn init_observability(service_name: &str, region_id: &str) -> anyhow::Result<PrometheusHandle> {
    SUBSCRIBER_INIT.get_or_init(|| {
        install_propagator();
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer());
        match otlp_tracer_provider(service_name, region_id) {
            Some(provider) => {
                let tracer = provider.tracer(service_name.to_string());
                let _ = registry
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .try_init();
            }
            None => {
                let _ = registry.try_init();
            }
        }
    });

    let handle = install_metrics_recorder()?;
    for (name, description) in COUNTERS {
        metrics::describe_counter!(name, description);
    }
    Ok(handle)
}

fn install_propagator() {
    PROPAGATOR_INIT.get_or_init(|| {
        global::set_text_map_propagator(TraceContextPropagator::new());
    });
}

fn resource(service_name: &str, region_id: &str) -> Resource {
    Resource::builder_empty()
        .with_attributes([
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("cloud.region", region_id.to_string()),
        ])
        .build()
}

/// Span export is opt-in; without a collector endpoint spans stay local.
fn otlp_tracer_provider(service_name: &str, region_id: &str) -> Option<SdkTracerProvider> {
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .filter(|endpoint| !endpoint.is_empty())?;
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
        .ok()?;
    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource(service_name, region_id))
            .build(),
    )
}

/// Remote parent carried by the request's `traceparent` header, if any.
pub fn trace_context_from_headers(headers: &axum::http::HeaderMap) -> opentelemetry::Context {
    install_propagator();
    global::get_text_map_propagator(|prop| prop.extract(&HeaderMapExtractor(headers)))
}

struct HeaderMapExtractor<'a>(&'a axum::http::HeaderMap);

impl Extractor for HeaderMapExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

pub async fn serve_metrics(handle: PrometheusHandle, listener: TcpListener) -> std::io::Result<()> {
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    );
    axum::serve(listener, app.into_make_service()).await
}

fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;
    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}
