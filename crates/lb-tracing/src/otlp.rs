//! OTLP exporter setup and TracingGuard.

use anyhow::Result;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{OtlpProtocol, TracingConfig};

/// RAII guard that shuts down the tracer provider on drop.
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl TracingGuard {
    /// Whether spans are being exported to an OTLP collector.
    pub fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(ref mut provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shutdown tracer provider: {e}");
            }
        }
    }
}

/// Initialize the tracing subsystem with fmt logging and optional OTLP export.
///
/// If the OTLP exporter fails to initialize (e.g. endpoint unreachable),
/// falls back to fmt-only tracing so the load balancer can start without a collector.
///
/// Returns a [`TracingGuard`] that must be held for the lifetime of the application
/// to ensure traces are flushed on shutdown.
pub fn init_tracing(config: &TracingConfig) -> TracingGuard {
    let endpoint = match &config.otlp_endpoint {
        Some(url) => url.clone(),
        None => {
            init_fmt_only(config);
            return TracingGuard { provider: None };
        }
    };

    match try_init_with_otlp(config, &endpoint) {
        Ok(guard) => guard,
        Err(e) => {
            init_fmt_only(config);

            tracing::warn!(
                error = %e,
                endpoint = %endpoint,
                "OTLP exporter failed to initialize, running with fmt-only tracing"
            );

            TracingGuard { provider: None }
        }
    }
}

fn env_filter(config: &TracingConfig) -> EnvFilter {
    EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Stderr fmt layer, plain text or JSON lines.
fn fmt_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

fn init_fmt_only(config: &TracingConfig) {
    tracing_subscriber::registry()
        .with(fmt_layer(config.json_logs))
        .with(env_filter(config))
        .init();
}

/// Try to initialize tracing with OTLP export. Returns Err if the exporter
/// cannot be built.
fn try_init_with_otlp(config: &TracingConfig, endpoint: &str) -> Result<TracingGuard> {
    let otlp_exporter = match config.protocol {
        OtlpProtocol::Grpc => opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?,
        OtlpProtocol::Http => opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()?,
    };

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(otlp_exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build();

    let tracer = provider.tracer(config.service_name.clone());

    tracing_subscriber::registry()
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(fmt_layer(config.json_logs))
        .with(env_filter(config))
        .init();

    tracing::info!(
        endpoint = %endpoint,
        service = %config.service_name,
        protocol = ?config.protocol,
        "OpenTelemetry OTLP tracing initialized"
    );

    Ok(TracingGuard {
        provider: Some(provider),
    })
}
