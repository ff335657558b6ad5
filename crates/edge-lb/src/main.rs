//! edge-lb: stateless reverse proxy that fails over across a pool of origins
//! and enforces a configurable CORS policy.

mod clock;
mod config;
mod cors;
mod diagnostics;
mod error;
mod proxy;
mod server;
mod settings;
#[cfg(test)]
mod test_support;

use config::RawEnv;
use proxy::failover::FailoverDispatcher;
use server::AppState;
use settings::Settings;

fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1).cloned())
        .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
        .or_else(|| std::env::var("EDGE_LB_CONFIG").ok())
        .unwrap_or_else(|| "edge-lb.toml".to_string());

    let listen_override = args
        .iter()
        .position(|a| a == "--listen")
        .and_then(|i| args.get(i + 1).cloned());

    let origins_override = args
        .iter()
        .position(|a| a == "--origins")
        .and_then(|i| args.get(i + 1).cloned());

    // Load configuration
    let mut settings = Settings::load(&config_path)?;

    // Apply CLI overrides (take precedence over TOML and env vars)
    if let Some(addr) = listen_override {
        settings.server.listen_address = addr;
    }
    let mut raw_env = RawEnv::capture(std::mem::take(&mut settings.env));
    if let Some(origins) = origins_override {
        raw_env.set(config::ORIGINS, origins);
    }

    // Build the tokio runtime first — tonic gRPC exporter needs a reactor context
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Initialize tracing (OTLP export is optional — falls back to fmt-only)
        let tracing_guard = lb_tracing::init_tracing(&settings.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %settings.server.listen_address,
            otlp_export = tracing_guard.is_exporting(),
            json_logs = settings.tracing.json_logs,
            "Starting edge-lb"
        );

        // Surface configuration problems early; requests still resolve per call.
        match config::LbConfig::resolve(&raw_env) {
            Ok(config) => tracing::info!(
                origin_count = config.origins.len(),
                retries = config.retries,
                origin_timeout_ms = config.origin_timeout_ms,
                cors_enabled = config.cors.enabled,
                "Load balancer configuration resolved"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                "Load balancer configuration is invalid, requests will fail with 500"
            ),
        }

        run(settings, raw_env).await
    })
}

async fn run(settings: Settings, raw_env: RawEnv) -> anyhow::Result<()> {
    // No client-wide timeout: every attempt carries its own deadline.
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let state = AppState {
        raw_env,
        dispatcher: FailoverDispatcher::new(client),
        max_body_bytes: settings.server.max_body_bytes,
    };

    // Run the server
    server::run(state, &settings.server.listen_address).await
}
