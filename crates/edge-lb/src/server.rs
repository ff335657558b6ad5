//! Axum HTTP server: single entry point, listener, graceful shutdown.
//!
//! Every request lands in [`handle_request`], which resolves the configuration
//! and then picks one of three routes: diagnostics, CORS preflight, or proxying.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::clock::iso_timestamp;
use crate::config::{LbConfig, RawEnv};
use crate::cors;
use crate::diagnostics;
use crate::proxy::correlation;
use crate::proxy::failover::{FailoverDispatcher, InboundRequest};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Raw load-balancer input, resolved afresh for every request.
    pub raw_env: RawEnv,
    pub dispatcher: FailoverDispatcher,
    pub max_body_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Build and run the HTTP server.
pub async fn run(state: AppState, listen_addr: &str) -> anyhow::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(address = %listen_addr, "edge-lb listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("edge-lb shut down gracefully");
    Ok(())
}

/// Entry point for every inbound request.
///
/// Configuration errors are caught here and rendered as a 500 envelope;
/// nothing below this point lets an origin failure escape.
async fn handle_request(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let request_id = correlation::generate_id();
    let span = lb_tracing::lb_request_span!(&request_id, request.method(), request.uri().path());

    async move {
        let response = match LbConfig::resolve(&state.raw_env) {
            Ok(config) => route(&state, &config, request).await,
            Err(e) => {
                tracing::error!(error = %e, "Load balancer configuration error");
                e.into_response()
            }
        };
        tracing::Span::current().record("status", response.status().as_u16());
        response
    }
    .instrument(span)
    .await
}

async fn route(state: &AppState, config: &LbConfig, request: Request) -> Response {
    let span = tracing::Span::current();
    let origin = cors::request_origin(request.headers()).map(str::to_string);

    if request.uri().path() == config.diag_path {
        span.record("route", "diagnostics");
        return cors::apply_to_response(
            &config.cors,
            diagnostics::diagnostics_response(config),
            origin.as_deref(),
        );
    }

    if config.cors.enabled && cors::is_preflight(request.method(), request.headers()) {
        span.record("route", "preflight");
        return cors::build_preflight_response(&config.cors, request.headers());
    }

    span.record("route", "proxy");
    let inbound = match read_inbound(request, state.max_body_bytes).await {
        Ok(inbound) => inbound,
        Err(response) => return response,
    };
    let response = state.dispatcher.dispatch(config, &inbound).await;
    cors::apply_to_response(&config.cors, response, origin.as_deref())
}

/// Buffer the request so it can be replayed against several origins.
async fn read_inbound(request: Request, max_body_bytes: usize) -> Result<InboundRequest, Response> {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let body = match axum::body::to_bytes(body, max_body_bytes).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read request body");
            return Err((
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({
                    "error": "Failed to read request body",
                    "timestamp": iso_timestamp(),
                })),
            )
                .into_response());
        }
    };

    Ok(InboundRequest {
        method: parts.method,
        path_and_query,
        headers: parts.headers,
        body,
    })
}

/// Wait for SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, draining connections...");
}
