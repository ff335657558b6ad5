//! Failover dispatcher: sequential attempts over a shuffled origin pool.
//!
//! Each inbound request shuffles the pool independently, then tries up to
//! `min(retries + 1, pool size)` distinct origins one after another. Attempts
//! never run in parallel and there is no delay between them. Per-attempt
//! failures are absorbed here and only the aggregate outcome leaves.

use std::fmt;
use std::time::Instant;

use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::time::error::Elapsed;
use tracing::Instrument;

use super::forward;
use crate::clock::iso_timestamp;
use crate::config::LbConfig;

/// The parts of an inbound request replayed against each origin.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Path plus `?query`, exactly as received.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Why a single attempt did not produce an acceptable response.
#[derive(Debug)]
pub enum FailureReason {
    NetworkError(reqwest::Error),
    Timeout,
    FailStatus(u16),
}

impl FailureReason {
    fn label(&self) -> &'static str {
        match self {
            FailureReason::NetworkError(_) => "network_error",
            FailureReason::Timeout => "timeout",
            FailureReason::FailStatus(_) => "fail_status",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NetworkError(e) => write!(f, "network error: {e}"),
            FailureReason::Timeout => write!(f, "timed out"),
            FailureReason::FailStatus(status) => write!(f, "failure status {status}"),
        }
    }
}

/// Result of one attempt against one origin.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(reqwest::Response),
    Failure(FailureReason),
}

/// Uniformly shuffled copy of `origins`.
pub fn shuffle_origins<R: Rng + ?Sized>(origins: &[String], rng: &mut R) -> Vec<String> {
    let mut order = origins.to_vec();
    order.shuffle(rng);
    order
}

/// Sorts a completed (or timed out) origin call into an outcome.
fn classify(
    result: Result<Result<reqwest::Response, reqwest::Error>, Elapsed>,
    config: &LbConfig,
) -> AttemptOutcome {
    match result {
        Err(_) => AttemptOutcome::Failure(FailureReason::Timeout),
        Ok(Err(e)) if e.is_timeout() => AttemptOutcome::Failure(FailureReason::Timeout),
        Ok(Err(e)) => AttemptOutcome::Failure(FailureReason::NetworkError(e)),
        Ok(Ok(resp)) if config.is_fail_status(resp.status().as_u16()) => {
            // Dropping the response releases its body and connection.
            AttemptOutcome::Failure(FailureReason::FailStatus(resp.status().as_u16()))
        }
        Ok(Ok(resp)) => AttemptOutcome::Success(resp),
    }
}

/// Proxies requests to the origin pool with bounded failover.
#[derive(Clone)]
pub struct FailoverDispatcher {
    client: reqwest::Client,
}

impl FailoverDispatcher {
    /// `client` must not carry a global timeout; each attempt is bounded by
    /// the configured origin timeout instead.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Dispatch using a random order seeded from OS entropy.
    pub async fn dispatch(&self, config: &LbConfig, request: &InboundRequest) -> Response {
        let mut rng = StdRng::from_entropy();
        self.dispatch_with_rng(config, request, &mut rng).await
    }

    /// Dispatch using an explicit random source.
    pub async fn dispatch_with_rng<R: Rng + ?Sized>(
        &self,
        config: &LbConfig,
        request: &InboundRequest,
        rng: &mut R,
    ) -> Response {
        let order = shuffle_origins(&config.origins, rng);
        self.dispatch_in_order(config, request, order).await
    }

    /// Try `order` front to back, stopping at the first accepted response.
    pub async fn dispatch_in_order(
        &self,
        config: &LbConfig,
        request: &InboundRequest,
        order: Vec<String>,
    ) -> Response {
        let max_attempts = config.max_attempts().min(order.len());

        for (index, origin) in order.iter().take(max_attempts).enumerate() {
            let attempt = index + 1;
            let span = lb_tracing::origin_attempt_span!(origin, attempt);

            let outcome = self
                .attempt(config, origin, request)
                .instrument(span.clone())
                .await;
            span.record("outcome", outcome_label(&outcome));

            match outcome {
                AttemptOutcome::Success(resp) => {
                    tracing::debug!(parent: &span, "Origin accepted");
                    return forward::build_response(resp, origin, attempt);
                }
                AttemptOutcome::Failure(reason) => {
                    tracing::warn!(
                        parent: &span,
                        reason = %reason,
                        remaining = max_attempts - attempt,
                        "Origin attempt failed"
                    );
                }
            }
        }

        tracing::error!(attempts = max_attempts, "All origins failed");
        all_origins_failed(max_attempts)
    }

    async fn attempt(
        &self,
        config: &LbConfig,
        origin: &str,
        request: &InboundRequest,
    ) -> AttemptOutcome {
        let url = forward::target_url(origin, &request.path_and_query);
        let mut req_builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(forward::outbound_headers(&request.headers));
        if !request.body.is_empty() {
            req_builder = req_builder.body(request.body.clone());
        }

        let start = Instant::now();
        let result = tokio::time::timeout(config.origin_timeout(), req_builder.send()).await;

        let span = tracing::Span::current();
        span.record("latency_ms", start.elapsed().as_millis() as u64);
        if let Ok(Ok(resp)) = &result {
            span.record("status", resp.status().as_u16());
        }

        classify(result, config)
    }
}

fn outcome_label(outcome: &AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Success(_) => "success",
        AttemptOutcome::Failure(reason) => reason.label(),
    }
}

fn all_origins_failed(attempts: usize) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        axum::Json(serde_json::json!({
            "error": "All origins failed",
            "attempts": attempts,
            "timestamp": iso_timestamp(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::routing::any;
    use axum::Router;

    use super::*;
    use crate::config::RawEnv;
    use crate::test_support::{closed_origin, spawn_origin, HitCounter};

    fn config(pairs: &[(&str, &str)]) -> LbConfig {
        let raw: RawEnv = pairs.iter().copied().collect();
        LbConfig::resolve(&raw).unwrap()
    }

    fn get(path_and_query: &str) -> InboundRequest {
        InboundRequest {
            method: Method::GET,
            path_and_query: path_and_query.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn dispatcher() -> FailoverDispatcher {
        FailoverDispatcher::new(
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .no_proxy()
                .build()
                .unwrap(),
        )
    }

    /// Origin that answers every request with `status` and counts hits.
    async fn status_origin(status: StatusCode, hits: &HitCounter) -> String {
        let hits = hits.clone();
        spawn_origin(Router::new().fallback(any(move || {
            let hits = hits.clone();
            async move {
                hits.hit();
                (status, "origin body")
            }
        })))
        .await
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_shuffle_is_a_permutation() {
        let origins: Vec<String> = (0..8).map(|i| format!("http://o{i}")).collect();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let order = shuffle_origins(&origins, &mut rng);
            let mut sorted = order.clone();
            sorted.sort();
            let mut expected = origins.clone();
            expected.sort();
            assert_eq!(sorted, expected);
        }
    }

    #[test]
    fn test_shuffle_is_deterministic_for_a_seed() {
        let origins: Vec<String> = (0..5).map(|i| format!("http://o{i}")).collect();
        let a = shuffle_origins(&origins, &mut StdRng::seed_from_u64(42));
        let b = shuffle_origins(&origins, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_shuffle_reaches_every_first_position() {
        let origins: Vec<String> = (0..3).map(|i| format!("http://o{i}")).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let mut firsts = HashSet::new();
        let mut orders = HashSet::new();

        for _ in 0..600 {
            let order = shuffle_origins(&origins, &mut rng);
            firsts.insert(order[0].clone());
            orders.insert(order);
        }

        assert_eq!(firsts.len(), 3);
        assert_eq!(orders.len(), 6, "all 3! permutations should appear");
    }

    #[tokio::test]
    async fn test_first_origin_success_is_attempt_one() {
        let hits = HitCounter::default();
        let a = status_origin(StatusCode::OK, &hits).await;
        let b = status_origin(StatusCode::OK, &hits).await;
        let config = config(&[("ORIGINS", &format!("{a},{b}")), ("RETRIES", "3")]);

        let response = dispatcher()
            .dispatch_with_rng(&config, &get("/"), &mut StdRng::seed_from_u64(3))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[forward::LB_ATTEMPT_HEADER], "1");
        let served_by = response.headers()[forward::LB_ORIGIN_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        assert!(served_by == a || served_by == b);
        assert_eq!(hits.count(), 1);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"origin body");
    }

    #[tokio::test]
    async fn test_origin_lb_headers_are_replaced() {
        let origin = spawn_origin(Router::new().fallback(any(|| async {
            (
                [("x-lb-attempt", "9"), ("x-lb-origin", "http://upstream")],
                "spoofed",
            )
        })))
        .await;
        let config = config(&[("ORIGINS", &origin)]);

        let response = dispatcher()
            .dispatch_with_rng(&config, &get("/"), &mut StdRng::seed_from_u64(5))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        let attempts: Vec<_> = headers.get_all(forward::LB_ATTEMPT_HEADER).iter().collect();
        assert_eq!(attempts, vec!["1"]);
        let origins: Vec<_> = headers.get_all(forward::LB_ORIGIN_HEADER).iter().collect();
        assert_eq!(origins, vec![origin.as_str()]);
    }

    #[tokio::test]
    async fn test_network_error_fails_over_to_second_origin() {
        let hits = HitCounter::default();
        let dead = closed_origin().await;
        let live = status_origin(StatusCode::OK, &hits).await;
        let config = config(&[("ORIGINS", &format!("{dead},{live}")), ("RETRIES", "1")]);

        let response = dispatcher()
            .dispatch_in_order(&config, &get("/items"), vec![dead.clone(), live.clone()])
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[forward::LB_ATTEMPT_HEADER], "2");
        assert_eq!(response.headers()[forward::LB_ORIGIN_HEADER], live.as_str());
        assert_eq!(hits.count(), 1);
    }

    #[tokio::test]
    async fn test_fail_status_fails_over() {
        let failing_hits = HitCounter::default();
        let ok_hits = HitCounter::default();
        let failing = status_origin(StatusCode::from_u16(521).unwrap(), &failing_hits).await;
        let ok = status_origin(StatusCode::OK, &ok_hits).await;
        let config = config(&[("ORIGINS", &format!("{failing},{ok}"))]);

        let response = dispatcher()
            .dispatch_in_order(&config, &get("/"), vec![failing.clone(), ok.clone()])
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[forward::LB_ORIGIN_HEADER], ok.as_str());
        assert_eq!(failing_hits.count(), 1);
        assert_eq!(ok_hits.count(), 1);
    }

    #[tokio::test]
    async fn test_status_outside_fail_set_is_returned() {
        let hits = HitCounter::default();
        let a = status_origin(StatusCode::SERVICE_UNAVAILABLE, &hits).await;
        let b = status_origin(StatusCode::SERVICE_UNAVAILABLE, &hits).await;
        let config = config(&[("ORIGINS", &format!("{a},{b}")), ("FAIL_STATUSES", "500")]);

        let response = dispatcher().dispatch(&config, &get("/")).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[forward::LB_ATTEMPT_HEADER], "1");
        assert_eq!(hits.count(), 1);
    }

    #[tokio::test]
    async fn test_single_origin_caps_attempts() {
        let hits = HitCounter::default();
        let a = status_origin(StatusCode::INTERNAL_SERVER_ERROR, &hits).await;
        let config = config(&[("ORIGINS", &a), ("RETRIES", "3"), ("FAIL_STATUSES", "500")]);

        let response = dispatcher().dispatch(&config, &get("/")).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(hits.count(), 1, "an origin is never retried within a request");
        let body = body_json(response).await;
        assert_eq!(body["error"], "All origins failed");
        assert_eq!(body["attempts"], 1);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_retries_plus_one() {
        let counters: Vec<HitCounter> = (0..4).map(|_| HitCounter::default()).collect();
        let mut origins = Vec::new();
        for hits in &counters {
            origins.push(status_origin(StatusCode::GATEWAY_TIMEOUT, hits).await);
        }
        let config = config(&[("ORIGINS", &origins.join(",")), ("RETRIES", "2")]);

        let response = dispatcher()
            .dispatch_with_rng(&config, &get("/"), &mut StdRng::seed_from_u64(9))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["attempts"], 3);

        let per_origin: Vec<usize> = counters.iter().map(HitCounter::count).collect();
        assert_eq!(per_origin.iter().sum::<usize>(), 3);
        assert!(per_origin.iter().all(|&n| n <= 1), "origin repeated: {per_origin:?}");
    }

    #[tokio::test]
    async fn test_retries_zero_tries_one_origin() {
        let hits = HitCounter::default();
        let a = status_origin(StatusCode::INTERNAL_SERVER_ERROR, &hits).await;
        let b = status_origin(StatusCode::INTERNAL_SERVER_ERROR, &hits).await;
        let config = config(&[("ORIGINS", &format!("{a},{b}")), ("RETRIES", "0")]);

        let response = dispatcher().dispatch(&config, &get("/")).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["attempts"], 1);
        assert_eq!(hits.count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_over() {
        let slow_hits = HitCounter::default();
        let fast_hits = HitCounter::default();
        let slow = {
            let hits = slow_hits.clone();
            spawn_origin(Router::new().fallback(any(move || {
                let hits = hits.clone();
                async move {
                    hits.hit();
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "too late"
                }
            })))
            .await
        };
        let fast = status_origin(StatusCode::OK, &fast_hits).await;
        let config = config(&[
            ("ORIGINS", &format!("{slow},{fast}")),
            ("ORIGIN_TIMEOUT_MS", "1000"),
        ]);

        let start = Instant::now();
        let response = dispatcher()
            .dispatch_in_order(&config, &get("/"), vec![slow.clone(), fast.clone()])
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[forward::LB_ATTEMPT_HEADER], "2");
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(slow_hits.count(), 1);
        assert_eq!(fast_hits.count(), 1);
    }

    #[tokio::test]
    async fn test_request_is_replayed_verbatim() {
        let seen: Arc<std::sync::Mutex<Vec<(String, String, Option<String>, Bytes)>>> =
            Arc::default();
        let origin = {
            let seen = seen.clone();
            spawn_origin(Router::new().fallback(any(
                move |method: Method, uri: axum::http::Uri, headers: HeaderMap, body: Bytes| {
                    let seen = seen.clone();
                    async move {
                        let custom = headers
                            .get("x-custom")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        seen.lock()
                            .unwrap()
                            .push((method.to_string(), uri.to_string(), custom, body));
                        StatusCode::CREATED
                    }
                },
            )))
            .await
        };
        let config = config(&[("ORIGINS", &origin)]);

        let mut headers = HeaderMap::new();
        headers.insert("x-custom", "42".parse().unwrap());
        let request = InboundRequest {
            method: Method::PUT,
            path_and_query: "/v1/things/7?dry_run=true".to_string(),
            headers,
            body: Bytes::from_static(b"{\"name\":\"seven\"}"),
        };

        let response = dispatcher().dispatch(&config, &request).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (method, uri, custom, body) = &seen[0];
        assert_eq!(method, "PUT");
        assert_eq!(uri, "/v1/things/7?dry_run=true");
        assert_eq!(custom.as_deref(), Some("42"));
        assert_eq!(&body[..], b"{\"name\":\"seven\"}");
    }

    #[tokio::test]
    async fn test_all_network_errors_yield_502() {
        let a = closed_origin().await;
        let b = closed_origin().await;
        let config = config(&[("ORIGINS", &format!("{a},{b}")), ("RETRIES", "5")]);

        let response = dispatcher().dispatch(&config, &get("/")).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(body_json(response).await["attempts"], 2);
    }
}
