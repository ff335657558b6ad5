//! Span builder helpers for edge-lb instrumentation.

/// Create a tracing span for one inbound request.
///
/// Usage: `let span = lb_request_span!(request_id, method, path);`
///
/// `route` is recorded once the router has decided between diagnostics,
/// preflight and proxying. `status` is the final status sent to the client.
#[macro_export]
macro_rules! lb_request_span {
    ($request_id:expr, $method:expr, $path:expr) => {
        tracing::info_span!(
            "lb_request",
            request_id = %$request_id,
            method = %$method,
            path = %$path,
            route = tracing::field::Empty,
            status = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for a single attempt against one origin.
///
/// `outcome` is one of `success`, `network_error`, `timeout` or `fail_status`.
#[macro_export]
macro_rules! origin_attempt_span {
    ($origin:expr, $attempt:expr) => {
        tracing::info_span!(
            "origin_attempt",
            origin = %$origin,
            attempt = $attempt,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        )
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_span_macros_expand_without_subscriber() {
        let request = lb_request_span!("req-1", "GET", "/v1/items");
        request.record("route", "proxy");
        request.record("status", 200_u16);

        let attempt = origin_attempt_span!("http://origin-a", 1_u32);
        attempt.record("outcome", "success");
        attempt.record("latency_ms", 12_u64);
    }
}
