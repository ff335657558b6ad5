//! Header plumbing between the inbound request, the origin, and the client.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

/// Name of the origin that served a proxied response.
pub const LB_ORIGIN_HEADER: &str = "x-lb-origin";

/// 1-based attempt number that produced a proxied response.
pub const LB_ATTEMPT_HEADER: &str = "x-lb-attempt";

/// Headers that should NOT be forwarded (hop-by-hop headers).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Inbound headers to send to an origin.
///
/// Drops hop-by-hop headers, `host` (the client derives it from the origin URL)
/// and `content-length` (recomputed from the buffered body).
pub fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound.iter() {
        if is_hop_by_hop(name) || name == "host" || name == "content-length" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Turn an accepted origin response into the client response, streaming the
/// body verbatim and tagging it with the origin and attempt number.
pub fn build_response(upstream_resp: reqwest::Response, origin: &str, attempt: usize) -> Response {
    let status = upstream_resp.status();
    let mut response_builder = Response::builder()
        .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY));

    for (name, value) in upstream_resp.headers().iter() {
        // The origin's own X-LB-* values are replaced by the ones set below.
        if is_hop_by_hop(name) || name == LB_ORIGIN_HEADER || name == LB_ATTEMPT_HEADER {
            continue;
        }
        response_builder = response_builder.header(name, value);
    }

    match HeaderValue::from_str(origin) {
        Ok(value) => response_builder = response_builder.header(LB_ORIGIN_HEADER, value),
        Err(e) => tracing::warn!(error = %e, "Origin is not a valid header value, omitting X-LB-Origin"),
    }
    response_builder = response_builder.header(LB_ATTEMPT_HEADER, HeaderValue::from(attempt));

    let body = Body::from_stream(upstream_resp.bytes_stream());

    response_builder.body(body).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to build response");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    })
}

/// `origin` joined with the inbound path and query, e.g.
/// `https://a.internal` + `/v1/items?page=2`.
pub fn target_url(origin: &str, path_and_query: &str) -> String {
    format!("{}{}", origin.trim_end_matches('/'), path_and_query)
}
