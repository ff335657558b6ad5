//! CORS policy: allow-list matching, preflight responses, and response decoration.
//!
//! A wildcard allow-list is never combined with `Allow-Credentials: true` on
//! the wire. Browsers reject that pair, so with credentials enabled the
//! concrete request origin is echoed instead of `*`.

use axum::body::Body;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::{AllowOrigins, CorsConfig};

/// OPTIONS carrying both `Origin` and `Access-Control-Request-Method`.
pub fn is_preflight(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::OPTIONS
        && headers.contains_key(ORIGIN)
        && headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD)
}

/// The `Origin` request header, if present and valid ASCII.
pub fn request_origin(headers: &HeaderMap) -> Option<&str> {
    headers.get(ORIGIN).and_then(|v| v.to_str().ok())
}

pub fn is_origin_allowed(cors: &CorsConfig, origin: &str) -> bool {
    if !cors.enabled {
        return false;
    }
    match &cors.allow_origins {
        AllowOrigins::Any => true,
        AllowOrigins::List(list) => list.iter().any(|allowed| allowed == origin),
    }
}

/// Value for `Access-Control-Allow-Origin`, or `None` to omit the header.
pub fn resolve_allow_origin(cors: &CorsConfig, origin: &str) -> Option<String> {
    if !is_origin_allowed(cors, origin) {
        return None;
    }
    match cors.allow_origins {
        AllowOrigins::Any if !cors.allow_credentials => Some("*".to_string()),
        _ => Some(origin.to_string()),
    }
}

/// Answer a preflight request: 204 with the negotiated headers, or 403.
pub fn build_preflight_response(cors: &CorsConfig, request_headers: &HeaderMap) -> Response {
    let allow_origin = request_origin(request_headers)
        .and_then(|origin| resolve_allow_origin(cors, origin))
        .and_then(|value| HeaderValue::from_str(&value).ok());

    let Some(allow_origin) = allow_origin else {
        tracing::debug!("CORS preflight denied");
        return (
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({ "error": "cors_denied" })),
        )
            .into_response();
    };

    let mut headers = HeaderMap::new();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
    insert_joined(&mut headers, ACCESS_CONTROL_ALLOW_METHODS, &cors.allow_methods);
    match request_headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
        Some(requested) => {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        None => insert_joined(&mut headers, ACCESS_CONTROL_ALLOW_HEADERS, &cors.allow_headers),
    }
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(cors.max_age_sec));
    if cors.allow_credentials {
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    *response.headers_mut() = headers;
    response
}

/// Decorate an outbound response for an allowed origin. Returns the response
/// unchanged when CORS is disabled, the origin is absent, or it is not allowed.
pub fn apply_to_response(cors: &CorsConfig, response: Response, origin: Option<&str>) -> Response {
    let Some(allow_origin) = origin
        .and_then(|origin| resolve_allow_origin(cors, origin))
        .and_then(|value| HeaderValue::from_str(&value).ok())
    else {
        return response;
    };

    let (mut parts, body) = response.into_parts();
    let mut headers = parts.headers.clone();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
    if cors.allow_credentials {
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    if let Some(expose) = cors.expose_headers.as_ref().filter(|list| !list.is_empty()) {
        insert_joined(&mut headers, ACCESS_CONTROL_EXPOSE_HEADERS, expose);
    }
    parts.headers = headers;
    Response::from_parts(parts, body)
}

fn insert_joined(headers: &mut HeaderMap, name: HeaderName, values: &[String]) {
    match HeaderValue::from_str(&values.join(", ")) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => tracing::warn!(header = %name, error = %e, "Skipping invalid CORS header value"),
    }
}
