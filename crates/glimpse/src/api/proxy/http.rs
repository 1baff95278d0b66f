//! Upstream HTTP forwarding for preview traffic.
//!
//! Requests are re-targeted at the session's dev server on loopback.
//! Hop-by-hop headers are stripped in both directions, frame-embedding
//! headers are relaxed for the preview iframe, and HTML bodies are rewritten
//! in path mode. Event streams and large bodies pass through unbuffered.

use axum::body::{Body, to_bytes};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use log::{debug, error, warn};
use std::time::Duration;

use crate::config::Settings;

use super::rewrite::rewrite_html;

/// Largest request or response body the proxy will hold in memory.
pub const MAX_BUFFERED_BODY: usize = 10 * 1024 * 1024;

/// Response bodies above this size stream through without buffering.
const STREAM_THRESHOLD: u64 = 1024 * 1024;

/// Deadline for the upstream to produce response headers. Body streaming is
/// exempt.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// HTTP client type shared through the app state.
pub type ProxyClient = Client<HttpConnector, Body>;

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message))
        .unwrap_or_default()
}

/// Forward a request to `127.0.0.1:{port}/{path}` and relay the response.
pub async fn forward_request(
    client: &ProxyClient,
    req: Request<Body>,
    port: u16,
    path: &str,
    session_id: &str,
    settings: &Settings,
) -> Response<Body> {
    let (parts, body) = req.into_parts();

    let mut target = format!("http://127.0.0.1:{}/{}", port, path);
    if let Some(query) = parts.uri.query() {
        target.push('?');
        target.push_str(query);
    }

    let uri: Uri = match target.parse() {
        Ok(uri) => uri,
        Err(e) => {
            error!("Invalid upstream URI {}: {:?}", target, e);
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Proxy error");
        }
    };

    debug!(
        "Proxying {} {} -> port {} for session {}",
        parts.method, path, port, session_id
    );

    let body_bytes = match to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to buffer proxy request body: {:?}", e);
            return plain_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
    };

    let mut forwarded = match Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(Body::from(body_bytes.clone()))
    {
        Ok(forwarded) => forwarded,
        Err(e) => {
            error!("Failed to build upstream request: {:?}", e);
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Proxy error");
        }
    };
    *forwarded.headers_mut() = upstream_request_headers(&parts.headers);
    if !body_bytes.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&body_bytes.len().to_string()) {
            forwarded
                .headers_mut()
                .insert(header::CONTENT_LENGTH, value);
        }
    }

    let response = match tokio::time::timeout(UPSTREAM_TIMEOUT, client.request(forwarded)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) if e.is_connect() => {
            warn!("Dev server connection error for session {}: {}", session_id, e);
            return plain_response(StatusCode::BAD_GATEWAY, "Dev server is not reachable");
        }
        Ok(Err(e)) => {
            error!("Proxy request failed for session {}: {}", session_id, e);
            return plain_response(StatusCode::BAD_GATEWAY, "Proxy error");
        }
        Err(_) => {
            warn!("Upstream timeout for session {}", session_id);
            return plain_response(StatusCode::GATEWAY_TIMEOUT, "Request to dev server timed out");
        }
    };

    let (mut head, incoming) = response.into_parts();
    head.headers = downstream_response_headers(&head.headers);

    if should_stream(&head.headers) {
        let mut builder = Response::builder().status(head.status);
        if let Some(headers) = builder.headers_mut() {
            *headers = head.headers;
        }
        return builder
            .body(Body::new(incoming))
            .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Proxy error"));
    }

    let bytes = match to_bytes(Body::new(incoming), MAX_BUFFERED_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to read upstream body for session {}: {:?}", session_id, e);
            return plain_response(StatusCode::BAD_GATEWAY, "Proxy error");
        }
    };

    let body = if wants_rewrite(&head.headers, settings) {
        match std::str::from_utf8(&bytes) {
            Ok(html) => rewrite_html(html, &settings.preview_path_prefix, session_id).into_bytes(),
            // Mislabeled binary content passes through untouched.
            Err(_) => bytes.to_vec(),
        }
    } else {
        bytes.to_vec()
    };

    head.headers.remove(header::CONTENT_LENGTH);
    if let Ok(value) = HeaderValue::from_str(&body.len().to_string()) {
        head.headers.insert(header::CONTENT_LENGTH, value);
    }

    let mut builder = Response::builder().status(head.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = head.headers;
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Proxy error"))
}

/// Headers for the upstream request: everything except hop-by-hop plus
/// Host/Content-Length/Content-Encoding, with forwarding headers appended.
fn upstream_request_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in incoming {
        if is_hop_by_hop(name)
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || *name == header::CONTENT_ENCODING
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let proto = incoming
        .get("x-forwarded-proto")
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("http"));
    headers.insert(HeaderName::from_static("x-forwarded-proto"), proto);

    if !headers.contains_key("x-forwarded-for") {
        headers.insert(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static("unknown"),
        );
    }

    let host = incoming
        .get(header::HOST)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(""));
    headers.insert(HeaderName::from_static("x-forwarded-host"), host);

    headers
}

/// Headers for the downstream response: hop-by-hop stripped, frame
/// embedding allowed, permissive CSP unless the upstream set one.
fn downstream_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in upstream {
        if is_hop_by_hop(name) || name.as_str() == "x-frame-options" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if !headers.contains_key("content-security-policy") {
        headers.insert(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static("frame-ancestors *"),
        );
    }

    headers
}

/// Event streams and large bodies bypass buffering.
fn should_stream(headers: &HeaderMap) -> bool {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.contains("text/event-stream") {
        return true;
    }

    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|len| len > STREAM_THRESHOLD)
}

/// HTML responses are rewritten only in path mode, and only when the body
/// is not content-encoded (there is nothing sensible to rewrite inside a
/// compressed stream).
fn wants_rewrite(headers: &HeaderMap, settings: &Settings) -> bool {
    if settings.use_subdomain_routing {
        return false;
    }
    if headers.contains_key(header::CONTENT_ENCODING) {
        return false;
    }
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/html"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn request_headers_drop_hop_by_hop_and_host() {
        let incoming = headers(&[
            ("host", "abc.preview.example"),
            ("connection", "keep-alive"),
            ("transfer-encoding", "chunked"),
            ("content-length", "12"),
            ("accept", "text/html"),
            ("cookie", "a=b"),
        ]);

        let out = upstream_request_headers(&incoming);
        assert!(!out.contains_key("connection"));
        assert!(!out.contains_key("transfer-encoding"));
        assert!(!out.contains_key("content-length"));
        assert!(!out.contains_key("host"));
        assert_eq!(out.get("accept").unwrap(), "text/html");
        assert_eq!(out.get("cookie").unwrap(), "a=b");
        assert_eq!(out.get("x-forwarded-host").unwrap(), "abc.preview.example");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "http");
        assert!(out.contains_key("x-forwarded-for"));
    }

    #[test]
    fn response_headers_drop_frame_options_and_add_csp() {
        let upstream = headers(&[
            ("x-frame-options", "DENY"),
            ("content-type", "text/html"),
            ("connection", "close"),
        ]);

        let out = downstream_response_headers(&upstream);
        assert!(!out.contains_key("x-frame-options"));
        assert!(!out.contains_key("connection"));
        assert_eq!(
            out.get("content-security-policy").unwrap(),
            "frame-ancestors *"
        );
    }

    #[test]
    fn upstream_csp_is_preserved() {
        let upstream = headers(&[("content-security-policy", "default-src 'self'")]);
        let out = downstream_response_headers(&upstream);
        assert_eq!(
            out.get("content-security-policy").unwrap(),
            "default-src 'self'"
        );
    }

    #[test]
    fn event_streams_and_large_bodies_stream() {
        assert!(should_stream(&headers(&[(
            "content-type",
            "text/event-stream"
        )])));
        assert!(should_stream(&headers(&[("content-length", "2000000")])));
        assert!(!should_stream(&headers(&[
            ("content-type", "text/html"),
            ("content-length", "512")
        ])));
        assert!(!should_stream(&headers(&[])));
    }

    #[test]
    fn rewrite_applies_only_to_plain_html_in_path_mode() {
        let path_mode = Settings::default();
        let html = headers(&[("content-type", "text/html; charset=utf-8")]);
        assert!(wants_rewrite(&html, &path_mode));

        let encoded = headers(&[
            ("content-type", "text/html"),
            ("content-encoding", "gzip"),
        ]);
        assert!(!wants_rewrite(&encoded, &path_mode));

        let json = headers(&[("content-type", "application/json")]);
        assert!(!wants_rewrite(&json, &path_mode));

        let subdomain_mode = Settings {
            use_subdomain_routing: true,
            preview_domain: Some("preview.example".to_string()),
            ..Settings::default()
        };
        assert!(!wants_rewrite(&html, &subdomain_mode));
    }
}
