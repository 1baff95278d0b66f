//! Subdomain routing.
//!
//! In subdomain mode a session is addressed as `{id}.{preview_domain}`.
//! This rewrite runs around the whole router (URI rewrites inside a router
//! layer would land after path matching), turning those requests into the
//! internal `/preview/{id}/{path}` form for both HTTP and WebSocket
//! traffic. Non-matching hosts pass through untouched.

use axum::body::Body;
use axum::http::uri::{PathAndQuery, Uri};
use axum::http::{Request, header};
use log::debug;

use crate::config::Settings;

/// Original host and extracted session id, stashed on the request for
/// logging.
#[derive(Debug, Clone)]
pub struct SubdomainInfo {
    pub session_id: String,
    pub original_host: String,
}

/// Rewrite a subdomain request to the internal preview path.
pub fn rewrite_request(settings: &Settings, mut req: Request<Body>) -> Request<Body> {
    let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
    else {
        return req;
    };

    let Some(session_id) = settings.extract_session_from_host(&host) else {
        return req;
    };

    let original_path = req.uri().path();
    let suffix = original_path.trim_start_matches('/');
    let mut new_path = format!("/preview/{}/{}", session_id, suffix);
    if let Some(query) = req.uri().query() {
        new_path.push('?');
        new_path.push_str(query);
    }

    debug!(
        "Subdomain routing: {}{} -> {}",
        host, original_path, new_path
    );

    let mut parts = req.uri().clone().into_parts();
    match new_path.parse::<PathAndQuery>() {
        Ok(path_and_query) => parts.path_and_query = Some(path_and_query),
        Err(_) => return req,
    }
    let Ok(new_uri) = Uri::from_parts(parts) else {
        return req;
    };

    *req.uri_mut() = new_uri;
    req.extensions_mut().insert(SubdomainInfo {
        session_id,
        original_host: host,
    });

    req
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subdomain_settings() -> Settings {
        Settings {
            use_subdomain_routing: true,
            preview_domain: Some("preview.example".to_string()),
            ..Settings::default()
        }
    }

    fn request(host: &str, path_and_query: &str) -> Request<Body> {
        Request::builder()
            .uri(path_and_query)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn subdomain_requests_are_rewritten() {
        let settings = subdomain_settings();
        let req = rewrite_request(&settings, request("abc.preview.example", "/src/main.tsx"));
        assert_eq!(req.uri().path(), "/preview/abc/src/main.tsx");

        let info = req.extensions().get::<SubdomainInfo>().unwrap();
        assert_eq!(info.session_id, "abc");
        assert_eq!(info.original_host, "abc.preview.example");
    }

    #[test]
    fn query_strings_survive_the_rewrite() {
        let settings = subdomain_settings();
        let req = rewrite_request(
            &settings,
            request("abc.preview.example:443", "/?token=glp_abc"),
        );
        assert_eq!(req.uri().path(), "/preview/abc/");
        assert_eq!(req.uri().query(), Some("token=glp_abc"));
    }

    #[test]
    fn unrelated_hosts_pass_through() {
        let settings = subdomain_settings();
        let req = rewrite_request(&settings, request("api.example.com", "/api/sessions"));
        assert_eq!(req.uri().path(), "/api/sessions");
        assert!(req.extensions().get::<SubdomainInfo>().is_none());
    }

    #[test]
    fn disabled_mode_never_rewrites() {
        let settings = Settings::default();
        let req = rewrite_request(&settings, request("abc.preview.example", "/x"));
        assert_eq!(req.uri().path(), "/x");
    }

    #[test]
    fn bare_domain_is_not_a_session() {
        let settings = subdomain_settings();
        let req = rewrite_request(&settings, request("preview.example", "/x"));
        assert_eq!(req.uri().path(), "/x");
    }
}
