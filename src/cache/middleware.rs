//! Response cache middleware.
//!
//! Intercepts GET requests: serves captured responses from the store,
//! answers conditional requests with 304, and drives misses through the
//! capture pipeline. Also exposes the header-keyed purge endpoint and the
//! bypass rules that keep per-visitor content out of the cache.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, instrument, warn};

use super::capture::capture_response;
use super::config::CacheConfig;
use super::meta::{CacheMeta, VALIDATOR_HEADERS, parse_http_date};
use super::store::{CacheEntry, Store};

/// Prefix of the session cookies WordPress hands to logged-in users.
/// Responses for logged-in visitors carry admin chrome and are never cached.
const LOGGED_IN_COOKIE_PREFIX: &str = "wordpress_logged_in";

/// Shared state for the cache middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: Arc<CacheConfig>,
    pub store: Arc<Store>,
}

/// Middleware entry point: purge endpoint, bypass rules, variant lookup,
/// conditional 304, background variant fill, miss capture.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.uri().path().starts_with(cache.config.purge_path.as_str())
        && let Some(response) = handle_purge(&cache, &request)
    {
        return response;
    }

    // Only GET responses are cached; everything else passes through.
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    if let Some(reason) = bypass_reason(&cache.config, &request) {
        debug!(reason, outcome = "bypass", "request bypasses the cache");
        let mut response = next.run(request).await;
        response.headers_mut().insert(
            cache.config.cache_header_name.clone(),
            HeaderValue::from_static("BYPASS"),
        );
        return response;
    }

    let path = request.uri().path().to_string();
    let cache_key = Store::build_cache_key(&path, "");
    let encodings = accept_encodings(request.headers());

    let mut hit = None;
    for enc in &encodings {
        match cache.store.get(&cache_key, enc) {
            Ok(entry) => {
                hit = Some((enc.as_str(), entry));
                break;
            }
            Err(err) => debug!(enc = %enc, error = %err, "variant unavailable"),
        }
    }

    let Some((enc, entry)) = hit else {
        debug!(outcome = "miss", "no cached variant; capturing origin response");
        let response = next.run(request).await;
        return capture_response(&cache.config, cache.store.clone(), path, response);
    };

    // Serving the uncompressed variant to a client that asked for
    // compression: re-drive the origin in the background so a compressed
    // variant gets captured for next time.
    if enc == "none" && encodings.first().is_some_and(|first| first.as_str() != "none") {
        spawn_background_fill(cache.clone(), &request, next);
    }

    if check_conditional_request(request.headers(), &entry.meta) {
        debug!(outcome = "hit-304", "validators match; responding not modified");
        return not_modified_response(&cache.config, &entry.meta);
    }

    debug!(outcome = "hit", enc, "serving cached response");
    hit_response(&cache.config, enc, &entry)
}

/// Handle the admin purge endpoint.
///
/// `None` means "not handled": an invalid key (logged, never rejected) or
/// an unexpected method falls through to normal request handling.
fn handle_purge(cache: &CacheState, request: &Request<Body>) -> Option<Response> {
    let provided = request
        .headers()
        .get(&cache.config.purge_key_header)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if provided != cache.config.purge_key {
        warn!(path = %request.uri().path(), "purge request with invalid key");
        return None;
    }

    if request.method() == Method::GET {
        return Some(Json(cache.store.list()).into_response());
    }
    if request.method() == Method::POST {
        let suffix = request
            .uri()
            .path()
            .replacen(cache.config.purge_path.as_str(), "", 1);
        let store = cache.store.clone();
        if suffix.len() < 2 {
            debug!("cache flush requested");
            tokio::task::spawn_blocking(move || store.flush());
        } else {
            debug!(key = %suffix, "cache purge requested");
            tokio::task::spawn_blocking(move || store.purge(&suffix));
        }
        return Some("OK".into_response());
    }
    None
}

/// First bypass rule the request trips, if any. Pure in the request and
/// configuration, so the decision is reproducible.
fn bypass_reason(config: &CacheConfig, request: &Request<Body>) -> Option<&'static str> {
    let path = request.uri().path();

    if !config.bypass_debug_query.is_empty()
        && let Some(query) = request.uri().query()
        && query_has_param(query, &config.bypass_debug_query)
    {
        return Some("debug_query");
    }

    if config
        .bypass_path_prefixes
        .iter()
        .any(|prefix| !prefix.is_empty() && path.starts_with(prefix))
    {
        return Some("path_prefix");
    }

    if config.bypass_path_regex.is_match(path) {
        return Some("path_regex");
    }

    if config.bypass_home && path == "/" {
        return Some("home");
    }

    if has_logged_in_cookie(request.headers()) {
        return Some("logged_in_cookie");
    }

    None
}

fn query_has_param(query: &str, name: &str) -> bool {
    url::form_urlencoded::parse(query.as_bytes()).any(|(key, _)| key == name)
}

fn has_logged_in_cookie(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .any(|cookie| {
            let name = cookie.trim().split('=').next().unwrap_or("");
            name.starts_with(LOGGED_IN_COOKIE_PREFIX)
        })
}

/// Client encoding preferences in order, with `none` as the final
/// fallback. Entries are kept verbatim (minus whitespace); anything the
/// store has no variant for simply misses.
fn accept_encodings(headers: &HeaderMap) -> Vec<String> {
    let joined: String = headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join("");
    let mut encodings: Vec<String> = if joined.is_empty() {
        Vec::new()
    } else {
        joined.split(',').map(|enc| enc.trim().to_string()).collect()
    };
    encodings.push("none".to_string());
    encodings
}

/// Re-drive the downstream handler on a detached task with a cloned
/// request and a discarded response, so the origin can produce a
/// compressed variant for the capture pipeline to store. Detached so a
/// client disconnect cannot abort the fill.
fn spawn_background_fill(cache: CacheState, request: &Request<Body>, next: Next) {
    let mut fill_request = match Request::builder()
        .method(Method::GET)
        .uri(request.uri().clone())
        .version(request.version())
        .body(Body::empty())
    {
        Ok(cloned) => cloned,
        Err(err) => {
            debug!(error = %err, "could not clone request for background fill");
            return;
        }
    };
    *fill_request.headers_mut() = request.headers().clone();

    let path = request.uri().path().to_string();
    tokio::spawn(async move {
        debug!(path = %path, "regenerating missing encoding variant in background");
        let response = next.run(fill_request).await;
        let response = capture_response(&cache.config, cache.store.clone(), path, response);
        // Drain the discarded body; the capture commits on end-of-stream.
        let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await;
    });
}

/// True when the request's validators match the cached entry, meaning a
/// 304 without a body is the right answer.
fn check_conditional_request(request_headers: &HeaderMap, meta: &CacheMeta) -> bool {
    if let Some(if_none_match) = request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        && let Some(cached_etag) = meta.header("Etag").filter(|etag| !etag.is_empty())
    {
        if if_none_match == cached_etag || if_none_match == "*" {
            return true;
        }
        if if_none_match.split(',').any(|tag| tag.trim() == cached_etag) {
            return true;
        }
    }

    if let Some(if_modified_since) = request_headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        && let Some(cached_last_modified) = meta.header("Last-Modified")
        && let (Some(request_time), Some(cached_time)) = (
            parse_http_date(if_modified_since),
            parse_http_date(cached_last_modified),
        )
        && cached_time <= request_time
    {
        return true;
    }

    false
}

/// 304 answer: cache-status header, `Vary`, and the validator family from
/// the cached metadata. No body.
fn not_modified_response(config: &CacheConfig, meta: &CacheMeta) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_MODIFIED;
    let headers = response.headers_mut();
    headers.insert(
        config.cache_header_name.clone(),
        HeaderValue::from_static("HIT-304"),
    );
    headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    for (name, value) in &meta.headers {
        if !VALIDATOR_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    response
}

/// Full hit: replay the captured status, body and stored headers.
fn hit_response(config: &CacheConfig, enc: &str, entry: &CacheEntry) -> Response {
    let mut response = Response::new(Body::from(entry.body.clone()));
    *response.status_mut() = StatusCode::from_u16(entry.meta.status).unwrap_or(StatusCode::OK);
    let headers = response.headers_mut();
    headers.insert(
        config.cache_header_name.clone(),
        HeaderValue::from_static("HIT"),
    );
    headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    if enc != "none"
        && let Ok(value) = HeaderValue::from_str(enc)
    {
        headers.insert(header::CONTENT_ENCODING, value);
    }
    for (name, value) in &entry.meta.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    fn config_with_codes() -> CacheConfig {
        CacheConfig {
            cache_response_codes: vec!["2".to_string(), "3".to_string()],
            ..CacheConfig::default()
        }
    }

    #[test]
    fn bypass_by_dotted_extension_regex() {
        let config = config_with_codes();
        assert_eq!(
            bypass_reason(&config, &get_request("/style.css")),
            Some("path_regex")
        );
        assert_eq!(
            bypass_reason(&config, &get_request("/script.min.js")),
            Some("path_regex")
        );
        assert_eq!(bypass_reason(&config, &get_request("/hello")), None);
    }

    #[test]
    fn bypass_by_debug_query() {
        let config = config_with_codes();
        assert_eq!(
            bypass_reason(&config, &get_request("/hello?WPEverywhere-NOCACHE")),
            Some("debug_query")
        );
        assert_eq!(
            bypass_reason(&config, &get_request("/hello?WPEverywhere-NOCACHE=1")),
            Some("debug_query")
        );
        assert_eq!(bypass_reason(&config, &get_request("/hello?page=2")), None);
    }

    #[test]
    fn bypass_by_path_prefix() {
        let config = CacheConfig {
            bypass_path_prefixes: vec!["/wp-admin".to_string(), String::new()],
            ..config_with_codes()
        };
        assert_eq!(
            bypass_reason(&config, &get_request("/wp-admin/options")),
            Some("path_prefix")
        );
        // The empty prefix must not match everything.
        assert_eq!(bypass_reason(&config, &get_request("/hello")), None);
    }

    #[test]
    fn bypass_home_only_when_enabled() {
        let config = config_with_codes();
        assert_eq!(bypass_reason(&config, &get_request("/")), None);

        let config = CacheConfig {
            bypass_home: true,
            ..config_with_codes()
        };
        assert_eq!(bypass_reason(&config, &get_request("/")), Some("home"));
    }

    #[test]
    fn bypass_logged_in_cookie() {
        let config = config_with_codes();
        let mut request = get_request("/hello");
        request.headers_mut().insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; wordpress_logged_in_abc123=token"),
        );
        assert_eq!(bypass_reason(&config, &request), Some("logged_in_cookie"));

        let mut request = get_request("/hello");
        request.headers_mut().insert(
            header::COOKIE,
            HeaderValue::from_static("wordpress_test_cookie=check"),
        );
        assert_eq!(bypass_reason(&config, &request), None);
    }

    #[test]
    fn accept_encodings_orders_preferences_with_none_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, br"),
        );
        assert_eq!(accept_encodings(&headers), vec!["gzip", "br", "none"]);

        let empty = HeaderMap::new();
        assert_eq!(accept_encodings(&empty), vec!["none"]);
    }

    fn meta_with_validators() -> CacheMeta {
        let mut headers = HeaderMap::new();
        headers.insert("Etag", HeaderValue::from_static("\"abc\""));
        headers.insert(
            "Last-Modified",
            HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT"),
        );
        CacheMeta::from_response(StatusCode::OK, &headers, b"body").expect("meta")
    }

    fn request_with_header(name: header::HeaderName, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn conditional_matches_etag_verbatim() {
        let meta = meta_with_validators();
        assert!(check_conditional_request(
            &request_with_header(header::IF_NONE_MATCH, "\"abc\""),
            &meta
        ));
        assert!(check_conditional_request(
            &request_with_header(header::IF_NONE_MATCH, "*"),
            &meta
        ));
        assert!(check_conditional_request(
            &request_with_header(header::IF_NONE_MATCH, "\"xyz\", \"abc\""),
            &meta
        ));
        // Weak tags are not normalized.
        assert!(!check_conditional_request(
            &request_with_header(header::IF_NONE_MATCH, "W/\"abc\""),
            &meta
        ));
        assert!(!check_conditional_request(
            &request_with_header(header::IF_NONE_MATCH, "\"other\""),
            &meta
        ));
    }

    #[test]
    fn conditional_matches_if_modified_since() {
        let meta = meta_with_validators();
        // Request date after the cached Last-Modified: not modified.
        assert!(check_conditional_request(
            &request_with_header(header::IF_MODIFIED_SINCE, "Mon, 07 Nov 1994 08:49:37 GMT"),
            &meta
        ));
        // Equal dates count as unmodified.
        assert!(check_conditional_request(
            &request_with_header(header::IF_MODIFIED_SINCE, "Sun, 06 Nov 1994 08:49:37 GMT"),
            &meta
        ));
        // Cached copy is newer than the client's date: modified.
        assert!(!check_conditional_request(
            &request_with_header(header::IF_MODIFIED_SINCE, "Sat, 05 Nov 1994 08:49:37 GMT"),
            &meta
        ));
        // Unparseable dates never match.
        assert!(!check_conditional_request(
            &request_with_header(header::IF_MODIFIED_SINCE, "not a date"),
            &meta
        ));
    }

    #[test]
    fn not_modified_response_carries_only_validators() {
        let config = config_with_codes();
        let meta = meta_with_validators();
        let response = not_modified_response(&config, &meta);

        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(
            response.headers().get("X-WPEverywhere-Cache").map(|v| v.as_bytes()),
            Some(b"HIT-304".as_slice())
        );
        assert!(response.headers().get("Etag").is_some());
        assert!(response.headers().get("Last-Modified").is_some());
        assert!(response.headers().get("Content-Type").is_none());
    }

    #[test]
    fn hit_response_replays_stored_headers() {
        let config = config_with_codes();
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("text/html"));
        let meta = CacheMeta::from_response(StatusCode::OK, &headers, b"hi").expect("meta");
        let entry = CacheEntry {
            meta,
            body: bytes::Bytes::from_static(b"hi"),
        };

        let response = hit_response(&config, "gzip", &entry);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("X-WPEverywhere-Cache").map(|v| v.as_bytes()),
            Some(b"HIT".as_slice())
        );
        assert_eq!(
            response.headers().get(header::CONTENT_ENCODING).map(|v| v.as_bytes()),
            Some(b"gzip".as_slice())
        );
        assert_eq!(
            response.headers().get(header::VARY).map(|v| v.as_bytes()),
            Some(b"Accept-Encoding".as_slice())
        );
        assert_eq!(
            response.headers().get("Content-Type").map(|v| v.as_bytes()),
            Some(b"text/html".as_slice())
        );
    }

    #[test]
    fn hit_response_for_identity_has_no_content_encoding() {
        let config = config_with_codes();
        let meta = CacheMeta::from_response(StatusCode::OK, &HeaderMap::new(), b"hi").expect("meta");
        let entry = CacheEntry {
            meta,
            body: bytes::Bytes::from_static(b"hi"),
        };
        let response = hit_response(&config, "none", &entry);
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    }
}
