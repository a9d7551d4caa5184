//! Resolved runtime options consulted by the cache middleware.
//!
//! Built once at startup from the settings layer; request handling only
//! ever reads these pre-validated values.

use axum::http::HeaderName;
use regex::Regex;

use crate::config::{
    CacheSettings, DEFAULT_BYPASS_DEBUG_QUERY, DEFAULT_BYPASS_PATH_REGEX,
    DEFAULT_CACHE_HEADER_NAME, DEFAULT_MEMORY_ITEM_MAX_SIZE, DEFAULT_PURGE_KEY_HEADER,
    DEFAULT_PURGE_PATH,
};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Admin endpoint path prefix.
    pub purge_path: String,
    /// Secret expected in the purge header; compared verbatim.
    pub purge_key: String,
    /// Request header carrying the purge secret.
    pub purge_key_header: HeaderName,
    /// Response header reporting `HIT`/`HIT-304`/`MISS`/`BYPASS`.
    pub cache_header_name: HeaderName,
    /// Path prefixes that bypass the cache outright.
    pub bypass_path_prefixes: Vec<String>,
    /// Paths matching this pattern bypass the cache.
    pub bypass_path_regex: Regex,
    /// Bypass `/` when set.
    pub bypass_home: bool,
    /// Query parameter whose presence bypasses the cache.
    pub bypass_debug_query: String,
    /// Status codes eligible for capture: exact (`404`) or a single digit
    /// wildcarding the hundreds bucket (`2` for any 2xx).
    pub cache_response_codes: Vec<String>,
    /// Per-response body cap for capture buffering.
    pub memory_item_max_size: usize,
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            purge_path: settings.purge_path.clone(),
            purge_key: settings.purge_key.clone(),
            purge_key_header: settings.purge_key_header.clone(),
            cache_header_name: settings.cache_header_name.clone(),
            bypass_path_prefixes: settings.bypass_path_prefixes.clone(),
            bypass_path_regex: settings.bypass_path_regex.clone(),
            bypass_home: settings.bypass_home,
            bypass_debug_query: settings.bypass_debug_query.clone(),
            cache_response_codes: settings.cache_response_codes.clone(),
            memory_item_max_size: settings.memory_item_max_size,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            purge_path: DEFAULT_PURGE_PATH.to_string(),
            purge_key: String::new(),
            purge_key_header: HeaderName::from_bytes(DEFAULT_PURGE_KEY_HEADER.as_bytes())
                .expect("default purge header name is valid"),
            cache_header_name: HeaderName::from_bytes(DEFAULT_CACHE_HEADER_NAME.as_bytes())
                .expect("default cache header name is valid"),
            bypass_path_prefixes: Vec::new(),
            bypass_path_regex: Regex::new(DEFAULT_BYPASS_PATH_REGEX)
                .expect("default bypass pattern compiles"),
            bypass_home: false,
            bypass_debug_query: DEFAULT_BYPASS_DEBUG_QUERY.to_string(),
            cache_response_codes: Vec::new(),
            memory_item_max_size: DEFAULT_MEMORY_ITEM_MAX_SIZE,
        }
    }
}
