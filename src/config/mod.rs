//! Configuration layer: typed settings with layered precedence
//! (file → environment → CLI).
//!
//! Cache options additionally honor the original deployment's bare
//! environment variables (`CACHE_LOC`, `TTL`, `PURGE_KEY`, …) as
//! fallbacks for keys the file leaves unset, so existing container
//! setups keep working unchanged.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::http::HeaderName;
use clap::{Args, Parser, builder::BoolishValueParser};
use config::{Config, Environment, File};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const LOCAL_CONFIG_BASENAME: &str = "sidekick";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEFAULT_PURGE_PATH: &str = "/__wp_cache/purge";
pub const DEFAULT_PURGE_KEY_HEADER: &str = "X-WPSidekick-Purge-Key";
pub const DEFAULT_CACHE_HEADER_NAME: &str = "X-WPEverywhere-Cache";
/// Matches every dotted-extension path: media, images, css, js and so on.
pub const DEFAULT_BYPASS_PATH_REGEX: &str = r".*(\.[^.]+)$";
pub const DEFAULT_BYPASS_DEBUG_QUERY: &str = "WPEverywhere-NOCACHE";
pub const DEFAULT_MEMORY_ITEM_MAX_SIZE: usize = 4 * 1024 * 1024;
const DEFAULT_MEMORY_MAX_SIZE: u64 = 128 * 1024 * 1024;
const DEFAULT_MEMORY_MAX_COUNT: usize = 32 * 1024;

/// Command-line arguments for the sidekick-cache binary.
#[derive(Debug, Parser)]
#[command(
    name = "sidekick-cache",
    version,
    about = "Caching reverse proxy for WordPress-style origins"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SIDEKICK_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listen address (host:port).
    #[arg(long = "listen", value_name = "ADDR")]
    pub listen: Option<String>,

    /// Override the origin base URL requests are forwarded to.
    #[arg(long = "origin-url", value_name = "URL")]
    pub origin_url: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the filesystem root of the disk cache tier.
    #[arg(long = "cache-loc", value_name = "PATH")]
    pub cache_loc: Option<PathBuf>,

    /// Override the cache entry TTL in seconds (0 disables expiry).
    #[arg(long = "ttl", value_name = "SECONDS")]
    pub ttl: Option<u64>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub origin: OriginSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    /// Base URL of the dynamic origin. Required for serving; checked at
    /// startup rather than here so the settings stay loadable for tools.
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Filesystem root the disk tier lives under.
    pub loc: PathBuf,
    /// Seconds before an entry expires; 0 disables expiry.
    pub ttl: u64,
    pub purge_path: String,
    pub purge_key: String,
    pub purge_key_header: HeaderName,
    pub cache_header_name: HeaderName,
    pub bypass_path_prefixes: Vec<String>,
    pub bypass_path_regex: Regex,
    pub bypass_home: bool,
    pub bypass_debug_query: String,
    pub cache_response_codes: Vec<String>,
    pub memory_item_max_size: usize,
    pub memory_max_size: u64,
    pub memory_max_count: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("SIDEKICK").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);
    Settings::from_raw(raw)
}

/// Resolve configuration using the process CLI arguments.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    origin: RawOriginSettings,
    cache: RawCacheSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    listen: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    loc: Option<PathBuf>,
    ttl: Option<u64>,
    purge_path: Option<String>,
    purge_key: Option<String>,
    purge_key_header: Option<String>,
    cache_header_name: Option<String>,
    bypass_path_prefixes: Option<String>,
    bypass_path_regex: Option<String>,
    bypass_home: Option<bool>,
    bypass_debug_query: Option<String>,
    cache_response_codes: Option<String>,
    memory_item_max_size: Option<i64>,
    memory_max_size: Option<i64>,
    memory_max_count: Option<i64>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(listen) = overrides.listen.as_ref() {
            self.server.listen = Some(listen.clone());
        }
        if let Some(url) = overrides.origin_url.as_ref() {
            self.origin.url = Some(url.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(loc) = overrides.cache_loc.as_ref() {
            self.cache.loc = Some(loc.clone());
        }
        if let Some(ttl) = overrides.ttl {
            self.cache.ttl = Some(ttl);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            origin,
            cache,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            origin: OriginSettings { url: origin.url },
            cache: build_cache_settings(cache)?,
        })
    }
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|value| !value.is_empty())
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let listen = server
        .listen
        .unwrap_or_else(|| format!("{DEFAULT_HOST}:{DEFAULT_PORT}"));
    let listen = listen
        .parse::<SocketAddr>()
        .map_err(|err| LoadError::invalid("server.listen", err.to_string()))?;
    Ok(ServerSettings { listen })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = logging
        .level
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    let level = level
        .parse::<LevelFilter>()
        .map_err(|err| LoadError::invalid("logging.level", format!("failed to parse: {err}")))?;
    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let loc = cache
        .loc
        .or_else(|| env_string("CACHE_LOC").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    let ttl = match cache.ttl {
        Some(ttl) => ttl,
        None => match env_string("TTL") {
            Some(value) => value.parse::<u64>().map_err(|_| {
                LoadError::invalid("cache.ttl", format!("invalid TTL value `{value}`"))
            })?,
            None => 0,
        },
    };

    let purge_path = cache
        .purge_path
        .or_else(|| env_string("PURGE_PATH"))
        .unwrap_or_else(|| DEFAULT_PURGE_PATH.to_string());
    let purge_key = cache
        .purge_key
        .or_else(|| env_string("PURGE_KEY"))
        .map(|key| key.trim().to_string())
        .unwrap_or_default();
    let purge_key_header = cache
        .purge_key_header
        .or_else(|| env_string("PURGE_KEY_HEADER"))
        .unwrap_or_else(|| DEFAULT_PURGE_KEY_HEADER.to_string());
    let purge_key_header = HeaderName::from_bytes(purge_key_header.as_bytes())
        .map_err(|err| LoadError::invalid("cache.purge_key_header", err.to_string()))?;
    let cache_header_name = cache
        .cache_header_name
        .or_else(|| env_string("CACHE_HEADER_NAME"))
        .unwrap_or_else(|| DEFAULT_CACHE_HEADER_NAME.to_string());
    let cache_header_name = HeaderName::from_bytes(cache_header_name.as_bytes())
        .map_err(|err| LoadError::invalid("cache.cache_header_name", err.to_string()))?;

    let bypass_path_prefixes = cache
        .bypass_path_prefixes
        .or_else(|| env_string("BYPASS_PATH_PREFIX"))
        .map(|list| split_comma_list(&list))
        .unwrap_or_default();

    let bypass_pattern = cache
        .bypass_path_regex
        .filter(|pattern| !pattern.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BYPASS_PATH_REGEX.to_string());
    let bypass_path_regex = Regex::new(&bypass_pattern)
        .map_err(|err| LoadError::invalid("cache.bypass_path_regex", err.to_string()))?;

    let bypass_home = match cache.bypass_home {
        Some(flag) => flag,
        None => env_string("BYPASS_HOME")
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    };

    let bypass_debug_query = cache
        .bypass_debug_query
        .map(|query| query.trim().to_string())
        .unwrap_or_else(|| DEFAULT_BYPASS_DEBUG_QUERY.to_string());

    let cache_response_codes = cache
        .cache_response_codes
        .or_else(|| env_string("CACHE_RESPONSE_CODES"))
        .map(|list| parse_response_codes(&list))
        .unwrap_or_default();

    let memory_item_max_size = match cache.memory_item_max_size {
        None | Some(0) => DEFAULT_MEMORY_ITEM_MAX_SIZE,
        Some(size) if size < 0 => usize::MAX,
        Some(size) => size as usize,
    };
    let memory_max_size = match cache.memory_max_size {
        None | Some(0) => DEFAULT_MEMORY_MAX_SIZE,
        // Negative disables the budget.
        Some(size) if size < 0 => 0,
        Some(size) => size as u64,
    };
    let memory_max_count = match cache.memory_max_count {
        None | Some(0) => DEFAULT_MEMORY_MAX_COUNT,
        Some(count) if count < 0 => 0,
        Some(count) => count as usize,
    };

    Ok(CacheSettings {
        loc,
        ttl,
        purge_path,
        purge_key,
        purge_key_header,
        cache_header_name,
        bypass_path_prefixes,
        bypass_path_regex,
        bypass_home,
        bypass_debug_query,
        cache_response_codes,
        memory_item_max_size,
        memory_max_size,
        memory_max_count,
    })
}

fn split_comma_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse the status-code list, collapsing wildcard entries (`2XX`) to
/// their leading digit.
fn parse_response_codes(list: &str) -> Vec<String> {
    split_comma_list(list)
        .into_iter()
        .map(|code| {
            if code.contains("XX") {
                code.chars().take(1).collect()
            } else {
                code
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let settings = Settings::from_raw(RawSettings::default()).expect("settings");

        assert_eq!(settings.server.listen.port(), DEFAULT_PORT);
        assert_eq!(settings.cache.ttl, 0);
        assert_eq!(settings.cache.purge_path, DEFAULT_PURGE_PATH);
        assert_eq!(settings.cache.purge_key_header.as_str(), "x-wpsidekick-purge-key");
        assert_eq!(settings.cache.cache_header_name.as_str(), "x-wpeverywhere-cache");
        assert_eq!(settings.cache.bypass_debug_query, DEFAULT_BYPASS_DEBUG_QUERY);
        assert_eq!(settings.cache.memory_item_max_size, 4 * 1024 * 1024);
        assert_eq!(settings.cache.memory_max_size, 128 * 1024 * 1024);
        assert_eq!(settings.cache.memory_max_count, 32 * 1024);
        assert!(settings.cache.bypass_path_prefixes.is_empty());
        assert!(!settings.cache.bypass_home);
        assert!(settings.origin.url.is_none());
    }

    #[test]
    fn default_regex_matches_dotted_extensions() {
        let settings = Settings::from_raw(RawSettings::default()).expect("settings");
        let regex = &settings.cache.bypass_path_regex;
        assert!(regex.is_match("/style.css"));
        assert!(regex.is_match("/media/img.png"));
        assert!(!regex.is_match("/hello"));
        assert!(!regex.is_match("/posts/2024/"));
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.listen = Some("0.0.0.0:3000".to_string());
        raw.cache.ttl = Some(60);

        let overrides = ServeOverrides {
            listen: Some("127.0.0.1:9999".to_string()),
            ttl: Some(120),
            origin_url: Some("http://origin:8080".to_string()),
            ..Default::default()
        };
        raw.apply_overrides(&overrides);

        let settings = Settings::from_raw(raw).expect("settings");
        assert_eq!(settings.server.listen.port(), 9999);
        assert_eq!(settings.cache.ttl, 120);
        assert_eq!(settings.origin.url.as_deref(), Some("http://origin:8080"));
    }

    #[test]
    fn response_code_wildcards_collapse() {
        assert_eq!(parse_response_codes("200, 3XX ,404"), vec!["200", "3", "404"]);
        assert_eq!(parse_response_codes("2XX"), vec!["2"]);
        assert!(parse_response_codes("").is_empty());
    }

    #[test]
    fn negative_memory_budgets_disable_limits() {
        let raw = RawCacheSettings {
            memory_item_max_size: Some(-1),
            memory_max_size: Some(-1),
            memory_max_count: Some(-1),
            ..Default::default()
        };
        let settings = build_cache_settings(raw).expect("settings");
        assert_eq!(settings.memory_item_max_size, usize::MAX);
        assert_eq!(settings.memory_max_size, 0);
        assert_eq!(settings.memory_max_count, 0);
    }

    #[test]
    fn invalid_bypass_regex_is_fatal() {
        let raw = RawCacheSettings {
            bypass_path_regex: Some("(unclosed".to_string()),
            ..Default::default()
        };
        let err = build_cache_settings(raw).expect_err("must fail");
        assert!(matches!(err, LoadError::Invalid { key: "cache.bypass_path_regex", .. }));
    }

    #[test]
    fn invalid_listen_address_is_fatal() {
        let raw = RawServerSettings {
            listen: Some("not-an-addr".to_string()),
        };
        assert!(build_server_settings(raw).is_err());
    }

    #[test]
    fn prefix_list_splits_and_drops_empties() {
        assert_eq!(
            split_comma_list("/wp-admin, /wp-json,,"),
            vec!["/wp-admin", "/wp-json"]
        );
        assert!(split_comma_list("").is_empty());
    }
}
