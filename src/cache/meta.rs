//! Cached-response metadata and its on-disk codec.
//!
//! A `.meta` file is a JSON object with short keys (`c` status, `h` header
//! pairs, `t` capture timestamp); absent fields read back as zero/empty so
//! older files stay loadable. Header names are stored in canonical
//! spelling and only names on the allow-list survive into the cache.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use axum::http::{HeaderMap, StatusCode, header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as FmtWrite;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Response header names that survive into the cache and are replayed on a
/// hit. Canonical spellings; everything else is dropped.
pub const CACHEABLE_RESPONSE_HEADERS: [&str; 31] = [
    "Accept-Ranges",
    "Content-Length",
    "Content-Type",
    "Location",
    "Etag",
    "Last-Modified",
    "Access-Control-Allow-Origin",
    "Access-Control-Max-Age",
    "Access-Control-Allow-Headers",
    "Access-Control-Allow-Methods",
    "Access-Control-Allow-Credentials",
    "Access-Control-Expose-Headers",
    "Referrer-Policy",
    "Strict-Transport-Security",
    "Content-Security-Policy",
    "X-Content-Type-Options",
    "X-Frame-Options",
    "X-Robots-Tag",
    // wordpress discovery
    "X-Pingback",
    "Server-Timing",
    "Server",
    "X-Powered-By",
    "Vary",
    "Link",
    "Expires",
    "Age",
    "Refresh",
    // deprecated, but harmless to replay
    "Pragma",
    "X-Xss-Protection",
    "Warning",
    "X-UA-Compatible",
];

/// Response header names whose presence makes a response uncacheable.
/// Hop-by-hop and negotiation headers that cannot be replayed safely.
pub const NEVER_CACHE_RESPONSE_HEADERS: [&str; 10] = [
    "Content-Range",
    "Www-Authenticate",
    "Connection",
    "Proxy-Connection",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Te",
    "Trailer",
    "Upgrade",
    "Retry-After",
];

/// The only headers a 304 answer carries besides the cache-status header.
pub const VALIDATOR_HEADERS: [&str; 4] = ["Etag", "Last-Modified", "Cache-Control", "Expires"];

/// Content encodings the store keeps variants for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    None,
    Gzip,
    Br,
    Zstd,
}

impl ContentEncoding {
    pub const ALL: [ContentEncoding; 4] = [
        ContentEncoding::None,
        ContentEncoding::Gzip,
        ContentEncoding::Br,
        ContentEncoding::Zstd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContentEncoding::None => "none",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Br => "br",
            ContentEncoding::Zstd => "zstd",
        }
    }

    /// Parse a `Content-Encoding` response header value; an absent or empty
    /// value means identity. Unknown encodings are not representable.
    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "" | "none" => Some(ContentEncoding::None),
            "gzip" => Some(ContentEncoding::Gzip),
            "br" => Some(ContentEncoding::Br),
            "zstd" => Some(ContentEncoding::Zstd),
            _ => None,
        }
    }

    /// Name of the body file for this variant inside a cache directory.
    pub fn file_name(self) -> String {
        format!(".{}", self.as_str())
    }
}

/// Metadata captured alongside a response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    #[serde(rename = "c", default)]
    pub status: u16,
    #[serde(rename = "h", default)]
    pub headers: Vec<(String, String)>,
    #[serde(rename = "t", default)]
    pub timestamp: i64,
    #[serde(skip)]
    content_encoding: ContentEncoding,
}

/// Strong ETag over the body: quoted lowercase hex of the first 16 bytes
/// of the SHA-256 digest.
pub fn generate_etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let mut etag = String::with_capacity(34);
    etag.push('"');
    for byte in &digest[..16] {
        let _ = write!(&mut etag, "{byte:02x}");
    }
    etag.push('"');
    etag
}

impl CacheMeta {
    /// Build metadata for a captured response.
    ///
    /// Returns `None` when the response carries a content encoding the
    /// store has no variant slot for. Validators are synthesized when the
    /// origin did not provide them, so every cached entry can answer
    /// conditional requests.
    pub fn from_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Option<Self> {
        let encoding = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let content_encoding = ContentEncoding::from_header(encoding)?;

        let mut meta = CacheMeta {
            status: status.as_u16(),
            headers: collect_cacheable_headers(headers),
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            content_encoding,
        };

        if meta.header("Etag").is_none() {
            let etag = generate_etag(body);
            meta.headers.push(("Etag".to_string(), etag));
        }
        if meta.header("Last-Modified").is_none() {
            let last_modified = format_http_date(meta.timestamp);
            meta.headers.push(("Last-Modified".to_string(), last_modified));
        }

        Some(meta)
    }

    pub fn content_encoding(&self) -> ContentEncoding {
        self.content_encoding
    }

    /// First stored value for a canonical header name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(stored, _)| stored == name)
            .map(|(_, value)| value.as_str())
    }

    /// Write the metadata as JSON, creating or truncating the file with
    /// mode 0644.
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer(file, self)?;
        set_disk_mode(path, 0o644)?;
        Ok(())
    }

    /// Read metadata back; missing fields decode as zero/empty.
    pub fn load_from_file(path: &Path) -> io::Result<Self> {
        let data = fs::read(path)?;
        let meta = serde_json::from_slice(&data)?;
        Ok(meta)
    }
}

/// Apply the cache layout's mode bits (0644 files, 0755 directories).
#[cfg(unix)]
pub(crate) fn set_disk_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn set_disk_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Copy allow-listed response headers into stored pairs, joining repeated
/// values with `,`. Order follows the allow-list, so output is stable.
fn collect_cacheable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut collected = Vec::with_capacity(8);
    for name in CACHEABLE_RESPONSE_HEADERS {
        let values: Vec<&str> = headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        if !values.is_empty() {
            collected.push((name.to_string(), values.join(",")));
        }
    }
    collected
}

const IMF_FIXDATE: &[time::format_description::BorrowedFormatItem<'static>] = time::macros::format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

const ASCTIME: &[time::format_description::BorrowedFormatItem<'static>] = time::macros::format_description!(
    "[weekday repr:short] [month repr:short] [day padding:space] [hour]:[minute]:[second] [year]"
);

/// Format a unix timestamp as an IMF-fixdate HTTP date.
pub fn format_http_date(unix: i64) -> String {
    OffsetDateTime::from_unix_timestamp(unix)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .format(&IMF_FIXDATE)
        .unwrap_or_default()
}

/// Parse an HTTP date in IMF-fixdate or asctime form.
pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    for format in [IMF_FIXDATE, ASCTIME] {
        if let Ok(parsed) = PrimitiveDateTime::parse(value, format) {
            return Some(parsed.assume_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn html_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("text/html"));
        headers.insert("Content-Length", HeaderValue::from_static("2"));
        headers
    }

    #[test]
    fn etag_is_deterministic_and_quoted() {
        let a = generate_etag(b"hello world");
        let b = generate_etag(b"hello world");
        assert_eq!(a, b);
        assert!(a.starts_with('"') && a.ends_with('"'));
        assert_eq!(a.len(), 34);
        assert_ne!(a, generate_etag(b"hello worlds"));
    }

    #[test]
    fn from_response_copies_only_allow_listed_headers() {
        let mut headers = html_headers();
        headers.insert("Set-Cookie", HeaderValue::from_static("session=abc"));
        headers.insert("X-Internal-Debug", HeaderValue::from_static("1"));

        let meta = CacheMeta::from_response(StatusCode::OK, &headers, b"hi").expect("meta");
        assert_eq!(meta.header("Content-Type"), Some("text/html"));
        assert!(meta.header("Set-Cookie").is_none());
        assert!(meta.header("X-Internal-Debug").is_none());
        assert!(meta.timestamp > 0);
        assert_eq!(meta.status, 200);
    }

    #[test]
    fn from_response_joins_repeated_values() {
        let mut headers = HeaderMap::new();
        headers.append("Link", HeaderValue::from_static("<a>; rel=prev"));
        headers.append("Link", HeaderValue::from_static("<b>; rel=next"));

        let meta = CacheMeta::from_response(StatusCode::OK, &headers, b"x").expect("meta");
        assert_eq!(meta.header("Link"), Some("<a>; rel=prev,<b>; rel=next"));
    }

    #[test]
    fn from_response_synthesizes_validators() {
        let meta = CacheMeta::from_response(StatusCode::OK, &html_headers(), b"hi").expect("meta");

        assert_eq!(meta.header("Etag"), Some(generate_etag(b"hi").as_str()));
        let last_modified = meta.header("Last-Modified").expect("synthesized");
        assert_eq!(last_modified, format_http_date(meta.timestamp));
    }

    #[test]
    fn from_response_keeps_origin_validators() {
        let mut headers = html_headers();
        headers.insert("Etag", HeaderValue::from_static("\"origin-tag\""));
        headers.insert(
            "Last-Modified",
            HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT"),
        );

        let meta = CacheMeta::from_response(StatusCode::OK, &headers, b"hi").expect("meta");
        assert_eq!(meta.header("Etag"), Some("\"origin-tag\""));
        assert_eq!(meta.header("Last-Modified"), Some("Sun, 06 Nov 1994 08:49:37 GMT"));
    }

    #[test]
    fn from_response_rejects_unknown_encoding() {
        let mut headers = html_headers();
        headers.insert("Content-Encoding", HeaderValue::from_static("deflate"));
        assert!(CacheMeta::from_response(StatusCode::OK, &headers, b"hi").is_none());
    }

    #[test]
    fn from_response_accepts_each_variant_encoding() {
        for encoding in ["gzip", "br", "zstd"] {
            let mut headers = html_headers();
            headers.insert("Content-Encoding", HeaderValue::from_static(encoding));
            let meta = CacheMeta::from_response(StatusCode::OK, &headers, b"hi").expect("meta");
            assert_eq!(meta.content_encoding().as_str(), encoding);
        }
    }

    #[test]
    fn file_roundtrip_preserves_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".meta");

        let meta = CacheMeta::from_response(StatusCode::NOT_FOUND, &html_headers(), b"nope")
            .expect("meta");
        meta.write_to_file(&path).expect("write");

        let loaded = CacheMeta::load_from_file(&path).expect("load");
        assert_eq!(loaded.status, meta.status);
        assert_eq!(loaded.timestamp, meta.timestamp);
        assert_eq!(loaded.headers, meta.headers);
    }

    #[test]
    fn loader_tolerates_missing_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".meta");
        std::fs::write(&path, b"{}").expect("write");

        let meta = CacheMeta::load_from_file(&path).expect("load");
        assert_eq!(meta.status, 0);
        assert_eq!(meta.timestamp, 0);
        assert!(meta.headers.is_empty());
    }

    #[test]
    fn http_date_roundtrip() {
        let formatted = format_http_date(784_111_777);
        assert_eq!(formatted, "Sun, 06 Nov 1994 08:49:37 GMT");
        let parsed = parse_http_date(&formatted).expect("parse");
        assert_eq!(parsed.unix_timestamp(), 784_111_777);
    }

    #[test]
    fn http_date_parses_asctime() {
        let parsed = parse_http_date("Sun Nov  6 08:49:37 1994").expect("parse");
        assert_eq!(parsed.unix_timestamp(), 784_111_777);
    }

    #[test]
    fn http_date_rejects_garbage() {
        assert!(parse_http_date("yesterday").is_none());
        assert!(parse_http_date("").is_none());
    }
}
