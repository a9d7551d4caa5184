//! Response capture pipeline.
//!
//! On a miss the origin's response is tagged `MISS` or `BYPASS` and, when
//! cacheable, its body is teed into a bounded buffer while streaming to
//! the client untouched. A clean end-of-stream commits metadata and body
//! to the store off the hot path; anything else abandons the capture and
//! the response is simply not cached.

use std::pin::Pin;
use std::task::{Context, Poll};

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use http_body::{Body as HttpBody, Frame, SizeHint};
use tracing::debug;

use super::config::CacheConfig;
use super::meta::{CacheMeta, NEVER_CACHE_RESPONSE_HEADERS};
use super::store::Store;

/// Body markers for consent-management placeholders. Pages carrying these
/// are rendered per-visitor by the consent tooling and must not be frozen
/// in the cache. Matched case-insensitively against the captured body.
const CONSENT_MARKERS: [&str; 7] = [
    "_iub_cs_activate",
    "cmplazyload",
    "data-suppressedsrc",
    "data-cmp-",
    "cookiebot",
    "onetrust",
    "cookieconsent",
];

/// Decide cacheability of a response and wrap its body for capture.
///
/// The status must match one of the configured response codes and no
/// never-cache header may be present; otherwise the response is tagged
/// `BYPASS` and passed through untouched. `path` is the request path from
/// before the downstream ran, so rewrites cannot shift the cache key.
pub fn capture_response(
    config: &CacheConfig,
    store: Arc<Store>,
    path: String,
    response: Response,
) -> Response {
    let status = response.status();
    let cacheable = status_is_cacheable(&config.cache_response_codes, status)
        && !has_never_cache_header(response.headers());

    let (mut parts, body) = response.into_parts();
    if !cacheable {
        debug!(path = %path, status = status.as_u16(), "response not cacheable");
        parts
            .headers
            .insert(config.cache_header_name.clone(), HeaderValue::from_static("BYPASS"));
        return Response::from_parts(parts, body);
    }

    parts
        .headers
        .insert(config.cache_header_name.clone(), HeaderValue::from_static("MISS"));

    let capture = CaptureBody {
        inner: body,
        buf: BytesMut::new(),
        max_size: config.memory_item_max_size,
        target: Some(CommitTarget {
            store,
            path,
            status,
            headers: parts.headers.clone(),
        }),
    };
    Response::from_parts(parts, Body::new(capture))
}

/// A status is cacheable when it matches any configured entry: either the
/// full status string, or a single digit matching the first byte of the
/// status string (the hundreds bucket).
pub(crate) fn status_is_cacheable(codes: &[String], status: StatusCode) -> bool {
    let status = status.as_u16().to_string();
    codes.iter().any(|code| {
        *code == status || (code.len() == 1 && code.as_bytes()[0] == status.as_bytes()[0])
    })
}

fn has_never_cache_header(headers: &HeaderMap) -> bool {
    NEVER_CACHE_RESPONSE_HEADERS
        .iter()
        .any(|name| headers.contains_key(*name))
}

/// True when the body contains consent-management placeholders.
pub(crate) fn should_bypass_for_content(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body).to_ascii_lowercase();
    CONSENT_MARKERS.iter().any(|marker| text.contains(marker))
}

struct CommitTarget {
    store: Arc<Store>,
    path: String,
    status: StatusCode,
    headers: HeaderMap,
}

/// Body wrapper that forwards frames downstream while buffering a copy.
///
/// Exceeding the size cap drops the buffer and disables the capture; the
/// client keeps receiving the stream either way. The commit runs exactly
/// once, on end-of-stream.
struct CaptureBody {
    inner: Body,
    buf: BytesMut,
    max_size: usize,
    target: Option<CommitTarget>,
}

impl CaptureBody {
    fn observe(&mut self, data: &Bytes) {
        let Some(target) = self.target.as_ref() else {
            return;
        };
        if self.buf.len() + data.len() > self.max_size {
            debug!(
                path = %target.path,
                buffered = self.buf.len() + data.len(),
                limit = self.max_size,
                "response exceeds cache item limit; passing through uncached"
            );
            self.buf = BytesMut::new();
            self.target = None;
            return;
        }
        self.buf.extend_from_slice(data);
    }

    fn commit(&mut self) {
        let Some(target) = self.target.take() else {
            return;
        };
        let body = std::mem::take(&mut self.buf).freeze();

        if should_bypass_for_content(&body) {
            debug!(path = %target.path, "body carries consent-management markup; not caching");
            return;
        }
        let Some(meta) = CacheMeta::from_response(target.status, &target.headers, &body) else {
            debug!(path = %target.path, "unsupported content encoding; not caching");
            return;
        };

        tokio::task::spawn_blocking(move || {
            target.store.set(&target.path, "", meta, body);
        });
    }
}

impl HttpBody for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.observe(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.target = None;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.commit();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
