//! Origin forwarder.
//!
//! The cache middleware sits in front of this handler: whatever the cache
//! does not serve itself is forwarded to the configured origin and the
//! origin's response is streamed back unchanged. Origin failures surface
//! as 502 so the caller can tell the proxy from a broken backend.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, error};

use super::error::InfraError;

/// Connection-scoped headers that must not travel through the proxy.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
enum ForwardError {
    #[error("failed to read request body: {0}")]
    RequestBody(axum::Error),
    #[error("origin request failed: {0}")]
    Origin(#[from] reqwest::Error),
}

pub struct OriginProxy {
    base: Url,
    client: reqwest::Client,
}

impl OriginProxy {
    /// Build a forwarder for the given origin base URL. Redirects are
    /// passed back to the client rather than followed, so the cache sees
    /// them like any other response.
    pub fn new(base_url: &str) -> Result<Self, InfraError> {
        let base = Url::parse(base_url)
            .map_err(|err| InfraError::configuration(format!("invalid origin url: {err}")))?;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| InfraError::configuration(err.to_string()))?;
        Ok(Self { base, client })
    }

    async fn try_forward(&self, request: Request<Body>) -> Result<Response, ForwardError> {
        let (parts, body) = request.into_parts();

        let mut url = self.base.clone();
        url.set_path(parts.uri.path());
        url.set_query(parts.uri.query());
        debug!(method = %parts.method, url = %url, "forwarding to origin");

        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(ForwardError::RequestBody)?;

        let mut upstream = self.client.request(parts.method, url).body(body);
        for (name, value) in parts.headers.iter() {
            if name == header::HOST || is_hop_by_hop(name.as_str()) {
                continue;
            }
            upstream = upstream.header(name, value);
        }

        let origin_response = upstream.send().await?;
        let status = origin_response.status();
        let origin_headers = origin_response.headers().clone();

        let mut response = Response::new(Body::from_stream(origin_response.bytes_stream()));
        *response.status_mut() = status;
        for (name, value) in origin_headers.iter() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            response.headers_mut().append(name, value.clone());
        }
        Ok(response)
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Axum handler delegating every request to the origin.
pub async fn forward_to_origin(
    State(proxy): State<Arc<OriginProxy>>,
    request: Request<Body>,
) -> Response {
    match proxy.try_forward(request).await {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "origin unreachable");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_detection_is_case_insensitive() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("TE"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Accept-Encoding"));
    }

    #[test]
    fn rejects_invalid_origin_url() {
        assert!(OriginProxy::new("not a url").is_err());
        assert!(OriginProxy::new("http://origin:8080").is_ok());
    }
}
