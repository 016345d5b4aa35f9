use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{header, HeaderMap, Method},
    response::Response,
};
use bytes::Bytes;
use reqwest::{redirect::Policy, Client};

use crate::{fallback::ContainerPromoter, SandcoreError, SandcoreResult};

use super::PreviewRegistry;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Upstream response headers that are never passed on.
///
/// The proxy re-frames the body, so the upstream's encoding and connection headers no longer
/// describe what the client receives.
pub const EXCLUDED_RESPONSE_HEADERS: &[&str] = &["content-encoding", "transfer-encoding", "connection"];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An inbound request to forward, detached from the server framework.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// The HTTP method.
    pub method: Method,

    /// Request headers. `Host` is dropped before forwarding.
    pub headers: HeaderMap,

    /// The raw query string, without the `?`.
    pub query: Option<String>,

    /// The full request body.
    pub body: Bytes,
}

/// Forwards preview traffic to the registered upstream, failing over to a fallback container.
pub struct PreviewRouter {
    client: Client,
    registry: Arc<PreviewRegistry>,
    promoter: Arc<dyn ContainerPromoter>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PreviewRouter {
    /// Creates a router that follows no redirects and bounds each upstream call by `timeout`.
    pub fn new(
        registry: Arc<PreviewRegistry>,
        promoter: Arc<dyn ContainerPromoter>,
        timeout: Duration,
    ) -> SandcoreResult<Self> {
        let client = build_client(timeout)?;
        Ok(Self::with_client(client, registry, promoter))
    }

    /// Creates a router around an existing HTTP client.
    pub fn with_client(
        client: Client,
        registry: Arc<PreviewRegistry>,
        promoter: Arc<dyn ContainerPromoter>,
    ) -> Self {
        Self {
            client,
            registry,
            promoter,
        }
    }

    /// The registry consulted for every request.
    pub fn registry(&self) -> &Arc<PreviewRegistry> {
        &self.registry
    }

    /// Sends `request` to `url` and streams the upstream response back.
    ///
    /// Any upstream status, including 5xx, is passed through. Only a transport failure is an
    /// error, reported as [`SandcoreError::UpstreamUnavailable`].
    pub async fn proxy(&self, url: &str, request: &ProxyRequest) -> SandcoreResult<Response> {
        let mut target = url.to_string();
        if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
            target.push('?');
            target.push_str(query);
        }

        let mut headers = request.headers.clone();
        headers.remove(header::HOST);

        let upstream = self
            .client
            .request(request.method.clone(), &target)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| SandcoreError::UpstreamUnavailable(format!("{target}: {e}")))?;

        let mut response = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            if !EXCLUDED_RESPONSE_HEADERS.contains(&name.as_str()) {
                response = response.header(name, value);
            }
        }

        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(SandcoreError::custom)
    }

    /// Forwards a request for `path` on a sandbox preview.
    ///
    /// If the upstream cannot be reached and the target is not on fallback yet, the sandbox is
    /// promoted, the target is switched to the fallback URL, and the request is retried once.
    pub async fn route(
        &self,
        sandbox_id: &str,
        port: u16,
        path: &str,
        request: ProxyRequest,
    ) -> SandcoreResult<Response> {
        let target = self.registry.resolve(sandbox_id, port).ok_or_else(|| {
            SandcoreError::PreviewTargetNotFound {
                sandbox_id: sandbox_id.to_string(),
                port,
            }
        })?;

        match self.proxy(&join_url(target.effective_url(), path), &request).await {
            Err(SandcoreError::UpstreamUnavailable(reason)) if !target.use_fallback => {
                tracing::warn!(sandbox_id, port, %reason, "preview upstream unavailable, promoting");

                let fallback_url = self.promoter.promote_to_container(sandbox_id).await?;
                self.registry.mark_fallback(sandbox_id, port, &fallback_url);

                self.proxy(&join_url(&fallback_url, path), &request).await
            }
            result => result,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Joins a base URL and a request path with exactly one slash between them.
///
/// An empty path yields the base URL without a trailing slash.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

/// Builds the HTTP client shared by the router and the health checker.
pub fn build_client(timeout: Duration) -> SandcoreResult<Client> {
    Ok(Client::builder()
        .redirect(Policy::none())
        .timeout(timeout)
        .build()?)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
