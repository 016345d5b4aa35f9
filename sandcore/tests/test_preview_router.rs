use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::to_bytes,
    http::{HeaderMap, Method, StatusCode},
    routing::get,
    Router,
};
use bytes::Bytes;
use sandcore::{
    fallback::ContainerPromoter,
    preview::{HealthChecker, PreviewRegistry, PreviewRouter, ProxyRequest},
    SandcoreError, SandcoreResult,
};
use tokio::net::TcpListener;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

struct CountingPromoter {
    url: String,
    calls: AtomicUsize,
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ContainerPromoter for CountingPromoter {
    async fn promote_to_container(&self, _sandbox_id: &str) -> SandcoreResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.url.clone())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_proxies_to_live_upstream() -> anyhow::Result<()> {
    let upstream = upstream("primary").await?;
    let promoter = promoter("http://127.0.0.1:1");
    let router = router(promoter.clone())?;

    router
        .registry()
        .register("sb1", 3000, &upstream, Default::default());

    let response = router
        .route("sb1", 3000, "hello", request(Some("name=x")))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response).await?, "primary:/hello?name=x");
    assert_eq!(promoter.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_fails_over_once_and_sticks() -> anyhow::Result<()> {
    let fallback = upstream("fallback").await?;
    let promoter = promoter(&fallback);
    let router = router(promoter.clone())?;

    router
        .registry()
        .register("sb1", 3000, &dead_url().await?, Default::default());

    let response = router.route("sb1", 3000, "", request(None)).await?;
    assert_eq!(body(response).await?, "fallback:/");
    assert_eq!(promoter.calls.load(Ordering::SeqCst), 1);

    let target = router.registry().resolve("sb1", 3000).expect("target");
    assert!(target.use_fallback);
    assert_eq!(target.fallback_url.as_deref(), Some(fallback.as_str()));

    let response = router.route("sb1", 3000, "a/b", request(None)).await?;
    assert_eq!(body(response).await?, "fallback:/a/b");
    assert_eq!(promoter.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_dead_fallback_is_not_promoted_again() -> anyhow::Result<()> {
    let dead = dead_url().await?;
    let promoter = promoter(&dead);
    let router = router(promoter.clone())?;

    router
        .registry()
        .register("sb1", 3000, &dead, Default::default());

    let result = router.route("sb1", 3000, "", request(None)).await;
    assert!(matches!(result, Err(SandcoreError::UpstreamUnavailable(_))));
    assert_eq!(promoter.calls.load(Ordering::SeqCst), 1);

    let result = router.route("sb1", 3000, "", request(None)).await;
    assert!(matches!(result, Err(SandcoreError::UpstreamUnavailable(_))));
    assert_eq!(promoter.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_unknown_target() -> anyhow::Result<()> {
    let router = router(promoter("http://127.0.0.1:1"))?;

    let result = router.route("sb1", 3000, "", request(None)).await;
    assert!(matches!(
        result,
        Err(SandcoreError::PreviewTargetNotFound { port: 3000, .. })
    ));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_upstream_errors_pass_through() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new().route("/", get(|| async { (StatusCode::BAD_GATEWAY, "broken") }));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let promoter = promoter("http://127.0.0.1:1");
    let router = router(promoter.clone())?;
    router
        .registry()
        .register("sb1", 3000, &format!("http://{addr}"), Default::default());

    let response = router.route("sb1", 3000, "", request(None)).await?;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(promoter.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn promoter(url: &str) -> Arc<CountingPromoter> {
    Arc::new(CountingPromoter {
        url: url.to_string(),
        calls: AtomicUsize::new(0),
    })
}

fn router(promoter: Arc<CountingPromoter>) -> anyhow::Result<PreviewRouter> {
    let registry = Arc::new(PreviewRegistry::new(
        HealthChecker::new(reqwest::Client::new(), Duration::from_secs(1)),
        Duration::from_secs(10),
    ));
    Ok(PreviewRouter::new(registry, promoter, Duration::from_secs(5))?)
}

fn request(query: Option<&str>) -> ProxyRequest {
    ProxyRequest {
        method: Method::GET,
        headers: HeaderMap::new(),
        query: query.map(str::to_string),
        body: Bytes::new(),
    }
}

/// Starts a server answering every path with `<name>:<path and query>`.
async fn upstream(name: &'static str) -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new().fallback(move |uri: axum::http::Uri| async move {
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default();
        format!("{name}:{path}")
    });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

async fn dead_url() -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(format!("http://{addr}"))
}

async fn body(response: axum::response::Response) -> anyhow::Result<String> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(String::from_utf8(bytes.to_vec())?)
}
