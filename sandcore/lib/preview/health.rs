use std::time::Duration;

use reqwest::{Client, Method};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Probes preview upstreams with a cheap `OPTIONS` request.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: Client,
    timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HealthChecker {
    /// Creates a checker that gives each probe at most `timeout`.
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// The per-probe timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `url` answers an `OPTIONS` request with a 2xx or 3xx status.
    ///
    /// Transport errors and timeouts count as unhealthy; this never fails.
    pub async fn is_healthy(&self, url: &str) -> bool {
        let result = self
            .client
            .request(Method::OPTIONS, url)
            .timeout(self.timeout)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                status.is_success() || status.is_redirection()
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "health probe failed");
                false
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, routing::options, Router};
    use tokio::net::TcpListener;

    use super::*;

    async fn upstream(status: StatusCode) -> anyhow::Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = Router::new().route("/", options(move || async move { status }));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(format!("http://{addr}"))
    }

    #[tokio::test]
    async fn test_health_by_status() -> anyhow::Result<()> {
        let checker = HealthChecker::new(Client::new(), Duration::from_secs(2));

        assert!(checker.is_healthy(&upstream(StatusCode::OK).await?).await);
        assert!(checker.is_healthy(&upstream(StatusCode::FOUND).await?).await);
        assert!(!checker.is_healthy(&upstream(StatusCode::SERVICE_UNAVAILABLE).await?).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_is_unhealthy() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let checker = HealthChecker::new(Client::new(), Duration::from_millis(500));
        assert!(!checker.is_healthy(&format!("http://{addr}")).await);
        Ok(())
    }
}
