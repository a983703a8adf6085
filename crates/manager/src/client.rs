//! Client for the manager HTTP API
//!
//! Used by gateways that dispatch requests to workers: they call
//! [`ManagerClient::spawn`] to get a worker address, then talk to the worker
//! directly.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use voice_insight_common::{ManagerConfig, ManagerError, Result};
use voice_insight_proto::{
    ErrorResponse, HealthResponse, SpawnResponse, StatusResponse, SuccessResponse,
};

/// Spawns wait on a model load, which can take minutes
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Where a spawned worker can be reached
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEndpoint {
    pub alias: String,
    /// Base URL of the worker, e.g. `http://localhost:8211`
    pub address: String,
    pub port: u16,
    pub memory_gb: f64,
    pub model_type: String,
}

/// Manager client wrapper
#[derive(Debug, Clone)]
pub struct ManagerClient {
    client: reqwest::Client,
    base_url: String,
    worker_host: String,
}

impl ManagerClient {
    /// Create a client for the manager at `base_url`. Workers are addressed
    /// at `worker_host`.
    pub fn new(base_url: impl Into<String>, worker_host: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ManagerError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            worker_host: worker_host.into(),
        })
    }

    /// Client for the manager described by this configuration
    pub fn from_config(config: &ManagerConfig) -> Result<Self> {
        Self::new(config.workers.manager_url(), config.workers.worker_host.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform health check. Connection failures count as unhealthy.
    pub async fn health_check(&self) -> bool {
        match self.get::<HealthResponse>("/health", "health").await {
            Ok(health) => health.status == "healthy",
            Err(e) => {
                debug!("Manager health check failed: {}", e);
                false
            }
        }
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        self.get("/status", "status").await
    }

    /// Ensure `alias` is running and mark it used
    pub async fn spawn(&self, alias: &str) -> Result<WorkerEndpoint> {
        let spawned: SpawnResponse = self.post(&format!("/spawn/{}", alias), alias).await?;
        self.touch(alias).await?;

        Ok(WorkerEndpoint {
            address: format!("http://{}:{}", self.worker_host, spawned.port),
            alias: spawned.alias,
            port: spawned.port,
            memory_gb: spawned.memory_gb,
            model_type: spawned.model_type,
        })
    }

    /// Mark `alias` used. A no-op on the manager if it is not running.
    pub async fn touch(&self, alias: &str) -> Result<()> {
        let _: SuccessResponse = self.post(&format!("/touch/{}", alias), alias).await?;
        Ok(())
    }

    /// Returns false if `alias` was not running
    pub async fn stop(&self, alias: &str) -> Result<bool> {
        let response: SuccessResponse = self.post(&format!("/stop/{}", alias), alias).await?;
        Ok(response.success)
    }

    pub async fn stop_all(&self) -> Result<()> {
        let _: SuccessResponse = self.post("/stop-all", "workers").await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, subject: &str) -> Result<T> {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        self.call(request, path, subject).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, subject: &str) -> Result<T> {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        self.call(request, path, subject).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
        subject: &str,
    ) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| ManagerError::connection(format!("Manager unreachable at {}: {}", self.base_url, e)))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                ManagerError::connection(format!("Invalid response from manager: {}", e))
            });
        }

        let detail = match response.json::<ErrorResponse>().await {
            Ok(body) => body.detail,
            Err(_) => status.to_string(),
        };
        Err(error_for_status(status, path, subject, detail))
    }
}

/// Map an error response back into the error it was rendered from
fn error_for_status(status: StatusCode, path: &str, subject: &str, detail: String) -> ManagerError {
    match status {
        StatusCode::NOT_FOUND => ManagerError::not_found(subject),
        StatusCode::SERVICE_UNAVAILABLE => ManagerError::resource_exhausted(detail),
        StatusCode::INTERNAL_SERVER_ERROR if path.starts_with("/spawn/") => {
            ManagerError::startup_failure_from_detail(subject, &detail)
        }
        _ => ManagerError::connection(format!("Manager returned {}: {}", status.as_u16(), detail)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::testing::{entry, harness, serve, Behavior, Harness};

    async fn client_for(h: &Harness) -> ManagerClient {
        let base = serve(router(h.registry.clone(), true)).await;
        ManagerClient::new(base, "localhost").unwrap()
    }

    #[tokio::test]
    async fn test_spawn_touches_and_returns_address() {
        let h = harness(vec![entry("stt-fast", 1.5)], 16.0);
        let client = client_for(&h).await;

        assert!(client.health_check().await);
        let worker = client.spawn("stt-fast").await.unwrap();

        assert_eq!(worker.address, "http://localhost:9000");
        assert_eq!(worker.memory_gb, 1.5);
        assert_eq!(worker.model_type, "stt");

        let status = client.status().await.unwrap();
        assert_eq!(status.workers["stt-fast"].request_count, 1);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let h = harness(vec![entry("big", 32.0), entry("flaky", 1.0)], 4.0);
        h.host.script("flaky", &[Behavior::CrashOnStart]);
        let client = client_for(&h).await;

        assert!(matches!(
            client.spawn("missing").await,
            Err(ManagerError::NotFound(alias)) if alias == "missing"
        ));
        assert!(matches!(
            client.spawn("big").await,
            Err(ManagerError::ResourceExhausted(_))
        ));
        match client.spawn("flaky").await {
            Err(ManagerError::StartupFailure { alias, reason, output }) => {
                assert_eq!(alias, "flaky");
                assert_eq!(reason, "process exited with code 1 before becoming healthy");
                assert!(output.starts_with("Traceback"));
                assert!(output.contains("model load failed"));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // A failed start leaves nothing behind, so the next spawn retries
        let retry = client.spawn("flaky").await.unwrap();
        assert_eq!(retry.address, "http://localhost:9001");
    }

    #[test]
    fn test_server_errors_outside_spawn_stay_connection_errors() {
        let err = error_for_status(
            StatusCode::INTERNAL_SERVER_ERROR,
            "/status",
            "status",
            "Internal error: boom".to_string(),
        );

        assert!(matches!(err, ManagerError::Connection(msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn test_stop_and_stop_all() {
        let h = harness(vec![entry("x", 1.0), entry("y", 1.0)], 16.0);
        let client = client_for(&h).await;
        client.spawn("x").await.unwrap();
        client.spawn("y").await.unwrap();

        assert!(client.stop("x").await.unwrap());
        assert!(!client.stop("x").await.unwrap());
        client.touch("x").await.unwrap();

        client.stop_all().await.unwrap();
        assert!(client.status().await.unwrap().workers.is_empty());
    }

    #[tokio::test]
    async fn test_from_config_uses_manager_client_host() {
        let mut config = ManagerConfig::from_yaml("models: {}\n").unwrap();
        config.workers.manager_client_host = "manager.internal".to_string();
        config.workers.worker_host = "workers.internal".to_string();

        let client = ManagerClient::from_config(&config).unwrap();

        assert_eq!(client.base_url(), "http://manager.internal:8210");
        assert_eq!(client.worker_host, "workers.internal");
    }

    #[tokio::test]
    async fn test_unreachable_manager() {
        let client = ManagerClient::new("http://127.0.0.1:1/", "localhost").unwrap();

        assert_eq!(client.base_url(), "http://127.0.0.1:1");
        assert!(!client.health_check().await);
        assert!(matches!(client.status().await, Err(ManagerError::Connection(_))));
    }
}
