//! HTTP client for the external GPU worker fleet.
//!
//! The worker process exposes a small JSON API:
//!
//! - `GET  /healthz`                     – liveness probe
//! - `POST /pipelines/{model}/load`      – load a pipeline into memory
//! - `POST /pipelines/{model}/release`   – fully release a pipeline
//! - `POST /memory/cleanup`              – allocator cache cleanup
//! - `POST /infer`                       – run one generation
//!
//! Worker-side failure messages are passed through verbatim so the task
//! record carries the worker's own report.

use async_trait::async_trait;
use serde::Deserialize;

use kiln_core::{GenerationParams, GpuWorker, WorkerError};

#[derive(Debug, Clone)]
pub struct HttpWorker {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CleanupResponse {
    freed_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    result_location: String,
}

impl HttpWorker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn error_detail(response: reqwest::Response) -> String {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if body.is_empty() {
            format!("worker returned {status}")
        } else {
            body
        }
    }
}

#[async_trait]
impl GpuWorker for HttpWorker {
    async fn probe(&self) -> Result<(), WorkerError> {
        let response = self
            .client
            .get(self.url("/healthz"))
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(WorkerError::Unreachable(Self::error_detail(response).await))
        }
    }

    async fn load(&self, model: &str) -> Result<(), WorkerError> {
        let response = self
            .client
            .post(self.url(&format!("/pipelines/{model}/load")))
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(WorkerError::LoadFailed {
                model: model.to_owned(),
                message: Self::error_detail(response).await,
            })
        }
    }

    async fn release(&self, model: &str) -> Result<(), WorkerError> {
        let response = self
            .client
            .post(self.url(&format!("/pipelines/{model}/release")))
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(WorkerError::Inference(Self::error_detail(response).await))
        }
    }

    async fn cleanup_cache(&self) -> Result<u64, WorkerError> {
        let response = self
            .client
            .post(self.url("/memory/cleanup"))
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(WorkerError::Inference(Self::error_detail(response).await));
        }
        let body: CleanupResponse = response
            .json()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        Ok(body.freed_bytes)
    }

    async fn infer(
        &self,
        task_id: &str,
        model: &str,
        params: &GenerationParams,
    ) -> Result<String, WorkerError> {
        let response = self
            .client
            .post(self.url("/infer"))
            .json(&serde_json::json!({
                "task_id": task_id,
                "model": model,
                "parameters": params,
            }))
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(WorkerError::Inference(Self::error_detail(response).await));
        }
        let body: InferResponse = response
            .json()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        Ok(body.result_location)
    }
}
