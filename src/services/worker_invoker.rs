//! Asynchronous re-invocation of the worker.

use crate::{
    errors::CopyResult,
    models::job::WorkerRequest,
    services::http_source::HttpError,
};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

#[async_trait]
pub trait WorkerInvoker: Send + Sync {
    /// Queue `operation_name` for a new worker invocation; does not wait for it to run.
    async fn invoke(
        &self,
        operation_name: &str,
        input: Value,
        tracker: Option<Value>,
    ) -> CopyResult<()>;
}

/// Posts worker requests to the service's own `/worker` endpoint.
pub struct HttpWorkerInvoker {
    http: reqwest::Client,
    worker_url: String,
}

impl HttpWorkerInvoker {
    pub fn new(http: reqwest::Client, worker_url: impl Into<String>) -> Self {
        Self {
            http,
            worker_url: worker_url.into(),
        }
    }
}

#[async_trait]
impl WorkerInvoker for HttpWorkerInvoker {
    async fn invoke(
        &self,
        operation_name: &str,
        input: Value,
        tracker: Option<Value>,
    ) -> CopyResult<()> {
        let mut request = WorkerRequest::new(operation_name, input);
        request.tracker = tracker;

        debug!(operation_name, url = %self.worker_url, "invoking worker");
        let response = self
            .http
            .post(&self.worker_url)
            .json(&request)
            .send()
            .await
            .map_err(HttpError::from)?;
        if !response.status().is_success() {
            return Err(HttpError::Status {
                url: self.worker_url.clone(),
                status: response.status().as_u16(),
            }
            .into());
        }
        Ok(())
    }
}
