//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (prompt submission, queue inspection,
//! history retrieval, cancellation, node metadata) using [`reqwest`].
//! Every call goes through [`run_with_retry`], so transient failures are
//! retried under the client's [`RetryPolicy`] and bounded by the caller's
//! [`CallContext`].

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::messages::{
    input_choices, parse_history, Capabilities, PromptOutcome, QueueSnapshot, SubmitResponse,
};
use crate::retry::{run_with_retry, CallContext, RetryPolicy};

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    policy: RetryPolicy,
    ping_timeout: Duration,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (connect, reset, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A 2xx response whose body did not match the expected shape.
    #[error("Malformed ComfyUI response: {0}")]
    Decode(String),

    /// The caller's deadline passed before the operation finished.
    #[error("Deadline exceeded")]
    DeadlineExceeded,
}

impl ComfyUIApiError {
    /// Transport failures, 5xx and 429 are worth another attempt. Other
    /// statuses and malformed bodies are definitive.
    pub fn is_retryable(&self) -> bool {
        match self {
            ComfyUIApiError::Request(_) => true,
            ComfyUIApiError::ApiError { status, .. } => *status >= 500 || *status == 429,
            ComfyUIApiError::Decode(_) | ComfyUIApiError::DeadlineExceeded => false,
        }
    }
}

impl ComfyUIApi {
    /// Create an API client with the default retry policy.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(
            reqwest::Client::new(),
            api_url,
            RetryPolicy::default(),
            Duration::from_secs(2),
        )
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for connection pooling across multiple instances).
    pub fn with_client(
        client: reqwest::Client,
        api_url: impl Into<String>,
        policy: RetryPolicy,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            policy,
            ping_timeout,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /prompt` with the workflow under `"prompt"` and a fresh
    /// client id. Returns the server-assigned `prompt_id`.
    pub async fn submit_prompt(
        &self,
        ctx: &CallContext,
        workflow: &Value,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": uuid::Uuid::new_v4().to_string(),
        });
        let url = self.url("/prompt");

        self.send_json(&self.policy, ctx, "submit_prompt", |c| c.post(&url).json(&body))
            .await
    }

    /// Current queue contents (`GET /queue`).
    pub async fn queue(&self, ctx: &CallContext) -> Result<QueueSnapshot, ComfyUIApiError> {
        let url = self.url("/queue");
        self.send_json(&self.policy, ctx, "queue", |c| c.get(&url))
            .await
    }

    /// Queued plus executing prompts.
    pub async fn queue_depth(&self, ctx: &CallContext) -> Result<u32, ComfyUIApiError> {
        Ok(self.queue(ctx).await?.depth())
    }

    /// Single-attempt liveness probe against `GET /system_stats`, bounded
    /// by the ping timeout.
    pub async fn probe(&self) -> Result<(), ComfyUIApiError> {
        let url = self.url("/system_stats");
        let policy = RetryPolicy::single_attempt(self.ping_timeout);
        self.send_json::<Value>(&policy, &CallContext::unbounded(), "ping", |c| c.get(&url))
            .await
            .map(|_| ())
    }

    /// `true` when the backend answered the liveness probe in time.
    pub async fn ping(&self) -> bool {
        self.probe().await.is_ok()
    }

    /// Single-attempt queue depth read used by health checks.
    pub async fn probe_queue_depth(&self) -> Result<u32, ComfyUIApiError> {
        let url = self.url("/queue");
        let policy = RetryPolicy::single_attempt(self.ping_timeout);
        self.send_json::<QueueSnapshot>(&policy, &CallContext::unbounded(), "queue_probe", |c| {
            c.get(&url)
        })
        .await
        .map(|q| q.depth())
    }

    /// Execution history for a prompt (`GET /history/{prompt_id}`).
    pub async fn history(
        &self,
        ctx: &CallContext,
        prompt_id: &str,
    ) -> Result<PromptOutcome, ComfyUIApiError> {
        let url = self.url(&format!("/history/{prompt_id}"));
        let body: Value = self
            .send_json(&self.policy, ctx, "history", |c| c.get(&url))
            .await?;
        Ok(parse_history(prompt_id, &body))
    }

    /// Remove a prompt from the backend.
    ///
    /// Deletes it from the pending queue via `POST /queue`, and interrupts
    /// execution when it is the prompt currently running.
    pub async fn cancel_prompt(
        &self,
        ctx: &CallContext,
        prompt_id: &str,
    ) -> Result<(), ComfyUIApiError> {
        let running = self.queue(ctx).await?.is_running(prompt_id);

        let url = self.url("/queue");
        let body = serde_json::json!({ "delete": [prompt_id] });
        self.send_unit(ctx, "delete_prompt", |c| c.post(&url).json(&body))
            .await?;

        if running {
            self.interrupt(ctx).await?;
        }
        Ok(())
    }

    /// Interrupt whatever is executing right now (`POST /interrupt`).
    pub async fn interrupt(&self, ctx: &CallContext) -> Result<(), ComfyUIApiError> {
        let url = self.url("/interrupt");
        self.send_unit(ctx, "interrupt", |c| c.post(&url)).await
    }

    /// Node metadata (`GET /object_info/{node}`).
    pub async fn object_info(&self, ctx: &CallContext, node: &str) -> Result<Value, ComfyUIApiError> {
        let url = self.url(&format!("/object_info/{node}"));
        self.send_json(&self.policy, ctx, "object_info", |c| c.get(&url))
            .await
    }

    /// Checkpoint files known to the backend.
    pub async fn list_models(&self, ctx: &CallContext) -> Result<Vec<String>, ComfyUIApiError> {
        self.combo_choices(ctx, "CheckpointLoaderSimple", "ckpt_name")
            .await
    }

    /// LoRA files known to the backend.
    pub async fn list_loras(&self, ctx: &CallContext) -> Result<Vec<String>, ComfyUIApiError> {
        self.combo_choices(ctx, "LoraLoader", "lora_name").await
    }

    /// Sampler and scheduler names, from the `KSampler` node.
    pub async fn list_samplers(
        &self,
        ctx: &CallContext,
    ) -> Result<(Vec<String>, Vec<String>), ComfyUIApiError> {
        let info = self.object_info(ctx, "KSampler").await?;
        Ok((
            input_choices(&info, "KSampler", "sampler_name"),
            input_choices(&info, "KSampler", "scheduler"),
        ))
    }

    /// Everything above in one round of concurrent requests.
    pub async fn capabilities(&self, ctx: &CallContext) -> Result<Capabilities, ComfyUIApiError> {
        let (models, loras, (samplers, schedulers)) = tokio::try_join!(
            self.list_models(ctx),
            self.list_loras(ctx),
            self.list_samplers(ctx),
        )?;
        Ok(Capabilities {
            models,
            loras,
            samplers,
            schedulers,
        })
    }

    // ---- private helpers ----

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_url)
    }

    async fn combo_choices(
        &self,
        ctx: &CallContext,
        node: &str,
        input: &str,
    ) -> Result<Vec<String>, ComfyUIApiError> {
        let info = self.object_info(ctx, node).await?;
        Ok(input_choices(&info, node, input))
    }

    /// Send a request built by `build` under `policy`, parsing the JSON
    /// body of the first successful attempt.
    async fn send_json<T: DeserializeOwned>(
        &self,
        policy: &RetryPolicy,
        ctx: &CallContext,
        operation: &str,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> Result<T, ComfyUIApiError> {
        run_with_retry(policy, ctx, operation, |_| {
            let request = build(&self.client).timeout(policy.timeout);
            async move { Self::parse_response(request.send().await?).await }
        })
        .await
    }

    /// Like [`Self::send_json`] with the client policy, discarding the body.
    async fn send_unit(
        &self,
        ctx: &CallContext,
        operation: &str,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> Result<(), ComfyUIApiError> {
        run_with_retry(&self.policy, ctx, operation, |_| {
            let request = build(&self.client).timeout(self.policy.timeout);
            async move { Self::check_status(request.send().await?).await }
        })
        .await
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let body = Self::ensure_success(response).await?.text().await?;
        serde_json::from_str(&body).map_err(|e| ComfyUIApiError::Decode(e.to_string()))
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let api = |status| ComfyUIApiError::ApiError {
            status,
            body: String::new(),
        };
        assert!(api(500).is_retryable());
        assert!(api(503).is_retryable());
        assert!(api(429).is_retryable());
        assert!(!api(400).is_retryable());
        assert!(!api(404).is_retryable());
        assert!(!ComfyUIApiError::Decode("x".into()).is_retryable());
        assert!(!ComfyUIApiError::DeadlineExceeded.is_retryable());
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let api = ComfyUIApi::new("http://host:8188/");
        assert_eq!(api.api_url(), "http://host:8188");
        assert_eq!(api.url("/queue"), "http://host:8188/queue");
    }
}
