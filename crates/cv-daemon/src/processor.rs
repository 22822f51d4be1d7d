//! Task processor backed by an HTTP endpoint.
//!
//! `POST {endpoint}` with a [`ProcessRequest`] body; the endpoint answers with
//! a [`ProcessResponse`]. Token usage in the response is added to the task.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use cv_agents::processor::{ProcessorError, TaskProcessor, WorkContext};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Serialize)]
pub struct ProcessRequest<'a> {
    pub task_id: &'a str,
    pub trace_id: &'a str,
    pub channel: &'a str,
    pub chat_id: &'a str,
    pub sender_id: &'a str,
    pub kind: &'a str,
    pub content: &'a str,
    pub metadata: &'a BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
}

#[derive(Debug, Deserialize)]
pub struct ProcessResponse {
    pub output: String,
    #[serde(default)]
    pub usage: Option<Usage>,
}

pub struct HttpProcessor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProcessor {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ProcessorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProcessorError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl TaskProcessor for HttpProcessor {
    async fn process(&self, ctx: &WorkContext, content: &str) -> Result<String, ProcessorError> {
        let body = ProcessRequest {
            task_id: &ctx.task_id,
            trace_id: &ctx.trace_id,
            channel: &ctx.channel,
            chat_id: &ctx.chat_id,
            sender_id: &ctx.sender_id,
            kind: ctx.kind.as_str(),
            content,
            metadata: &ctx.metadata,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    ProcessorError::Unavailable(e.to_string())
                } else {
                    ProcessorError::Failed(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProcessorError::Failed(format!("HTTP {status}: {text}")));
        }
        let parsed: ProcessResponse = resp
            .json()
            .await
            .map_err(|e| ProcessorError::Failed(format!("invalid processor response: {e}")))?;

        if let Some(usage) = parsed.usage {
            if let Err(e) = ctx
                .usage
                .record(usage.prompt_tokens, usage.completion_tokens)
                .await
            {
                warn!(task_id = %ctx.task_id, error = %e, "failed to record token usage");
            }
        }
        Ok(parsed.output)
    }
}
