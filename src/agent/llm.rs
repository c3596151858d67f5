use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::types::{
    ChatRequest, ChatResponse, EmbedRequest, EmbedResponse, GenerateRequest, GenerateResponse,
    Message, ModelInfo, ShowResponse, StatusResponse, TagsResponse, Tool, VersionResponse,
};

use super::stream::NdjsonDecoder;

/// Ollama 客户端错误
#[derive(Debug, Error)]
pub enum OllamaError {
    #[error("调用 Ollama API 失败：{0}")]
    Http(#[from] reqwest::Error),
    #[error("Ollama API 错误：{status} - {body}")]
    Api { status: u16, body: String },
    #[error("解析 Ollama 响应失败：{0}")]
    Json(#[from] serde_json::Error),
    #[error("Ollama 错误：{0}")]
    Server(String),
    #[error("流式响应中断：{0}")]
    Stream(String),
}

fn retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

impl OllamaError {
    /// 连接失败、超时、429 和 5xx 可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            OllamaError::Http(e) => {
                if e.is_decode() || e.is_builder() {
                    return false;
                }
                e.status().map_or(true, |s| retryable_status(s.as_u16()))
            }
            OllamaError::Api { status, .. } => retryable_status(*status),
            _ => false,
        }
    }
}

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_retries(3)
    }
}

impl RetryPolicy {
    /// 首次请求 + retries 次重试，退避 1s / 2s / 4s ...
    pub fn from_retries(retries: usize) -> Self {
        RetryPolicy {
            max_attempts: retries as u32 + 1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    pub fn backoff_for(&self, retry: u32) -> Duration {
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(retry as i32);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, OllamaError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OllamaError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if !e.is_retryable() || attempt >= max_attempts {
                        return Err(e);
                    }

                    let delay = self.backoff_for(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "LLM 调用失败，正在重试"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Ollama REST API 客户端
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    retry: RetryPolicy,
}

impl OllamaClient {
    pub fn new(config: &AgentConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        OllamaClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            retry: RetryPolicy::from_retries(config.max_llm_retries),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_json(response: Response) -> Result<Value, OllamaError> {
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(OllamaError::Api {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        let value: Value = serde_json::from_str(&text)?;
        check_server_error(&value)?;
        Ok(value)
    }

    /// 发送请求（带重试）并解析 JSON
    async fn send_json<F>(&self, build: F) -> Result<Value, OllamaError>
    where
        F: Fn() -> RequestBuilder,
    {
        self.retry
            .execute(|| {
                let request = build();
                async move { Self::read_json(request.send().await?).await }
            })
            .await
    }

    /// 只对建立连接和响应头阶段重试
    async fn open_stream<F>(&self, build: F) -> Result<Response, OllamaError>
    where
        F: Fn() -> RequestBuilder,
    {
        self.retry
            .execute(|| {
                let request = build();
                async move {
                    let response = request.send().await?;
                    let status = response.status();
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(OllamaError::Api {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    Ok::<_, OllamaError>(response)
                }
            })
            .await
    }

    fn chat_request(&self, messages: &[Message], tools: Option<&[Tool]>, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            tools: tools.filter(|t| !t.is_empty()).map(|t| t.to_vec()),
            stream,
        }
    }

    /// POST /api/chat（非流式）
    pub async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[Tool]>,
    ) -> Result<ChatResponse, OllamaError> {
        let request = self.chat_request(messages, tools, false);
        let url = self.url("/api/chat");
        debug!(model = %self.model, messages = messages.len(), "chat 请求");
        let value = self.send_json(|| self.client.post(&url).json(&request)).await?;
        parse_chat(value)
    }

    /// POST /api/chat（流式 NDJSON）
    pub async fn chat_stream(
        &self,
        messages: &[Message],
        tools: Option<&[Tool]>,
    ) -> Result<BoxStream<'static, Result<ChatResponse, OllamaError>>, OllamaError> {
        let request = self.chat_request(messages, tools, true);
        let url = self.url("/api/chat");
        let response = self
            .open_stream(|| self.client.post(&url).json(&request))
            .await?;
        Ok(ndjson_values(response)
            .map(|item| item.and_then(parse_chat))
            .boxed())
    }

    fn generate_request(&self, prompt: &str, system: Option<&str>, stream: bool) -> GenerateRequest {
        GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            system: system.map(str::to_string),
            stream,
        }
    }

    /// POST /api/generate
    pub async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<GenerateResponse, OllamaError> {
        let request = self.generate_request(prompt, system, false);
        let url = self.url("/api/generate");
        let value = self.send_json(|| self.client.post(&url).json(&request)).await?;
        parse_generate(value)
    }

    pub async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<BoxStream<'static, Result<GenerateResponse, OllamaError>>, OllamaError> {
        let request = self.generate_request(prompt, system, true);
        let url = self.url("/api/generate");
        let response = self
            .open_stream(|| self.client.post(&url).json(&request))
            .await?;
        Ok(ndjson_values(response)
            .map(|item| item.and_then(parse_generate))
            .boxed())
    }

    /// POST /api/embed
    pub async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, OllamaError> {
        let request = EmbedRequest {
            model: self.model.clone(),
            input: inputs.to_vec(),
        };
        let url = self.url("/api/embed");
        let value = self.send_json(|| self.client.post(&url).json(&request)).await?;
        let response: EmbedResponse = serde_json::from_value(value)?;
        Ok(response.embeddings)
    }

    /// GET /api/tags
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, OllamaError> {
        let url = self.url("/api/tags");
        let value = self.send_json(|| self.client.get(&url)).await?;
        let tags: TagsResponse = serde_json::from_value(value)?;
        Ok(tags.models)
    }

    /// POST /api/show
    pub async fn show_model(&self, name: &str) -> Result<ShowResponse, OllamaError> {
        let url = self.url("/api/show");
        let body = json!({ "model": name });
        let value = self.send_json(|| self.client.post(&url).json(&body)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// POST /api/pull（非流式，等待下载完成）
    pub async fn pull_model(&self, name: &str) -> Result<StatusResponse, OllamaError> {
        let url = self.url("/api/pull");
        let body = json!({ "model": name, "stream": false });
        let value = self.send_json(|| self.client.post(&url).json(&body)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// DELETE /api/delete
    pub async fn delete_model(&self, name: &str) -> Result<(), OllamaError> {
        let url = self.url("/api/delete");
        let body = json!({ "model": name });
        self.send_json(|| self.client.delete(&url).json(&body)).await?;
        Ok(())
    }

    /// GET /api/version
    pub async fn version(&self) -> Result<String, OllamaError> {
        let url = self.url("/api/version");
        let value = self.send_json(|| self.client.get(&url)).await?;
        let version: VersionResponse = serde_json::from_value(value)?;
        Ok(version.version)
    }
}

fn check_server_error(value: &Value) -> Result<(), OllamaError> {
    match value.get("error") {
        Some(Value::String(err)) => Err(OllamaError::Server(err.clone())),
        Some(Value::Null) | None => Ok(()),
        Some(other) => Err(OllamaError::Server(other.to_string())),
    }
}

fn parse_chat(value: Value) -> Result<ChatResponse, OllamaError> {
    let mut response: ChatResponse = serde_json::from_value(value.clone())?;
    response.raw = value;
    Ok(response)
}

fn parse_generate(value: Value) -> Result<GenerateResponse, OllamaError> {
    let mut response: GenerateResponse = serde_json::from_value(value.clone())?;
    response.raw = value;
    Ok(response)
}

/// 把响应体解码为 NDJSON 值流
fn ndjson_values(response: Response) -> impl Stream<Item = Result<Value, OllamaError>> + Send {
    async_stream::try_stream! {
        let mut bytes = response.bytes_stream();
        let mut decoder = NdjsonDecoder::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| OllamaError::Stream(e.to_string()))?;
            for value in decoder.push(&chunk)? {
                check_server_error(&value)?;
                yield value;
            }
        }

        if let Some(value) = decoder.finish()? {
            check_server_error(&value)?;
            yield value;
        }
    }
}

/// 汇总流式 chat：拼接内容、合并 tool call，统计字段取自最后一个分片
pub async fn collect_chat<S, F>(mut stream: S, mut on_delta: F) -> Result<ChatResponse, OllamaError>
where
    S: Stream<Item = Result<ChatResponse, OllamaError>> + Unpin,
    F: FnMut(&str),
{
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    let mut last: Option<ChatResponse> = None;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if !chunk.message.content.is_empty() {
            on_delta(&chunk.message.content);
            content.push_str(&chunk.message.content);
        }
        if let Some(calls) = &chunk.message.tool_calls {
            tool_calls.extend(calls.iter().cloned());
        }
        let done = chunk.done;
        last = Some(chunk);
        if done {
            break;
        }
    }

    let mut response = last.ok_or_else(|| OllamaError::Stream("响应为空".to_string()))?;
    response.message.content = content;
    response.message.tool_calls = if tool_calls.is_empty() {
        None
    } else {
        Some(tool_calls)
    };
    Ok(response)
}
