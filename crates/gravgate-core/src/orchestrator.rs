//! Ties the Credential Pool, Request Adapter, Streaming Engine, Usage
//! Store and image sink together per request (spec §4.H): validate, build a
//! request snapshot, acquire a credential, translate, drive the upstream
//! call, then feed the outcome back to the Pool and the log.
//!
//! A response is always written to the caller even if the subsequent log
//! append fails; a log append is always attempted even if the caller has
//! already disconnected.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt, pin_mut};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use gravgate_common::now_ms;
use gravgate_credential::{CredentialPool, CredentialView, Outcome};
use gravgate_protocol::sse::SseParser;
use gravgate_protocol::{anthropic, gemini, openai};
use gravgate_storage::{LogDetail, LogEntry, LogStore, redact_headers};
use gravgate_transform::image::ImageSink;
use gravgate_transform::stream::{
    AnthropicStreamState, OpenAiStreamState, UpstreamEvent, build_anthropic_response, build_openai_response,
    finalize_images, parse_sse_event, render_anthropic_event, signature_observations,
};
use gravgate_transform::{RequestAdapter, UpstreamRequest};

use crate::error::GatewayError;
use crate::upstream::UpstreamClient;

/// A request snapshot the caller hands the Orchestrator for logging;
/// headers are redacted before they ever reach storage.
pub struct RequestContext {
    pub method: &'static str,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

pub type ResponseBody = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Everything an HTTP-framing layer needs to write a response, independent
/// of which web framework does the writing.
pub enum GatewayResponse {
    Json { status: u16, body: Value },
    Stream { status: u16, content_type: &'static str, body: ResponseBody },
}

impl GatewayResponse {
    fn from_error(err: GatewayError) -> Self {
        GatewayResponse::Json { status: err.status_code(), body: err.to_json() }
    }
}

pub struct RequestOrchestrator {
    pool: Arc<CredentialPool>,
    adapter: Arc<RequestAdapter>,
    logs: Arc<LogStore>,
    upstream: Arc<UpstreamClient>,
    images: Arc<dyn ImageSink>,
    retry_max_attempts: u32,
}

impl RequestOrchestrator {
    pub fn new(
        pool: Arc<CredentialPool>,
        adapter: Arc<RequestAdapter>,
        logs: Arc<LogStore>,
        upstream: Arc<UpstreamClient>,
        images: Arc<dyn ImageSink>,
        retry_max_attempts: u32,
    ) -> Self {
        Self { pool, adapter, logs, upstream, images, retry_max_attempts }
    }

    async fn acquire(&self, forced_project_id: Option<&str>) -> Result<CredentialView, GatewayError> {
        match forced_project_id {
            Some(project_id) => Ok(self.pool.acquire_by_project_id(project_id).await?),
            None => Ok(self.pool.acquire().await?),
        }
    }

    fn should_retry(&self, attempt: u32, err: &GatewayError) -> bool {
        attempt < self.retry_max_attempts
            && matches!(err, GatewayError::UpstreamTransient(_) | GatewayError::UpstreamTerminalForCredential(_))
    }

    async fn log_outcome(
        &self,
        ctx: &RequestContext,
        model: &str,
        project_id: &str,
        success: bool,
        status_code: u16,
        message: Option<String>,
        duration_ms: u64,
        request_snapshot: Value,
        response_snapshot: Value,
    ) {
        let mut request_detail = redact_headers(&ctx.headers);
        if let Some(object) = request_detail.as_object_mut() {
            object.insert("body".to_string(), request_snapshot);
        }
        let entry = LogEntry {
            id: 0,
            timestamp: now_ms(),
            model: model.to_string(),
            project_id: project_id.to_string(),
            success,
            status_code,
            message,
            duration_ms,
            method: ctx.method.to_string(),
            path: ctx.path.clone(),
            detail: Some(LogDetail { request: request_detail, response: response_snapshot }),
        };
        if let Err(err) = self.logs.append(entry).await {
            tracing::error!(%err, "failed to append log entry");
        }
    }

    // ---- OpenAI dialect --------------------------------------------------

    pub async fn handle_openai_chat(
        &self,
        ctx: &RequestContext,
        forced_project_id: Option<&str>,
        body: openai::ChatCompletionRequest,
    ) -> GatewayResponse {
        let started = Instant::now();
        let stream = body.stream.unwrap_or(false);
        let model = body.model.clone();
        let request_snapshot = serde_json::to_value(&body).unwrap_or(Value::Null);

        let mut attempt = 0u32;
        loop {
            let credential = match self.acquire(forced_project_id).await {
                Ok(view) => view,
                Err(err) => {
                    self.log_outcome(
                        ctx, &model, "", false, err.status_code(), Some(err.to_string()),
                        elapsed_ms(started), request_snapshot, Value::Null,
                    ).await;
                    return GatewayResponse::from_error(err);
                }
            };
            let upstream_request = self.adapter.from_openai_chat(&body, &credential).await;

            if stream {
                match self.upstream.generate_stream(&credential.access_token, &credential.project_id, &upstream_request).await {
                    Ok(byte_stream) => {
                        self.pool.record_outcome(&credential.project_id, Outcome { success: true, model: model.clone() }).await;
                        let sink = Box::new(OpenAiStreamState::new(chat_completion_id(), model.clone(), now_ms() / 1000));
                        return self.drive_stream(
                            ctx.snapshot(), model.clone(), credential.project_id.clone(), request_snapshot,
                            started, byte_stream, sink, "text/event-stream",
                        ).await;
                    }
                    Err(err) if self.should_retry(attempt, &err) => {
                        attempt += 1;
                        self.pool.record_outcome(&credential.project_id, Outcome { success: false, model: model.clone() }).await;
                        continue;
                    }
                    Err(err) => {
                        self.pool.record_outcome(&credential.project_id, Outcome { success: false, model: model.clone() }).await;
                        self.log_outcome(
                            ctx, &model, &credential.project_id, false, err.status_code(), Some(err.to_string()),
                            elapsed_ms(started), request_snapshot, Value::Null,
                        ).await;
                        return GatewayResponse::from_error(err);
                    }
                }
            }

            match self.upstream.generate(&credential.access_token, &credential.project_id, &upstream_request).await {
                Ok(response) => {
                    self.pool.record_outcome(&credential.project_id, Outcome { success: true, model: model.clone() }).await;
                    let observations = signature_observations(&gravgate_transform::stream::classify_response(&response));
                    self.adapter.register_response_signatures(&observations).await;
                    let built = build_openai_response(&chat_completion_id(), &model, now_ms() / 1000, &response);
                    let body_value = serde_json::to_value(&built).unwrap_or(Value::Null);
                    self.log_outcome(
                        ctx, &model, &credential.project_id, true, 200, None,
                        elapsed_ms(started), request_snapshot, body_value.clone(),
                    ).await;
                    return GatewayResponse::Json { status: 200, body: body_value };
                }
                Err(err) if self.should_retry(attempt, &err) => {
                    attempt += 1;
                    self.pool.record_outcome(&credential.project_id, Outcome { success: false, model: model.clone() }).await;
                    continue;
                }
                Err(err) => {
                    self.pool.record_outcome(&credential.project_id, Outcome { success: false, model: model.clone() }).await;
                    self.log_outcome(
                        ctx, &model, &credential.project_id, false, err.status_code(), Some(err.to_string()),
                        elapsed_ms(started), request_snapshot, Value::Null,
                    ).await;
                    return GatewayResponse::from_error(err);
                }
            }
        }
    }

    // ---- Anthropic dialect -------------------------------------------------

    pub async fn handle_anthropic_messages(
        &self,
        ctx: &RequestContext,
        forced_project_id: Option<&str>,
        body: anthropic::MessagesRequest,
    ) -> GatewayResponse {
        let started = Instant::now();
        let stream = body.stream.unwrap_or(false);
        let model = body.model.clone();
        let request_snapshot = serde_json::to_value(&body).unwrap_or(Value::Null);

        let mut attempt = 0u32;
        loop {
            let credential = match self.acquire(forced_project_id).await {
                Ok(view) => view,
                Err(err) => {
                    self.log_outcome(
                        ctx, &model, "", false, err.status_code(), Some(err.to_string()),
                        elapsed_ms(started), request_snapshot, Value::Null,
                    ).await;
                    return GatewayResponse::from_error(err);
                }
            };
            let upstream_request = self.adapter.from_anthropic_messages(&body, &credential).await;

            if stream {
                match self.upstream.generate_stream(&credential.access_token, &credential.project_id, &upstream_request).await {
                    Ok(byte_stream) => {
                        self.pool.record_outcome(&credential.project_id, Outcome { success: true, model: model.clone() }).await;
                        let sink = Box::new(AnthropicSink::new(message_id(), model.clone()));
                        return self.drive_stream(
                            ctx.snapshot(), model.clone(), credential.project_id.clone(), request_snapshot,
                            started, byte_stream, sink, "text/event-stream",
                        ).await;
                    }
                    Err(err) if self.should_retry(attempt, &err) => {
                        attempt += 1;
                        self.pool.record_outcome(&credential.project_id, Outcome { success: false, model: model.clone() }).await;
                        continue;
                    }
                    Err(err) => {
                        self.pool.record_outcome(&credential.project_id, Outcome { success: false, model: model.clone() }).await;
                        self.log_outcome(
                            ctx, &model, &credential.project_id, false, err.status_code(), Some(err.to_string()),
                            elapsed_ms(started), request_snapshot, Value::Null,
                        ).await;
                        return GatewayResponse::from_error(err);
                    }
                }
            }

            match self.upstream.generate(&credential.access_token, &credential.project_id, &upstream_request).await {
                Ok(response) => {
                    self.pool.record_outcome(&credential.project_id, Outcome { success: true, model: model.clone() }).await;
                    let observations = signature_observations(&gravgate_transform::stream::classify_response(&response));
                    self.adapter.register_response_signatures(&observations).await;
                    let built = build_anthropic_response(&message_id(), &model, &response);
                    let body_value = serde_json::to_value(&built).unwrap_or(Value::Null);
                    self.log_outcome(
                        ctx, &model, &credential.project_id, true, 200, None,
                        elapsed_ms(started), request_snapshot, body_value.clone(),
                    ).await;
                    return GatewayResponse::Json { status: 200, body: body_value };
                }
                Err(err) if self.should_retry(attempt, &err) => {
                    attempt += 1;
                    self.pool.record_outcome(&credential.project_id, Outcome { success: false, model: model.clone() }).await;
                    continue;
                }
                Err(err) => {
                    self.pool.record_outcome(&credential.project_id, Outcome { success: false, model: model.clone() }).await;
                    self.log_outcome(
                        ctx, &model, &credential.project_id, false, err.status_code(), Some(err.to_string()),
                        elapsed_ms(started), request_snapshot, Value::Null,
                    ).await;
                    return GatewayResponse::from_error(err);
                }
            }
        }
    }

    pub async fn handle_count_tokens(
        &self,
        ctx: &RequestContext,
        body: anthropic::MessagesRequest,
    ) -> GatewayResponse {
        let started = Instant::now();
        let model = body.model.clone();
        let request_snapshot = serde_json::to_value(&body).unwrap_or(Value::Null);
        let credential = match self.acquire(None).await {
            Ok(view) => view,
            Err(err) => {
                self.log_outcome(
                    ctx, &model, "", false, err.status_code(), Some(err.to_string()),
                    elapsed_ms(started), request_snapshot, Value::Null,
                ).await;
                return GatewayResponse::from_error(err);
            }
        };
        let upstream_request = self.adapter.from_anthropic_messages(&body, &credential).await;
        match self.upstream.count_tokens(&credential.access_token, &credential.project_id, &model, &upstream_request.body.contents).await {
            Ok(tokens) => {
                let body_value = json!({ "input_tokens": tokens });
                self.log_outcome(
                    ctx, &model, &credential.project_id, true, 200, None,
                    elapsed_ms(started), request_snapshot, body_value.clone(),
                ).await;
                GatewayResponse::Json { status: 200, body: body_value }
            }
            Err(err) => {
                self.log_outcome(
                    ctx, &model, &credential.project_id, false, err.status_code(), Some(err.to_string()),
                    elapsed_ms(started), request_snapshot, Value::Null,
                ).await;
                GatewayResponse::from_error(err)
            }
        }
    }

    // ---- Gemini dialect (non-stream only, per spec §6) ---------------------

    pub async fn handle_gemini_generate(
        &self,
        ctx: &RequestContext,
        model: &str,
        body: gemini::GenerateContentRequest,
    ) -> GatewayResponse {
        let started = Instant::now();
        let request_snapshot = serde_json::to_value(&body).unwrap_or(Value::Null);
        let credential = match self.acquire(None).await {
            Ok(view) => view,
            Err(err) => {
                self.log_outcome(
                    ctx, model, "", false, err.status_code(), Some(err.to_string()),
                    elapsed_ms(started), request_snapshot, Value::Null,
                ).await;
                return GatewayResponse::from_error(err);
            }
        };
        let upstream_request = self.adapter.from_gemini(&body, model, &credential).await;
        match self.upstream.generate(&credential.access_token, &credential.project_id, &upstream_request).await {
            Ok(response) => {
                self.pool.record_outcome(&credential.project_id, Outcome { success: true, model: model.to_string() }).await;
                let observations = signature_observations(&gravgate_transform::stream::classify_response(&response));
                self.adapter.register_response_signatures(&observations).await;
                let body_value = serde_json::to_value(&response).unwrap_or(Value::Null);
                self.log_outcome(
                    ctx, model, &credential.project_id, true, 200, None,
                    elapsed_ms(started), request_snapshot, body_value.clone(),
                ).await;
                GatewayResponse::Json { status: 200, body: body_value }
            }
            Err(err) => {
                self.pool.record_outcome(&credential.project_id, Outcome { success: false, model: model.to_string() }).await;
                self.log_outcome(
                    ctx, model, &credential.project_id, false, err.status_code(), Some(err.to_string()),
                    elapsed_ms(started), request_snapshot, Value::Null,
                ).await;
                GatewayResponse::from_error(err)
            }
        }
    }

    pub async fn handle_models_list(&self) -> GatewayResponse {
        let credential = match self.acquire(None).await {
            Ok(view) => view,
            Err(err) => return GatewayResponse::from_error(err),
        };
        match self.upstream.fetch_available_models(&credential.access_token, &credential.project_id).await {
            Ok(body) => GatewayResponse::Json { status: 200, body },
            Err(err) => GatewayResponse::from_error(err),
        }
    }

    /// Spawns the task that drives the upstream byte stream to completion,
    /// bridging it into an axum-compatible `Stream` via a channel. Side
    /// effects (signature registration, log append) run inside the spawned
    /// task after the stream ends, so a client disconnect (send failure)
    /// stops the upstream read without blocking the handler.
    async fn drive_stream(
        &self,
        ctx: RequestContextSnapshot,
        model: String,
        project_id: String,
        request_snapshot: Value,
        started: Instant,
        byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
        mut sink: Box<dyn DialectSink + Send>,
        content_type: &'static str,
    ) -> GatewayResponse {
        let (tx, rx) = mpsc::channel::<String>(64);
        let adapter = self.adapter.clone();
        let images = self.images.clone();
        let logs = self.logs.clone();

        tokio::spawn(async move {
            pin_mut!(byte_stream);
            let mut parser = SseParser::new();
            let mut collected = Vec::new();
            let mut image_buffer = Vec::new();
            let mut transport_error = None;
            let mut disconnected = false;

            'read: while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        transport_error = Some(err.to_string());
                        break 'read;
                    }
                };
                for event in parser.push_bytes(&bytes) {
                    let Some(parsed) = parse_sse_event(&event) else { break 'read };
                    for upstream_event in &parsed {
                        if let UpstreamEvent::Image { mime_type, data } = upstream_event {
                            image_buffer.push((mime_type.clone(), data.clone()));
                            continue;
                        }
                        if disconnected {
                            continue;
                        }
                        for line in sink.on_event(upstream_event) {
                            if tx.send(line).await.is_err() {
                                disconnected = true;
                                break;
                            }
                        }
                    }
                    collected.extend(parsed);
                }
                if disconnected {
                    break 'read;
                }
            }

            let success = transport_error.is_none();
            if !disconnected {
                let lines = match &transport_error {
                    Some(message) => sink.error(message),
                    None => {
                        let image_markdown = finalize_images(images.as_ref(), &image_buffer).await;
                        sink.finish(image_markdown)
                    }
                };
                for line in lines {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            }

            let observations = signature_observations(&collected);
            adapter.register_response_signatures(&observations).await;

            let response_snapshot = stream_log_snapshot(&collected);
            let mut request_detail = redact_headers(&ctx.headers);
            if let Some(object) = request_detail.as_object_mut() {
                object.insert("body".to_string(), request_snapshot);
            }
            let entry = LogEntry {
                id: 0,
                timestamp: now_ms(),
                model,
                project_id,
                success,
                status_code: if success { 200 } else { 502 },
                message: transport_error,
                duration_ms: elapsed_ms(started),
                method: ctx.method,
                path: ctx.path,
                detail: Some(LogDetail { request: request_detail, response: response_snapshot }),
            };
            if let Err(err) = logs.append(entry).await {
                tracing::error!(%err, "failed to append streamed log entry");
            }
        });

        let body_stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|line| (Ok::<_, std::io::Error>(Bytes::from(line)), rx))
        });

        GatewayResponse::Stream { status: 200, content_type, body: Box::pin(body_stream) }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn chat_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

fn message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

/// A lightweight owned copy of [`RequestContext`] so the streaming task can
/// outlive the borrow the handler holds.
pub struct RequestContextSnapshot {
    method: &'static str,
    path: String,
    headers: Vec<(String, String)>,
}

impl RequestContext {
    fn snapshot(&self) -> RequestContextSnapshot {
        RequestContextSnapshot { method: self.method, path: self.path.clone(), headers: self.headers.clone() }
    }
}

fn stream_log_snapshot(events: &[UpstreamEvent]) -> Value {
    let mut raw = Vec::new();
    for event in events {
        let value = match event {
            UpstreamEvent::Text { text, .. } => Some(json!({ "content": text })),
            UpstreamEvent::Thinking(text) => Some(json!({ "thinking": text })),
            UpstreamEvent::ToolCall { name, arguments, .. } => {
                Some(json!({ "tool_calls": [{ "name": name, "arguments": arguments }] }))
            }
            _ => None,
        };
        if let Some(value) = value {
            raw.push(value);
        }
    }
    serde_json::to_value(gravgate_storage::summarize_stream_events(&raw)).unwrap_or(Value::Null)
}

/// Unifies [`OpenAiStreamState`] and the Anthropic dialect under one
/// SSE-line-producing interface so [`RequestOrchestrator::drive_stream`]
/// does not need to branch on dialect.
trait DialectSink {
    fn on_event(&mut self, event: &UpstreamEvent) -> Vec<String>;
    fn finish(&mut self, image_markdown: Option<String>) -> Vec<String>;
    fn error(&mut self, message: &str) -> Vec<String>;
}

impl DialectSink for OpenAiStreamState {
    fn on_event(&mut self, event: &UpstreamEvent) -> Vec<String> {
        OpenAiStreamState::on_event(self, event)
    }
    fn finish(&mut self, image_markdown: Option<String>) -> Vec<String> {
        OpenAiStreamState::finish(self, image_markdown)
    }
    fn error(&mut self, message: &str) -> Vec<String> {
        OpenAiStreamState::error(self, message)
    }
}

struct AnthropicSink {
    state: AnthropicStreamState,
    text_chars: usize,
}

impl AnthropicSink {
    fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self { state: AnthropicStreamState::new(id, model, 0), text_chars: 0 }
    }
}

impl DialectSink for AnthropicSink {
    fn on_event(&mut self, event: &UpstreamEvent) -> Vec<String> {
        if let UpstreamEvent::Text { text, .. } = event {
            self.text_chars += text.chars().count();
        }
        self.state.on_event(event).iter().map(render_anthropic_event).collect()
    }

    fn finish(&mut self, image_markdown: Option<String>) -> Vec<String> {
        let output_tokens = (self.text_chars as u64).div_ceil(4);
        self.state.finish(output_tokens, image_markdown).iter().map(render_anthropic_event).collect()
    }

    fn error(&mut self, message: &str) -> Vec<String> {
        self.state.error(message).iter().map(render_anthropic_event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_sink_tracks_output_token_estimate_from_text_events() {
        let mut sink = AnthropicSink::new("msg_1", "claude-3-5-sonnet");
        sink.on_event(&UpstreamEvent::Text { text: "abcdefgh".to_string(), thought_signature: None });
        assert_eq!(sink.text_chars, 8);
        let lines = sink.finish(None);
        assert!(lines.iter().any(|line| line.contains("message_stop")));
    }
}
