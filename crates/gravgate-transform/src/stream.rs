//! Upstream SSE consumption and per-dialect re-emission: classifies each
//! upstream event as text/thinking/tool_calls/image/terminal, then hands it
//! to the state machine for whichever dialect the client is speaking.
//! Non-stream response building reuses the same classification so the two
//! paths never drift apart.

use base64::Engine;
use serde_json::Value;

use gravgate_protocol::sse::SseEvent;
use gravgate_protocol::{anthropic, gemini, openai};

use crate::adapter::SignatureObservation;
use crate::image::ImageSink;

/// One classified event out of an upstream `GenerateContentResponse`.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Text {
        text: String,
        thought_signature: Option<String>,
    },
    Thinking(String),
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
        thought_signature: Option<String>,
    },
    Image {
        mime_type: String,
        data: String,
    },
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    Terminal {
        finish_reason: Option<String>,
    },
}

/// Parses one upstream SSE event's JSON `data` payload. Returns `None` for
/// the upstream's own `[DONE]` sentinel, if it sends one.
pub fn parse_sse_event(event: &SseEvent) -> Option<Vec<UpstreamEvent>> {
    if event.data.trim() == "[DONE]" {
        return None;
    }
    serde_json::from_str::<gemini::GenerateContentResponse>(&event.data)
        .ok()
        .map(|response| classify_response(&response))
}

pub fn classify_response(response: &gemini::GenerateContentResponse) -> Vec<UpstreamEvent> {
    let mut events = Vec::new();
    if let Some(candidate) = response.candidates.first() {
        for part in &candidate.content.parts {
            if let Some(call) = &part.function_call {
                events.push(UpstreamEvent::ToolCall {
                    id: call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                    name: call.name.clone(),
                    arguments: call.args.clone(),
                    thought_signature: part.thought_signature.clone(),
                });
            } else if let Some(text) = &part.text {
                if part.thought == Some(true) {
                    events.push(UpstreamEvent::Thinking(text.clone()));
                } else {
                    events.push(UpstreamEvent::Text {
                        text: text.clone(),
                        thought_signature: part.thought_signature.clone(),
                    });
                }
            } else if let Some(blob) = &part.inline_data {
                events.push(UpstreamEvent::Image {
                    mime_type: blob.mime_type.clone(),
                    data: blob.data.clone(),
                });
            }
        }
        if candidate.finish_reason.is_some() {
            events.push(UpstreamEvent::Terminal {
                finish_reason: candidate.finish_reason.clone(),
            });
        }
    }
    if let Some(usage) = &response.usage_metadata {
        events.push(UpstreamEvent::Usage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
        });
    }
    events
}

/// Feeds the thought-signature maps from one completed event stream,
/// matching the Adapter's `RegisterResponseSignatures` contract.
pub fn signature_observations(events: &[UpstreamEvent]) -> Vec<SignatureObservation> {
    events
        .iter()
        .filter_map(|event| match event {
            UpstreamEvent::Text {
                text,
                thought_signature: Some(signature),
            } => Some(SignatureObservation::Text {
                text: text.clone(),
                signature: signature.clone(),
            }),
            UpstreamEvent::ToolCall {
                id,
                thought_signature: Some(signature),
                ..
            } => Some(SignatureObservation::ToolCall {
                id: id.clone(),
                signature: signature.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

/// Buffers images collected over a stream, decodes and saves each through
/// `sink`, and joins the resulting URLs into a single markdown block.
pub async fn finalize_images(sink: &dyn ImageSink, images: &[(String, String)]) -> Option<String> {
    if images.is_empty() {
        return None;
    }
    let mut links = Vec::new();
    for (mime_type, data) in images {
        match base64::engine::general_purpose::STANDARD.decode(data) {
            Ok(bytes) => match sink.save_image(&bytes, mime_type).await {
                Ok(url) => links.push(format!("![image]({url})")),
                Err(err) => tracing::warn!(%err, "failed to save streamed image"),
            },
            Err(err) => tracing::warn!(%err, "invalid base64 image payload in stream"),
        }
    }
    if links.is_empty() {
        None
    } else {
        Some(links.join("\n"))
    }
}

/// Splits upstream text on `<思考>...</思考>` markers, returning
/// `(is_thinking, segment)` pairs in order so each segment can be routed to
/// `content` or `reasoning_content`.
fn split_thinking_markers(text: &str) -> Vec<(bool, String)> {
    const OPEN: &str = "<思考>";
    const CLOSE: &str = "</思考>";
    let mut segments = Vec::new();
    let mut rest = text;
    loop {
        match rest.find(OPEN) {
            Some(start) => {
                if start > 0 {
                    segments.push((false, rest[..start].to_string()));
                }
                let after = &rest[start + OPEN.len()..];
                match after.find(CLOSE) {
                    Some(end) => {
                        segments.push((true, after[..end].to_string()));
                        rest = &after[end + CLOSE.len()..];
                    }
                    None => {
                        segments.push((true, after.to_string()));
                        return segments;
                    }
                }
            }
            None => {
                if !rest.is_empty() {
                    segments.push((false, rest.to_string()));
                }
                return segments;
            }
        }
    }
}

/// OpenAI `chat.completion.chunk` emission state for one stream.
pub struct OpenAiStreamState {
    id: String,
    model: String,
    created: i64,
    tool_call_index: u32,
    saw_tool_call: bool,
}

impl OpenAiStreamState {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            tool_call_index: 0,
            saw_tool_call: false,
        }
    }

    /// Re-emits one classified upstream event as zero or more SSE lines.
    pub fn on_event(&mut self, event: &UpstreamEvent) -> Vec<String> {
        match event {
            UpstreamEvent::Text { text, .. } => self.emit_text(text),
            UpstreamEvent::Thinking(text) => vec![self.chunk(
                openai::ChunkDelta {
                    reasoning_content: Some(text.clone()),
                    ..Default::default()
                },
                None,
            )],
            UpstreamEvent::ToolCall { id, name, arguments, .. } => {
                let index = self.tool_call_index;
                self.tool_call_index += 1;
                self.saw_tool_call = true;
                vec![self.chunk(
                    openai::ChunkDelta {
                        tool_calls: Some(vec![openai::ToolCallDelta {
                            index,
                            id: Some(id.clone()),
                            kind: Some("function".to_string()),
                            function: Some(openai::FunctionCallDelta {
                                name: Some(name.clone()),
                                arguments: Some(arguments.to_string()),
                            }),
                        }]),
                        ..Default::default()
                    },
                    None,
                )]
            }
            UpstreamEvent::Image { .. } | UpstreamEvent::Usage { .. } | UpstreamEvent::Terminal { .. } => Vec::new(),
        }
    }

    fn emit_text(&mut self, text: &str) -> Vec<String> {
        split_thinking_markers(text)
            .into_iter()
            .filter(|(_, segment)| !segment.is_empty())
            .map(|(is_thinking, segment)| {
                let delta = if is_thinking {
                    openai::ChunkDelta {
                        reasoning_content: Some(segment),
                        ..Default::default()
                    }
                } else {
                    openai::ChunkDelta {
                        content: Some(segment),
                        ..Default::default()
                    }
                };
                self.chunk(delta, None)
            })
            .collect()
    }

    fn chunk(&self, delta: openai::ChunkDelta, finish_reason: Option<String>) -> String {
        let chunk = openai::ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![openai::ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        };
        format!("data: {}\n\n", serde_json::to_string(&chunk).expect("chunk always serializes"))
    }

    /// Terminal sequence: an optional buffered-image chunk, the
    /// finish-reason chunk, then `data: [DONE]`.
    pub fn finish(&mut self, image_markdown: Option<String>) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(markdown) = image_markdown {
            lines.push(self.chunk(
                openai::ChunkDelta {
                    content: Some(markdown),
                    ..Default::default()
                },
                None,
            ));
        }
        let finish_reason = if self.saw_tool_call { "tool_calls" } else { "stop" };
        lines.push(self.chunk(openai::ChunkDelta::default(), Some(finish_reason.to_string())));
        lines.push("data: [DONE]\n\n".to_string());
        lines
    }

    /// A mid-stream upstream error, re-emitted as content rather than a
    /// status change since headers are already committed.
    pub fn error(&mut self, message: &str) -> Vec<String> {
        let mut lines = self.emit_text(&format!("错误: {message}"));
        lines.push(self.chunk(openai::ChunkDelta::default(), Some("stop".to_string())));
        lines.push("data: [DONE]\n\n".to_string());
        lines
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Thinking,
    Text,
}

/// Anthropic `message_start` / `content_block_*` / `message_delta` /
/// `message_stop` emission state for one stream.
pub struct AnthropicStreamState {
    id: String,
    model: String,
    started: bool,
    next_index: u32,
    open_block: Option<(u32, BlockKind)>,
    saw_tool_call: bool,
    input_tokens_estimate: u64,
}

impl AnthropicStreamState {
    pub fn new(id: impl Into<String>, model: impl Into<String>, input_tokens_estimate: u64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            started: false,
            next_index: 0,
            open_block: None,
            saw_tool_call: false,
            input_tokens_estimate,
        }
    }

    pub fn on_event(&mut self, event: &UpstreamEvent) -> Vec<anthropic::StreamEvent> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        match event {
            UpstreamEvent::Thinking(text) => {
                self.emit_delta(&mut out, BlockKind::Thinking, anthropic::ContentDelta::ThinkingDelta { thinking: text.clone() });
            }
            UpstreamEvent::Text { text, .. } => {
                self.emit_delta(&mut out, BlockKind::Text, anthropic::ContentDelta::TextDelta { text: text.clone() });
            }
            UpstreamEvent::ToolCall { id, name, arguments, .. } => {
                self.saw_tool_call = true;
                self.close_open_block(&mut out);
                let index = self.next_index;
                self.next_index += 1;
                out.push(anthropic::StreamEvent::ContentBlockStart {
                    index,
                    content_block: anthropic::ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: Value::Object(Default::default()),
                    },
                });
                out.push(anthropic::StreamEvent::ContentBlockDelta {
                    index,
                    delta: anthropic::ContentDelta::InputJsonDelta {
                        partial_json: arguments.to_string(),
                    },
                });
                out.push(anthropic::StreamEvent::ContentBlockStop { index });
            }
            UpstreamEvent::Image { .. } | UpstreamEvent::Usage { .. } | UpstreamEvent::Terminal { .. } => {}
        }
        out
    }

    fn ensure_started(&mut self, out: &mut Vec<anthropic::StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(anthropic::StreamEvent::MessageStart {
            message: anthropic::MessagesResponse {
                id: self.id.clone(),
                kind: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                usage: anthropic::AnthropicUsage {
                    input_tokens: self.input_tokens_estimate,
                    output_tokens: 0,
                },
            },
        });
    }

    fn close_open_block(&mut self, out: &mut Vec<anthropic::StreamEvent>) {
        if let Some((index, _)) = self.open_block.take() {
            out.push(anthropic::StreamEvent::ContentBlockStop { index });
        }
    }

    fn emit_delta(&mut self, out: &mut Vec<anthropic::StreamEvent>, kind: BlockKind, delta: anthropic::ContentDelta) {
        let same_open = matches!(self.open_block, Some((_, open_kind)) if open_kind == kind);
        if !same_open {
            self.close_open_block(out);
            let index = self.next_index;
            self.next_index += 1;
            let block = match kind {
                BlockKind::Thinking => anthropic::ContentBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
                BlockKind::Text => anthropic::ContentBlock::Text { text: String::new() },
            };
            out.push(anthropic::StreamEvent::ContentBlockStart {
                index,
                content_block: block,
            });
            self.open_block = Some((index, kind));
        }
        let index = self.open_block.expect("just opened above").0;
        out.push(anthropic::StreamEvent::ContentBlockDelta { index, delta });
    }

    pub fn finish(&mut self, output_tokens_estimate: u64, image_markdown: Option<String>) -> Vec<anthropic::StreamEvent> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        if let Some(markdown) = image_markdown {
            self.emit_delta(&mut out, BlockKind::Text, anthropic::ContentDelta::TextDelta { text: markdown });
        }
        self.close_open_block(&mut out);
        let stop_reason = if self.saw_tool_call { "tool_use" } else { "end_turn" };
        out.push(anthropic::StreamEvent::MessageDelta {
            delta: anthropic::MessageDeltaPayload {
                stop_reason: Some(stop_reason.to_string()),
            },
            usage: anthropic::AnthropicUsage {
                input_tokens: self.input_tokens_estimate,
                output_tokens: output_tokens_estimate,
            },
        });
        out.push(anthropic::StreamEvent::MessageStop);
        out
    }

    pub fn error(&mut self, message: &str) -> Vec<anthropic::StreamEvent> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.emit_delta(&mut out, BlockKind::Text, anthropic::ContentDelta::TextDelta {
            text: format!("错误: {message}"),
        });
        self.close_open_block(&mut out);
        out.push(anthropic::StreamEvent::MessageDelta {
            delta: anthropic::MessageDeltaPayload {
                stop_reason: Some("end_turn".to_string()),
            },
            usage: anthropic::AnthropicUsage {
                input_tokens: self.input_tokens_estimate,
                output_tokens: 0,
            },
        });
        out.push(anthropic::StreamEvent::MessageStop);
        out
    }
}

/// Renders one Anthropic stream event as its `event: .../data: ...` SSE
/// framing.
pub fn render_anthropic_event(event: &anthropic::StreamEvent) -> String {
    let name = match event {
        anthropic::StreamEvent::MessageStart { .. } => "message_start",
        anthropic::StreamEvent::ContentBlockStart { .. } => "content_block_start",
        anthropic::StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
        anthropic::StreamEvent::ContentBlockStop { .. } => "content_block_stop",
        anthropic::StreamEvent::MessageDelta { .. } => "message_delta",
        anthropic::StreamEvent::MessageStop => "message_stop",
        anthropic::StreamEvent::Ping => "ping",
    };
    format!(
        "event: {name}\ndata: {}\n\n",
        serde_json::to_string(event).expect("stream event always serializes")
    )
}

/// Builds the non-stream OpenAI response from a buffered upstream reply,
/// reusing the same classification the streaming path uses.
pub fn build_openai_response(
    id: &str,
    model: &str,
    created: i64,
    response: &gemini::GenerateContentResponse,
) -> openai::ChatCompletionResponse {
    let events = classify_response(response);
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    let mut saw_tool_call = false;
    for event in &events {
        match event {
            UpstreamEvent::Text { text, .. } => content.push_str(text),
            UpstreamEvent::ToolCall { id, name, arguments, .. } => {
                saw_tool_call = true;
                tool_calls.push(openai::ToolCall {
                    id: id.clone(),
                    kind: "function".to_string(),
                    function: openai::FunctionCall {
                        name: name.clone(),
                        arguments: arguments.to_string(),
                    },
                });
            }
            _ => {}
        }
    }
    let finish_reason = if saw_tool_call { "tool_calls" } else { "stop" };
    let usage = response.usage_metadata.as_ref().map(|usage| openai::Usage {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
        total_tokens: usage.total_token_count,
    });
    openai::ChatCompletionResponse {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![openai::Choice {
            index: 0,
            message: openai::ChatMessage {
                role: "assistant".to_string(),
                content: if content.is_empty() {
                    None
                } else {
                    Some(openai::MessageContent::Text(content))
                },
                name: None,
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                tool_call_id: None,
            },
            finish_reason: Some(finish_reason.to_string()),
        }],
        usage,
    }
}

/// Builds the non-stream Anthropic response, mirroring
/// [`build_openai_response`] for that dialect.
pub fn build_anthropic_response(id: &str, model: &str, response: &gemini::GenerateContentResponse) -> anthropic::MessagesResponse {
    let events = classify_response(response);
    let mut blocks = Vec::new();
    let mut saw_tool_call = false;
    let mut text_chars = 0usize;
    for event in &events {
        match event {
            UpstreamEvent::Thinking(text) => blocks.push(anthropic::ContentBlock::Thinking {
                thinking: text.clone(),
                signature: None,
            }),
            UpstreamEvent::Text { text, .. } => {
                text_chars += text.chars().count();
                blocks.push(anthropic::ContentBlock::Text { text: text.clone() });
            }
            UpstreamEvent::ToolCall { id, name, arguments, .. } => {
                saw_tool_call = true;
                blocks.push(anthropic::ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: arguments.clone(),
                });
            }
            _ => {}
        }
    }
    let (input_tokens, output_tokens) = match &response.usage_metadata {
        Some(usage) => (usage.prompt_token_count, usage.candidates_token_count),
        None => (0, (text_chars as u64).div_ceil(4)),
    };
    anthropic::MessagesResponse {
        id: id.to_string(),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content: blocks,
        stop_reason: Some(if saw_tool_call { "tool_use" } else { "end_turn" }.to_string()),
        usage: anthropic::AnthropicUsage { input_tokens, output_tokens },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_events() -> Vec<UpstreamEvent> {
        vec![
            UpstreamEvent::Thinking("A".to_string()),
            UpstreamEvent::Text {
                text: "B".to_string(),
                thought_signature: None,
            },
            UpstreamEvent::ToolCall {
                id: "call-1".to_string(),
                name: "lookup".to_string(),
                arguments: serde_json::json!({"q": "x"}),
                thought_signature: None,
            },
        ]
    }

    #[test]
    fn openai_dialect_parity_matches_event_sequence() {
        let mut state = OpenAiStreamState::new("id-1", "gemini-2.5-flash", 0);
        let mut chunks = Vec::new();
        for event in sample_events() {
            chunks.extend(state.on_event(&event));
        }
        chunks.extend(state.finish(None));

        assert!(chunks[0].contains("\"reasoning_content\":\"A\""));
        assert!(chunks[1].contains("\"content\":\"B\""));
        assert!(chunks[2].contains("\"tool_calls\""));
        assert!(chunks[2].contains("\"index\":0"));
        assert!(chunks[3].contains("\"finish_reason\":\"tool_calls\""));
        assert_eq!(chunks.last().unwrap(), "data: [DONE]\n\n");
    }

    #[test]
    fn anthropic_dialect_parity_matches_event_sequence() {
        let mut state = AnthropicStreamState::new("id-1", "claude-3-5-sonnet", 10);
        let mut events = Vec::new();
        for upstream_event in sample_events() {
            events.extend(state.on_event(&upstream_event));
        }
        events.extend(state.finish(5, None));

        assert!(matches!(events[0], anthropic::StreamEvent::MessageStart { .. }));
        assert!(matches!(
            events[1],
            anthropic::StreamEvent::ContentBlockStart {
                content_block: anthropic::ContentBlock::Thinking { .. },
                ..
            }
        ));
        let has_tool_use_start = events.iter().any(|event| matches!(
            event,
            anthropic::StreamEvent::ContentBlockStart {
                content_block: anthropic::ContentBlock::ToolUse { .. },
                ..
            }
        ));
        assert!(has_tool_use_start);
        assert!(matches!(events.last(), Some(anthropic::StreamEvent::MessageStop)));
        let stop_reason = events.iter().find_map(|event| match event {
            anthropic::StreamEvent::MessageDelta { delta, .. } => delta.stop_reason.clone(),
            _ => None,
        });
        assert_eq!(stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn splits_thinking_markers_out_of_plain_text() {
        let segments = split_thinking_markers("before<思考>inner</思考>after");
        assert_eq!(segments, vec![
            (false, "before".to_string()),
            (true, "inner".to_string()),
            (false, "after".to_string()),
        ]);
    }

    #[test]
    fn estimates_tokens_by_four_chars_per_token() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn builds_non_stream_openai_response_for_plain_text() {
        let response = gemini::GenerateContentResponse {
            candidates: vec![gemini::Candidate {
                content: gemini::Content {
                    role: Some(gemini::ContentRole::Model),
                    parts: vec![gemini::Part::text("pong")],
                },
                finish_reason: Some("STOP".to_string()),
            }],
            usage_metadata: None,
        };
        let built = build_openai_response("id-1", "gemini-2.5-flash", 0, &response);
        assert_eq!(built.choices[0].finish_reason.as_deref(), Some("stop"));
        match &built.choices[0].message.content {
            Some(openai::MessageContent::Text(text)) => assert_eq!(text, "pong"),
            other => panic!("expected text content, got {other:?}"),
        }
    }
}
