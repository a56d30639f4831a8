//! Three client-facing dialects (OpenAI chat completions, Anthropic
//! messages, Gemini generateContent) translated into the single upstream
//! "Antigravity" (Gemini-shaped) request, plus the thought-signature
//! continuity protocol chain-of-thought-capable upstream models require.

use serde_json::Value;

use gravgate_credential::CredentialView;
use gravgate_protocol::{anthropic, gemini, openai};

use crate::thought_signature::ThoughtSignatureMap;

const STOP_SEQUENCES: &[&str] = &[
    "<|user|>",
    "<|bot|>",
    "<|context_request|>",
    "<|endoftext|>",
    "<|end_of_turn|>",
];

/// Models that get thinking enabled despite matching none of the
/// name-shape rules below. Small and explicit, the way the spec's "small
/// allowlist" phrasing implies — extend here if the upstream adds more.
const THINKING_MODEL_ALLOWLIST: &[&str] = &["gemini-2.0-flash-thinking-exp"];

const DEFAULT_TEMPERATURE: f64 = 1.0;
const DEFAULT_TOP_P: f64 = 0.95;
const DEFAULT_TOP_K: u32 = 40;
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 65536;
const THINKING_BUDGET_ENABLED: i32 = 1024;

const IMAGE_STEERING_NOTE: &str =
    "When generating an image, also include a short text description of what was produced.";

/// The one internal representation all three dialects translate into: the
/// model name plus a Gemini-shaped request body ready for the upstream
/// envelope (project id and session routing are the orchestrator's job).
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub model: String,
    pub body: gemini::GenerateContentRequest,
}

/// One observed thought-signature, fed back by the Streaming Engine after a
/// terminal event stream so later turns in the same conversation can echo
/// it.
#[derive(Debug, Clone)]
pub enum SignatureObservation {
    ToolCall { id: String, signature: String },
    Text { text: String, signature: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Native,
    AnthropicHop,
}

/// Holds the process-wide thought-signature maps and exposes the three
/// dialect entry points plus signature registration. One instance is shared
/// for the life of the process; it has no other state.
#[derive(Default)]
pub struct RequestAdapter {
    signatures: ThoughtSignatureMap,
}

impl RequestAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_openai_chat(
        &self,
        body: &openai::ChatCompletionRequest,
        _token: &CredentialView,
    ) -> UpstreamRequest {
        self.build_from_openai(body, Origin::Native).await
    }

    /// Performs the documented dialect hop: Anthropic messages are first
    /// mapped into an OpenAI-shape request, then run through the same
    /// message-translation rules as `from_openai_chat`.
    pub async fn from_anthropic_messages(
        &self,
        body: &anthropic::MessagesRequest,
        token: &CredentialView,
    ) -> UpstreamRequest {
        let hopped = map_claude_to_openai(body);
        let _ = token;
        self.build_from_openai(&hopped, Origin::AnthropicHop).await
    }

    pub async fn from_gemini(
        &self,
        body: &gemini::GenerateContentRequest,
        model: &str,
        _token: &CredentialView,
    ) -> UpstreamRequest {
        let mut body = body.clone();

        if let Some(tools) = body.tools.as_mut() {
            for tool in tools.iter_mut() {
                if let Some(declarations) = tool.function_declarations.as_mut() {
                    for declaration in declarations.iter_mut() {
                        if let Some(parameters) = declaration.parameters.as_mut() {
                            crate::schema::clean_schema(parameters);
                        }
                    }
                }
            }
        }

        let mut generation_config = body.generation_config.take().unwrap_or_default();
        if generation_config.stop_sequences.is_none() {
            generation_config.stop_sequences = Some(stop_sequences());
        }
        let thinking = thinking_enabled(model);
        if generation_config.thinking_config.is_none() {
            generation_config.thinking_config = Some(gemini::ThinkingConfig {
                thinking_budget: thinking_budget(thinking),
                include_thoughts: Some(thinking),
            });
        }
        if is_image_generation_model(model) {
            if generation_config.response_modalities.is_none() {
                generation_config.response_modalities = Some(image_modalities());
            }
            body.system_instruction = Some(append_steering_note(body.system_instruction.take()));
        }
        body.generation_config = Some(generation_config);

        UpstreamRequest {
            model: model.to_string(),
            body,
        }
    }

    pub async fn register_response_signatures(&self, observations: &[SignatureObservation]) {
        for observation in observations {
            match observation {
                SignatureObservation::ToolCall { id, signature } => {
                    self.signatures.record_tool_call(id, signature).await;
                }
                SignatureObservation::Text { text, signature } => {
                    self.signatures.record_text(text, signature).await;
                }
            }
        }
    }

    async fn build_from_openai(
        &self,
        body: &openai::ChatCompletionRequest,
        origin: Origin,
    ) -> UpstreamRequest {
        let model = body.model.clone();
        let is_claude_family = origin == Origin::AnthropicHop;
        let mut system_texts = Vec::new();
        let mut contents: Vec<gemini::Content> = Vec::new();
        let mut saw_tool_calls_in_history = false;

        for message in &body.messages {
            match message.role.as_str() {
                "system" => {
                    let text = message.tool_result_text();
                    if !text.is_empty() {
                        system_texts.push(text);
                    }
                }
                "user" => {
                    let parts = user_parts(message);
                    if !parts.is_empty() {
                        contents.push(gemini::Content {
                            role: Some(gemini::ContentRole::User),
                            parts,
                        });
                    }
                }
                "assistant" => {
                    if message
                        .tool_calls
                        .as_ref()
                        .is_some_and(|calls| !calls.is_empty())
                    {
                        saw_tool_calls_in_history = true;
                    }
                    self.push_assistant_turn(&mut contents, message, &model, is_claude_family)
                        .await;
                }
                "tool" => {
                    let name = find_function_name_for_call(&contents, message.tool_call_id.as_deref())
                        .or_else(|| message.tool_call_id.clone())
                        .unwrap_or_else(|| "unknown".to_string());
                    let part = gemini::Part::function_response(gemini::FunctionResponse {
                        name,
                        response: Value::String(message.tool_result_text()),
                        id: message.tool_call_id.clone(),
                    });
                    push_tool_turn(&mut contents, part);
                }
                _ => {
                    let text = message.tool_result_text();
                    if !text.is_empty() {
                        contents.push(gemini::Content {
                            role: Some(gemini::ContentRole::User),
                            parts: vec![gemini::Part::text(text)],
                        });
                    }
                }
            }
        }

        if is_image_generation_model(&model) {
            system_texts.push(IMAGE_STEERING_NOTE.to_string());
        }
        let system_instruction = if system_texts.is_empty() {
            None
        } else {
            Some(gemini::Content {
                role: None,
                parts: vec![gemini::Part::text(system_texts.join("\n\n"))],
            })
        };

        let tools = body
            .tools
            .as_deref()
            .and_then(crate::schema::map_openai_tools)
            .map(|tool| vec![tool]);

        let thinking_forced_off = is_claude_family && saw_tool_calls_in_history;
        let generation_config = self.build_generation_config(body, &model, thinking_forced_off);

        let upstream_body = gemini::GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: Some(generation_config),
            tools,
            tool_config: None,
            extra: serde_json::Map::new(),
        };

        UpstreamRequest {
            model,
            body: upstream_body,
        }
    }

    /// Builds a `model` turn from one `assistant` message. Function-call
    /// parts get their thought signature by tool-call id; the text part
    /// gets it by normalized-text lookup when the model is gemini-3-class.
    /// A gemini-3 text part with no recorded signature is omitted rather
    /// than sent unsigned. When the new turn carries only tool-calls and
    /// the previous turn was itself a tool-calls-only `model` turn, the new
    /// parts are appended there instead of starting a fresh turn.
    async fn push_assistant_turn(
        &self,
        contents: &mut Vec<gemini::Content>,
        message: &openai::ChatMessage,
        model: &str,
        is_claude_family: bool,
    ) {
        let mut tool_parts = Vec::new();
        if let Some(tool_calls) = &message.tool_calls {
            for call in tool_calls {
                let args: Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
                let mut part = gemini::Part::function_call(gemini::FunctionCall {
                    name: call.function.name.clone(),
                    args,
                    id: Some(call.id.clone()),
                });
                if !is_claude_family {
                    part.thought_signature = self.signatures.lookup_tool_call(&call.id).await;
                }
                tool_parts.push(part);
            }
        }

        let raw_text = message.tool_result_text();
        let text_part = if raw_text.is_empty() {
            None
        } else if !is_claude_family && is_gemini3_class(model) {
            match self.signatures.lookup_text(&raw_text).await {
                Some(signature) => {
                    let mut part = gemini::Part::text(raw_text);
                    part.thought_signature = Some(signature);
                    Some(part)
                }
                None => {
                    tracing::warn!(model, "dropping unsigned gemini-3 assistant text");
                    None
                }
            }
        } else {
            Some(gemini::Part::text(raw_text))
        };

        if text_part.is_none() && !tool_parts.is_empty() {
            if let Some(last) = contents.last_mut() {
                if last.role == Some(gemini::ContentRole::Model)
                    && all_parts_are_function_calls(&last.parts)
                {
                    last.parts.extend(tool_parts);
                    return;
                }
            }
        }

        let mut parts = tool_parts;
        if let Some(part) = text_part {
            parts.push(part);
        }
        if !parts.is_empty() {
            contents.push(gemini::Content {
                role: Some(gemini::ContentRole::Model),
                parts,
            });
        }
    }

    fn build_generation_config(
        &self,
        body: &openai::ChatCompletionRequest,
        model: &str,
        thinking_forced_off: bool,
    ) -> gemini::GenerationConfig {
        let thinking = thinking_enabled(model) && !thinking_forced_off;
        gemini::GenerationConfig {
            temperature: Some(body.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
            top_p: Some(body.top_p.unwrap_or(DEFAULT_TOP_P)),
            top_k: Some(DEFAULT_TOP_K),
            max_output_tokens: Some(
                body.max_completion_tokens
                    .or(body.max_tokens)
                    .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
            ),
            stop_sequences: Some(stop_sequences()),
            thinking_config: Some(gemini::ThinkingConfig {
                thinking_budget: thinking_budget(thinking),
                include_thoughts: Some(thinking),
            }),
            response_modalities: if is_image_generation_model(model) {
                Some(image_modalities())
            } else {
                None
            },
        }
    }
}

fn stop_sequences() -> Vec<String> {
    STOP_SEQUENCES.iter().map(|s| s.to_string()).collect()
}

fn image_modalities() -> Vec<String> {
    vec!["TEXT".to_string(), "IMAGE".to_string()]
}

fn thinking_budget(enabled: bool) -> i32 {
    if enabled {
        THINKING_BUDGET_ENABLED
    } else {
        0
    }
}

fn is_gemini3_class(model: &str) -> bool {
    model.contains("gemini-3")
}

fn is_image_generation_model(model: &str) -> bool {
    model.contains("image")
}

fn thinking_enabled(model: &str) -> bool {
    model.ends_with("-thinking")
        || model == "gemini-2.5-pro"
        || model.starts_with("gemini-3-pro-")
        || THINKING_MODEL_ALLOWLIST.contains(&model)
}

fn append_steering_note(existing: Option<gemini::Content>) -> gemini::Content {
    let mut content = existing.unwrap_or(gemini::Content {
        role: None,
        parts: Vec::new(),
    });
    content.parts.push(gemini::Part::text(IMAGE_STEERING_NOTE));
    content
}

fn all_parts_are_function_calls(parts: &[gemini::Part]) -> bool {
    !parts.is_empty() && parts.iter().all(|part| part.function_call.is_some())
}

fn all_parts_are_function_responses(parts: &[gemini::Part]) -> bool {
    !parts.is_empty() && parts.iter().all(|part| part.function_response.is_some())
}

fn push_tool_turn(contents: &mut Vec<gemini::Content>, part: gemini::Part) {
    if let Some(last) = contents.last_mut() {
        if last.role == Some(gemini::ContentRole::User) && all_parts_are_function_responses(&last.parts) {
            last.parts.push(part);
            return;
        }
    }
    contents.push(gemini::Content {
        role: Some(gemini::ContentRole::User),
        parts: vec![part],
    });
}

fn find_function_name_for_call(contents: &[gemini::Content], tool_call_id: Option<&str>) -> Option<String> {
    let tool_call_id = tool_call_id?;
    contents
        .iter()
        .rev()
        .filter(|content| content.role == Some(gemini::ContentRole::Model))
        .flat_map(|content| content.parts.iter())
        .find_map(|part| {
            part.function_call
                .as_ref()
                .filter(|call| call.id.as_deref() == Some(tool_call_id))
                .map(|call| call.name.clone())
        })
}

fn user_parts(message: &openai::ChatMessage) -> Vec<gemini::Part> {
    match &message.content {
        Some(openai::MessageContent::Text(text)) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![gemini::Part::text(text.clone())]
            }
        }
        Some(openai::MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                openai::ContentPart::Text { text } => Some(gemini::Part::text(text.clone())),
                openai::ContentPart::ImageUrl { image_url } => decode_data_uri_image(&image_url.url),
                openai::ContentPart::Other => None,
            })
            .collect(),
        Some(openai::MessageContent::Raw(value)) => value
            .as_str()
            .filter(|text| !text.is_empty())
            .map(|text| vec![gemini::Part::text(text)])
            .unwrap_or_default(),
        None => Vec::new(),
    }
}

fn decode_data_uri_image(url: &str) -> Option<gemini::Part> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime_type = meta
        .split(';')
        .next()
        .filter(|m| !m.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();
    Some(gemini::Part::inline_data(gemini::Blob {
        mime_type,
        data: data.to_string(),
    }))
}

/// Anthropic `/v1/messages` → OpenAI chat-completions, the documented
/// `mapClaudeToOpenAI` dialect hop. Thinking-block signatures are dropped
/// here rather than carried forward: Claude-family turns never attach an
/// upstream thought signature in the first place (see
/// [`RequestAdapter::push_assistant_turn`]), so nothing downstream needs to
/// strip one.
fn map_claude_to_openai(body: &anthropic::MessagesRequest) -> openai::ChatCompletionRequest {
    let mut messages = Vec::new();

    if let Some(system) = &body.system {
        let text = match system {
            anthropic::SystemPrompt::Text(text) => text.clone(),
            anthropic::SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    anthropic::ContentBlock::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        };
        if !text.is_empty() {
            messages.push(plain_message("system", text));
        }
    }

    for message in &body.messages {
        let blocks = message.content.as_blocks();
        if message.role == "assistant" {
            messages.push(map_claude_assistant_message(&blocks));
        } else {
            let mut parts = Vec::new();
            let mut tool_results = Vec::new();
            for block in &blocks {
                match block {
                    anthropic::ContentBlock::Text { text } => {
                        parts.push(openai::ContentPart::Text { text: text.clone() });
                    }
                    anthropic::ContentBlock::Image { source } => {
                        if let Some(url) = claude_image_source_to_data_uri(source) {
                            parts.push(openai::ContentPart::ImageUrl {
                                image_url: openai::ImageUrl { url, detail: None },
                            });
                        }
                    }
                    anthropic::ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        tool_results.push(openai::ChatMessage {
                            role: "tool".to_string(),
                            content: Some(openai::MessageContent::Text(claude_tool_result_text(
                                content.as_ref(),
                            ))),
                            name: None,
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                        });
                    }
                    _ => {}
                }
            }
            if !parts.is_empty() {
                messages.push(openai::ChatMessage {
                    role: "user".to_string(),
                    content: Some(openai::MessageContent::Parts(parts)),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            messages.extend(tool_results);
        }
    }

    let tools = body.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| openai::ChatCompletionTool {
                kind: "function".to_string(),
                function: openai::FunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(tool.input_schema.clone()),
                },
            })
            .collect()
    });

    openai::ChatCompletionRequest {
        model: body.model.clone(),
        messages,
        stream: body.stream,
        temperature: body.temperature,
        top_p: body.top_p,
        max_tokens: Some(body.max_tokens),
        max_completion_tokens: None,
        tools,
        tool_choice: None,
        stop: None,
        extra: serde_json::Map::new(),
    }
}

fn map_claude_assistant_message(blocks: &[anthropic::ContentBlock]) -> openai::ChatMessage {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block {
            anthropic::ContentBlock::Thinking { thinking, .. } => {
                text.push_str("<think>");
                text.push_str(thinking);
                text.push_str("</think>");
            }
            anthropic::ContentBlock::Text { text: block_text } => text.push_str(block_text),
            anthropic::ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(openai::ToolCall {
                    id: id.clone(),
                    kind: "function".to_string(),
                    function: openai::FunctionCall {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                });
            }
            _ => {}
        }
    }
    openai::ChatMessage {
        role: "assistant".to_string(),
        content: if text.is_empty() {
            None
        } else {
            Some(openai::MessageContent::Text(text))
        },
        name: None,
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
    }
}

fn claude_image_source_to_data_uri(source: &Value) -> Option<String> {
    let media_type = source.get("media_type").and_then(Value::as_str)?;
    let data = source.get("data").and_then(Value::as_str)?;
    Some(format!("data:{media_type};base64,{data}"))
}

fn claude_tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .find_map(|item| item.get("text").and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| Value::Array(items.clone()).to_string()),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn plain_message(role: &str, text: String) -> openai::ChatMessage {
    openai::ChatMessage {
        role: role.to_string(),
        content: Some(openai::MessageContent::Text(text)),
        name: None,
        tool_calls: None,
        tool_call_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> CredentialView {
        CredentialView {
            access_token: "token".to_string(),
            project_id: "proj-a".to_string(),
            session_id: 1,
            enabled: true,
        }
    }

    fn chat_message(role: &str, text: &str) -> openai::ChatMessage {
        openai::ChatMessage {
            role: role.to_string(),
            content: Some(openai::MessageContent::Text(text.to_string())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[tokio::test]
    async fn thinking_enabled_matches_name_shape_rules() {
        assert!(thinking_enabled("gemini-2.5-pro"));
        assert!(thinking_enabled("gemini-3-pro-preview"));
        assert!(thinking_enabled("my-model-thinking"));
        assert!(thinking_enabled("gemini-2.0-flash-thinking-exp"));
        assert!(!thinking_enabled("gemini-2.5-flash"));
    }

    #[tokio::test]
    async fn merges_consecutive_tool_call_only_assistant_turns() {
        let adapter = RequestAdapter::new();
        let body = openai::ChatCompletionRequest {
            model: "gemini-2.5-flash".to_string(),
            messages: vec![
                openai::ChatMessage {
                    role: "assistant".to_string(),
                    content: None,
                    name: None,
                    tool_calls: Some(vec![openai::ToolCall {
                        id: "call-1".to_string(),
                        kind: "function".to_string(),
                        function: openai::FunctionCall {
                            name: "lookup".to_string(),
                            arguments: "{}".to_string(),
                        },
                    }]),
                    tool_call_id: None,
                },
                openai::ChatMessage {
                    role: "assistant".to_string(),
                    content: None,
                    name: None,
                    tool_calls: Some(vec![openai::ToolCall {
                        id: "call-2".to_string(),
                        kind: "function".to_string(),
                        function: openai::FunctionCall {
                            name: "lookup2".to_string(),
                            arguments: "{}".to_string(),
                        },
                    }]),
                    tool_call_id: None,
                },
            ],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            max_completion_tokens: None,
            tools: None,
            tool_choice: None,
            stop: None,
            extra: serde_json::Map::new(),
        };
        let upstream = adapter.from_openai_chat(&body, &view()).await;
        assert_eq!(upstream.body.contents.len(), 1);
        assert_eq!(upstream.body.contents[0].parts.len(), 2);
    }

    #[tokio::test]
    async fn drops_unsigned_gemini3_assistant_text() {
        let adapter = RequestAdapter::new();
        let body = openai::ChatCompletionRequest {
            model: "gemini-3-pro-preview".to_string(),
            messages: vec![chat_message("user", "hi"), chat_message("assistant", "hello there")],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            max_completion_tokens: None,
            tools: None,
            tool_choice: None,
            stop: None,
            extra: serde_json::Map::new(),
        };
        let upstream = adapter.from_openai_chat(&body, &view()).await;
        // only the user turn survives; the unsigned assistant text is dropped.
        assert_eq!(upstream.body.contents.len(), 1);
        assert_eq!(upstream.body.contents[0].role, Some(gemini::ContentRole::User));
    }

    #[tokio::test]
    async fn keeps_signed_gemini3_assistant_text() {
        let adapter = RequestAdapter::new();
        adapter
            .signatures
            .record_text("hello there", "sig-xyz")
            .await;
        let body = openai::ChatCompletionRequest {
            model: "gemini-3-pro-preview".to_string(),
            messages: vec![chat_message("user", "hi"), chat_message("assistant", "hello there")],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            max_completion_tokens: None,
            tools: None,
            tool_choice: None,
            stop: None,
            extra: serde_json::Map::new(),
        };
        let upstream = adapter.from_openai_chat(&body, &view()).await;
        assert_eq!(upstream.body.contents.len(), 2);
        let model_turn = &upstream.body.contents[1];
        assert_eq!(model_turn.parts[0].thought_signature.as_deref(), Some("sig-xyz"));
    }

    #[tokio::test]
    async fn image_generation_models_set_response_modalities_and_steering_note() {
        let adapter = RequestAdapter::new();
        let body = openai::ChatCompletionRequest {
            model: "gemini-2.5-flash-image".to_string(),
            messages: vec![chat_message("user", "draw a cat")],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            max_completion_tokens: None,
            tools: None,
            tool_choice: None,
            stop: None,
            extra: serde_json::Map::new(),
        };
        let upstream = adapter.from_openai_chat(&body, &view()).await;
        let config = upstream.body.generation_config.unwrap();
        assert_eq!(
            config.response_modalities,
            Some(vec!["TEXT".to_string(), "IMAGE".to_string()])
        );
        let system = upstream.body.system_instruction.unwrap();
        assert!(system.parts[0].text.as_ref().unwrap().contains("description"));
    }

    #[tokio::test]
    async fn anthropic_hop_preserves_tool_use_and_tool_result() {
        let adapter = RequestAdapter::new();
        let request = anthropic::MessagesRequest {
            model: "claude-3-5-sonnet".to_string(),
            messages: vec![
                anthropic::AnthropicMessage {
                    role: "user".to_string(),
                    content: anthropic::AnthropicContent::Text("what's the weather?".to_string()),
                },
                anthropic::AnthropicMessage {
                    role: "assistant".to_string(),
                    content: anthropic::AnthropicContent::Blocks(vec![anthropic::ContentBlock::ToolUse {
                        id: "call-1".to_string(),
                        name: "get_weather".to_string(),
                        input: serde_json::json!({"city": "nyc"}),
                    }]),
                },
                anthropic::AnthropicMessage {
                    role: "user".to_string(),
                    content: anthropic::AnthropicContent::Blocks(vec![anthropic::ContentBlock::ToolResult {
                        tool_use_id: "call-1".to_string(),
                        content: Some(Value::String("sunny".to_string())),
                        is_error: None,
                    }]),
                },
            ],
            max_tokens: 1024,
            system: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            tools: None,
            thinking: None,
            extra: serde_json::Map::new(),
        };
        let upstream = adapter.from_anthropic_messages(&request, &view()).await;
        // user turn, model tool-call turn, user function-response turn.
        assert_eq!(upstream.body.contents.len(), 3);
        let function_call_turn = &upstream.body.contents[1];
        assert_eq!(function_call_turn.role, Some(gemini::ContentRole::Model));
        assert_eq!(
            function_call_turn.parts[0].function_call.as_ref().unwrap().name,
            "get_weather"
        );
        let function_response_turn = &upstream.body.contents[2];
        assert_eq!(
            function_response_turn.parts[0]
                .function_response
                .as_ref()
                .unwrap()
                .name,
            "get_weather"
        );
    }

    #[tokio::test]
    async fn gemini_passthrough_cleans_tool_schema_and_fills_defaults() {
        let adapter = RequestAdapter::new();
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"x": {"type": "string", "minLength": 3}},
            "additionalProperties": false
        });
        let body = gemini::GenerateContentRequest {
            contents: vec![gemini::Content {
                role: Some(gemini::ContentRole::User),
                parts: vec![gemini::Part::text("hi")],
            }],
            system_instruction: None,
            generation_config: None,
            tools: Some(vec![gemini::Tool {
                function_declarations: Some(vec![gemini::FunctionDeclaration {
                    name: "search".to_string(),
                    description: None,
                    parameters: Some(schema),
                }]),
            }]),
            tool_config: None,
            extra: serde_json::Map::new(),
        };
        let upstream = adapter.from_gemini(&body, "gemini-2.5-pro", &view()).await;
        let params = upstream.body.tools.unwrap()[0]
            .function_declarations
            .as_ref()
            .unwrap()[0]
            .parameters
            .clone()
            .unwrap();
        assert!(!params.as_object().unwrap().contains_key("additionalProperties"));
        let config = upstream.body.generation_config.unwrap();
        assert_eq!(config.thinking_config.unwrap().thinking_budget, 1024);
        assert_eq!(config.stop_sequences.unwrap().len(), STOP_SEQUENCES.len());
    }
}
