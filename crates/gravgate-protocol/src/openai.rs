//! OpenAI-compatible chat completions request/response shapes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "top_p")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "max_completion_tokens"
    )]
    pub max_completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatCompletionTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    /// Some clients send tool results as a bare JSON object or array.
    Raw(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, matching the OpenAI wire shape.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDeclaration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One `chat.completion.chunk` streamed to an OpenAI-dialect client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCallDelta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FunctionCallDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl ChatMessage {
    /// Extracts tool-result text the way the adapter needs it: `.text` on an
    /// object, the first text element of an array, or a JSON-stringify as a
    /// last resort.
    pub fn tool_result_text(&self) -> String {
        match &self.content {
            Some(MessageContent::Text(text)) => text.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .find_map(|part| match part {
                    ContentPart::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .unwrap_or_default(),
            Some(MessageContent::Raw(value)) => {
                if let Some(text) = value.get("text").and_then(Value::as_str) {
                    text.to_string()
                } else if let Some(array) = value.as_array() {
                    array
                        .iter()
                        .find_map(|item| item.get("text").and_then(Value::as_str))
                        .map(str::to_string)
                        .unwrap_or_else(|| value.to_string())
                } else {
                    value.to_string()
                }
            }
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_text_extracts_plain_string_content() {
        let msg = ChatMessage {
            role: "tool".into(),
            content: Some(MessageContent::Text("42".into())),
            name: None,
            tool_calls: None,
            tool_call_id: Some("call-1".into()),
        };
        assert_eq!(msg.tool_result_text(), "42");
    }

    #[test]
    fn tool_result_text_finds_first_text_part() {
        let msg = ChatMessage {
            role: "tool".into(),
            content: Some(MessageContent::Parts(vec![
                ContentPart::Other,
                ContentPart::Text {
                    text: "found it".into(),
                },
            ])),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        };
        assert_eq!(msg.tool_result_text(), "found it");
    }

    #[test]
    fn tool_result_text_reads_dot_text_on_raw_object() {
        let msg = ChatMessage {
            role: "tool".into(),
            content: Some(MessageContent::Raw(serde_json::json!({"text": "from object"}))),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        };
        assert_eq!(msg.tool_result_text(), "from object");
    }

    #[test]
    fn tool_result_text_falls_back_to_json_stringify() {
        let msg = ChatMessage {
            role: "tool".into(),
            content: Some(MessageContent::Raw(serde_json::json!({"code": 7}))),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        };
        assert_eq!(msg.tool_result_text(), r#"{"code":7}"#);
    }

    #[test]
    fn tool_result_text_is_empty_for_absent_content() {
        let msg = ChatMessage {
            role: "tool".into(),
            content: None,
            name: None,
            tool_calls: None,
            tool_call_id: None,
        };
        assert_eq!(msg.tool_result_text(), "");
    }

    #[test]
    fn request_round_trips_through_extra_fields() {
        let body = serde_json::json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": "ping"}],
            "stream": true,
            "frequency_penalty": 0.5,
        });
        let req: ChatCompletionRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.model, "gemini-2.5-flash");
        assert_eq!(req.stream, Some(true));
        assert!(req.extra.contains_key("frequency_penalty"));
    }
}
