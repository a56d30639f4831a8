//! Wire-shape types for the three client-facing dialects (OpenAI chat
//! completions, Anthropic messages, Gemini generateContent) plus the SSE
//! line parser shared by the streaming response engine.
//!
//! Fields the adapter never inspects are carried through a
//! `#[serde(flatten)] extra: serde_json::Map<String, Value>` bag rather than
//! enumerated exhaustively, so a client can send provider-specific fields
//! without the gateway stripping them.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod sse;
