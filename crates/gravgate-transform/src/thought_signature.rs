//! Thought-signature continuity: opaque upstream tokens that must be echoed
//! back on a chain-of-thought-capable model's subsequent turns, matched
//! either by tool-call id or by normalized emitted text.

use std::collections::HashMap;

use tokio::sync::RwLock;

/// Strips `<think>...</think>` blocks, markdown image references, CR, and
/// surrounding whitespace, so a reformatted echo of the same text still
/// matches its recorded signature.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find("<think>") {
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start..].find("</think>") {
                    Some(end) => rest = &rest[start + end + "</think>".len()..],
                    None => {
                        rest = "";
                        break;
                    }
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    let without_images = strip_markdown_images(&out);
    without_images.replace('\r', "").trim().to_string()
}

fn strip_markdown_images(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '!' && text[i..].starts_with("![") {
            if let Some(close_bracket) = text[i..].find(']') {
                let after_bracket = i + close_bracket + 1;
                if text[after_bracket..].starts_with('(') {
                    if let Some(close_paren) = text[after_bracket..].find(')') {
                        let end = after_bracket + close_paren + 1;
                        while let Some((j, _)) = chars.peek() {
                            if *j < end {
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        continue;
                    }
                }
            }
        }
        result.push(c);
    }
    result
}

#[derive(Debug, Clone)]
pub struct SignatureEntry {
    pub signature: String,
    pub original_text: String,
}

#[derive(Default)]
pub struct ThoughtSignatureMap {
    by_tool_call_id: RwLock<HashMap<String, String>>,
    by_normalized_text: RwLock<HashMap<String, SignatureEntry>>,
}

impl ThoughtSignatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_tool_call(&self, tool_call_id: &str, signature: &str) {
        self.by_tool_call_id
            .write()
            .await
            .insert(tool_call_id.to_string(), signature.to_string());
    }

    pub async fn record_text(&self, original_text: &str, signature: &str) {
        let key = normalize_text(original_text);
        self.by_normalized_text.write().await.insert(
            key,
            SignatureEntry {
                signature: signature.to_string(),
                original_text: original_text.to_string(),
            },
        );
    }

    pub async fn lookup_tool_call(&self, tool_call_id: &str) -> Option<String> {
        self.by_tool_call_id.read().await.get(tool_call_id).cloned()
    }

    /// Looks up by exact text, then trimmed, then fully normalized.
    pub async fn lookup_text(&self, text: &str) -> Option<String> {
        let guard = self.by_normalized_text.read().await;
        if let Some(entry) = guard.get(text) {
            return Some(entry.signature.clone());
        }
        let trimmed = text.trim();
        if let Some(entry) = guard.get(trimmed) {
            return Some(entry.signature.clone());
        }
        guard
            .get(&normalize_text(text))
            .map(|entry| entry.signature.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_think_blocks_images_and_whitespace() {
        let text = "  <think>reasoning here</think>Hello ![alt](http://x/y.png) world\r\n  ";
        assert_eq!(normalize_text(text), "Hello  world");
    }

    #[tokio::test]
    async fn looks_up_text_by_exact_then_trimmed_then_normalized() {
        let map = ThoughtSignatureMap::new();
        map.record_text("hello world", "sig-1").await;
        assert_eq!(map.lookup_text("hello world").await, Some("sig-1".to_string()));
        // trimming the query still matches the normalized stored key.
        assert_eq!(
            map.lookup_text("  hello world  ").await,
            Some("sig-1".to_string())
        );
        assert_eq!(map.lookup_text("entirely different").await, None);
    }

    #[tokio::test]
    async fn tool_call_signatures_round_trip() {
        let map = ThoughtSignatureMap::new();
        map.record_tool_call("call-1", "sig-a").await;
        assert_eq!(map.lookup_tool_call("call-1").await, Some("sig-a".to_string()));
        assert_eq!(map.lookup_tool_call("call-missing").await, None);
    }
}
