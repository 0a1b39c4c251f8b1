//! Token estimation
//!
//! Used when the upstream does not report usage. Roughly 4 characters per
//! token, which is what the billing fallback needs; adaptors that know a
//! model-specific tokeniser may do better.

/// Estimate the token count of a piece of text.
pub fn estimate_text_tokens(text: &str) -> u64 {
    (text.chars().count() as f64 / 4.0).ceil() as u64
}

/// Estimate the prompt tokens of a chat payload by walking its message
/// contents. Accepts both string contents and multi-part contents.
pub fn estimate_chat_prompt_tokens(payload: &serde_json::Value) -> u64 {
    let Some(messages) = payload.get("messages").and_then(|m| m.as_array()) else {
        return 0;
    };

    let mut total = 0u64;
    for message in messages {
        match message.get("content") {
            Some(serde_json::Value::String(text)) => total += estimate_text_tokens(text),
            Some(serde_json::Value::Array(parts)) => {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        total += estimate_text_tokens(text);
                    }
                }
            }
            _ => {}
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn four_chars_per_token() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
    }

    #[test]
    fn chat_prompt_walks_string_and_parts() {
        let payload = json!({
            "messages": [
                {"role": "system", "content": "abcdefgh"},
                {"role": "user", "content": [{"type": "text", "text": "abcd"}]},
            ]
        });
        assert_eq!(estimate_chat_prompt_tokens(&payload), 3);
    }
}
