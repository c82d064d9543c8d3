use super::TurnOutcome;
use super::decode::Usage;
use serde_json::{Value, json};

/// Shared fields of every chunk / completion sent for one request.
#[derive(Debug, Clone)]
pub struct ChunkEnvelope {
    pub id: String,
    pub created: i64,
    pub model: String,
}

impl ChunkEnvelope {
    pub fn for_chat(chat_id: &str, model: &str) -> Self {
        let prefix: String = chat_id.chars().take(10).collect();
        Self {
            id: format!("chatcmpl-{prefix}"),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
        }
    }

    pub fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }]
        })
    }

    pub fn content_chunk(&self, content: &str, reasoning_content: Option<&str>) -> Value {
        let mut delta = json!({ "content": content });
        if let Some(reasoning) = reasoning_content {
            delta["reasoning_content"] = Value::String(reasoning.to_string());
        }
        self.chunk(delta, None)
    }

    pub fn terminal_chunk(&self, finish_reason: &str) -> Value {
        self.chunk(json!({}), Some(finish_reason))
    }

    pub fn error_chunk(&self, message: &str) -> Value {
        json!({
            "id": "chatcmpl-error",
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": { "content": format!("Error during streaming: {message}") },
                "finish_reason": "error",
            }]
        })
    }

    pub fn completion(&self, outcome: &TurnOutcome) -> Value {
        let mut message = json!({
            "role": "assistant",
            "content": outcome.content,
        });
        if let Some(reasoning) = &outcome.reasoning_content {
            message["reasoning_content"] = Value::String(reasoning.clone());
        }
        json!({
            "id": self.id,
            "object": "chat.completion",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": outcome.finish_reason,
            }],
            "usage": usage_value(&outcome.usage),
        })
    }
}

fn usage_value(usage: &Usage) -> Value {
    let mut value = json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens,
    });
    if usage.reasoning_tokens > 0 {
        value["completion_tokens_details"] = json!({ "reasoning_tokens": usage.reasoning_tokens });
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_uses_chat_prefix() {
        let env = ChunkEnvelope::for_chat("0123456789abcdef", "qwen");
        assert_eq!(env.id, "chatcmpl-0123456789");
        let short = ChunkEnvelope::for_chat("abc", "qwen");
        assert_eq!(short.id, "chatcmpl-abc");
    }

    #[test]
    fn terminal_chunk_has_empty_delta() {
        let env = ChunkEnvelope::for_chat("abc", "qwen");
        let chunk = env.terminal_chunk("stop");
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["choices"][0]["delta"], json!({}));
        assert_eq!(chunk["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn content_chunk_has_null_finish_reason() {
        let env = ChunkEnvelope::for_chat("abc", "qwen");
        let chunk = env.content_chunk("hi", None);
        assert!(chunk["choices"][0]["finish_reason"].is_null());
        assert!(chunk["choices"][0]["delta"].get("reasoning_content").is_none());
    }
}
