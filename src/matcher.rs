use crate::store::{SessionStore, StorageError};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

impl ChatMessage {
    /// Plain text of the message; text parts of a multi-part content array
    /// are concatenated.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(obj) => obj
                        .get("text")
                        .and_then(|v| v.as_str())
                        .filter(|_| obj.get("type").and_then(|t| t.as_str()).unwrap_or("text") == "text"),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadPlan {
    Resume {
        chat_id: String,
        parent_id: Option<String>,
        user_content: String,
    },
    NewThread {
        user_content: String,
    },
}

impl ThreadPlan {
    pub fn user_content(&self) -> &str {
        match self {
            ThreadPlan::Resume { user_content, .. } | ThreadPlan::NewThread { user_content } => {
                user_content
            }
        }
    }
}

/// Decides whether a request continues a known upstream thread.
///
/// Only an exact (post-normalization) echo of a stored assistant reply
/// resumes; anything else starts a fresh thread carrying the whole history.
pub async fn plan_thread(
    store: &dyn SessionStore,
    messages: &[ChatMessage],
) -> Result<ThreadPlan, StorageError> {
    let last_assistant = messages
        .iter()
        .rev()
        .find(|m| m.role == "assistant")
        .map(|m| m.text())
        .filter(|text| !text.is_empty());
    let Some(last_assistant) = last_assistant else {
        return Ok(new_thread(messages));
    };

    let Some(pointer) = store.find_by_fingerprint(&last_assistant).await? else {
        tracing::debug!("no stored thread matches the echoed assistant reply");
        return Ok(new_thread(messages));
    };

    let Some(last_user) = messages.iter().rev().find(|m| m.role == "user") else {
        tracing::debug!(chat_id = %pointer.chat_id, "matched thread but request has no user turn");
        return Ok(new_thread(messages));
    };

    Ok(ThreadPlan::Resume {
        chat_id: pointer.chat_id,
        parent_id: pointer.current_response_id,
        user_content: last_user.text(),
    })
}

fn new_thread(messages: &[ChatMessage]) -> ThreadPlan {
    ThreadPlan::NewThread {
        user_content: flatten_history(messages),
    }
}

pub fn flatten_history(messages: &[ChatMessage]) -> String {
    let joined = messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.text()))
        .collect::<Vec<_>>()
        .join("\n\n");
    match messages.first() {
        Some(first) if first.role == "system" => joined,
        _ => format!("system:\n\n{joined}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChatSession, MemorySessionStore};
    use serde_json::json;

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: Value::String(content.to_string()),
        }
    }

    async fn store_with(chat_id: &str, content: &str, response_id: &str) -> MemorySessionStore {
        let store = MemorySessionStore::default();
        store
            .upsert(&ChatSession {
                chat_id: chat_id.to_string(),
                title: String::new(),
                chat_type: "t2t".to_string(),
                created_at: 0,
                updated_at: 0,
                current_response_id: Some(response_id.to_string()),
                last_assistant_content: Some(content.to_string()),
            })
            .await
            .expect("upsert");
        store
    }

    #[tokio::test]
    async fn resumes_on_echoed_reply() {
        let store = store_with("chat-7", "The answer is **42**.", "resp-7").await;
        let messages = vec![
            msg("system", "be brief"),
            msg("user", "question"),
            msg("assistant", "The answer is  42."),
            msg("user", "why?"),
        ];
        let plan = plan_thread(&store, &messages).await.expect("plan");
        assert_eq!(
            plan,
            ThreadPlan::Resume {
                chat_id: "chat-7".to_string(),
                parent_id: Some("resp-7".to_string()),
                user_content: "why?".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn no_assistant_message_starts_new_thread() {
        let store = store_with("chat-7", "hello", "resp-7").await;
        let messages = vec![msg("user", "hello")];
        let plan = plan_thread(&store, &messages).await.expect("plan");
        assert_eq!(
            plan,
            ThreadPlan::NewThread {
                user_content: "system:\n\nuser: hello".to_string()
            }
        );
    }

    #[tokio::test]
    async fn edited_reply_rebuilds_full_context() {
        let store = store_with("chat-7", "original reply", "resp-7").await;
        let messages = vec![
            msg("system", "sys"),
            msg("user", "q1"),
            msg("assistant", "edited reply"),
            msg("user", "q2"),
        ];
        let plan = plan_thread(&store, &messages).await.expect("plan");
        assert_eq!(
            plan.user_content(),
            "system: sys\n\nuser: q1\n\nassistant: edited reply\n\nuser: q2"
        );
        assert!(matches!(plan, ThreadPlan::NewThread { .. }));
    }

    #[tokio::test]
    async fn empty_assistant_message_never_matches() {
        let store = MemorySessionStore::default();
        store
            .upsert(&ChatSession {
                chat_id: "blank".to_string(),
                title: String::new(),
                chat_type: "t2t".to_string(),
                created_at: 0,
                updated_at: 0,
                current_response_id: Some("r".to_string()),
                last_assistant_content: Some(String::new()),
            })
            .await
            .expect("upsert");
        let messages = vec![msg("user", "a"), msg("assistant", ""), msg("user", "b")];
        let plan = plan_thread(&store, &messages).await.expect("plan");
        assert!(matches!(plan, ThreadPlan::NewThread { .. }));
    }

    #[test]
    fn text_joins_content_parts() {
        let m = ChatMessage {
            role: "user".to_string(),
            content: json!([
                {"type": "text", "text": "hello "},
                {"type": "image_url", "image_url": {"url": "http://x"}},
                {"type": "text", "text": "world"}
            ]),
        };
        assert_eq!(m.text(), "hello world");
    }
}
