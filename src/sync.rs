use crate::fingerprint::strip_tool_markup;
use crate::store::{ChatSession, SessionStore, StorageError};
use crate::upstream::{ChatSummary, QwenGateway};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub pages: u32,
    pub synced: u32,
    pub skipped: u32,
}

/// Rebuilds the session table from the upstream conversation history.
#[derive(Clone)]
pub struct HistorySync {
    gateway: QwenGateway,
    store: Arc<dyn SessionStore>,
    running: Arc<Mutex<()>>,
}

impl HistorySync {
    pub fn new(gateway: QwenGateway, store: Arc<dyn SessionStore>) -> Self {
        Self {
            gateway,
            store,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Clears the store and re-imports every upstream thread. A thread whose
    /// detail cannot be fetched is skipped; only storage failures abort.
    pub async fn run(&self) -> Result<SyncReport, StorageError> {
        let _guard = self.running.lock().await;
        let mut report = SyncReport::default();
        self.store.clear().await?;

        let mut page = 1u32;
        loop {
            let listing = match self.gateway.list_chats(page).await {
                Ok(listing) => listing,
                Err(err) => {
                    tracing::warn!(page, error = %err, "chat list request failed, ending sync");
                    break;
                }
            };
            if !listing.success || listing.data.is_empty() {
                break;
            }
            report.pages += 1;
            for summary in &listing.data {
                match self.import(summary).await {
                    Ok(session) => {
                        self.store.upsert(&session).await?;
                        report.synced += 1;
                        metrics::counter!("qwen_bridge_sync_conversations_total").increment(1);
                    }
                    Err(message) => {
                        tracing::warn!(chat_id = %summary.id, error = %message, "skipping conversation");
                        report.skipped += 1;
                        metrics::counter!("qwen_bridge_sync_skipped_total").increment(1);
                    }
                }
            }
            page += 1;
        }

        tracing::info!(
            pages = report.pages,
            synced = report.synced,
            skipped = report.skipped,
            "history sync finished"
        );
        Ok(report)
    }

    async fn import(&self, summary: &ChatSummary) -> Result<ChatSession, String> {
        let detail = self
            .gateway
            .chat_detail(&summary.id)
            .await
            .map_err(|err| err.to_string())?;
        session_from_detail(summary, &detail)
    }
}

pub fn session_from_detail(summary: &ChatSummary, detail: &Value) -> Result<ChatSession, String> {
    if !detail.is_object() {
        return Err("chat detail is not an object".to_string());
    }
    let messages = detail
        .get("chat")
        .and_then(|chat| chat.get("messages"))
        .and_then(|v| v.as_array())
        .map(|v| v.as_slice())
        .unwrap_or_default();
    let content = messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("assistant"))
        .map(assistant_text)
        .unwrap_or_default();
    let current_response_id = detail
        .get("currentId")
        .or_else(|| {
            detail
                .get("chat")
                .and_then(|chat| chat.get("history"))
                .and_then(|history| history.get("currentId"))
        })
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let read_i64 = |key: &str, fallback: i64| detail.get(key).and_then(|v| v.as_i64()).unwrap_or(fallback);
    Ok(ChatSession {
        chat_id: summary.id.clone(),
        title: detail
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or(&summary.title)
            .to_string(),
        chat_type: detail
            .get("chat_type")
            .and_then(|v| v.as_str())
            .unwrap_or(&summary.chat_type)
            .to_string(),
        created_at: read_i64("created_at", summary.created_at),
        updated_at: read_i64("updated_at", summary.updated_at),
        current_response_id,
        last_assistant_content: Some(strip_tool_markup(&content)),
    })
}

fn assistant_text(message: &Value) -> String {
    if let Some(last) = message
        .get("content_list")
        .and_then(|v| v.as_array())
        .and_then(|list| list.last())
    {
        return last
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
    }
    message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary() -> ChatSummary {
        ChatSummary {
            id: "chat-1".to_string(),
            title: "From list".to_string(),
            chat_type: "t2t".to_string(),
            created_at: 10,
            updated_at: 20,
        }
    }

    #[test]
    fn picks_newest_assistant_content_list_tail() {
        let detail = json!({
            "id": "chat-1",
            "title": "Detail title",
            "currentId": "resp-3",
            "chat": {
                "messages": [
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "old", "content_list": [{"content": "old", "phase": "answer"}]},
                    {"role": "user", "content": "again"},
                    {"role": "assistant", "content": "flat", "content_list": [
                        {"content": "thinking...", "phase": "think"},
                        {"content": "<tool_use>x</tool_use>final", "phase": "answer"}
                    ]},
                    {"role": "user", "content": "pending"}
                ]
            }
        });
        let session = session_from_detail(&summary(), &detail).expect("session");
        assert_eq!(session.last_assistant_content.as_deref(), Some("final"));
        assert_eq!(session.current_response_id.as_deref(), Some("resp-3"));
        assert_eq!(session.title, "Detail title");
        assert_eq!(session.created_at, 10);
    }

    #[test]
    fn falls_back_to_flat_content_and_history_pointer() {
        let detail = json!({
            "chat": {
                "history": { "currentId": "resp-h" },
                "messages": [{"role": "assistant", "content": "flat text"}]
            }
        });
        let session = session_from_detail(&summary(), &detail).expect("session");
        assert_eq!(session.last_assistant_content.as_deref(), Some("flat text"));
        assert_eq!(session.current_response_id.as_deref(), Some("resp-h"));
        assert_eq!(session.title, "From list");
    }

    #[test]
    fn no_assistant_message_stores_empty_content() {
        let detail = json!({ "chat": { "messages": [{"role": "user", "content": "q"}] } });
        let session = session_from_detail(&summary(), &detail).expect("session");
        assert_eq!(session.last_assistant_content.as_deref(), Some(""));
        assert!(session.current_response_id.is_none());
    }

    #[test]
    fn non_object_detail_is_rejected() {
        assert!(session_from_detail(&summary(), &json!("nope")).is_err());
    }
}
