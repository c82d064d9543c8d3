use crate::config::CredentialSource;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Decode,
    Credential,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    fn decode(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Decode, None, message.into())
    }

    /// Code reported to API callers: the upstream's own error code when it
    /// sent one, otherwise one derived from the failure kind and status.
    pub fn error_code(&self) -> String {
        if let Some(code) = &self.code {
            return code.clone();
        }
        match (self.kind, self.status) {
            (UpstreamErrorKind::Network, _) => "upstream_unreachable".to_string(),
            (UpstreamErrorKind::Http, Some(status)) => format!("upstream_http_{}", status.as_u16()),
            (UpstreamErrorKind::Http, None) => "upstream_http_error".to_string(),
            (UpstreamErrorKind::Decode, _) => "upstream_bad_response".to_string(),
            (UpstreamErrorKind::Credential, _) => "upstream_credentials".to_string(),
        }
    }
}

/// Model catalog and user settings fetched once at startup.
#[derive(Debug, Clone, Default)]
pub struct UpstreamProfile {
    pub models: BTreeMap<String, Value>,
    pub settings: Value,
}

impl UpstreamProfile {
    pub fn catalog_ids(&self) -> HashSet<String> {
        self.models.keys().cloned().collect()
    }

    pub fn default_thinking_budget(&self, model: &str) -> Option<Value> {
        self.settings
            .get("model_config")
            .and_then(|v| v.get(model))
            .and_then(|v| v.get("thinking_budget"))
            .filter(|v| !v.is_null())
            .cloned()
    }

    /// The catalog in OpenAI `/v1/models` shape.
    pub fn openai_models(&self) -> Vec<Value> {
        self.models
            .iter()
            .map(|(id, model)| {
                let info = model.get("info");
                json!({
                    "id": info.and_then(|i| i.get("id")).and_then(|v| v.as_str()).unwrap_or(id),
                    "object": "model",
                    "created": info
                        .and_then(|i| i.get("created_at"))
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0),
                    "owned_by": model.get("owned_by").and_then(|v| v.as_str()).unwrap_or("qwen"),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChatSummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_chat_type")]
    pub chat_type: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_chat_type() -> String {
    "t2t".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatListPage {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Vec<ChatSummary>,
}

#[derive(Debug, Clone)]
pub struct ThinkingConfig {
    pub enabled: bool,
    pub budget: Option<Value>,
}

/// One user turn posted to an upstream thread.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub chat_id: String,
    pub parent_id: Option<String>,
    pub model: String,
    pub content: String,
    pub thinking: ThinkingConfig,
    pub timestamp_ms: i64,
}

pub fn build_turn_payload(turn: &TurnRequest) -> Value {
    let mut feature_config = json!({
        "output_schema": "phase",
        "thinking_enabled": turn.thinking.enabled,
    });
    if turn.thinking.enabled {
        if let Some(budget) = &turn.thinking.budget {
            feature_config["thinking_budget"] = budget.clone();
        }
    }
    json!({
        "stream": true,
        "incremental_output": true,
        "chat_id": turn.chat_id,
        "chat_mode": "normal",
        "model": turn.model,
        "parent_id": turn.parent_id,
        "messages": [{
            "fid": uuid::Uuid::new_v4().to_string(),
            "parentId": turn.parent_id,
            "childrenIds": [uuid::Uuid::new_v4().to_string()],
            "role": "user",
            "content": turn.content,
            "user_action": "chat",
            "files": [],
            "timestamp": turn.timestamp_ms,
            "models": [turn.model],
            "chat_type": "t2t",
            "feature_config": feature_config,
            "extra": { "meta": { "subChatType": "t2t" } },
            "sub_chat_type": "t2t",
            "parent_id": turn.parent_id,
        }],
        "timestamp": turn.timestamp_ms,
    })
}

/// HTTP client for the upstream web API.
///
/// The bearer token is resolved from the credential source on every call and
/// attached to that request only, so concurrent calls never share header state.
#[derive(Clone)]
pub struct QwenGateway {
    http: reqwest::Client,
    base_url: String,
    credentials: CredentialSource,
    request_timeout: Duration,
}

impl QwenGateway {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        credentials: CredentialSource,
        request_timeout_ms: u64,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            credentials,
            request_timeout: Duration::from_millis(request_timeout_ms),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, UpstreamCallError> {
        let token = self
            .credentials
            .current()
            .await
            .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Credential, None, err))?;
        Ok(self
            .http
            .request(method, join_url(&self.base_url, path))
            .bearer_auth(token)
            .header("accept-language", "zh-CN,zh;q=0.9,en;q=0.8")
            .header("source", "web"))
    }

    async fn send(req: reqwest::RequestBuilder) -> Result<reqwest::Response, UpstreamCallError> {
        let resp = req
            .send()
            .await
            .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let code = extract_error_code(&text);
            return Err(UpstreamCallError::new(
                UpstreamErrorKind::Http,
                Some(status),
                format!("upstream status {}: {}", status, text),
            )
            .with_code(code));
        }
        Ok(resp)
    }

    async fn send_json(&self, req: reqwest::RequestBuilder) -> Result<Value, UpstreamCallError> {
        let resp = Self::send(req.timeout(self.request_timeout)).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(|err| {
            UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
        })?;
        serde_json::from_str(&text).map_err(|err| {
            UpstreamCallError::new(UpstreamErrorKind::Decode, Some(status), err.to_string())
        })
    }

    pub async fn fetch_profile(&self) -> Result<UpstreamProfile, UpstreamCallError> {
        let user = self.send_json(self.request(Method::GET, "/api/v1/auths/").await?).await?;
        let Some(user_id) = user.get("id").and_then(|v| v.as_str()) else {
            return Err(UpstreamCallError::new(
                UpstreamErrorKind::Credential,
                None,
                "upstream did not return an account for the configured token".to_string(),
            ));
        };
        tracing::info!(user_id, "upstream token accepted");
        let models_value = self.send_json(self.request(Method::GET, "/api/models").await?).await?;
        let mut models = BTreeMap::new();
        for model in models_value
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| UpstreamCallError::decode("model catalog has no data array"))?
        {
            if let Some(id) = model.get("id").and_then(|v| v.as_str()) {
                models.insert(id.to_string(), model.clone());
            }
        }
        let settings = self
            .send_json(self.request(Method::GET, "/api/v2/users/user/settings").await?)
            .await?
            .get("data")
            .cloned()
            .unwrap_or(Value::Null);
        Ok(UpstreamProfile {
            models,
            settings,
        })
    }

    pub async fn create_chat(&self, model: &str, title: &str) -> Result<String, UpstreamCallError> {
        let body = json!({
            "title": title,
            "models": [model],
            "chat_mode": "normal",
            "chat_type": "t2t",
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        let value = self
            .send_json(self.request(Method::POST, "/api/v2/chats/new").await?.json(&body))
            .await?;
        let chat_id = value
            .get("data")
            .and_then(|v| v.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| UpstreamCallError::decode("create chat response has no data.id"))?;
        tracing::info!(chat_id, "created upstream chat");
        Ok(chat_id.to_string())
    }

    /// Posts a turn and returns the still-unread event stream response.
    pub async fn post_turn(&self, turn: &TurnRequest) -> Result<reqwest::Response, UpstreamCallError> {
        let path = format!("/api/v2/chat/completions?chat_id={}", turn.chat_id);
        let req = self
            .request(Method::POST, &path)
            .await?
            .header("x-accel-buffering", "no")
            .json(&build_turn_payload(turn));
        Self::send(req).await
    }

    pub async fn list_chats(&self, page: u32) -> Result<ChatListPage, UpstreamCallError> {
        let value = self
            .send_json(self.request(Method::GET, &format!("/api/v2/chats/?page={page}")).await?)
            .await?;
        serde_json::from_value(value).map_err(|err| UpstreamCallError::decode(err.to_string()))
    }

    pub async fn chat_detail(&self, chat_id: &str) -> Result<Value, UpstreamCallError> {
        let value = self
            .send_json(self.request(Method::GET, &format!("/api/v2/chats/{chat_id}")).await?)
            .await?;
        if value.get("success").and_then(|v| v.as_bool()) == Some(false) {
            return Err(UpstreamCallError::decode(format!(
                "chat detail for {chat_id} reported success=false"
            )));
        }
        value
            .get("data")
            .cloned()
            .ok_or_else(|| UpstreamCallError::decode(format!("chat detail for {chat_id} has no data")))
    }

    pub async fn delete_chat(&self, chat_id: &str) -> Result<bool, UpstreamCallError> {
        let value = self
            .send_json(self.request(Method::DELETE, &format!("/api/v2/chats/{chat_id}")).await?)
            .await?;
        let ok = value.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        if ok {
            tracing::info!(chat_id, "deleted upstream chat");
        } else {
            tracing::warn!(chat_id, response = %value, "upstream chat delete returned success=false");
        }
        Ok(ok)
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .or_else(|| value.get("data").and_then(|v| v.get("code")))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(parent: Option<&str>, thinking: ThinkingConfig) -> TurnRequest {
        TurnRequest {
            chat_id: "chat-1".to_string(),
            parent_id: parent.map(|s| s.to_string()),
            model: "qwen3-32b".to_string(),
            content: "hello".to_string(),
            thinking,
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn turn_payload_links_parent() {
        let payload = build_turn_payload(&turn(
            Some("resp-9"),
            ThinkingConfig {
                enabled: true,
                budget: Some(json!(2048)),
            },
        ));
        assert_eq!(payload["parent_id"], "resp-9");
        let message = &payload["messages"][0];
        assert_eq!(message["parentId"], "resp-9");
        assert_eq!(message["parent_id"], "resp-9");
        assert_eq!(message["content"], "hello");
        assert_eq!(message["feature_config"]["output_schema"], "phase");
        assert_eq!(message["feature_config"]["thinking_enabled"], true);
        assert_eq!(message["feature_config"]["thinking_budget"], 2048);
        assert_eq!(payload["stream"], true);
    }

    #[test]
    fn turn_payload_for_new_thread_has_null_parent_and_no_budget_when_disabled() {
        let payload = build_turn_payload(&turn(
            None,
            ThinkingConfig {
                enabled: false,
                budget: Some(json!(100)),
            },
        ));
        assert!(payload["parent_id"].is_null());
        let feature = &payload["messages"][0]["feature_config"];
        assert_eq!(feature["thinking_enabled"], false);
        assert!(feature.get("thinking_budget").is_none());
    }

    #[test]
    fn profile_reads_budget_and_models() {
        let mut models = BTreeMap::new();
        models.insert(
            "qwen3-32b".to_string(),
            json!({"id": "qwen3-32b", "owned_by": "qwen", "info": {"id": "qwen3-32b", "created_at": 42}}),
        );
        let profile = UpstreamProfile {
            models,
            settings: json!({"model_config": {"qwen3-32b": {"thinking_budget": 512}}}),
        };
        assert_eq!(profile.default_thinking_budget("qwen3-32b"), Some(json!(512)));
        assert_eq!(profile.default_thinking_budget("other"), None);
        let listed = profile.openai_models();
        assert_eq!(listed[0]["id"], "qwen3-32b");
        assert_eq!(listed[0]["created"], 42);
        assert_eq!(listed[0]["object"], "model");
    }

    #[test]
    fn error_code_prefers_upstream_code() {
        let http = UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(StatusCode::TOO_MANY_REQUESTS),
            "slow down".to_string(),
        );
        assert_eq!(http.error_code(), "upstream_http_429");
        let coded = http.with_code(extract_error_code(r#"{"success":false,"data":{"code":"RateLimited"}}"#));
        assert_eq!(coded.error_code(), "RateLimited");
        let network = UpstreamCallError::new(UpstreamErrorKind::Network, None, "reset".to_string());
        assert_eq!(network.error_code(), "upstream_unreachable");
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("http://x/", "/api/models"), "http://x/api/models");
        assert_eq!(join_url("http://x", "api/models"), "http://x/api/models");
    }
}
