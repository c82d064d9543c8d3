use crate::app::AppState;
use crate::config::resolve_upstream_model;
use crate::error::{AppError, AppResult};
use crate::matcher::{ChatMessage, ThreadPlan, plan_thread};
use crate::translate::encode::ChunkEnvelope;
use crate::translate::{StreamEnd, ThreadContext, TurnOutcome, aggregate, persist_outcome, stream_chunks};
use crate::upstream::{ThinkingConfig, TurnRequest};
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_enable_thinking")]
    pub enable_thinking: bool,
    #[serde(default)]
    pub thinking_budget: Option<u64>,
}

fn default_model() -> String {
    "qwen3".to_string()
}

fn default_enable_thinking() -> bool {
    true
}

pub async fn index() -> impl IntoResponse {
    Json(json!({
        "message": "Qwen OpenAI-compatible bridge is running.",
        "docs": "https://platform.openai.com/docs/api-reference/chat"
    }))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models(State(state): State<AppState>) -> AppResult<Response> {
    let data = state.profile.read().await.openai_models();
    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

pub async fn list_sessions(State(state): State<AppState>) -> AppResult<Response> {
    let data: Vec<Value> = state
        .sessions
        .list()
        .await?
        .into_iter()
        .map(|s| {
            json!({
                "chat_id": s.chat_id,
                "title": s.title,
                "chat_type": s.chat_type,
                "created_at": s.created_at,
                "updated_at": s.updated_at,
                "current_response_id": s.current_response_id,
            })
        })
        .collect();
    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

pub async fn sync_sessions(State(state): State<AppState>) -> AppResult<Response> {
    let report = state.history.run().await?;
    Ok(Json(report).into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Response> {
    let req: ChatCompletionRequest = serde_json::from_slice(&body).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("Invalid JSON in request body: {err}"),
        )
    })?;
    if req.messages.is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "messages_required",
            "messages must contain at least one message",
        )
        .with_param("messages"));
    }

    let (upstream_model, default_budget) = {
        let profile = state.profile.read().await;
        let model =
            resolve_upstream_model(&state.runtime.model_aliases, &req.model, &profile.catalog_ids());
        let budget = profile.default_thinking_budget(&model);
        (model, budget)
    };

    let plan = plan_thread(state.sessions.as_ref(), &req.messages).await?;
    let now = chrono::Utc::now();
    let (thread, parent_id) = match &plan {
        ThreadPlan::Resume {
            chat_id, parent_id, ..
        } => {
            metrics::counter!("qwen_bridge_threads_resumed_total").increment(1);
            tracing::info!(chat_id = %chat_id, "resuming upstream thread");
            (
                ThreadContext {
                    chat_id: chat_id.clone(),
                    title: String::new(),
                    created_at: now.timestamp(),
                },
                parent_id.clone(),
            )
        }
        ThreadPlan::NewThread { .. } => {
            let title = format!("OpenAI API conversation {}", now.timestamp());
            let chat_id = state.gateway.create_chat(&upstream_model, &title).await?;
            metrics::counter!("qwen_bridge_threads_created_total").increment(1);
            (
                ThreadContext {
                    chat_id,
                    title,
                    created_at: now.timestamp(),
                },
                None,
            )
        }
    };

    let budget = req
        .thinking_budget
        .map(|b| json!(b))
        .or(default_budget);
    let turn = TurnRequest {
        chat_id: thread.chat_id.clone(),
        parent_id,
        model: upstream_model,
        content: plan.user_content().to_string(),
        thinking: ThinkingConfig {
            enabled: req.enable_thinking,
            budget,
        },
        timestamp_ms: now.timestamp_millis(),
    };
    let envelope = ChunkEnvelope::for_chat(&thread.chat_id, &req.model);

    if req.stream {
        let (tx, rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let end = match state.gateway.post_turn(&turn).await {
                Ok(resp) => stream_chunks(resp.bytes_stream(), &envelope, &tx).await,
                Err(err) => {
                    tracing::warn!(chat_id = %thread.chat_id, error = %err, "posting turn failed");
                    metrics::counter!("qwen_bridge_stream_errors_total").increment(1);
                    let _ = tx.send(envelope.error_chunk(&err.to_string()).to_string()).await;
                    StreamEnd::Failed(err.to_string())
                }
            };
            let outcome = match end {
                StreamEnd::Completed(outcome) => Some(outcome),
                StreamEnd::Failed(_) | StreamEnd::Disconnected => None,
            };
            // the response body stays open until the session row is written
            finish_turn(&state, &thread, outcome.as_ref()).await;
            drop(tx);
        });
        let stream = tokio_stream::wrappers::ReceiverStream::new(rx)
            .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
        return Ok(Sse::new(stream).into_response());
    }

    let result = match state.gateway.post_turn(&turn).await {
        Ok(resp) => aggregate(resp.bytes_stream()).await,
        Err(err) => Err(err),
    };
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::warn!(chat_id = %thread.chat_id, error = %err, "chat completion failed");
            finish_turn(&state, &thread, None).await;
            return Err(err.into());
        }
    };
    finish_turn(&state, &thread, Some(&outcome)).await;
    Ok(Json(envelope.completion(&outcome)).into_response())
}

/// Records a completed turn, or removes the thread entirely when the bridge
/// is configured to delete upstream chats after each completion.
async fn finish_turn(state: &AppState, thread: &ThreadContext, outcome: Option<&TurnOutcome>) {
    if state.runtime.delete_after_turn {
        if let Err(err) = state.gateway.delete_chat(&thread.chat_id).await {
            tracing::warn!(chat_id = %thread.chat_id, error = %err, "upstream chat delete failed");
        }
        if let Err(err) = state.sessions.delete(&thread.chat_id).await {
            tracing::warn!(chat_id = %thread.chat_id, error = %err, "session delete failed");
        }
        return;
    }
    let Some(outcome) = outcome else {
        return;
    };
    match persist_outcome(state.sessions.as_ref(), thread, outcome).await {
        Ok(true) => tracing::debug!(chat_id = %thread.chat_id, "session updated"),
        Ok(false) => {
            tracing::debug!(chat_id = %thread.chat_id, "turn had no answer or response id, session unchanged")
        }
        Err(err) => tracing::warn!(chat_id = %thread.chat_id, error = %err, "session update failed"),
    }
}
