pub mod decode;
pub mod encode;

use crate::fingerprint::strip_tool_markup;
use crate::store::{SessionStore, StorageError, TurnRecord};
use crate::upstream::{UpstreamCallError, UpstreamErrorKind};
use decode::{Phase, UpstreamFrame, UpstreamPayload, Usage, decode_frame};
use encode::ChunkEnvelope;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Reasoning is flushed onto the first answer chunk after it accumulates.
    Stream,
    /// No chunks; reasoning is kept for the aggregate result.
    Aggregate,
}

/// Content of one outbound, non-terminal chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDelta {
    pub content: String,
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub content: String,
    pub reasoning_content: Option<String>,
    pub finish_reason: String,
    pub usage: Usage,
    pub response_id: Option<String>,
}

/// Per-request translation state for the upstream phased event stream.
#[derive(Debug, Clone)]
pub struct Translator {
    mode: OutputMode,
    reasoning: String,
    finish_reason: String,
    answer: String,
    response_id: Option<String>,
    usage: Usage,
}

impl Translator {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            reasoning: String::new(),
            finish_reason: "stop".to_string(),
            answer: String::new(),
            response_id: None,
            usage: Usage::default(),
        }
    }

    pub fn finish_reason(&self) -> &str {
        &self.finish_reason
    }

    pub fn apply(&mut self, payload: UpstreamPayload) -> Option<ChunkDelta> {
        if self.response_id.is_none() {
            self.response_id = payload.response_id;
        }

        let mut out = None;
        if let Some(delta) = payload.delta {
            match delta.phase {
                // appended on the finished event too
                Phase::Think => self.reasoning.push_str(&delta.content),
                Phase::Answer => out = self.push_answer(delta.content),
                Phase::Absent if !delta.content.is_empty() => out = self.push_answer(delta.content),
                Phase::Absent | Phase::Other(_) => {}
            }
            if delta.finished {
                self.finish_reason = delta.finish_reason.unwrap_or_else(|| "stop".to_string());
            }
        }

        if let Some(usage) = payload.usage {
            self.usage = usage;
        }
        out
    }

    fn push_answer(&mut self, content: String) -> Option<ChunkDelta> {
        self.answer.push_str(&content);
        match self.mode {
            OutputMode::Aggregate => None,
            OutputMode::Stream => {
                let reasoning_content = if self.reasoning.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut self.reasoning))
                };
                Some(ChunkDelta {
                    content,
                    reasoning_content,
                })
            }
        }
    }

    pub fn into_outcome(self) -> TurnOutcome {
        TurnOutcome {
            content: self.answer,
            reasoning_content: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning)
            },
            finish_reason: self.finish_reason,
            usage: self.usage,
            response_id: self.response_id,
        }
    }
}

#[derive(Debug)]
pub enum StreamEnd {
    Completed(TurnOutcome),
    Failed(String),
    Disconnected,
}

/// Payloads carried by one SSE event. Back-to-back `data:` lines arrive
/// joined by `\n` in a single event; every line is decoded on its own.
fn event_frames(data: &str) -> Vec<UpstreamFrame> {
    data.split('\n')
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match decode_frame(line) {
            Ok(frame) => Some(frame),
            Err(err) => {
                tracing::debug!(error = %err, "discarding undecodable upstream payload");
                None
            }
        })
        .collect()
}

/// Translates an upstream byte stream into chunk payloads on `tx`.
///
/// Every item sent is the data of one outbound SSE frame: chunk JSON, or the
/// `[DONE]` marker. Returns as soon as the receiver is gone, even while the
/// upstream is silent or only sending reasoning, dropping the upstream stream.
pub async fn stream_chunks<S, B, E>(
    upstream: S,
    envelope: &ChunkEnvelope,
    tx: &mpsc::Sender<String>,
) -> StreamEnd
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut translator = Translator::new(OutputMode::Stream);
    let mut events = std::pin::pin!(upstream.eventsource());
    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                tracing::debug!("downstream closed, stopping upstream read");
                return StreamEnd::Disconnected;
            }
            next = events.next() => next,
        };
        let frames = match next {
            // upstream closed without the sentinel; treated as a normal end
            None => vec![UpstreamFrame::Done],
            Some(Ok(event)) => event_frames(&event.data),
            Some(Err(EventStreamError::Transport(err))) => {
                let message = err.to_string();
                tracing::warn!(error = %message, "upstream stream failed");
                metrics::counter!("qwen_bridge_stream_errors_total").increment(1);
                let _ = tx.send(envelope.error_chunk(&message).to_string()).await;
                return StreamEnd::Failed(message);
            }
            Some(Err(err)) => {
                tracing::debug!(error = %err, "discarding malformed upstream frame");
                continue;
            }
        };

        for frame in frames {
            match frame {
                UpstreamFrame::Done => {
                    let terminal = envelope.terminal_chunk(translator.finish_reason());
                    if tx.send(terminal.to_string()).await.is_err()
                        || tx.send(decode::DONE_SENTINEL.to_string()).await.is_err()
                    {
                        return StreamEnd::Disconnected;
                    }
                    return StreamEnd::Completed(translator.into_outcome());
                }
                UpstreamFrame::Payload(payload) => {
                    if let Some(delta) = translator.apply(payload) {
                        let chunk = envelope
                            .content_chunk(&delta.content, delta.reasoning_content.as_deref());
                        if tx.send(chunk.to_string()).await.is_err() {
                            tracing::debug!("downstream closed, stopping upstream read");
                            return StreamEnd::Disconnected;
                        }
                    }
                }
            }
        }
    }
}

/// Runs the upstream stream to completion and returns the aggregate result.
pub async fn aggregate<S, B, E>(upstream: S) -> Result<TurnOutcome, UpstreamCallError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut translator = Translator::new(OutputMode::Aggregate);
    let mut events = std::pin::pin!(upstream.eventsource());
    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => event,
            Err(EventStreamError::Transport(err)) => {
                return Err(UpstreamCallError::new(
                    UpstreamErrorKind::Network,
                    None,
                    err.to_string(),
                ));
            }
            Err(err) => {
                tracing::debug!(error = %err, "discarding malformed upstream frame");
                continue;
            }
        };
        for frame in event_frames(&event.data) {
            match frame {
                UpstreamFrame::Done => return Ok(translator.into_outcome()),
                UpstreamFrame::Payload(payload) => {
                    translator.apply(payload);
                }
            }
        }
    }
    Ok(translator.into_outcome())
}

/// Thread the finished turn belongs to.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    pub chat_id: String,
    pub title: String,
    pub created_at: i64,
}

/// Stores the finished turn as the thread's new tip. Skipped when the turn
/// produced no answer or the upstream never announced a response id.
pub async fn persist_outcome(
    store: &dyn SessionStore,
    thread: &ThreadContext,
    outcome: &TurnOutcome,
) -> Result<bool, StorageError> {
    let Some(response_id) = outcome.response_id.as_ref() else {
        return Ok(false);
    };
    if outcome.content.is_empty() {
        return Ok(false);
    }
    store
        .record_turn(&TurnRecord {
            chat_id: thread.chat_id.clone(),
            title: thread.title.clone(),
            chat_type: "t2t".to_string(),
            created_at: thread.created_at,
            updated_at: chrono::Utc::now().timestamp(),
            current_response_id: response_id.clone(),
            last_assistant_content: strip_tool_markup(&outcome.content),
        })
        .await?;
    Ok(true)
}
