use serde_json::Value;

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Think,
    Answer,
    Absent,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseDelta {
    pub phase: Phase,
    pub finished: bool,
    pub content: String,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub reasoning_tokens: u64,
}

/// Everything one upstream data line can carry. The three carriers are
/// independent; a line may hold any subset of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamPayload {
    pub response_id: Option<String>,
    pub usage: Option<Usage>,
    pub delta: Option<PhaseDelta>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFrame {
    Done,
    Payload(UpstreamPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(String),
    #[error("payload is not an object")]
    NotObject,
}

/// Decodes the data field of one SSE frame.
pub fn decode_frame(data: &str) -> Result<UpstreamFrame, DecodeError> {
    if data.trim() == DONE_SENTINEL {
        return Ok(UpstreamFrame::Done);
    }
    let value: Value = serde_json::from_str(data).map_err(|err| DecodeError::Json(err.to_string()))?;
    let obj = value.as_object().ok_or(DecodeError::NotObject)?;

    let response_id = obj
        .get("response.created")
        .and_then(|v| v.get("response_id"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let usage = obj.get("usage").and_then(|v| v.as_object()).map(|u| {
        let read = |key: &str| u.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        Usage {
            prompt_tokens: read("input_tokens"),
            completion_tokens: read("output_tokens"),
            total_tokens: read("total_tokens"),
            reasoning_tokens: u
                .get("output_tokens_details")
                .and_then(|d| d.get("reasoning_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        }
    });

    let delta = obj
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|v| v.as_object())
        .map(|delta| {
            let phase = match delta.get("phase").and_then(|v| v.as_str()) {
                None => Phase::Absent,
                Some("think") => Phase::Think,
                Some("answer") => Phase::Answer,
                Some(other) => Phase::Other(other.to_string()),
            };
            PhaseDelta {
                phase,
                finished: delta.get("status").and_then(|v| v.as_str()) == Some("finished"),
                content: delta
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                finish_reason: delta
                    .get("finish_reason")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            }
        });

    Ok(UpstreamFrame::Payload(UpstreamPayload {
        response_id,
        usage,
        delta,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(data: &str) -> UpstreamPayload {
        match decode_frame(data).expect("decodes") {
            UpstreamFrame::Payload(p) => p,
            UpstreamFrame::Done => panic!("unexpected done"),
        }
    }

    #[test]
    fn sentinel_is_done() {
        assert_eq!(decode_frame("[DONE]"), Ok(UpstreamFrame::Done));
        assert_eq!(decode_frame(" [DONE] "), Ok(UpstreamFrame::Done));
    }

    #[test]
    fn reads_response_created() {
        let p = payload(r#"{"response.created":{"chat_id":"c","parent_id":"p","response_id":"r-1"}}"#);
        assert_eq!(p.response_id.as_deref(), Some("r-1"));
        assert!(p.delta.is_none());
    }

    #[test]
    fn reads_phase_delta() {
        let p = payload(
            r#"{"choices":[{"delta":{"role":"assistant","content":"hi","phase":"answer","status":"typing"}}]}"#,
        );
        let delta = p.delta.expect("delta");
        assert_eq!(delta.phase, Phase::Answer);
        assert!(!delta.finished);
        assert_eq!(delta.content, "hi");

        let p = payload(r#"{"choices":[{"delta":{"content":"","phase":"think","status":"finished","finish_reason":"length"}}]}"#);
        let delta = p.delta.expect("delta");
        assert_eq!(delta.phase, Phase::Think);
        assert!(delta.finished);
        assert_eq!(delta.finish_reason.as_deref(), Some("length"));
    }

    #[test]
    fn missing_and_unknown_phase() {
        let p = payload(r#"{"choices":[{"delta":{"content":"x"}}]}"#);
        assert_eq!(p.delta.expect("delta").phase, Phase::Absent);
        let p = payload(r#"{"choices":[{"delta":{"content":"x","phase":"web_search"}}]}"#);
        assert_eq!(
            p.delta.expect("delta").phase,
            Phase::Other("web_search".to_string())
        );
    }

    #[test]
    fn maps_usage_fields() {
        let p = payload(
            r#"{"choices":[{"delta":{"content":""}}],"usage":{"input_tokens":11,"output_tokens":7,"total_tokens":18,"output_tokens_details":{"reasoning_tokens":3}}}"#,
        );
        assert_eq!(
            p.usage,
            Some(Usage {
                prompt_tokens: 11,
                completion_tokens: 7,
                total_tokens: 18,
                reasoning_tokens: 3,
            })
        );
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(decode_frame("{not json"), Err(DecodeError::Json(_))));
        assert_eq!(decode_frame("[1,2]"), Err(DecodeError::NotObject));
    }
}
