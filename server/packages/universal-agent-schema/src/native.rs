//! Native Claude agent messages, as printed by `claude --output-format
//! stream-json`.
//!
//! The six raw API streaming events may arrive bare or wrapped in a
//! `{"type":"stream_event","event":{...}}` envelope; both decode to
//! [`NativeMessage::Stream`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const STREAM_EVENT_KINDS: &[&str] = &[
    "message_start",
    "content_block_start",
    "content_block_delta",
    "content_block_stop",
    "message_delta",
    "message_stop",
];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("native message has no `type` field")]
    MissingType,
    #[error("`{kind}` message is missing `{field}`")]
    MissingField { kind: String, field: &'static str },
    #[error("malformed `{kind}` message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum NativeMessage {
    Stream(StreamEvent),
    Assistant(AssistantMessage),
    User(UserMessage),
    System(SystemMessage),
    Result(ResultMessage),
    /// A message kind outside the supported set; carries the `type` for logging.
    Unknown { kind: String },
}

impl NativeMessage {
    pub fn parse(value: &Value) -> Result<Self, DecodeError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;
        let message = match kind {
            "stream_event" => {
                let event = value.get("event").ok_or_else(|| DecodeError::MissingField {
                    kind: kind.to_string(),
                    field: "event",
                })?;
                let inner = event
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or(DecodeError::MissingType)?;
                if !STREAM_EVENT_KINDS.contains(&inner) {
                    return Ok(Self::Unknown {
                        kind: format!("stream_event/{inner}"),
                    });
                }
                Self::Stream(decode(inner, event)?)
            }
            kind if STREAM_EVENT_KINDS.contains(&kind) => Self::Stream(decode(kind, value)?),
            "assistant" => Self::Assistant(decode(kind, value)?),
            "user" => Self::User(decode(kind, value)?),
            "system" => Self::System(decode(kind, value)?),
            "result" => Self::Result(decode(kind, value)?),
            other => Self::Unknown {
                kind: other.to_string(),
            },
        };
        Ok(message)
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Stream(event) => event.kind(),
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::System(_) => "system",
            Self::Result(_) => "result",
            Self::Unknown { kind } => kind,
        }
    }
}

fn decode<T: DeserializeOwned>(kind: &str, value: &Value) -> Result<T, DecodeError> {
    T::deserialize(value).map_err(|source| DecodeError::Malformed {
        kind: kind.to_string(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStartPayload,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaPayload,
        #[serde(default)]
        usage: Option<NativeUsage>,
    },
    MessageStop,
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::ContentBlockStart { .. } => "content_block_start",
            Self::ContentBlockDelta { .. } => "content_block_delta",
            Self::ContentBlockStop { .. } => "content_block_stop",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageStop => "message_stop",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageStartPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<NativeUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaPayload {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// Thinking, images, server tool blocks and anything newer.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub message: ApiMessage,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

/// A fully resolved API message, as carried by `assistant` envelopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<NativeUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub message: UserPayload,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub content: UserContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<UserContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContentBlock {
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub usage: Option<NativeUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrapped_and_bare_stream_events_decode_alike() {
        let bare = json!({"type": "content_block_stop", "index": 2});
        let wrapped = json!({
            "type": "stream_event",
            "session_id": "native-1",
            "event": {"type": "content_block_stop", "index": 2}
        });
        let expected = NativeMessage::Stream(StreamEvent::ContentBlockStop { index: 2 });
        assert_eq!(NativeMessage::parse(&bare).expect("bare"), expected);
        assert_eq!(NativeMessage::parse(&wrapped).expect("wrapped"), expected);
    }

    #[test]
    fn unknown_kinds_are_preserved_for_logging() {
        let ping = json!({"type": "stream_event", "event": {"type": "ping"}});
        assert_eq!(
            NativeMessage::parse(&ping).expect("ping"),
            NativeMessage::Unknown {
                kind: "stream_event/ping".to_string()
            }
        );
        let other = json!({"type": "keep_alive"});
        assert_eq!(NativeMessage::parse(&other).expect("other").kind(), "keep_alive");
    }

    #[test]
    fn unknown_block_and_delta_kinds_fall_back_to_other() {
        let thinking = json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "thinking", "thinking": ""}
        });
        assert_eq!(
            NativeMessage::parse(&thinking).expect("thinking"),
            NativeMessage::Stream(StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::Other,
            })
        );
        let signature = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "signature_delta", "signature": "abc"}
        });
        assert!(matches!(
            NativeMessage::parse(&signature).expect("signature"),
            NativeMessage::Stream(StreamEvent::ContentBlockDelta {
                delta: BlockDelta::Other,
                ..
            })
        ));
    }

    #[test]
    fn user_content_accepts_text_and_tool_results() {
        let text = json!({"type": "user", "message": {"role": "user", "content": "hi"}});
        let NativeMessage::User(user) = NativeMessage::parse(&text).expect("text") else {
            panic!("expected user message");
        };
        assert_eq!(user.message.content, UserContent::Text("hi".to_string()));

        let result = json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "tool_use_id": "tool-1", "content": "ok"}]}
        });
        let NativeMessage::User(user) = NativeMessage::parse(&result).expect("result") else {
            panic!("expected user message");
        };
        assert_eq!(
            user.message.content,
            UserContent::Blocks(vec![UserContentBlock::ToolResult {
                tool_use_id: "tool-1".to_string(),
                content: json!("ok"),
                is_error: false,
            }])
        );
    }

    #[test]
    fn malformed_known_kind_is_an_error() {
        let bad = json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "x"}});
        let err = NativeMessage::parse(&bad).expect_err("index is required");
        assert!(matches!(err, DecodeError::Malformed { .. }));
        assert!(matches!(
            NativeMessage::parse(&json!({"index": 0})),
            Err(DecodeError::MissingType)
        ));
    }
}
