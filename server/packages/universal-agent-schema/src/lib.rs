use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub mod agents;
pub mod native;

pub use agents::claude as convert_claude;
pub use native::{DecodeError, NativeMessage};

/// Canonical event emitted for every agent, independent of the native
/// streaming vocabulary it was translated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    StartStep,
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputEnd {
        tool_call_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        input: Value,
        output: Value,
    },
    #[serde(rename_all = "camelCase")]
    FinishStep {
        finish_reason: FinishReason,
        usage: Usage,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
    },
}

impl StreamChunk {
    pub fn error(error_text: impl Into<String>) -> Self {
        Self::Error {
            error_text: error_text.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Wire name of the chunk, as written in its `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartStep => "start-step",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ToolInputStart { .. } => "tool-input-start",
            Self::ToolInputDelta { .. } => "tool-input-delta",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolInputEnd { .. } => "tool-input-end",
            Self::ToolResult { .. } => "tool-result",
            Self::FinishStep { .. } => "finish-step",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other,
}

impl FinishReason {
    pub fn from_stop_reason(stop_reason: Option<&str>) -> Self {
        match stop_reason {
            Some("tool_use") => Self::ToolCalls,
            Some("end_turn") | Some("stop_sequence") => Self::Stop,
            Some("max_tokens") => Self::Length,
            _ => Self::Other,
        }
    }
}

/// Token usage for one step. `total_tokens` is always the sum of the other two.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }

    pub fn add(&self, other: &Usage) -> Self {
        Self::new(
            self.input_tokens.saturating_add(other.input_tokens),
            self.output_tokens.saturating_add(other.output_tokens),
        )
    }
}

/// Correlates every event of one tool call, from its first streamed input
/// fragment to its result.
pub fn tool_call_id(session_id: &str, native_tool_id: &str) -> String {
    format!("{session_id}:{native_tool_id}")
}
