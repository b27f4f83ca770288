use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::native::{
    AssistantMessage, BlockDelta, ContentBlock, NativeMessage, NativeUsage, ResultMessage,
    StreamEvent, SystemMessage, UserContent, UserContentBlock, UserMessage,
};
use crate::{tool_call_id, FinishReason, StreamChunk, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Tool,
}

/// Bookkeeping for one open content block, keyed by its native index.
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub index: u32,
    pub kind: BlockKind,
    pub canonical_id: String,
    pub tool_name: Option<String>,
    pub json_buffer: String,
    native_tool_id: Option<String>,
}

impl BlockEntry {
    fn text(index: u32, canonical_id: String) -> Self {
        Self {
            index,
            kind: BlockKind::Text,
            canonical_id,
            tool_name: None,
            json_buffer: String::new(),
            native_tool_id: None,
        }
    }

    fn tool(index: u32, native_tool_id: &str, canonical_id: String, tool_name: String) -> Self {
        Self {
            index,
            kind: BlockKind::Tool,
            canonical_id,
            tool_name: Some(tool_name),
            json_buffer: String::new(),
            native_tool_id: Some(native_tool_id.to_string()),
        }
    }
}

/// State of a single prompt/response exchange.
#[derive(Debug, Clone)]
pub struct StreamState {
    message_id: String,
    blocks: BTreeMap<u32, BlockEntry>,
    input_tokens: u64,
    output_tokens: u64,
    stop_reason: Option<String>,
    finished: bool,
}

impl StreamState {
    fn new(message_id: String) -> Self {
        Self {
            message_id,
            blocks: BTreeMap::new(),
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
            finished: false,
        }
    }

    pub fn usage(&self) -> Usage {
        Usage::new(self.input_tokens, self.output_tokens)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn open_blocks(&self) -> impl Iterator<Item = &BlockEntry> {
        self.blocks.values()
    }

    fn record_usage(&mut self, usage: Option<&NativeUsage>) {
        let Some(usage) = usage else {
            return;
        };
        if let Some(input) = usage.input_tokens {
            self.input_tokens = input;
        }
        if let Some(output) = usage.output_tokens {
            self.output_tokens = output;
        }
    }
}

#[derive(Debug, Clone)]
struct ToolRecord {
    name: String,
    input: Value,
    announced: bool,
}

/// What the backend reported in its closing `result` message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub subtype: Option<String>,
    pub is_error: bool,
    pub num_turns: Option<u32>,
    pub duration_ms: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub result: Option<String>,
}

/// Translates Claude's native stream-json messages into canonical chunks.
///
/// One instance lives for one invocation. The per-turn [`StreamState`] is
/// replaced on every `message_start`; the tool ledger spans the whole
/// invocation because tool results arrive after the turn that requested them
/// has finished.
#[derive(Debug)]
pub struct ClaudeTransform {
    session_id: String,
    turn: Option<StreamState>,
    tools: HashMap<String, ToolRecord>,
    partial: bool,
    turns_started: u64,
    finished_turns: u32,
    usage: Usage,
    native_session_id: Option<String>,
    summary: Option<RunSummary>,
}

impl ClaudeTransform {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            turn: None,
            tools: HashMap::new(),
            partial: false,
            turns_started: 0,
            finished_turns: 0,
            usage: Usage::default(),
            native_session_id: None,
            summary: None,
        }
    }

    pub fn turn(&self) -> Option<&StreamState> {
        self.turn.as_ref()
    }

    pub fn finished_turns(&self) -> u32 {
        self.finished_turns
    }

    /// Usage summed over every finished turn.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn native_session_id(&self) -> Option<&str> {
        self.native_session_id.as_deref()
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }

    pub fn push(&mut self, message: &NativeMessage) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        match message {
            NativeMessage::Stream(event) => {
                self.partial = true;
                self.stream_event(event, &mut out);
            }
            NativeMessage::Assistant(message) => self.assistant(message, &mut out),
            NativeMessage::User(message) => self.user(message, &mut out),
            NativeMessage::System(message) => self.system(message),
            NativeMessage::Result(message) => self.result(message),
            NativeMessage::Unknown { kind } => {
                tracing::warn!(
                    session_id = %self.session_id,
                    kind = %kind,
                    "skipping unsupported native message"
                );
            }
        }
        out
    }

    fn stream_event(&mut self, event: &StreamEvent, out: &mut Vec<StreamChunk>) {
        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(turn) = self.turn.as_mut().filter(|turn| !turn.finished) {
                    tracing::warn!(
                        session_id = %self.session_id,
                        message_id = %turn.message_id,
                        "message_start before previous turn finished"
                    );
                    close_open_blocks(turn, out);
                }
                self.begin_turn(message.id.clone(), out);
                if let Some(turn) = self.turn.as_mut() {
                    turn.record_usage(message.usage.as_ref());
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.block_start(*index, content_block, out),
            StreamEvent::ContentBlockDelta { index, delta } => {
                self.block_delta(*index, delta, out)
            }
            StreamEvent::ContentBlockStop { index } => self.block_stop(*index, out),
            StreamEvent::MessageDelta { delta, usage } => {
                let Some(turn) = self.turn.as_mut().filter(|turn| !turn.finished) else {
                    tracing::warn!(session_id = %self.session_id, "message_delta outside an open turn");
                    return;
                };
                if delta.stop_reason.is_some() {
                    turn.stop_reason = delta.stop_reason.clone();
                }
                turn.record_usage(usage.as_ref());
            }
            StreamEvent::MessageStop => {
                if self.turn.as_ref().map_or(true, |turn| turn.finished) {
                    tracing::warn!(session_id = %self.session_id, "message_stop outside an open turn");
                    return;
                }
                self.finish_turn(out);
            }
        }
    }

    fn block_start(&mut self, index: u32, block: &ContentBlock, out: &mut Vec<StreamChunk>) {
        if self.turn.as_ref().map_or(true, |turn| turn.finished) {
            tracing::warn!(
                session_id = %self.session_id,
                index,
                "content block without message_start, opening a turn"
            );
            self.begin_turn(None, out);
        }
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        if turn.blocks.contains_key(&index) {
            tracing::warn!(session_id = %self.session_id, index, "content block index already open");
            return;
        }

        match block {
            ContentBlock::Text { .. } => {
                let id = format!("{}:{index}", turn.message_id);
                turn.blocks.insert(index, BlockEntry::text(index, id.clone()));
                out.push(StreamChunk::TextStart { id });
            }
            ContentBlock::ToolUse { id, name, .. } => {
                let call_id = tool_call_id(&self.session_id, id);
                turn.blocks.insert(
                    index,
                    BlockEntry::tool(index, id, call_id.clone(), name.clone()),
                );
                self.tools.insert(
                    id.clone(),
                    ToolRecord {
                        name: name.clone(),
                        input: Value::Null,
                        announced: true,
                    },
                );
                out.push(StreamChunk::ToolInputStart {
                    tool_call_id: call_id,
                    tool_name: name.clone(),
                });
            }
            ContentBlock::Other => {
                tracing::warn!(session_id = %self.session_id, index, "skipping unsupported content block");
            }
        }
    }

    fn block_delta(&mut self, index: u32, delta: &BlockDelta, out: &mut Vec<StreamChunk>) {
        let Some(turn) = self.turn.as_mut().filter(|turn| !turn.finished) else {
            tracing::warn!(session_id = %self.session_id, index, "content delta outside an open turn");
            return;
        };
        let Some(entry) = turn.blocks.get_mut(&index) else {
            tracing::warn!(session_id = %self.session_id, index, "content delta for unknown block");
            return;
        };

        match (entry.kind, delta) {
            (BlockKind::Text, BlockDelta::TextDelta { text }) => {
                out.push(StreamChunk::TextDelta {
                    id: entry.canonical_id.clone(),
                    delta: text.clone(),
                });
            }
            (BlockKind::Tool, BlockDelta::InputJsonDelta { partial_json }) => {
                entry.json_buffer.push_str(partial_json);
                out.push(StreamChunk::ToolInputDelta {
                    tool_call_id: entry.canonical_id.clone(),
                    input_text_delta: partial_json.clone(),
                });
            }
            (kind, _) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    index,
                    block_kind = ?kind,
                    "skipping delta that does not match its block"
                );
            }
        }
    }

    fn block_stop(&mut self, index: u32, out: &mut Vec<StreamChunk>) {
        let Some(turn) = self.turn.as_mut().filter(|turn| !turn.finished) else {
            tracing::warn!(session_id = %self.session_id, index, "content block stop outside an open turn");
            return;
        };
        let Some(entry) = turn.blocks.remove(&index) else {
            tracing::warn!(session_id = %self.session_id, index, "content block stop for unknown block");
            return;
        };

        if !entry.json_buffer.is_empty() {
            // Fallback input for backends that never send the resolved assistant message.
            let record = entry
                .native_tool_id
                .as_ref()
                .and_then(|native_id| self.tools.get_mut(native_id));
            if let Some(record) = record {
                if record.input.is_null() {
                    match serde_json::from_str(&entry.json_buffer) {
                        Ok(input) => record.input = input,
                        Err(err) => tracing::debug!(
                            session_id = %self.session_id,
                            index,
                            error = %err,
                            "accumulated tool input is not valid json"
                        ),
                    }
                }
            }
        }
        out.push(end_chunk(entry));
    }

    fn assistant(&mut self, message: &AssistantMessage, out: &mut Vec<StreamChunk>) {
        if self.native_session_id.is_none() {
            self.native_session_id = message.session_id.clone();
        }

        if self.partial {
            for block in &message.message.content {
                if let ContentBlock::ToolUse { id, name, input } = block {
                    self.resolved_tool_call(id, name, input, out);
                }
            }
            return;
        }

        // Without partial messages every assistant envelope is a whole step.
        self.begin_turn(message.message.id.clone(), out);
        let message_id = match self.turn.as_mut() {
            Some(turn) => {
                turn.record_usage(message.message.usage.as_ref());
                turn.stop_reason = message.message.stop_reason.clone();
                turn.message_id.clone()
            }
            None => return,
        };
        for (index, block) in message.message.content.iter().enumerate() {
            match block {
                ContentBlock::Text { text } => {
                    let id = format!("{message_id}:{index}");
                    out.push(StreamChunk::TextStart { id: id.clone() });
                    if !text.is_empty() {
                        out.push(StreamChunk::TextDelta {
                            id: id.clone(),
                            delta: text.clone(),
                        });
                    }
                    out.push(StreamChunk::TextEnd { id });
                }
                ContentBlock::ToolUse { id, name, input } => {
                    self.resolved_tool_call(id, name, input, out);
                }
                ContentBlock::Other => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        index,
                        "skipping unsupported content block"
                    );
                }
            }
        }
        self.finish_turn(out);
    }

    /// Emits the structured `tool-call` for a resolved tool_use block. Tools
    /// that were never streamed get their start and end synthesized around it.
    fn resolved_tool_call(
        &mut self,
        native_id: &str,
        name: &str,
        input: &Value,
        out: &mut Vec<StreamChunk>,
    ) {
        let call_id = tool_call_id(&self.session_id, native_id);
        let record = self
            .tools
            .entry(native_id.to_string())
            .or_insert_with(|| ToolRecord {
                name: name.to_string(),
                input: Value::Null,
                announced: false,
            });
        record.input = input.clone();

        let synthesize = !record.announced;
        record.announced = true;
        if synthesize {
            out.push(StreamChunk::ToolInputStart {
                tool_call_id: call_id.clone(),
                tool_name: name.to_string(),
            });
        }
        out.push(StreamChunk::ToolCall {
            tool_call_id: call_id.clone(),
            tool_name: name.to_string(),
            input: input.clone(),
        });
        if synthesize {
            out.push(StreamChunk::ToolInputEnd {
                tool_call_id: call_id,
            });
        }
    }

    fn user(&mut self, message: &UserMessage, out: &mut Vec<StreamChunk>) {
        let UserContent::Blocks(blocks) = &message.message.content else {
            return;
        };
        for block in blocks {
            let UserContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = block
            else {
                continue;
            };
            let Some(record) = self.tools.get(tool_use_id) else {
                tracing::warn!(
                    session_id = %self.session_id,
                    tool_use_id = %tool_use_id,
                    "tool result for unknown tool call"
                );
                continue;
            };
            if *is_error {
                tracing::debug!(
                    session_id = %self.session_id,
                    tool_use_id = %tool_use_id,
                    tool_name = %record.name,
                    "tool reported an error result"
                );
            }
            out.push(StreamChunk::ToolResult {
                tool_call_id: tool_call_id(&self.session_id, tool_use_id),
                tool_name: record.name.clone(),
                input: record.input.clone(),
                output: content.clone(),
            });
        }
    }

    fn system(&mut self, message: &SystemMessage) {
        tracing::debug!(
            session_id = %self.session_id,
            subtype = ?message.subtype,
            native_session_id = ?message.session_id,
            model = ?message.model,
            "agent system message"
        );
        if message.session_id.is_some() {
            self.native_session_id = message.session_id.clone();
        }
    }

    fn result(&mut self, message: &ResultMessage) {
        if self.native_session_id.is_none() {
            self.native_session_id = message.session_id.clone();
        }
        if self.turn.as_ref().is_some_and(|turn| !turn.finished) {
            tracing::warn!(session_id = %self.session_id, "result arrived while a turn is still open");
        }
        self.summary = Some(RunSummary {
            subtype: message.subtype.clone(),
            is_error: message.is_error,
            num_turns: message.num_turns,
            duration_ms: message.duration_ms,
            total_cost_usd: message.total_cost_usd,
            result: message.result.clone(),
        });
    }

    fn begin_turn(&mut self, message_id: Option<String>, out: &mut Vec<StreamChunk>) {
        self.turns_started += 1;
        let message_id = message_id
            .unwrap_or_else(|| format!("{}-turn-{}", self.session_id, self.turns_started));
        self.turn = Some(StreamState::new(message_id));
        out.push(StreamChunk::StartStep);
    }

    fn finish_turn(&mut self, out: &mut Vec<StreamChunk>) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        if !turn.blocks.is_empty() {
            tracing::warn!(
                session_id = %self.session_id,
                open_blocks = turn.blocks.len(),
                "closing blocks left open at message_stop"
            );
            close_open_blocks(turn, out);
        }
        turn.finished = true;
        let usage = turn.usage();
        out.push(StreamChunk::FinishStep {
            finish_reason: FinishReason::from_stop_reason(turn.stop_reason.as_deref()),
            usage,
        });
        self.usage = self.usage.add(&usage);
        self.finished_turns += 1;
    }
}

fn end_chunk(entry: BlockEntry) -> StreamChunk {
    match entry.kind {
        BlockKind::Text => StreamChunk::TextEnd {
            id: entry.canonical_id,
        },
        BlockKind::Tool => StreamChunk::ToolInputEnd {
            tool_call_id: entry.canonical_id,
        },
    }
}

fn close_open_blocks(turn: &mut StreamState, out: &mut Vec<StreamChunk>) {
    let blocks = std::mem::take(&mut turn.blocks);
    out.extend(blocks.into_values().map(end_chunk));
}
