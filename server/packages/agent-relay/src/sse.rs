//! Frames driver events as Server-Sent Events.
//!
//! Every stream ends with exactly one `data: [DONE]` frame, whether the
//! invocation completed, failed, timed out or lost its driver. Once the
//! bridge has ended it writes nothing more and its receiver is closed, so a
//! driver still running sees nobody listening.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::time::{Duration, Instant};

use agent_relay_error::RelayError;
use agent_relay_universal_agent_schema::StreamChunk;
use axum::http::{header, HeaderName, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{stream, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Sleep;

use crate::driver::DriverEvent;

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Ceiling on the whole stream, measured from the moment the bridge
    /// starts listening.
    pub timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_STREAM_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Chunk(Value),
    Done,
}

impl SseFrame {
    /// The `data:` payload of the frame.
    pub fn data(&self) -> String {
        match self {
            Self::Chunk(value) => value.to_string(),
            Self::Done => DONE_MARKER.to_string(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl From<SseFrame> for Event {
    fn from(frame: SseFrame) -> Self {
        Event::default().data(frame.data())
    }
}

pub struct SseBridge {
    session_id: String,
    events: mpsc::Receiver<DriverEvent>,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
    include_raw: bool,
    ended: bool,
    pending: VecDeque<SseFrame>,
    frames: u64,
    started: Instant,
}

impl SseBridge {
    pub fn new(
        session_id: impl Into<String>,
        events: mpsc::Receiver<DriverEvent>,
        timeout: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            events,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            timeout,
            include_raw: false,
            ended: false,
            pending: VecDeque::new(),
            frames: 0,
            started: Instant::now(),
        }
    }

    /// Attach each chunk's native message under `raw`.
    pub fn with_raw(mut self, include_raw: bool) -> Self {
        self.include_raw = include_raw;
        self
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Next frame to write, or `None` once the stream is over.
    pub async fn next_frame(&mut self) -> Option<SseFrame> {
        if self.pending.is_empty() && !self.ended {
            self.poll_driver().await;
        }
        let frame = self.pending.pop_front()?;
        self.frames += 1;
        Some(frame)
    }

    async fn poll_driver(&mut self) {
        tokio::select! {
            biased;
            _ = &mut self.deadline => {
                tracing::warn!(
                    session_id = %self.session_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    frames = self.frames,
                    "stream timed out"
                );
                let err = RelayError::Timeout {
                    message: format!("stream exceeded {:?}", self.timeout),
                };
                self.end_with_error(&err);
            }
            event = self.events.recv() => match event {
                Some(DriverEvent::Chunk { chunk, raw }) => {
                    let is_error = chunk.is_error();
                    let frame = self.chunk_frame(chunk, raw);
                    self.pending.push_back(frame);
                    if is_error {
                        self.pending.push_back(SseFrame::Done);
                        self.end();
                    }
                }
                Some(DriverEvent::Complete(completion)) => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        success = completion.success,
                        frames = self.frames,
                        elapsed_ms = self.started.elapsed().as_millis() as u64,
                        "stream complete"
                    );
                    self.pending.push_back(SseFrame::Done);
                    self.end();
                }
                None => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        "driver channel closed without completion"
                    );
                    let err = RelayError::StreamError {
                        message: "invocation ended without completing".to_string(),
                    };
                    self.end_with_error(&err);
                }
            }
        }
    }

    fn chunk_frame(&self, chunk: StreamChunk, raw: Option<Value>) -> SseFrame {
        let mut value = match serde_json::to_value(&chunk) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "failed to encode chunk");
                return error_frame(&format!("failed to encode {} chunk", chunk.kind()));
            }
        };
        if self.include_raw {
            if let (Value::Object(map), Some(raw)) = (&mut value, raw) {
                map.insert("raw".to_string(), raw);
            }
        }
        SseFrame::Chunk(value)
    }

    fn end_with_error(&mut self, err: &RelayError) {
        self.pending.push_back(error_frame(&err.to_string()));
        self.pending.push_back(SseFrame::Done);
        self.end();
    }

    fn end(&mut self) {
        self.ended = true;
        self.events.close();
    }

    /// Stops listening. Frames already queued are discarded.
    pub fn disconnect(&mut self) {
        if !self.ended {
            tracing::info!(
                session_id = %self.session_id,
                frames = self.frames,
                "client disconnected"
            );
        }
        self.pending.clear();
        self.end();
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
        stream::unfold(self, |mut bridge| async move {
            let frame = bridge.next_frame().await?;
            Some((Ok(Event::from(frame)), bridge))
        })
    }

    /// Answers with the event stream right away, so the head and keep-alive
    /// comments reach the client before the agent has produced anything.
    pub fn into_response(self, keep_alive: Duration) -> Response {
        let body = self.into_stream();
        let mut response = Sse::new(body)
            .keep_alive(KeepAlive::new().interval(keep_alive))
            .into_response();
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        );
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        response
    }
}

impl Drop for SseBridge {
    fn drop(&mut self) {
        if !self.ended {
            self.disconnect();
        }
    }
}

fn error_frame(error_text: &str) -> SseFrame {
    SseFrame::Chunk(json!({"type": "error", "errorText": error_text}))
}
