use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay_error::RelayError;
use futures::future::BoxFuture;
use futures::{stream, StreamExt};
use serde_json::Value;
use thiserror::Error;

use super::{AgentBackend, AgentInvocation, NativeStream};

#[derive(Debug, Clone, PartialEq)]
pub enum MockStep {
    Message(Value),
    /// Fails the stream mid-flight with a stream error.
    Fail(String),
}

#[derive(Debug, Error)]
pub enum MockScriptError {
    #[error("failed to read mock script {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mock script line {line} is not json: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Replays a fixed list of native messages for every invocation.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    steps: Vec<MockStep>,
    start_error: Option<String>,
    delay: Option<Duration>,
    hang: bool,
    invocations: Arc<AtomicUsize>,
    last_invocation: Arc<Mutex<Option<AgentInvocation>>>,
}

impl MockBackend {
    pub fn new(steps: Vec<MockStep>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    pub fn from_messages<I>(messages: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Self::new(messages.into_iter().map(MockStep::Message).collect())
    }

    /// Parses a JSON-lines script. A `{"type":"mock_error","message":...}`
    /// line becomes a [`MockStep::Fail`]; every other line is replayed as is.
    pub fn from_script(script: &str) -> Result<Self, MockScriptError> {
        let mut steps = Vec::new();
        for (index, line) in script.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line).map_err(|source| {
                MockScriptError::Json {
                    line: index + 1,
                    source,
                }
            })?;
            if value.get("type").and_then(Value::as_str) == Some("mock_error") {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("mock failure")
                    .to_string();
                steps.push(MockStep::Fail(message));
            } else {
                steps.push(MockStep::Message(value));
            }
        }
        Ok(Self::new(steps))
    }

    pub fn from_script_file(path: &Path) -> Result<Self, MockScriptError> {
        let script = std::fs::read_to_string(path).map_err(|source| MockScriptError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_script(&script)
    }

    /// Makes `invoke` itself fail, as a spawn failure would.
    pub fn with_start_error(mut self, message: impl Into<String>) -> Self {
        self.start_error = Some(message.into());
        self
    }

    /// Sleeps before each step.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Never ends the stream after the last step.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn last_invocation(&self) -> Option<AgentInvocation> {
        self.last_invocation
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }
}

impl AgentBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn invoke(
        &self,
        invocation: AgentInvocation,
    ) -> BoxFuture<'_, Result<NativeStream, RelayError>> {
        Box::pin(async move {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                session_id = %invocation.session_id,
                steps = self.steps.len(),
                "mock backend invoked"
            );
            if let Ok(mut last) = self.last_invocation.lock() {
                *last = Some(invocation);
            }
            if let Some(message) = self.start_error.as_ref() {
                return Err(RelayError::Provider {
                    message: message.clone(),
                });
            }

            let delay = self.delay;
            let steps = stream::iter(self.steps.clone()).then(move |step| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                match step {
                    MockStep::Message(value) => Ok(value),
                    MockStep::Fail(message) => Err(RelayError::StreamError { message }),
                }
            });
            if self.hang {
                Ok(steps.chain(stream::pending()).boxed())
            } else {
                Ok(steps.boxed())
            }
        })
    }
}
