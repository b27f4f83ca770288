//! Owns one agent invocation end to end.
//!
//! The driver validates the request, starts the backend, runs every native
//! message through a [`ClaudeTransform`] and republishes the canonical chunks
//! on a bounded channel. Whatever happens, a listener that stays attached
//! sees exactly one [`DriverEvent::Complete`] and nothing after it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use agent_relay_error::{ErrorSummary, RelayError};
use agent_relay_universal_agent_schema::convert_claude::ClaudeTransform;
use agent_relay_universal_agent_schema::{NativeMessage, StreamChunk, Usage};
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use utoipa::ToSchema;

use crate::backend::{AgentBackend, AgentInvocation, PermissionMode};
use crate::resolver::{ModelResolver, ProviderCredential};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfiguration {
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvocationInput {
    pub prompt: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_credential: Option<ProviderCredential>,
    #[serde(default)]
    pub configuration: AgentConfiguration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
}

/// Terminal record of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub success: bool,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_session_id: Option<String>,
    /// Every native message the backend produced, verbatim.
    pub messages: Vec<Value>,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Chunk {
        chunk: StreamChunk,
        /// The native message the chunk was derived from. `None` for chunks
        /// the driver synthesizes itself.
        raw: Option<Value>,
    },
    Complete(Completion),
}

impl DriverEvent {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

#[derive(Debug, Clone)]
pub struct InvocationDriver {
    backend: Arc<dyn AgentBackend>,
    resolver: Arc<dyn ModelResolver>,
    channel_capacity: usize,
}

impl InvocationDriver {
    pub fn new(backend: Arc<dyn AgentBackend>, resolver: Arc<dyn ModelResolver>) -> Self {
        Self {
            backend,
            resolver,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Spawns the invocation on its own task and returns the only receiver.
    pub fn start(&self, input: InvocationInput) -> mpsc::Receiver<DriverEvent> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let driver = self.clone();
        tokio::spawn(async move {
            driver.run(input, tx).await;
        });
        rx
    }

    pub async fn run(&self, input: InvocationInput, tx: mpsc::Sender<DriverEvent>) {
        let started = Instant::now();
        let session_id = input.session_id.clone();
        let mut sink = EventSink::new(tx, session_id.clone());
        let mut run = RunRecord::new(&session_id, started);
        tracing::info!(
            session_id = %session_id,
            model_id = %input.model_id,
            backend = %self.backend.name(),
            "invocation started"
        );

        let invocation = match self.validate(&input).await {
            Ok(invocation) => invocation,
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "invocation rejected");
                sink.fail(&err, run.finish(Some(&err))).await;
                return;
            }
        };

        let mut stream = match self.backend.invoke(invocation).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(session_id = %session_id, error = %err, "backend failed to start");
                sink.fail(&err, run.finish(Some(&err))).await;
                return;
            }
        };

        loop {
            // A stalled backend never yields, so watch the receiver as well.
            let next = tokio::select! {
                _ = sink.detached() => {
                    tracing::info!(
                        session_id = %session_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "listener detached; abandoning invocation"
                    );
                    return;
                }
                next = stream.next() => next,
            };
            let Some(item) = next else {
                break;
            };
            let raw = match item {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::error!(session_id = %session_id, error = %err, "backend stream failed");
                    sink.fail(&err, run.finish(Some(&err))).await;
                    return;
                }
            };
            run.messages.push(raw.clone());
            let message = match NativeMessage::parse(&raw) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %err,
                        "skipping undecodable native message"
                    );
                    continue;
                }
            };
            for chunk in run.transform.push(&message) {
                if !sink.chunk(chunk, Some(raw.clone())).await {
                    tracing::info!(
                        session_id = %session_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "listener detached; abandoning invocation"
                    );
                    return;
                }
            }
        }

        let completion = run.finish(None);
        tracing::info!(
            session_id = %session_id,
            num_turns = completion.num_turns,
            total_tokens = completion.usage.total_tokens,
            duration_ms = completion.duration_ms,
            "invocation finished"
        );
        sink.complete(completion).await;
    }

    /// Checks every precondition before the backend is touched.
    pub async fn validate(&self, input: &InvocationInput) -> Result<AgentInvocation, RelayError> {
        if input.session_id.trim().is_empty() {
            return Err(RelayError::InvalidRequest {
                message: "sessionId must not be empty".to_string(),
            });
        }
        if input.prompt.trim().is_empty() {
            return Err(RelayError::InvalidRequest {
                message: "prompt must not be empty".to_string(),
            });
        }

        let working_directory = match input.working_directory.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                return Err(RelayError::MissingWorkingDirectory {
                    session_id: input.session_id.clone(),
                })
            }
        };
        match tokio::fs::metadata(&working_directory).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                return Err(RelayError::WorkingDirectoryInaccessible {
                    path: working_directory.display().to_string(),
                    reason: "not a directory".to_string(),
                })
            }
            Err(err) => {
                return Err(RelayError::WorkingDirectoryInaccessible {
                    path: working_directory.display().to_string(),
                    reason: err.to_string(),
                })
            }
        }

        let resolved = self.resolver.resolve(&input.model_id)?;
        let provider = resolved.provider;
        if !self.backend.supports(provider.provider_type) {
            return Err(RelayError::UnsupportedProvider {
                provider: provider.id,
                provider_type: provider.provider_type.to_string(),
                agent: self.backend.name().to_string(),
            });
        }

        let credential = input
            .provider_credential
            .clone()
            .unwrap_or(provider.credential);
        if !credential.has_key() {
            return Err(RelayError::MissingCredentials {
                provider: provider.id,
            });
        }

        Ok(AgentInvocation {
            session_id: input.session_id.clone(),
            prompt: input.prompt.clone(),
            working_directory,
            model: resolved.resolved_model_id,
            provider_type: provider.provider_type,
            credential,
            permission_mode: input.configuration.permission_mode,
            max_turns: input.configuration.max_turns,
            resume_id: input.resume_id.clone(),
        })
    }
}

/// Per-invocation state owned by the driver task.
struct RunRecord {
    session_id: String,
    started: Instant,
    transform: ClaudeTransform,
    messages: Vec<Value>,
}

impl RunRecord {
    fn new(session_id: &str, started: Instant) -> Self {
        Self {
            session_id: session_id.to_string(),
            started,
            transform: ClaudeTransform::new(session_id),
            messages: Vec::new(),
        }
    }

    fn finish(&mut self, error: Option<&RelayError>) -> Completion {
        let summary = self.transform.summary();
        Completion {
            success: error.is_none(),
            session_id: self.session_id.clone(),
            native_session_id: self.transform.native_session_id().map(str::to_string),
            messages: std::mem::take(&mut self.messages),
            duration_ms: self.started.elapsed().as_millis() as u64,
            num_turns: summary
                .and_then(|summary| summary.num_turns)
                .unwrap_or_else(|| self.transform.finished_turns()),
            usage: self.transform.usage(),
            total_cost_usd: summary.and_then(|summary| summary.total_cost_usd),
            result: summary.and_then(|summary| summary.result.clone()),
            error: error.map(RelayError::summary),
        }
    }
}

/// Publishing side of the channel. Guards the single terminal signal.
struct EventSink {
    tx: mpsc::Sender<DriverEvent>,
    session_id: String,
    completed: bool,
}

impl EventSink {
    fn new(tx: mpsc::Sender<DriverEvent>, session_id: String) -> Self {
        Self {
            tx,
            session_id,
            completed: false,
        }
    }

    /// Returns false once nobody is listening or the invocation is complete.
    async fn chunk(&mut self, chunk: StreamChunk, raw: Option<Value>) -> bool {
        if self.completed {
            tracing::warn!(
                session_id = %self.session_id,
                kind = chunk.kind(),
                "dropping chunk after completion"
            );
            return false;
        }
        self.tx.send(DriverEvent::Chunk { chunk, raw }).await.is_ok()
    }

    /// Resolves once the receiver is dropped or closed.
    async fn detached(&self) {
        self.tx.closed().await
    }

    async fn complete(&mut self, completion: Completion) -> bool {
        if self.completed {
            tracing::warn!(session_id = %self.session_id, "duplicate completion suppressed");
            return false;
        }
        self.completed = true;
        self.tx.send(DriverEvent::Complete(completion)).await.is_ok()
    }

    /// Advisory error chunk followed by the authoritative completion.
    async fn fail(&mut self, err: &RelayError, completion: Completion) {
        if self.chunk(StreamChunk::error(err.to_string()), None).await {
            self.complete(completion).await;
        }
    }
}
