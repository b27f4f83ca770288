use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use agent_relay_error::RelayError;
use futures::future::BoxFuture;
use futures::{stream, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;

use super::{AgentBackend, AgentInvocation, NativeStream};

const STDERR_TAIL_LINES: usize = 20;
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs the `claude` CLI in print mode and streams its stream-json output.
#[derive(Debug, Clone)]
pub struct ClaudeCliBackend {
    program: PathBuf,
    leading_args: Vec<String>,
    partial_messages: bool,
}

impl Default for ClaudeCliBackend {
    fn default() -> Self {
        Self::new("claude")
    }
}

impl ClaudeCliBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            partial_messages: true,
        }
    }

    /// Arguments placed before the CLI flags, for launchers such as
    /// `npx @anthropic-ai/claude-code`.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Without partial messages the CLI prints only whole `assistant`
    /// messages and no streaming events.
    pub fn with_partial_messages(mut self, enabled: bool) -> Self {
        self.partial_messages = enabled;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// The prompt always goes last, after `--`, so it is never read as a flag.
    pub fn command_args(&self, invocation: &AgentInvocation) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend([
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ]);
        if self.partial_messages {
            args.push("--include-partial-messages".to_string());
        }
        args.extend([
            "--model".to_string(),
            invocation.model.clone(),
            "--permission-mode".to_string(),
            invocation.permission_mode.as_arg().to_string(),
        ]);
        if let Some(max_turns) = invocation.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        if let Some(resume_id) = invocation.resume_id.as_ref() {
            args.push("--resume".to_string());
            args.push(resume_id.clone());
        }
        args.push("--".to_string());
        args.push(invocation.prompt.clone());
        args
    }

    fn spawn(&self, invocation: &AgentInvocation) -> Result<NativeStream, RelayError> {
        let args = self.command_args(invocation);
        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .current_dir(&invocation.working_directory)
            .env("ANTHROPIC_API_KEY", &invocation.credential.api_key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(host) = invocation.credential.api_host.as_ref() {
            command.env("ANTHROPIC_BASE_URL", host);
        }

        tracing::info!(
            session_id = %invocation.session_id,
            program = ?self.program,
            model = %invocation.model,
            cwd = ?invocation.working_directory,
            "spawning claude process"
        );

        let spawned_at = Instant::now();
        let mut child = command.spawn().map_err(|err| {
            tracing::error!(
                session_id = %invocation.session_id,
                program = ?self.program,
                error = %err,
                "failed to spawn claude process"
            );
            RelayError::Provider {
                message: format!("failed to spawn {}: {err}", self.program.display()),
            }
        })?;

        let stdout = child.stdout.take().ok_or_else(|| RelayError::Provider {
            message: "failed to capture claude stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| RelayError::Provider {
            message: "failed to capture claude stderr".to_string(),
        })?;
        tracing::info!(
            session_id = %invocation.session_id,
            pid = child.id().unwrap_or(0),
            elapsed_ms = spawned_at.elapsed().as_millis() as u64,
            "claude process spawned"
        );

        let stderr_task = spawn_stderr_loop(stderr, invocation.session_id.clone());
        let output = ChildOutput {
            session_id: invocation.session_id.clone(),
            child,
            lines: LinesStream::new(BufReader::new(stdout).lines()),
            stderr_task: Some(stderr_task),
            line_number: 0,
            spawned_at,
        };
        Ok(output.into_stream())
    }
}

impl AgentBackend for ClaudeCliBackend {
    fn name(&self) -> &str {
        "claude"
    }

    fn invoke(
        &self,
        invocation: AgentInvocation,
    ) -> BoxFuture<'_, Result<NativeStream, RelayError>> {
        Box::pin(async move { self.spawn(&invocation) })
    }
}

struct ChildOutput {
    session_id: String,
    child: Child,
    lines: LinesStream<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<VecDeque<String>>>,
    line_number: u64,
    spawned_at: Instant,
}

impl ChildOutput {
    fn into_stream(self) -> NativeStream {
        stream::unfold(Some(self), |state| async move {
            let mut output = state?;
            match output.next_message().await {
                Some(Ok(value)) => Some((Ok(value), Some(output))),
                Some(Err(err)) => Some((Err(err), None)),
                None => match output.finish().await {
                    Ok(()) => None,
                    Err(err) => Some((Err(err), None)),
                },
            }
        })
        .boxed()
    }

    async fn next_message(&mut self) -> Option<Result<Value, RelayError>> {
        while let Some(line) = self.lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    return Some(Err(RelayError::StreamError {
                        message: format!("failed to read claude stdout: {err}"),
                    }))
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            self.line_number += 1;
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => return Some(Ok(value)),
                Err(err) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        line_number = self.line_number,
                        error = %err,
                        raw = %truncate(trimmed, 200),
                        "skipping non-json stdout line"
                    );
                }
            }
        }
        None
    }

    async fn finish(&mut self) -> Result<(), RelayError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|err| RelayError::StreamError {
                message: format!("failed to wait for claude process: {err}"),
            })?;
        let tail = match self.stderr_task.take() {
            Some(task) => match tokio::time::timeout(STDERR_DRAIN_GRACE, task).await {
                Ok(Ok(tail)) => tail,
                _ => VecDeque::new(),
            },
            None => VecDeque::new(),
        };
        tracing::info!(
            session_id = %self.session_id,
            status = %status,
            lines = self.line_number,
            elapsed_ms = self.spawned_at.elapsed().as_millis() as u64,
            "claude process exited"
        );
        exit_result(status, &tail)
    }
}

fn exit_result(status: ExitStatus, stderr_tail: &VecDeque<String>) -> Result<(), RelayError> {
    if status.success() {
        return Ok(());
    }
    let mut message = format!("claude exited with {status}");
    if !stderr_tail.is_empty() {
        message.push_str(": ");
        message.push_str(&Vec::from(stderr_tail.clone()).join("\n"));
    }
    Err(RelayError::StreamError { message })
}

fn spawn_stderr_loop(
    stderr: tokio::process::ChildStderr,
    session_id: String,
) -> JoinHandle<VecDeque<String>> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut line_count: u64 = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            line_count += 1;
            tracing::info!(
                session_id = %session_id,
                line_number = line_count,
                "claude stderr: {}",
                line
            );
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tracing::debug!(session_id = %session_id, total_lines = line_count, "claude stderr: stream ended");
        tail
    })
}

fn truncate(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}
