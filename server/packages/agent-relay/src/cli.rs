use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_relay_universal_agent_schema::convert_claude::ClaudeTransform;
use agent_relay_universal_agent_schema::NativeMessage;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::backend::{AgentBackend, ClaudeCliBackend, MockBackend, MockScriptError};
use crate::driver::InvocationDriver;
use crate::resolver::{split_model_id, ProviderCredential, ProviderType, StaticModelResolver};
use crate::router::{build_router, AppState};
use crate::sse::BridgeConfig;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2470;

#[derive(Parser, Debug)]
#[command(name = "agent-relay", bin_name = "agent-relay")]
#[command(about = "Streams coding agent turns as Server-Sent Events", version)]
#[command(arg_required_else_help = true)]
pub struct AgentRelayCli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay HTTP server.
    Server(ServerArgs),
    /// Translate a recorded stream-json transcript into canonical chunks.
    Transform(TransformArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long = "claude-path", env = "AGENT_RELAY_CLAUDE_PATH", default_value = "claude")]
    pub claude_path: PathBuf,

    /// Ask the CLI for whole messages only; each assistant message becomes one step.
    #[arg(long = "no-partial-messages")]
    pub no_partial_messages: bool,

    #[arg(
        long = "stream-timeout-secs",
        env = "AGENT_RELAY_STREAM_TIMEOUT_SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub stream_timeout_secs: u64,

    #[arg(
        long = "keep-alive-secs",
        default_value_t = 15,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub keep_alive_secs: u64,

    /// Replay a JSON-lines script instead of running the agent.
    #[arg(long = "mock-script")]
    pub mock_script: Option<PathBuf>,

    /// Restrict a provider to specific models, as `<provider>:<model>`.
    #[arg(long = "allow-model")]
    pub allow_model: Vec<String>,

    #[arg(long = "anthropic-api-key", env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    #[arg(long = "anthropic-base-url", env = "ANTHROPIC_BASE_URL")]
    pub anthropic_base_url: Option<String>,

    #[arg(long = "openai-api-key", env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long = "openai-base-url", env = "OPENAI_BASE_URL")]
    pub openai_base_url: Option<String>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    pub cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    pub cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    pub cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    pub cors_allow_credentials: bool,
}

#[derive(Args, Debug)]
pub struct TransformArgs {
    /// stream-json transcript; stdin when omitted.
    pub input: Option<PathBuf>,

    #[arg(long = "session-id", default_value = "transform")]
    pub session_id: String,

    /// Attach the native message to each chunk under `raw`.
    #[arg(long)]
    pub raw: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("invalid model filter: {0}")]
    InvalidModelFilter(String),
    #[error(transparent)]
    MockScript(#[from] MockScriptError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("logging error: {0}")]
    Logging(String),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent_relay() -> Result<(), CliError> {
    let cli = AgentRelayCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Logging(err.to_string()))
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Transform(args) => run_transform(args),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let backend: Arc<dyn AgentBackend> = match server.mock_script.as_ref() {
        Some(path) => {
            tracing::warn!(script = ?path, "serving scripted mock backend");
            Arc::new(MockBackend::from_script_file(path)?)
        }
        None => Arc::new(
            ClaudeCliBackend::new(&server.claude_path)
                .with_partial_messages(!server.no_partial_messages),
        ),
    };
    let resolver = build_resolver(server)?;
    tracing::info!(
        backend = %backend.name(),
        providers = ?resolver.provider_ids().collect::<Vec<_>>(),
        "agent backend configured"
    );

    let driver = InvocationDriver::new(backend, Arc::new(resolver));
    let state = AppState::new(driver).with_bridge_config(BridgeConfig {
        timeout: Duration::from_secs(server.stream_timeout_secs),
        keep_alive: Duration::from_secs(server.keep_alive_secs),
    });
    let router = build_router(state).layer(build_cors_layer(server)?);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

pub fn build_resolver(server: &ServerArgs) -> Result<StaticModelResolver, CliError> {
    let mut resolver = StaticModelResolver::new()
        .with_provider(
            "anthropic",
            ProviderType::Anthropic,
            credential(&server.anthropic_api_key, &server.anthropic_base_url),
        )
        .with_provider(
            "openai",
            ProviderType::Openai,
            credential(&server.openai_api_key, &server.openai_base_url),
        );

    let mut allowed: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for filter in &server.allow_model {
        let (provider, model) = split_model_id(filter)
            .ok_or_else(|| CliError::InvalidModelFilter(filter.clone()))?;
        allowed
            .entry(provider.to_ascii_lowercase())
            .or_default()
            .push(model.to_string());
    }
    for (provider, models) in allowed {
        resolver = resolver.with_models(&provider, models);
    }
    Ok(resolver)
}

fn credential(api_key: &Option<String>, base_url: &Option<String>) -> ProviderCredential {
    let credential = ProviderCredential::new(api_key.clone().unwrap_or_default());
    match base_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => credential.with_api_host(url),
        None => credential,
    }
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

fn run_transform(args: &TransformArgs) -> Result<(), CliError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let emitted = match args.input.as_ref() {
        Some(path) => transform_lines(
            BufReader::new(File::open(path)?),
            &mut out,
            &args.session_id,
            args.raw,
        )?,
        None => transform_lines(
            std::io::stdin().lock(),
            &mut out,
            &args.session_id,
            args.raw,
        )?,
    };
    out.flush()?;
    tracing::info!(chunks = emitted, "transform finished");
    Ok(())
}

/// Writes one canonical chunk per line and returns how many were written.
pub fn transform_lines<R: BufRead, W: Write>(
    reader: R,
    writer: &mut W,
    session_id: &str,
    include_raw: bool,
) -> Result<usize, CliError> {
    let mut transform = ClaudeTransform::new(session_id);
    let mut emitted = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let raw: Value = match serde_json::from_str(trimmed) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(line_number = index + 1, error = %err, "skipping non-json line");
                continue;
            }
        };
        let message = match NativeMessage::parse(&raw) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(line_number = index + 1, error = %err, "skipping undecodable message");
                continue;
            }
        };
        for chunk in transform.push(&message) {
            let mut value = serde_json::to_value(&chunk)?;
            if include_raw {
                if let Value::Object(map) = &mut value {
                    map.insert("raw".to_string(), raw.clone());
                }
            }
            serde_json::to_writer(&mut *writer, &value)?;
            writer.write_all(b"\n")?;
            emitted += 1;
        }
    }
    Ok(emitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ModelResolver;
    use serde_json::json;

    fn server_args(extra: &[&str]) -> ServerArgs {
        let mut argv = vec!["agent-relay", "server", "--anthropic-api-key", "sk-test"];
        argv.extend_from_slice(extra);
        match AgentRelayCli::try_parse_from(argv).expect("parse").command {
            Command::Server(args) => args,
            other => panic!("expected server command, got {other:?}"),
        }
    }

    #[test]
    fn server_defaults() {
        let args = server_args(&[]);
        assert_eq!(args.host, DEFAULT_HOST);
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.keep_alive_secs, 15);
        assert!(args.mock_script.is_none());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let result = AgentRelayCli::try_parse_from([
            "agent-relay",
            "server",
            "--stream-timeout-secs",
            "0",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn resolver_uses_flags_and_model_filters() {
        let args = server_args(&[
            "--anthropic-base-url",
            "http://proxy.local",
            "--allow-model",
            "anthropic:claude-sonnet-4-5",
        ]);
        let resolver = build_resolver(&args).expect("resolver");
        let resolved = resolver
            .resolve("anthropic:claude-sonnet-4-5")
            .expect("allowed model");
        assert_eq!(resolved.provider.credential.api_key, "sk-test");
        assert_eq!(
            resolved.provider.credential.api_host.as_deref(),
            Some("http://proxy.local")
        );
        assert!(resolver.resolve("anthropic:claude-opus-4").is_err());

        let bad = server_args(&["--allow-model", "sonnet"]);
        assert!(matches!(
            build_resolver(&bad),
            Err(CliError::InvalidModelFilter(_))
        ));
    }

    #[test]
    fn invalid_cors_origin_is_reported() {
        let args = server_args(&["--cors-allow-origin", "not a\norigin"]);
        assert!(matches!(
            build_cors_layer(&args),
            Err(CliError::InvalidCorsOrigin(_))
        ));
        assert!(build_cors_layer(&server_args(&["-O", "http://localhost:5173"])).is_ok());
    }

    #[test]
    fn transform_writes_one_chunk_per_line() {
        let transcript = [
            json!({"type": "system", "subtype": "init", "session_id": "native-1"}),
            json!({"type": "stream_event", "event": {"type": "message_start", "message": {"id": "msg_1"}}}),
            json!({"type": "stream_event", "event": {"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}}),
            json!({"type": "stream_event", "event": {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}}),
            json!({"type": "stream_event", "event": {"type": "content_block_stop", "index": 0}}),
            json!({"type": "stream_event", "event": {"type": "message_stop"}}),
        ]
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n")
            + "\nnot json\n";

        let mut out = Vec::new();
        let emitted =
            transform_lines(transcript.as_bytes(), &mut out, "session-1", false).expect("transform");
        assert_eq!(emitted, 5);
        let lines: Vec<Value> = String::from_utf8(out)
            .expect("utf8")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines[0], json!({"type": "start-step"}));
        assert_eq!(lines[1], json!({"type": "text-start", "id": "msg_1:0"}));
        assert_eq!(lines[2], json!({"type": "text-delta", "id": "msg_1:0", "delta": "Hi"}));
        assert_eq!(lines[4]["type"], "finish-step");
        assert!(lines.iter().all(|line| line.get("raw").is_none()));
    }
}
