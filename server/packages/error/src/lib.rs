use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    MissingWorkingDirectory,
    WorkingDirectoryInaccessible,
    InvalidModelId,
    ModelNotFound,
    UnsupportedProvider,
    MissingCredentials,
    ProviderError,
    StreamError,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-relay:error:invalid_request",
            Self::MissingWorkingDirectory => "urn:agent-relay:error:missing_working_directory",
            Self::WorkingDirectoryInaccessible => {
                "urn:agent-relay:error:working_directory_inaccessible"
            }
            Self::InvalidModelId => "urn:agent-relay:error:invalid_model_id",
            Self::ModelNotFound => "urn:agent-relay:error:model_not_found",
            Self::UnsupportedProvider => "urn:agent-relay:error:unsupported_provider",
            Self::MissingCredentials => "urn:agent-relay:error:missing_credentials",
            Self::ProviderError => "urn:agent-relay:error:provider_error",
            Self::StreamError => "urn:agent-relay:error:stream_error",
            Self::Timeout => "urn:agent-relay:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::MissingWorkingDirectory => "Missing Working Directory",
            Self::WorkingDirectoryInaccessible => "Working Directory Inaccessible",
            Self::InvalidModelId => "Invalid Model Id",
            Self::ModelNotFound => "Model Not Found",
            Self::UnsupportedProvider => "Unsupported Provider",
            Self::MissingCredentials => "Missing Credentials",
            Self::ProviderError => "Provider Error",
            Self::StreamError => "Stream Error",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::MissingWorkingDirectory => 400,
            Self::WorkingDirectoryInaccessible => 400,
            Self::InvalidModelId => 400,
            Self::ModelNotFound => 404,
            Self::UnsupportedProvider => 400,
            Self::MissingCredentials => 401,
            Self::ProviderError => 502,
            Self::StreamError => 502,
            Self::Timeout => 504,
        }
    }
}

/// Coarse classification used by the invocation driver to decide how a
/// failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad session, model or credential configuration. No agent call was made.
    Validation,
    /// The agent backend could not be started.
    Provider,
    /// The agent backend failed partway through an otherwise healthy stream.
    Stream,
    /// The delivery ceiling elapsed.
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Error summary attached to an invocation's completion record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorSummary {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("session {session_id} does not declare a working directory")]
    MissingWorkingDirectory { session_id: String },
    #[error("working directory is not accessible: {path}")]
    WorkingDirectoryInaccessible { path: String, reason: String },
    #[error("invalid model id: {model_id}")]
    InvalidModelId { model_id: String },
    #[error("model not found: {model_id}")]
    ModelNotFound { model_id: String, message: String },
    #[error("provider {provider} ({provider_type}) is not supported by the {agent} agent")]
    UnsupportedProvider {
        provider: String,
        provider_type: String,
        agent: String,
    },
    #[error("provider {provider} has no credentials configured")]
    MissingCredentials { provider: String },
    #[error("provider error: {message}")]
    Provider { message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("timeout: {message}")]
    Timeout { message: String },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::MissingWorkingDirectory { .. } => ErrorType::MissingWorkingDirectory,
            Self::WorkingDirectoryInaccessible { .. } => ErrorType::WorkingDirectoryInaccessible,
            Self::InvalidModelId { .. } => ErrorType::InvalidModelId,
            Self::ModelNotFound { .. } => ErrorType::ModelNotFound,
            Self::UnsupportedProvider { .. } => ErrorType::UnsupportedProvider,
            Self::MissingCredentials { .. } => ErrorType::MissingCredentials,
            Self::Provider { .. } => ErrorType::ProviderError,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. }
            | Self::MissingWorkingDirectory { .. }
            | Self::WorkingDirectoryInaccessible { .. }
            | Self::InvalidModelId { .. }
            | Self::ModelNotFound { .. }
            | Self::UnsupportedProvider { .. }
            | Self::MissingCredentials { .. } => ErrorKind::Validation,
            Self::Provider { .. } => ErrorKind::Provider,
            Self::StreamError { .. } => ErrorKind::Stream,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            type_: self.error_type(),
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    fn details(&self) -> Option<Value> {
        let mut map = Map::new();
        match self {
            Self::InvalidRequest { .. }
            | Self::InvalidModelId { .. }
            | Self::Provider { .. }
            | Self::StreamError { .. }
            | Self::Timeout { .. } => {}
            Self::MissingWorkingDirectory { session_id } => {
                map.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::WorkingDirectoryInaccessible { path, reason } => {
                map.insert("path".to_string(), Value::String(path.clone()));
                map.insert("reason".to_string(), Value::String(reason.clone()));
            }
            Self::ModelNotFound { model_id, message } => {
                map.insert("modelId".to_string(), Value::String(model_id.clone()));
                map.insert("message".to_string(), Value::String(message.clone()));
            }
            Self::UnsupportedProvider {
                provider,
                provider_type,
                agent,
            } => {
                map.insert("provider".to_string(), Value::String(provider.clone()));
                map.insert(
                    "providerType".to_string(),
                    Value::String(provider_type.clone()),
                );
                map.insert("agent".to_string(), Value::String(agent.clone()));
            }
            Self::MissingCredentials { provider } => {
                map.insert("provider".to_string(), Value::String(provider.clone()));
            }
        }
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        if let Some(details) = self.details() {
            problem.extensions.insert("details".to_string(), details);
        }
        problem
    }
}
