//! Agent backends: the seam between the relay and the process or SDK that
//! actually runs the agent.

use std::path::PathBuf;

use agent_relay_error::RelayError;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::resolver::{ProviderCredential, ProviderType};

mod claude_cli;
mod mock;

pub use claude_cli::ClaudeCliBackend;
pub use mock::{MockBackend, MockScriptError, MockStep};

/// Native messages as the backend printed them, one JSON value per item.
pub type NativeStream = BoxStream<'static, Result<Value, RelayError>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }
}

/// Everything a backend needs to run one prompt. Built by the driver after
/// validation, so the working directory exists and the credential has a key.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub session_id: String,
    pub prompt: String,
    pub working_directory: PathBuf,
    pub model: String,
    pub provider_type: ProviderType,
    pub credential: ProviderCredential,
    pub permission_mode: PermissionMode,
    pub max_turns: Option<u32>,
    pub resume_id: Option<String>,
}

pub trait AgentBackend: Send + Sync + std::fmt::Debug {
    /// Agent name used in logs and unsupported-provider errors.
    fn name(&self) -> &str;

    fn supports(&self, provider_type: ProviderType) -> bool {
        provider_type == ProviderType::Anthropic
    }

    /// Starts the agent. An error here is a provider error: nothing was
    /// streamed yet.
    fn invoke(
        &self,
        invocation: AgentInvocation,
    ) -> BoxFuture<'_, Result<NativeStream, RelayError>>;
}
