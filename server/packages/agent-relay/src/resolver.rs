//! Model id resolution.
//!
//! Model ids take the form `<provider>:<model>`. The provider half selects a
//! configured [`Provider`] and its credential; the model half is passed to the
//! agent backend untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use agent_relay_error::RelayError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Anthropic,
    Openai,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Openai => "openai",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCredential {
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_host: Option<String>,
}

impl ProviderCredential {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_host: None,
        }
    }

    pub fn with_api_host(mut self, api_host: impl Into<String>) -> Self {
        self.api_host = Some(api_host.into());
        self
    }

    pub fn has_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

// Keys stay out of logs.
impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredential")
            .field("api_key", &if self.has_key() { "<redacted>" } else { "<empty>" })
            .field("api_host", &self.api_host)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub id: String,
    pub provider_type: ProviderType,
    pub credential: ProviderCredential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub provider: Provider,
    pub resolved_model_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("model id `{model_id}` is not of the form <provider>:<model>")]
    Malformed { model_id: String },
    #[error("unknown provider `{provider}`")]
    UnknownProvider { model_id: String, provider: String },
    #[error("provider `{provider}` does not offer model `{model}`")]
    UnknownModel {
        model_id: String,
        provider: String,
        model: String,
    },
}

impl ResolutionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "invalid_model_id",
            Self::UnknownProvider { .. } => "unknown_provider",
            Self::UnknownModel { .. } => "unknown_model",
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            Self::Malformed { model_id }
            | Self::UnknownProvider { model_id, .. }
            | Self::UnknownModel { model_id, .. } => model_id,
        }
    }
}

impl From<ResolutionError> for RelayError {
    fn from(value: ResolutionError) -> Self {
        match value {
            ResolutionError::Malformed { model_id } => RelayError::InvalidModelId { model_id },
            other => RelayError::ModelNotFound {
                model_id: other.model_id().to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Maps a `<provider>:<model>` id to a configured provider.
pub trait ModelResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, model_id: &str) -> Result<ResolvedModel, ResolutionError>;
}

/// Splits a model id at its first `:`. Both halves must be non-empty.
pub fn split_model_id(model_id: &str) -> Option<(&str, &str)> {
    let (provider, model) = model_id.split_once(':')?;
    let provider = provider.trim();
    let model = model.trim();
    if provider.is_empty() || model.is_empty() {
        return None;
    }
    Some((provider, model))
}

#[derive(Debug, Clone)]
struct ProviderEntry {
    provider_type: ProviderType,
    credential: ProviderCredential,
    /// Empty means every model is accepted.
    models: BTreeSet<String>,
}

/// Resolver over a fixed provider table, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticModelResolver {
    providers: BTreeMap<String, ProviderEntry>,
}

impl StaticModelResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(
        mut self,
        id: impl AsRef<str>,
        provider_type: ProviderType,
        credential: ProviderCredential,
    ) -> Self {
        self.providers.insert(
            id.as_ref().trim().to_ascii_lowercase(),
            ProviderEntry {
                provider_type,
                credential,
                models: BTreeSet::new(),
            },
        );
        self
    }

    /// Restricts a provider to the given model names. Unknown provider ids
    /// are ignored.
    pub fn with_models<I, S>(mut self, id: &str, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(entry) = self.providers.get_mut(&id.to_ascii_lowercase()) {
            entry.models = models.into_iter().map(Into::into).collect();
        }
        self
    }

    pub fn provider_ids(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl ModelResolver for StaticModelResolver {
    fn resolve(&self, model_id: &str) -> Result<ResolvedModel, ResolutionError> {
        let (provider_id, model) =
            split_model_id(model_id).ok_or_else(|| ResolutionError::Malformed {
                model_id: model_id.to_string(),
            })?;
        let provider_id = provider_id.to_ascii_lowercase();
        let entry =
            self.providers
                .get(&provider_id)
                .ok_or_else(|| ResolutionError::UnknownProvider {
                    model_id: model_id.to_string(),
                    provider: provider_id.clone(),
                })?;
        if !entry.models.is_empty() && !entry.models.contains(model) {
            return Err(ResolutionError::UnknownModel {
                model_id: model_id.to_string(),
                provider: provider_id,
                model: model.to_string(),
            });
        }
        Ok(ResolvedModel {
            provider: Provider {
                id: provider_id,
                provider_type: entry.provider_type,
                credential: entry.credential.clone(),
            },
            resolved_model_id: model.to_string(),
        })
    }
}
