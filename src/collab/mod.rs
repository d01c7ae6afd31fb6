//! Collaborator contracts the engine consumes.
//!
//! The engine never owns tools, providers, credentials, or files — it
//! talks to them through the traits here, all object-safe and designed
//! to be shared as `Arc<dyn …>`. The [`mock`] module ships deterministic
//! in-memory implementations for tests and embedding without a host.

pub mod mock;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::model::{is_safe_identifier, BlockStatus};

/// Descriptor for a registered tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Registry name (`web_search`, `send_discord_message`, …).
    pub name: String,
    /// Human-readable description surfaced to the LLM tool catalog.
    pub description: String,
    /// JSON-schema-shaped parameter description.
    pub parameters: Value,
    /// Integration type this tool needs a credential for (`discord`,
    /// `mongodb`, …), when any.
    pub integration: Option<String>,
}

/// Registry of invokable tools.
///
/// Execution is opaque to the engine: a tool takes structured arguments
/// and returns a string (frequently JSON, but not required to be).
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Look up a tool descriptor by name.
    fn get(&self, name: &str) -> Option<ToolSpec>;

    /// Execute a tool with the given arguments.
    async fn execute(&self, name: &str, args: &Value) -> anyhow::Result<String>;

    /// All registered tools, for the agent's tool catalog.
    fn list(&self) -> Vec<ToolSpec>;
}

/// An LLM provider endpoint.
#[derive(Debug, Clone)]
pub struct Provider {
    /// Provider name (`openai`, `ollama`, `groq`, …). Drives quirk
    /// handling in the chat client.
    pub name: String,
    /// Base URL; the chat client appends `/chat/completions`.
    pub base_url: String,
    /// Bearer key, when the provider requires one.
    pub api_key: Option<String>,
}

/// Model-to-provider resolution.
pub trait ProviderCatalog: Send + Sync {
    /// Direct lookup: the provider serving this exact model id.
    fn by_model_id(&self, id: &str) -> Option<Provider>;

    /// Alias resolution: map a friendly id to `(provider, effective model)`.
    fn resolve_alias(&self, id: &str) -> Option<(Provider, String)>;

    /// The catalog's default `(provider, model)` pair.
    fn default_provider(&self) -> Option<(Provider, String)>;
}

/// A decrypted credential handed to tools.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    /// Integration type (`discord`, `slack`, `mongodb`, …).
    pub integration: String,
    /// Credential payload (token, connection string, …).
    pub data: Value,
}

/// Resolver closure mapping a credential id to its decrypted form.
pub type CredentialResolver = Arc<dyn Fn(&str) -> Option<Credential> + Send + Sync>;

/// Credential lookup service scoped by user.
#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Build a resolver bound to `user_id`.
    fn resolver(&self, user_id: &str) -> CredentialResolver;

    /// All of a user's credentials of one integration type (used for
    /// credential auto-selection).
    async fn list_by_user_and_type(
        &self,
        user_id: &str,
        integration: &str,
    ) -> anyhow::Result<Vec<Credential>>;
}

/// A cached file's metadata.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub mime_type: String,
    pub filename: String,
    pub size: u64,
    pub user_id: String,
}

/// File cache lookup by id.
pub trait FileCache: Send + Sync {
    fn get(&self, file_id: &str) -> Option<FileEntry>;
}

/// Validate a file id before it touches the cache: safe identifiers
/// only, no traversal.
pub fn validate_file_id(file_id: &str) -> bool {
    is_safe_identifier(file_id)
}

/// Checkpoint sink invoked after each block's terminal transition.
pub type CheckpointFn = Arc<dyn Fn(&str, BlockStatus, Option<&Value>) + Send + Sync>;
