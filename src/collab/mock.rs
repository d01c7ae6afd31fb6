//! Deterministic in-memory collaborators for tests.
//!
//! These mirror the real contracts closely enough to drive the whole
//! engine without a host process: canned tool responses with a call
//! log, a static provider catalog, a static credential store, and an
//! in-memory file cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    Credential, CredentialResolver, CredentialService, FileCache, FileEntry, Provider,
    ProviderCatalog, ToolRegistry, ToolSpec,
};

/// Handler signature for a mock tool.
pub type ToolHandler = Arc<dyn Fn(&Value) -> anyhow::Result<String> + Send + Sync>;

/// In-memory tool registry with a call log.
///
/// # Example
///
/// ```
/// use blockflow::collab::mock::StaticToolRegistry;
///
/// let tools = StaticToolRegistry::new()
///     .with_canned("web_search", "search the web", r#"{"results": []}"#);
/// ```
#[derive(Default)]
pub struct StaticToolRegistry {
    tools: HashMap<String, (ToolSpec, ToolHandler)>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool with a handler closure.
    pub fn with_tool(
        mut self,
        spec: ToolSpec,
        handler: impl Fn(&Value) -> anyhow::Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.tools
            .insert(spec.name.clone(), (spec, Arc::new(handler)));
        self
    }

    /// Register a tool that always returns the same response.
    pub fn with_canned(
        self,
        name: &str,
        description: &str,
        response: impl Into<String>,
    ) -> Self {
        let response = response.into();
        self.with_tool(
            ToolSpec {
                name: name.to_string(),
                description: description.to_string(),
                parameters: Value::Null,
                integration: None,
            },
            move |_| Ok(response.clone()),
        )
    }

    /// Register a tool that always fails with the given message.
    pub fn with_failing(self, name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        self.with_tool(
            ToolSpec {
                name: name.to_string(),
                description: String::new(),
                parameters: Value::Null,
                integration: None,
            },
            move |_| Err(anyhow::anyhow!("{}", message)),
        )
    }

    /// `(tool name, arguments)` pairs in invocation order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("call log lock").clone()
    }
}

#[async_trait]
impl ToolRegistry for StaticToolRegistry {
    fn get(&self, name: &str) -> Option<ToolSpec> {
        self.tools.get(name).map(|(spec, _)| spec.clone())
    }

    async fn execute(&self, name: &str, args: &Value) -> anyhow::Result<String> {
        self.calls
            .lock()
            .expect("call log lock")
            .push((name.to_string(), args.clone()));
        let (_, handler) = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown tool '{}'", name))?;
        handler(args)
    }

    fn list(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<_> = self.tools.values().map(|(s, _)| s.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

/// Static provider catalog.
#[derive(Default)]
pub struct StaticCatalog {
    models: HashMap<String, Provider>,
    aliases: HashMap<String, (Provider, String)>,
    default: Option<(Provider, String)>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: &str, provider: Provider) -> Self {
        self.models.insert(model.to_string(), provider);
        self
    }

    pub fn with_alias(mut self, alias: &str, provider: Provider, model: &str) -> Self {
        self.aliases
            .insert(alias.to_string(), (provider, model.to_string()));
        self
    }

    pub fn with_default(mut self, provider: Provider, model: &str) -> Self {
        self.default = Some((provider, model.to_string()));
        self
    }
}

impl ProviderCatalog for StaticCatalog {
    fn by_model_id(&self, id: &str) -> Option<Provider> {
        self.models.get(id).cloned()
    }

    fn resolve_alias(&self, id: &str) -> Option<(Provider, String)> {
        self.aliases.get(id).cloned()
    }

    fn default_provider(&self) -> Option<(Provider, String)> {
        self.default.clone()
    }
}

/// Static credential store.
#[derive(Default)]
pub struct StaticCredentials {
    by_user: HashMap<String, Vec<Credential>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(mut self, user_id: &str, cred: Credential) -> Self {
        self.by_user.entry(user_id.to_string()).or_default().push(cred);
        self
    }
}

#[async_trait]
impl CredentialService for StaticCredentials {
    fn resolver(&self, user_id: &str) -> CredentialResolver {
        let creds = self.by_user.get(user_id).cloned().unwrap_or_default();
        Arc::new(move |cred_id| creds.iter().find(|c| c.id == cred_id).cloned())
    }

    async fn list_by_user_and_type(
        &self,
        user_id: &str,
        integration: &str,
    ) -> anyhow::Result<Vec<Credential>> {
        Ok(self
            .by_user
            .get(user_id)
            .map(|creds| {
                creds
                    .iter()
                    .filter(|c| c.integration == integration)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// In-memory file cache.
#[derive(Default)]
pub struct MemoryFileCache {
    entries: HashMap<String, FileEntry>,
}

impl MemoryFileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, file_id: &str, entry: FileEntry) -> Self {
        self.entries.insert(file_id.to_string(), entry);
        self
    }
}

impl FileCache for MemoryFileCache {
    fn get(&self, file_id: &str) -> Option<FileEntry> {
        self.entries.get(file_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_canned_tool_and_call_log() {
        let tools = StaticToolRegistry::new().with_canned("echo", "echoes", "hello");
        let out = tools.execute("echo", &json!({"q": 1})).await.unwrap();
        assert_eq!(out, "hello");
        let calls = tools.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "echo");
        assert_eq!(calls[0].1, json!({"q": 1}));
    }

    #[tokio::test]
    async fn test_unknown_tool_errors() {
        let tools = StaticToolRegistry::new();
        assert!(tools.execute("nope", &Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_tool() {
        let tools = StaticToolRegistry::new().with_failing("broken", "Did you mean 'fixed'?");
        let err = tools.execute("broken", &Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("Did you mean"));
    }

    #[test]
    fn test_catalog_resolution() {
        let provider = Provider {
            name: "ollama".into(),
            base_url: "http://localhost:11434/v1".into(),
            api_key: None,
        };
        let catalog = StaticCatalog::new()
            .with_model("llama3.2:3b", provider.clone())
            .with_alias("fast", provider.clone(), "llama3.2:1b")
            .with_default(provider, "llama3.2:3b");

        assert!(catalog.by_model_id("llama3.2:3b").is_some());
        let (_, model) = catalog.resolve_alias("fast").unwrap();
        assert_eq!(model, "llama3.2:1b");
        assert!(catalog.default_provider().is_some());
    }

    #[tokio::test]
    async fn test_credentials_by_type() {
        let creds = StaticCredentials::new()
            .with_credential(
                "u1",
                Credential {
                    id: "c1".into(),
                    integration: "discord".into(),
                    data: json!({"token": "t"}),
                },
            )
            .with_credential(
                "u1",
                Credential {
                    id: "c2".into(),
                    integration: "slack".into(),
                    data: json!({"token": "s"}),
                },
            );

        let discord = creds.list_by_user_and_type("u1", "discord").await.unwrap();
        assert_eq!(discord.len(), 1);
        assert_eq!(discord[0].id, "c1");

        let resolver = creds.resolver("u1");
        assert!(resolver("c2").is_some());
        assert!(resolver("missing").is_none());
    }
}
