//! Shared run context handed to every executor.
//!
//! [`RunContext`] carries the HTTP client, collaborator handles, status
//! sink, circuit breaker, and cancellation flag. It is constructed once
//! per host via the builder; the engine re-stamps the per-run fields
//! (breaker, cancellation, model override, user id) for each execution.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use reqwest::Client;

use crate::backoff::RetryPolicy;
use crate::breaker::CircuitBreaker;
use crate::collab::{
    CheckpointFn, CredentialService, FileCache, ProviderCatalog, ToolRegistry,
};
use crate::error::{EngineError, Result};
use crate::events::StatusSender;

/// Agent-executor tuning shared through the context.
#[derive(Clone)]
pub struct AgentSettings {
    /// Hard cap on agent-loop iterations.
    pub max_iterations: u32,
    /// Tool-usage validation reruns.
    pub validation_retries: u32,
    /// Transport retry policy for LLM calls.
    pub llm_retry: RetryPolicy,
    /// Models trusted with native strict JSON-schema response format.
    /// Entries are exact names or `prefix*` globs. Empty (the default)
    /// means prompt-based fallback everywhere.
    pub strict_schema_models: Vec<String>,
    /// Models that accept image content parts.
    pub vision_models: Vec<String>,
    /// Whether the post-hoc block checker runs for LLM blocks.
    pub checker_enabled: bool,
    /// Model id used by the checker; falls back to the block's model.
    pub checker_model: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            validation_retries: 2,
            llm_retry: RetryPolicy::standard(),
            strict_schema_models: Vec::new(),
            vision_models: vec![
                "*vision*".to_string(),
                "gpt-4o*".to_string(),
                "llava*".to_string(),
            ],
            checker_enabled: false,
            checker_model: None,
        }
    }
}

impl AgentSettings {
    /// Whether `model` may receive a native strict JSON-schema request.
    pub fn supports_strict_schema(&self, model: &str) -> bool {
        model_matches(&self.strict_schema_models, model)
    }

    /// Whether `model` accepts image content parts.
    pub fn supports_vision(&self, model: &str) -> bool {
        model_matches(&self.vision_models, model)
    }
}

/// Match a model name against exact entries and `*`-glob patterns
/// (`prefix*`, `*suffix`, `*infix*`).
fn model_matches(patterns: &[String], model: &str) -> bool {
    patterns.iter().any(|p| {
        let starts_wild = p.starts_with('*');
        let ends_wild = p.ends_with('*');
        let core = p.trim_matches('*');
        match (starts_wild, ends_wild) {
            (true, true) => model.contains(core),
            (true, false) => model.ends_with(core),
            (false, true) => model.starts_with(core),
            (false, false) => model == p,
        }
    })
}

/// Shared execution context for block executors.
///
/// Cheap to clone — every field is either `Arc`-backed or small.
#[derive(Clone)]
pub struct RunContext {
    /// HTTP client (uses `Arc` internally).
    pub client: Client,
    /// Tool registry collaborator.
    pub tools: Arc<dyn ToolRegistry>,
    /// Provider catalog collaborator.
    pub providers: Arc<dyn ProviderCatalog>,
    /// Credential service, when the host supplies one.
    pub credentials: Option<Arc<dyn CredentialService>>,
    /// File cache, when the host supplies one.
    pub files: Option<Arc<dyn FileCache>>,
    /// Checkpoint sink invoked after terminal block transitions.
    pub checkpoint: Option<CheckpointFn>,
    /// Status update sink.
    pub status: StatusSender,
    /// Per-run circuit breaker.
    pub breaker: Arc<CircuitBreaker>,
    /// Per-run cancellation flag.
    pub cancellation: Arc<AtomicBool>,
    /// Workflow-level model override for LLM blocks.
    pub model_override: Option<String>,
    /// Run owner, for credential resolution.
    pub user_id: Option<String>,
    /// Workflow intent summary, consumed by the block checker.
    pub workflow_goal: Option<String>,
    /// Agent-executor tuning.
    pub agent: AgentSettings,
}

impl RunContext {
    /// Start building a context around the two mandatory collaborators.
    pub fn builder(
        tools: Arc<dyn ToolRegistry>,
        providers: Arc<dyn ProviderCatalog>,
    ) -> RunContextBuilder {
        RunContextBuilder {
            client: None,
            tools,
            providers,
            credentials: None,
            files: None,
            checkpoint: None,
            status: StatusSender::disabled(),
            agent: AgentSettings::default(),
            workflow_goal: None,
            timeout: None,
        }
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::Relaxed)
    }

    /// Return an error if cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    /// Request cancellation of the run.
    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::Relaxed);
    }

    /// Clone with fresh per-run state (breaker, cancellation) and
    /// run-scoped metadata.
    pub fn for_run(
        &self,
        breaker_threshold: u32,
        model_override: Option<String>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            breaker: Arc::new(CircuitBreaker::with_threshold(breaker_threshold)),
            cancellation: Arc::new(AtomicBool::new(false)),
            model_override,
            user_id,
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("has_credentials", &self.credentials.is_some())
            .field("has_files", &self.files.is_some())
            .field("has_checkpoint", &self.checkpoint.is_some())
            .field("model_override", &self.model_override)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Builder for [`RunContext`].
pub struct RunContextBuilder {
    client: Option<Client>,
    tools: Arc<dyn ToolRegistry>,
    providers: Arc<dyn ProviderCatalog>,
    credentials: Option<Arc<dyn CredentialService>>,
    files: Option<Arc<dyn FileCache>>,
    checkpoint: Option<CheckpointFn>,
    status: StatusSender,
    agent: AgentSettings,
    workflow_goal: Option<String>,
    timeout: Option<Duration>,
}

impl RunContextBuilder {
    /// Set the HTTP client. If not set, a default client is created.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Attach the credential service.
    pub fn credentials(mut self, service: Arc<dyn CredentialService>) -> Self {
        self.credentials = Some(service);
        self
    }

    /// Attach the file cache.
    pub fn files(mut self, cache: Arc<dyn FileCache>) -> Self {
        self.files = Some(cache);
        self
    }

    /// Attach the checkpoint sink.
    pub fn checkpoint(mut self, sink: CheckpointFn) -> Self {
        self.checkpoint = Some(sink);
        self
    }

    /// Attach the status update sink.
    pub fn status(mut self, status: StatusSender) -> Self {
        self.status = status;
        self
    }

    /// Override agent-executor tuning.
    pub fn agent(mut self, settings: AgentSettings) -> Self {
        self.agent = settings;
        self
    }

    /// Describe the workflow's intent for the block checker.
    pub fn workflow_goal(mut self, goal: impl Into<String>) -> Self {
        self.workflow_goal = Some(goal.into());
        self
    }

    /// Request timeout for the default client. Ignored when a custom
    /// client is supplied.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the context.
    pub fn build(self) -> RunContext {
        let timeout = self.timeout.unwrap_or(Duration::from_secs(120));
        let client = self.client.unwrap_or_else(|| {
            Client::builder()
                .timeout(timeout)
                .build()
                .expect("failed to build HTTP client")
        });
        RunContext {
            client,
            tools: self.tools,
            providers: self.providers,
            credentials: self.credentials,
            files: self.files,
            checkpoint: self.checkpoint,
            status: self.status,
            breaker: Arc::new(CircuitBreaker::new()),
            cancellation: Arc::new(AtomicBool::new(false)),
            model_override: None,
            user_id: None,
            workflow_goal: self.workflow_goal,
            agent: self.agent,
        }
    }
}
