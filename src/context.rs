//! Shared engine state threaded through the call graph.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use crate::config::{RuntimeConfig, Workspace};
use crate::llm::{HttpProvider, LmClient, LmProvider};
use crate::prompts::PromptBundle;
use crate::skills::{builtin_registry, SkillRegistry};
use crate::store::Store;

/// Everything a phase needs: the store, configuration, workspace layout,
/// prompt bundle, LM client, and skill registry. There are no singletons;
/// the context is passed explicitly.
pub struct EngineContext {
    pub store: Store,
    pub config: RuntimeConfig,
    pub workspace: Workspace,
    pub prompts: PromptBundle,
    pub llm: LmClient,
    pub skills: SkillRegistry,
}

impl EngineContext {
    /// Standard construction: HTTP provider from config.
    pub async fn init(workspace: Workspace) -> anyhow::Result<Self> {
        let config = RuntimeConfig::load(&workspace.config_path())?;
        let provider: Arc<dyn LmProvider> = Arc::new(HttpProvider::new(
            &config.llm.base_url,
            &config.llm.api_key,
            &config.llm.model,
            Duration::from_secs(config.llm.timeout_s),
        )?);
        Self::with_provider(workspace, config, provider).await
    }

    /// Construction with an injected provider (tests use a scripted one).
    pub async fn with_provider(
        workspace: Workspace,
        config: RuntimeConfig,
        provider: Arc<dyn LmProvider>,
    ) -> anyhow::Result<Self> {
        workspace.ensure_layout().await?;
        let store = Store::open(&workspace.db_path()).await?;
        Self::assemble(workspace, config, provider, store).await
    }

    /// In-memory variant for tests.
    pub async fn in_memory(
        workspace: Workspace,
        config: RuntimeConfig,
        provider: Arc<dyn LmProvider>,
    ) -> anyhow::Result<Self> {
        workspace.ensure_layout().await?;
        let store = Store::open_in_memory().await?;
        Self::assemble(workspace, config, provider, store).await
    }

    async fn assemble(
        workspace: Workspace,
        config: RuntimeConfig,
        provider: Arc<dyn LmProvider>,
        store: Store,
    ) -> anyhow::Result<Self> {
        let llm = LmClient::new(
            provider,
            Duration::from_secs(config.llm.timeout_s),
            config.guardrails.max_prompt_chars,
            config.guardrails.max_response_chars,
        );
        let prompts = PromptBundle::builtin();
        prompts.register(store.pool()).await?;
        Ok(Self {
            store,
            config,
            workspace,
            prompts,
            llm,
            skills: builtin_registry(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        self.store.pool()
    }
}
