//! Wires stores, the prompt runner and the pipeline into a worker.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use outreach_core::conversation::{ConversationSource, InMemoryConversationSource, PgConversationSource};
use outreach_core::cron::{AdvisoryLocks, CronAuth, CronGuard, CronTrigger, InMemoryLocks, Maintenance, PgAdvisoryLocks};
use outreach_core::drafts::db::PgDraftStore;
use outreach_core::drafts::{DraftStore, InMemoryDraftStore, StaleDraftRecovery};
use outreach_core::jobs::db::PgJobStore;
use outreach_core::jobs::{InMemoryJobStore, JobRunner, JobStore, RetryPolicy};
use outreach_core::notify::LogNotifier;
use outreach_core::pipeline::db::PgPipelineStore;
use outreach_core::pipeline::{
    DraftPipelineHandler, InMemoryChunkCache, InMemoryPipelineStore, PipelineDeps, PipelineOrchestrator,
    PipelineSettings, PipelineStore, PromptStages,
};
use outreach_core::{Clock, OutreachCfg, SystemClock};
use outreach_llm::provider::LlmProvider;
use outreach_llm::runner::PromptRunner;

pub struct App {
    pub cfg: Arc<OutreachCfg>,
    pub runner: JobRunner,
    pub trigger: CronTrigger,
}

struct Stores {
    jobs: Arc<dyn JobStore>,
    pipeline: Arc<dyn PipelineStore>,
    drafts: Arc<dyn DraftStore>,
    conversations: Arc<dyn ConversationSource>,
    locks: Arc<dyn AdvisoryLocks>,
}

impl Stores {
    fn postgres(pool: &PgPool) -> Self {
        Self {
            jobs: Arc::new(PgJobStore::new(pool.clone())),
            pipeline: Arc::new(PgPipelineStore::new(pool.clone())),
            drafts: Arc::new(PgDraftStore::new(pool.clone())),
            conversations: Arc::new(PgConversationSource::new(pool.clone())),
            locks: Arc::new(PgAdvisoryLocks::new(pool.clone())),
        }
    }

    fn ephemeral() -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            pipeline: Arc::new(InMemoryPipelineStore::new()),
            drafts: Arc::new(InMemoryDraftStore::new()),
            conversations: Arc::new(InMemoryConversationSource::new()),
            locks: Arc::new(InMemoryLocks::new()),
        }
    }
}

impl App {
    pub async fn build(pool: Option<PgPool>) -> anyhow::Result<Self> {
        let cfg = match &pool {
            Some(pool) => OutreachCfg::load(pool).await.context("loading outreach_config")?,
            None => OutreachCfg::default(),
        };
        let cfg = Arc::new(cfg);
        let stores = match &pool {
            Some(pool) => Stores::postgres(pool),
            None => Stores::ephemeral(),
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let provider: Arc<dyn LlmProvider> = Arc::new(
            outreach_llm::http::from_env().context("OUTREACH_LLM_MODEL and OUTREACH_LLM_API_KEY must be set")?,
        );
        let stages = PromptStages::new(PromptRunner::new(provider, cfg.runner_settings()), cfg.default_output_tokens);
        let deps = PipelineDeps::prompt_backed(
            stages,
            stores.pipeline.clone(),
            stores.drafts.clone(),
            Arc::new(InMemoryChunkCache::new()),
            Arc::new(LogNotifier),
            clock.clone(),
        );
        let orchestrator = Arc::new(PipelineOrchestrator::new(deps, PipelineSettings::from_cfg(&cfg)));

        let mut runner = JobRunner::new(stores.jobs.clone(), clock.clone())
            .with_retry_policy(RetryPolicy::new(cfg.job_backoff_base(), cfg.job_backoff_max()))
            .with_stale_after(cfg.job_stale_after());
        runner.register(Arc::new(DraftPipelineHandler::new(
            orchestrator,
            stores.conversations.clone(),
            clock.clone(),
        )));

        let recovery = StaleDraftRecovery::new(
            stores.drafts.clone(),
            clock.clone(),
            cfg.stale_draft_after(),
            cfg.stale_draft_batch,
        );
        let maintenance = Maintenance::new(
            stores.jobs.clone(),
            stores.pipeline.clone(),
            clock,
            cfg.retention(),
            cfg.prune_interval(),
        );
        let trigger = CronTrigger::new(
            CronAuth::from_env(),
            CronGuard::new(stores.locks),
            runner.clone(),
            Arc::new(recovery),
            Arc::new(maintenance),
            cfg.job_batch_size,
        );

        Ok(Self { cfg, runner, trigger })
    }
}
