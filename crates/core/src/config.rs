use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;

use outreach_llm::runner::RunnerSettings;

/// Upper bound for `retention_days`.
pub const MAX_RETENTION_DAYS: i64 = 3650;
/// Upper bound for any seconds-valued interval.
pub const MAX_INTERVAL_SECS: u64 = 30 * 24 * 3600;

/// All outreach pipeline parameters. Loaded from `outreach_config` table at startup.
/// First boot writes defaults; subsequent boots read existing values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutreachCfg {
    // job runner
    pub job_batch_size: usize,
    pub job_max_attempts: i32,
    pub job_backoff_base_secs: u64,
    pub job_backoff_max_secs: u64,
    pub job_stale_secs: u64,
    pub runner_poll_ms: u64,

    // stale draft recovery
    pub stale_draft_secs: u64,
    pub stale_draft_batch: usize,
    pub sweep_interval_secs: u64,

    // auto-send decision
    pub auto_send_threshold: f64,
    pub auto_send_delay_secs: u64,

    // revision loop
    pub revision_max_iterations: u32,
    pub revision_time_budget_ms: u64,
    pub revision_epsilon: f64,
    pub revision_patience: u32,
    pub max_context_chunks: usize,

    // prompt runner
    pub prompt_max_attempts: usize,
    pub token_multiplier: f64,
    pub token_cap: u32,
    pub token_retry_bonus: u32,
    pub prompt_timeout_secs: u64,
    pub default_output_tokens: u32,

    // maintenance
    pub prune_interval_secs: u64,
    pub retention_days: i64,
}

impl Default for OutreachCfg {
    fn default() -> Self {
        Self {
            job_batch_size: 10,
            job_max_attempts: 5,
            job_backoff_base_secs: 30,
            job_backoff_max_secs: 3600,
            job_stale_secs: 900,
            runner_poll_ms: 2000,
            stale_draft_secs: 600,
            stale_draft_batch: 50,
            sweep_interval_secs: 60,
            auto_send_threshold: 0.85,
            auto_send_delay_secs: 0,
            revision_max_iterations: 3,
            revision_time_budget_ms: 60_000,
            revision_epsilon: 0.03,
            revision_patience: 1,
            max_context_chunks: 6,
            prompt_max_attempts: 3,
            token_multiplier: 1.2,
            token_cap: 8000,
            token_retry_bonus: 0,
            prompt_timeout_secs: 60,
            default_output_tokens: 1200,
            prune_interval_secs: 3600,
            retention_days: 30,
        }
    }
}

impl OutreachCfg {
    /// Load config from `outreach_config` table. If table is empty, seed with defaults.
    pub async fn load(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM outreach_config")
                .fetch_all(pool)
                .await?;

        if rows.is_empty() {
            let cfg = Self::default();
            cfg.seed(pool).await?;
            return Ok(cfg);
        }

        let map: HashMap<String, String> = rows.into_iter().collect();
        Ok(Self::from_map(&map))
    }

    /// Write all default values into `outreach_config` table.
    async fn seed(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        for (key, value, desc) in &self.to_entries() {
            sqlx::query(
                "INSERT INTO outreach_config (key, value, description) VALUES ($1, $2, $3) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .bind(desc)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub fn from_map(m: &HashMap<String, String>) -> Self {
        let d = Self::default();
        let cfg = Self {
            job_batch_size: get_or(m, "job_batch_size", d.job_batch_size),
            job_max_attempts: get_or(m, "job_max_attempts", d.job_max_attempts),
            job_backoff_base_secs: get_or(m, "job_backoff_base_secs", d.job_backoff_base_secs),
            job_backoff_max_secs: get_or(m, "job_backoff_max_secs", d.job_backoff_max_secs),
            job_stale_secs: get_or(m, "job_stale_secs", d.job_stale_secs),
            runner_poll_ms: get_or(m, "runner_poll_ms", d.runner_poll_ms),
            stale_draft_secs: get_or(m, "stale_draft_secs", d.stale_draft_secs),
            stale_draft_batch: get_or(m, "stale_draft_batch", d.stale_draft_batch),
            sweep_interval_secs: get_or(m, "sweep_interval_secs", d.sweep_interval_secs),
            auto_send_threshold: get_or(m, "auto_send_threshold", d.auto_send_threshold),
            auto_send_delay_secs: get_or(m, "auto_send_delay_secs", d.auto_send_delay_secs),
            revision_max_iterations: get_or(m, "revision_max_iterations", d.revision_max_iterations),
            revision_time_budget_ms: get_or(m, "revision_time_budget_ms", d.revision_time_budget_ms),
            revision_epsilon: get_or(m, "revision_epsilon", d.revision_epsilon),
            revision_patience: get_or(m, "revision_patience", d.revision_patience),
            max_context_chunks: get_or(m, "max_context_chunks", d.max_context_chunks),
            prompt_max_attempts: get_or(m, "prompt_max_attempts", d.prompt_max_attempts),
            token_multiplier: get_or(m, "token_multiplier", d.token_multiplier),
            token_cap: get_or(m, "token_cap", d.token_cap),
            token_retry_bonus: get_or(m, "token_retry_bonus", d.token_retry_bonus),
            prompt_timeout_secs: get_or(m, "prompt_timeout_secs", d.prompt_timeout_secs),
            default_output_tokens: get_or(m, "default_output_tokens", d.default_output_tokens),
            prune_interval_secs: get_or(m, "prune_interval_secs", d.prune_interval_secs),
            retention_days: get_or(m, "retention_days", d.retention_days),
        };
        cfg.checked()
    }

    /// Replace out-of-range values with their defaults.
    fn checked(mut self) -> Self {
        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention_days) {
            tracing::warn!(retention_days = self.retention_days, "retention_days out of range, using default");
            self.retention_days = Self::default().retention_days;
        }
        self
    }

    pub fn job_backoff_base(&self) -> chrono::Duration {
        interval(self.job_backoff_base_secs)
    }

    pub fn job_backoff_max(&self) -> chrono::Duration {
        interval(self.job_backoff_max_secs)
    }

    pub fn job_stale_after(&self) -> chrono::Duration {
        interval(self.job_stale_secs)
    }

    pub fn stale_draft_after(&self) -> chrono::Duration {
        interval(self.stale_draft_secs)
    }

    pub fn prune_interval(&self) -> chrono::Duration {
        interval(self.prune_interval_secs)
    }

    /// How long finished jobs and artifacts are kept, at least one day.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days.clamp(1, MAX_RETENTION_DAYS))
    }

    fn to_entries(&self) -> Vec<(&str, String, &str)> {
        vec![
            ("job_batch_size", self.job_batch_size.to_string(), "Jobs claimed per runner pass"),
            ("job_max_attempts", self.job_max_attempts.to_string(), "Default attempts before a job fails terminally"),
            ("job_backoff_base_secs", self.job_backoff_base_secs.to_string(), "Retry backoff base seconds"),
            ("job_backoff_max_secs", self.job_backoff_max_secs.to_string(), "Retry backoff ceiling seconds"),
            ("job_stale_secs", self.job_stale_secs.to_string(), "RUNNING jobs older than this are requeued"),
            ("runner_poll_ms", self.runner_poll_ms.to_string(), "Job runner poll interval ms"),
            ("stale_draft_secs", self.stale_draft_secs.to_string(), "Drafts stuck in sending longer than this are reconciled"),
            ("stale_draft_batch", self.stale_draft_batch.to_string(), "Drafts reconciled per sweep"),
            ("sweep_interval_secs", self.sweep_interval_secs.to_string(), "Stale draft sweep interval seconds"),
            ("auto_send_threshold", self.auto_send_threshold.to_string(), "Minimum confidence to auto-send"),
            ("auto_send_delay_secs", self.auto_send_delay_secs.to_string(), "Delay before sending; 0 sends immediately"),
            ("revision_max_iterations", self.revision_max_iterations.to_string(), "Revision loop iteration budget"),
            ("revision_time_budget_ms", self.revision_time_budget_ms.to_string(), "Revision loop wall-clock budget ms"),
            ("revision_epsilon", self.revision_epsilon.to_string(), "Minimum confidence gain per revision"),
            ("revision_patience", self.revision_patience.to_string(), "Consecutive low-gain revisions before stopping"),
            ("max_context_chunks", self.max_context_chunks.to_string(), "Context chunks per revision prompt"),
            ("prompt_max_attempts", self.prompt_max_attempts.to_string(), "Provider calls per prompt"),
            ("token_multiplier", self.token_multiplier.to_string(), "Output token budget growth per retry"),
            ("token_cap", self.token_cap.to_string(), "Output token budget ceiling"),
            ("token_retry_bonus", self.token_retry_bonus.to_string(), "Additive output token bonus per retry"),
            ("prompt_timeout_secs", self.prompt_timeout_secs.to_string(), "Single provider call timeout seconds"),
            ("default_output_tokens", self.default_output_tokens.to_string(), "First-attempt output token budget"),
            ("prune_interval_secs", self.prune_interval_secs.to_string(), "Minimum seconds between prune passes"),
            ("retention_days", self.retention_days.to_string(), "Days finished jobs and artifacts are kept"),
        ]
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            max_attempts: self.prompt_max_attempts,
            multiplier: self.token_multiplier,
            token_cap: self.token_cap,
            retry_bonus: self.token_retry_bonus,
            call_timeout: Duration::from_secs(self.prompt_timeout_secs),
            ..RunnerSettings::default()
        }
    }
}

fn interval(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_INTERVAL_SECS) as i64)
}

fn get_or<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_map_falls_back_on_missing_or_bad_values() {
        let mut m = HashMap::new();
        m.insert("auto_send_threshold".to_string(), "0.9".to_string());
        m.insert("job_batch_size".to_string(), "lots".to_string());
        let cfg = OutreachCfg::from_map(&m);
        assert_eq!(cfg.auto_send_threshold, 0.9);
        assert_eq!(cfg.job_batch_size, 10);
        assert_eq!(cfg.revision_max_iterations, 3);
    }

    #[test]
    fn entries_cover_every_field() {
        let cfg = OutreachCfg::default();
        let entries = cfg.to_entries();
        let map: HashMap<String, String> =
            entries.iter().map(|(k, v, _)| (k.to_string(), v.clone())).collect();
        let reloaded = OutreachCfg::from_map(&map);
        assert_eq!(entries.len(), 24);
        assert_eq!(reloaded.token_cap, cfg.token_cap);
        assert_eq!(reloaded.retention_days, cfg.retention_days);
    }

    #[test]
    fn out_of_range_durations_never_overflow() {
        let mut m = HashMap::new();
        m.insert("retention_days".to_string(), i64::MAX.to_string());
        m.insert("job_stale_secs".to_string(), u64::MAX.to_string());
        let cfg = OutreachCfg::from_map(&m);
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.retention(), chrono::Duration::days(30));
        assert_eq!(cfg.job_stale_after(), chrono::Duration::seconds(MAX_INTERVAL_SECS as i64));

        m.insert("retention_days".to_string(), "-4".to_string());
        assert_eq!(OutreachCfg::from_map(&m).retention_days, 30);

        let hand_built = OutreachCfg { retention_days: i64::MIN, ..OutreachCfg::default() };
        assert_eq!(hand_built.retention(), chrono::Duration::days(1));
    }

    #[test]
    fn runner_settings_follow_cfg() {
        let s = OutreachCfg::default().runner_settings();
        assert_eq!(s.max_attempts, 3);
        assert_eq!(s.token_cap, 8000);
        assert_eq!(s.call_timeout, Duration::from_secs(60));
    }
}
