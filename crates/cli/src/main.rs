mod app;

use std::time::Duration;

use anyhow::Context;
use outreach_core::cron::{CronCredentials, CronTask};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use app::App;

const DB_CONNECT_TIMEOUT_SECS: u64 = 3;
const USAGE: &str = "usage: outreach-worker serve | tick <process-jobs|stale-drafts|prune>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_target(true))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str);
    if !matches!(command, Some("serve" | "tick")) {
        anyhow::bail!(USAGE);
    }

    let pool = connect_db().await;
    let app = App::build(pool).await?;

    match (command, args.get(1)) {
        (Some("serve"), _) => serve(app).await,
        (Some("tick"), Some(task)) => tick(&app, task).await,
        _ => anyhow::bail!(USAGE),
    }
}

/// Connect and migrate. Any failure falls back to ephemeral in-memory mode.
async fn connect_db() -> Option<sqlx::PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        tracing::warn!("DATABASE_URL not set, running in ephemeral mode");
        return None;
    };
    let connect_result = tokio::time::timeout(
        Duration::from_secs(DB_CONNECT_TIMEOUT_SECS),
        sqlx::postgres::PgPoolOptions::new().max_connections(8).connect(&url),
    )
    .await;

    match connect_result {
        Ok(Ok(pool)) => match sqlx::migrate!("../../migrations").run(&pool).await {
            Ok(()) => {
                tracing::info!("database connected and migrations applied");
                Some(pool)
            }
            Err(e) => {
                tracing::warn!(error = %e, "database migration failed, falling back to ephemeral mode");
                None
            }
        },
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to connect DATABASE_URL, falling back to ephemeral mode");
            None
        }
        Err(_) => {
            tracing::warn!(
                timeout_secs = DB_CONNECT_TIMEOUT_SECS,
                "database connect timed out, falling back to ephemeral mode"
            );
            None
        }
    }
}

async fn serve(app: App) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    spawn_signal_canceler(token.clone());

    let cfg = app.cfg.clone();
    let runner = app.runner.clone().spawn(
        cfg.job_batch_size,
        Duration::from_millis(cfg.runner_poll_ms),
        token.child_token(),
    );
    let app = std::sync::Arc::new(app);
    let sweep = spawn_periodic(
        app.clone(),
        CronTask::StaleDrafts,
        Duration::from_secs(cfg.sweep_interval_secs),
        token.child_token(),
    );
    let prune = spawn_periodic(
        app,
        CronTask::Prune,
        Duration::from_secs(cfg.prune_interval_secs),
        token.child_token(),
    );
    tracing::info!("worker started");

    token.cancelled().await;
    for handle in [runner, sweep, prune] {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "worker task ended abnormally");
        }
    }
    tracing::info!("worker stopped");
    Ok(())
}

fn spawn_periodic(
    app: std::sync::Arc<App>,
    task: CronTask,
    every: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let response = app.trigger.run_task(task).await;
            if response.status != 200 {
                tracing::warn!(%task, status = response.status, body = %response.body, "periodic task failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(every) => {}
            }
        }
    })
}

/// One authorized cron invocation, as an external scheduler would make it.
async fn tick(app: &App, task: &str) -> anyhow::Result<()> {
    let secret = std::env::var("CRON_SECRET").context("CRON_SECRET must be set for tick")?;
    let response = app.trigger.dispatch(task, &CronCredentials::bearer(secret)).await;
    println!("{}", response.body);
    if response.status != 200 {
        anyhow::bail!("cron task {task} returned {}", response.status);
    }
    Ok(())
}

fn spawn_signal_canceler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(mut sigint), Ok(mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => {}
                        _ = sigterm.recv() => {}
                    }
                    tracing::info!("shutdown signal received");
                    token.cancel();
                }
                _ => tracing::warn!("failed to install signal handlers"),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        }
    });
}
