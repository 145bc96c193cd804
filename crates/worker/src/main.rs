use personaflow::api;
use personaflow::clients::{FsArtifactStore, OpenAiBatchClient, PgSubjectDirectory, ProcessTrainer};
use personaflow::config;
use personaflow::db;
use personaflow::jobs::JobsRepo;
use personaflow::telemetry;
use personaflow::{Deps, Orchestrator};

use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    telemetry::init_tracing();

    let api_addr = cfg.admin_addr.clone();

    info!(
        notify_mode = ?cfg.pipeline.notify_mode,
        poll_interval_secs = cfg.pipeline.poll_interval.as_secs(),
        max_wait_hours = cfg.pipeline.max_wait.as_secs() / 3600,
        artifact_dir = %cfg.artifact_dir.display(),
        api = api_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        "personaflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let api_key = cfg
        .openai_api_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is missing"))?;
    let provider = OpenAiBatchClient::new(api_key, cfg.pipeline.call_timeout)?
        .with_base_url(cfg.openai_base_url.clone());

    let artifacts = FsArtifactStore::new(&cfg.artifact_dir)?;
    let trainer = ProcessTrainer::new(cfg.trainer_cmd.clone(), cfg.artifact_dir.join("runs"))?
        .with_publish_cmd(cfg.publish_cmd.clone());

    let deps = Deps {
        store: Arc::new(JobsRepo::new(pool.clone())),
        provider: Arc::new(provider),
        artifacts: Arc::new(artifacts),
        subjects: Arc::new(PgSubjectDirectory::new(pool.clone())),
        trainer: Arc::new(trainer),
    };
    let orchestrator = Orchestrator::new(deps, cfg.pipeline.clone());

    // rebuild watchers before taking new traffic
    let report = orchestrator.reconcile().await;
    info!(?report, "startup reconciliation done");

    // ---- API task ----
    let app = api::router(api::ApiState {
        orchestrator: orchestrator.clone(),
    });
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    let outcome = tokio::select! {
        res = api_handle => match res {
            Ok(inner) => inner,
            Err(e) => Err(e.into()),
        },
        res = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            res.map_err(Into::into)
        }
    };

    orchestrator.shutdown().await;
    pool.close().await;

    if let Err(e) = &outcome {
        error!(error = %e, "worker stopped with an error");
    }
    outcome
}
