use std::sync::Arc;

use sea_orm_migration::MigratorTrait;

use autopilot_worker::{bots, config, credentials, queue, runner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = config::Settings::from_env()?;

    let db = autopilot_db::connect(&settings.database_url).await?;
    // Apply migrations on boot (idempotent).
    autopilot_migration::Migrator::up(&db, None).await?;

    let queue = Arc::new(queue::QueueClient::new(settings.worker_concurrency));
    let ctx = Arc::new(runner::WorkerCtx {
        auth: credentials::AuthBackendClient::new(&settings),
        db: Arc::new(db),
        queue: queue.clone(),
        settings,
    });

    queue.start(Arc::new({
        let ctx = ctx.clone();
        move |req| {
            let ctx = ctx.clone();
            Box::pin(runner::run_bot(ctx, req))
        }
    }));

    // Job handles do not survive a worker restart; reconcile bot records
    // that still point at them before accepting new work.
    bots::recover_interrupted_bots(ctx.db.as_ref(), &queue).await?;

    tracing::info!(
        concurrency = ctx.settings.worker_concurrency,
        "autopilot worker ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    queue.shutdown().await;

    Ok(())
}
