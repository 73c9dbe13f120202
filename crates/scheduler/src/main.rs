use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use regards_infra::jobs::{
    InMemoryJobQueue, JobPuller, JobPullerConfig, JobPullerHandle, JobResult, ThreadJobRunner,
    with_job_lock,
};
use regards_infra::{
    InMemoryLockStore, LockService, LockStore, PostgresLockStore, SchedulerConfig,
    StaticTenantResolver,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    regards_observability::init();

    let config = SchedulerConfig::from_env().context("invalid scheduler configuration")?;
    info!(config = %serde_json::to_string(&config)?, "scheduler configuration loaded");

    let handle = match &config.database_url {
        Some(url) => {
            let pool = sqlx::PgPool::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            let store = PostgresLockStore::new(pool, tokio::runtime::Handle::current());
            store
                .ensure_schema()
                .await
                .context("failed to create lock table")?;
            info!("using Postgres lock store");
            start(&config, store)?
        }
        None => {
            warn!("DATABASE_URL not set; locks are local to this process");
            start(&config, InMemoryLockStore::new())?
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    tokio::task::spawn_blocking(move || handle.shutdown()).await?;
    Ok(())
}

fn start<S: LockStore + 'static>(
    config: &SchedulerConfig,
    store: S,
) -> anyhow::Result<JobPullerHandle> {
    let locks = Arc::new(LockService::new(store));

    let handler = with_job_lock(locks, config.lock_expiration_secs, |job, _| {
        info!(job_id = %job.id, tenant = %job.tenant, kind = %job.kind, "running job");
        JobResult::Success
    })?;
    let runner = ThreadJobRunner::new().with_handler("*", handler);

    let handle = JobPuller::new(
        Arc::new(StaticTenantResolver::new(config.tenants.clone())),
        InMemoryJobQueue::arc(),
        runner,
    )
    .spawn(JobPullerConfig::from(config).with_name("regards-job-puller"))
    .context("failed to spawn job puller")?;

    Ok(handle)
}
