use crate::enforcer::{install_guards, repair_completed_jobs};
use crate::errors::StartupError;
use sqlx::PgPool;
use tracing::info;

/// Bring the database to a state the application may serve from.
///
/// Runs the migrations, backfills resolutions for legacy completed jobs and
/// then installs the job-completion guards, in that order, so no completed job
/// is left without a resolution once the guards are active. Any error is
/// fatal: the caller must not start serving without the guards in place.
pub async fn setup_database(pool: &PgPool) -> Result<(), StartupError> {
    sqlx::migrate!("./migrations").run(pool).await?;

    let repaired = repair_completed_jobs(pool)
        .await
        .map_err(StartupError::RepairError)?;

    install_guards(pool)
        .await
        .map_err(StartupError::GuardInstallError)?;

    info!(repaired = repaired.len(), "Database ready");
    Ok(())
}
