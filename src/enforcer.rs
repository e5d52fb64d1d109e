//! Storage-level enforcement of "no completed job without a resolution".
//!
//! The rule lives in Postgres triggers on the `jobs` table so it holds for every
//! writer: application code, migrations and hand-written fixes alike. The
//! triggers raise SQLSTATE [`RESOLUTION_REQUIRED_SQLSTATE`] with the job id in
//! the message, which [`GuardError`](crate::GuardError) recognises.
//!
//! Resolutions and booking events are append-only: a second pair of triggers
//! rejects every `UPDATE` or `DELETE` on `job_resolutions` and
//! `booking_events` with SQLSTATE [`APPEND_ONLY_SQLSTATE`].
//!
//! Legacy rows that already violate the rule are backfilled by
//! [`repair_completed_jobs`], which must run before [`install_guards`].

use crate::errors::{APPEND_ONLY_SQLSTATE, RESOLUTION_REQUIRED_SQLSTATE};
use sqlx::PgPool;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Waiver reason written on resolutions synthesized by the repair procedure.
pub const REPAIR_WAIVER_REASON: &str = "internal";

const INSERT_TRIGGER: &str = "jobs_require_resolution_on_insert";
const UPDATE_TRIGGER: &str = "jobs_require_resolution_on_update";
const RESOLUTIONS_TRIGGER: &str = "job_resolutions_append_only";
const EVENTS_TRIGGER: &str = "booking_events_append_only";

fn guard_function_sql() -> String {
    format!(
        r"
        CREATE OR REPLACE FUNCTION require_job_resolution() RETURNS trigger AS $$
        BEGIN
            IF NEW.status IS DISTINCT FROM 'completed' THEN
                RETURN NEW;
            END IF;
            IF TG_OP = 'UPDATE' THEN
                IF OLD.status = 'completed' THEN
                    RETURN NEW;
                END IF;
            END IF;
            IF NOT EXISTS (SELECT 1 FROM job_resolutions WHERE job_id = NEW.id) THEN
                RAISE EXCEPTION 'RESOLUTION_REQUIRED: job % has no resolution', NEW.id
                    USING ERRCODE = '{RESOLUTION_REQUIRED_SQLSTATE}',
                          HINT = 'Record a payment, invoice or waiver for the job first.';
            END IF;
            RETURN NEW;
        END;
        $$ LANGUAGE plpgsql
        "
    )
}

fn append_only_function_sql() -> String {
    format!(
        r"
        CREATE OR REPLACE FUNCTION reject_history_rewrite() RETURNS trigger AS $$
        BEGIN
            RAISE EXCEPTION 'APPEND_ONLY: % rows cannot be modified (%)', TG_TABLE_NAME, TG_OP
                USING ERRCODE = '{APPEND_ONLY_SQLSTATE}';
        END;
        $$ LANGUAGE plpgsql
        "
    )
}

/// Install (or reinstall) the completion guards on the `jobs` table and the
/// append-only guards on `job_resolutions` and `booking_events`.
///
/// The functions and triggers are dropped and recreated in one transaction,
/// so calling this on every start is safe.
#[instrument(name = "escrow.install_guards", skip(pool))]
pub async fn install_guards(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::raw_sql(&guard_function_sql()).execute(&mut *tx).await?;
    sqlx::raw_sql(&append_only_function_sql()).execute(&mut *tx).await?;

    sqlx::raw_sql(&format!(
        r"
        DROP TRIGGER IF EXISTS {INSERT_TRIGGER} ON jobs;
        CREATE TRIGGER {INSERT_TRIGGER}
            BEFORE INSERT ON jobs
            FOR EACH ROW EXECUTE FUNCTION require_job_resolution();

        DROP TRIGGER IF EXISTS {UPDATE_TRIGGER} ON jobs;
        CREATE TRIGGER {UPDATE_TRIGGER}
            BEFORE UPDATE ON jobs
            FOR EACH ROW
            WHEN (NEW.status = 'completed' AND OLD.status IS DISTINCT FROM 'completed')
            EXECUTE FUNCTION require_job_resolution();

        DROP TRIGGER IF EXISTS {RESOLUTIONS_TRIGGER} ON job_resolutions;
        CREATE TRIGGER {RESOLUTIONS_TRIGGER}
            BEFORE UPDATE OR DELETE ON job_resolutions
            FOR EACH ROW EXECUTE FUNCTION reject_history_rewrite();

        DROP TRIGGER IF EXISTS {EVENTS_TRIGGER} ON booking_events;
        CREATE TRIGGER {EVENTS_TRIGGER}
            BEFORE UPDATE OR DELETE ON booking_events
            FOR EACH ROW EXECUTE FUNCTION reject_history_rewrite();
        "
    ))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!("Job completion guards installed");
    Ok(())
}

/// Whether every completion and append-only trigger is currently installed.
pub async fn guards_installed(pool: &PgPool) -> Result<bool, sqlx::Error> {
    let triggers = [INSERT_TRIGGER, UPDATE_TRIGGER, RESOLUTIONS_TRIGGER, EVENTS_TRIGGER];
    let count = sqlx::query_scalar::<_, i64>(
        r"
        SELECT COUNT(*) FROM pg_trigger
        WHERE tgrelid IN ('jobs'::regclass, 'job_resolutions'::regclass, 'booking_events'::regclass)
          AND tgname::text = ANY($1)
          AND NOT tgisinternal
        ",
    )
    .bind(&triggers[..])
    .fetch_one(pool)
    .await?;

    Ok(usize::try_from(count).is_ok_and(|count| count == triggers.len()))
}

/// Backfill a waiver for every completed job that has no resolution.
///
/// Each waiver is dated at the job's completion time, falling back to its
/// creation time, and attributed to the job's owner. Conflicts on `job_id` are
/// ignored, so reruns insert nothing. Returns the ids of the jobs repaired by
/// this call.
#[instrument(name = "escrow.repair_completed_jobs", skip(pool))]
pub async fn repair_completed_jobs(pool: &PgPool) -> Result<Vec<Uuid>, sqlx::Error> {
    let repaired = sqlx::query_scalar::<_, Uuid>(
        r"
        INSERT INTO job_resolutions (job_id, resolution_type, waiver_reason, resolved_at, resolved_by)
        SELECT j.id, 'waived'::resolution_type, $1, COALESCE(j.completed_at, j.created_at, NOW()), j.owner_id
        FROM jobs j
        WHERE j.status = 'completed'
          AND NOT EXISTS (SELECT 1 FROM job_resolutions r WHERE r.job_id = j.id)
        ON CONFLICT (job_id) DO NOTHING
        RETURNING job_id
        ",
    )
    .bind(REPAIR_WAIVER_REASON)
    .fetch_all(pool)
    .await?;

    if repaired.is_empty() {
        info!("No completed jobs without a resolution");
    } else {
        // Some of these may have been paid through a channel that never
        // produced a payment row; they are flagged here rather than reclassified.
        warn!(
            count = repaired.len(),
            job_ids = ?repaired,
            "Waived completed jobs that had no resolution"
        );
    }

    Ok(repaired)
}

/// Completed jobs that have no resolution. Empty whenever the guards are doing their job.
pub async fn unresolved_completed_jobs(pool: &PgPool) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r"
        SELECT j.id FROM jobs j
        WHERE j.status = 'completed'
          AND NOT EXISTS (SELECT 1 FROM job_resolutions r WHERE r.job_id = j.id)
        ORDER BY j.created_at
        ",
    )
    .fetch_all(pool)
    .await
}
