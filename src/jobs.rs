//! Job, resolution and payment writes.
//!
//! Checks made here only fail fast. The triggers installed by
//! [`install_guards`](crate::install_guards) are what actually keeps a job
//! from being completed without a resolution, and their rejections come back
//! as the same [`GuardError::ResolutionRequired`].

use crate::deposit::DepositState;
use crate::errors::GuardError;
use crate::schema::{Job, JobPayment, JobResolution, JobStatus, PaymentKind, PaymentStatus, ResolutionType};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, owner_id, status, price_cents, notes, invoice_id, scheduled_start, completed_at, created_at, updated_at";
const PAYMENT_COLUMNS: &str = "id, job_id, invoice_id, amount_cents, method, status, kind, notes, created_at";

/// A job to insert.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Identifier, chosen by the caller so a resolution can be recorded first.
    pub id: Uuid,
    /// Provider who owns the job.
    pub owner_id: Uuid,
    /// Initial status. `Completed` requires an existing resolution.
    pub status: JobStatus,
    /// Price in minor currency units.
    pub price_cents: i64,
    /// Free-text annotation, may embed deposit metadata.
    pub notes: Option<String>,
    /// Invoice raised for the job.
    pub invoice_id: Option<Uuid>,
    /// When the work is due to start.
    pub scheduled_start: Option<DateTime<Utc>>,
}

impl NewJob {
    /// A scheduled job with no notes, invoice or start time.
    pub fn scheduled(owner_id: Uuid, price_cents: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            status: JobStatus::Scheduled,
            price_cents,
            notes: None,
            invoice_id: None,
            scheduled_start: None,
        }
    }
}

/// A resolution to record.
#[derive(Debug, Clone)]
pub struct NewResolution {
    /// The job being closed out.
    pub job_id: Uuid,
    /// How it was settled.
    pub resolution_type: ResolutionType,
    /// Required for [`ResolutionType::Waived`].
    pub waiver_reason: Option<String>,
    /// Who recorded it.
    pub resolved_by: Uuid,
}

/// A payment to record.
#[derive(Debug, Clone)]
pub struct NewPayment {
    /// Job the payment was taken for.
    pub job_id: Option<Uuid>,
    /// Invoice the payment was taken against.
    pub invoice_id: Option<Uuid>,
    /// Amount in minor currency units.
    pub amount_cents: i64,
    /// Payment method, e.g. `card`.
    pub method: String,
    /// Settlement state.
    pub status: PaymentStatus,
    /// What the payment represents.
    pub kind: PaymentKind,
    /// Free-text annotation.
    pub notes: Option<String>,
}

/// Insert a job. Inserting it as completed requires a resolution on record.
#[instrument(name = "escrow.create_job", skip(pool, job), fields(job.id = %job.id))]
pub async fn create_job(pool: &PgPool, job: &NewJob) -> Result<Job, GuardError> {
    let completed_at = (job.status == JobStatus::Completed).then(Utc::now);

    let job = sqlx::query_as::<_, Job>(&format!(
        r"
        INSERT INTO jobs (id, owner_id, status, price_cents, notes, invoice_id, scheduled_start, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {JOB_COLUMNS}
        "
    ))
    .bind(job.id)
    .bind(job.owner_id)
    .bind(job.status)
    .bind(job.price_cents)
    .bind(&job.notes)
    .bind(job.invoice_id)
    .bind(job.scheduled_start)
    .bind(completed_at)
    .fetch_one(pool)
    .await?;

    Ok(job)
}

/// Fetch a job by id.
pub async fn find_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Record the financial resolution of a job.
///
/// A job has at most one resolution; if one already exists it is returned
/// unchanged.
#[instrument(name = "escrow.record_resolution", skip(pool, resolution), fields(job.id = %resolution.job_id))]
pub async fn record_resolution(
    pool: &PgPool,
    resolution: &NewResolution,
) -> Result<JobResolution, GuardError> {
    let mut tx = pool.begin().await?;
    let recorded = record_resolution_tx(&mut tx, resolution).await?;
    tx.commit().await?;
    Ok(recorded)
}

async fn record_resolution_tx(
    tx: &mut Transaction<'_, Postgres>,
    resolution: &NewResolution,
) -> Result<JobResolution, GuardError> {
    let has_reason = resolution
        .waiver_reason
        .as_deref()
        .is_some_and(|reason| !reason.trim().is_empty());
    if resolution.resolution_type == ResolutionType::Waived && !has_reason {
        return Err(GuardError::MissingWaiverReason {
            job_id: resolution.job_id,
        });
    }

    sqlx::query(
        r"
        INSERT INTO job_resolutions (job_id, resolution_type, waiver_reason, resolved_by)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (job_id) DO NOTHING
        ",
    )
    .bind(resolution.job_id)
    .bind(resolution.resolution_type)
    .bind(&resolution.waiver_reason)
    .bind(resolution.resolved_by)
    .execute(&mut **tx)
    .await?;

    let recorded = sqlx::query_as::<_, JobResolution>(
        r"
        SELECT id, job_id, resolution_type, waiver_reason, resolved_at, resolved_by
        FROM job_resolutions
        WHERE job_id = $1
        ",
    )
    .bind(resolution.job_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(recorded)
}

/// Fetch the resolution of a job, if it has one.
pub async fn find_resolution(pool: &PgPool, job_id: Uuid) -> Result<Option<JobResolution>, sqlx::Error> {
    sqlx::query_as::<_, JobResolution>(
        r"
        SELECT id, job_id, resolution_type, waiver_reason, resolved_at, resolved_by
        FROM job_resolutions
        WHERE job_id = $1
        ",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

/// Move a job to `status`.
///
/// Moving into [`JobStatus::Completed`] checks for a resolution first and
/// stamps `completed_at`. Every other transition is unchecked.
#[instrument(name = "escrow.update_job_status", skip(pool))]
pub async fn update_job_status(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
) -> Result<Job, GuardError> {
    let mut tx = pool.begin().await?;
    let job = update_job_status_tx(&mut tx, job_id, status).await?;
    tx.commit().await?;
    Ok(job)
}

async fn update_job_status_tx(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    status: JobStatus,
) -> Result<Job, GuardError> {
    if status == JobStatus::Completed {
        let resolved = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM job_resolutions WHERE job_id = $1)",
        )
        .bind(job_id)
        .fetch_one(&mut **tx)
        .await?;

        if !resolved {
            debug!("Refusing to complete job without a resolution");
            return Err(GuardError::ResolutionRequired { job_id });
        }
    }

    let job = sqlx::query_as::<_, Job>(&format!(
        r"
        UPDATE jobs
        SET status = $2,
            completed_at = CASE
                WHEN $2 = 'completed'::job_status AND status <> 'completed'::job_status THEN NOW()
                ELSE completed_at
            END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {JOB_COLUMNS}
        "
    ))
    .bind(job_id)
    .bind(status)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(GuardError::JobNotFound(job_id))?;

    Ok(job)
}

/// Mark a job completed. Fails with [`GuardError::ResolutionRequired`] unless
/// a resolution was recorded first.
pub async fn complete_job(pool: &PgPool, job_id: Uuid) -> Result<Job, GuardError> {
    update_job_status(pool, job_id, JobStatus::Completed).await
}

/// Record a resolution and complete the job in one transaction.
#[instrument(name = "escrow.resolve_and_complete", skip(pool, resolution), fields(job.id = %resolution.job_id))]
pub async fn resolve_and_complete(
    pool: &PgPool,
    resolution: &NewResolution,
) -> Result<(Job, JobResolution), GuardError> {
    let mut tx = pool.begin().await?;
    let recorded = record_resolution_tx(&mut tx, resolution).await?;
    let job = update_job_status_tx(&mut tx, resolution.job_id, JobStatus::Completed).await?;
    tx.commit().await?;
    Ok((job, recorded))
}

/// Record a payment against a job or invoice.
#[instrument(name = "escrow.record_payment", skip(pool, payment))]
pub async fn record_payment(pool: &PgPool, payment: &NewPayment) -> Result<JobPayment, sqlx::Error> {
    sqlx::query_as::<_, JobPayment>(&format!(
        r"
        INSERT INTO job_payments (id, job_id, invoice_id, amount_cents, method, status, kind, notes)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {PAYMENT_COLUMNS}
        "
    ))
    .bind(Uuid::new_v4())
    .bind(payment.job_id)
    .bind(payment.invoice_id)
    .bind(payment.amount_cents)
    .bind(&payment.method)
    .bind(payment.status)
    .bind(payment.kind)
    .bind(&payment.notes)
    .fetch_one(pool)
    .await
}

/// All payments recorded against a job or its invoice, oldest first.
pub async fn payments_for_job(pool: &PgPool, job: &Job) -> Result<Vec<JobPayment>, sqlx::Error> {
    sqlx::query_as::<_, JobPayment>(&format!(
        r"
        SELECT {PAYMENT_COLUMNS}
        FROM job_payments
        WHERE job_id = $1 OR ($2::uuid IS NOT NULL AND invoice_id = $2)
        ORDER BY created_at, id
        "
    ))
    .bind(job.id)
    .bind(job.invoice_id)
    .fetch_all(pool)
    .await
}

/// Load a job and its payments and derive its escrow state.
pub async fn deposit_state(pool: &PgPool, job_id: Uuid) -> Result<DepositState, GuardError> {
    let job = find_job(pool, job_id)
        .await?
        .ok_or(GuardError::JobNotFound(job_id))?;
    let payments = payments_for_job(pool, &job).await?;
    Ok(DepositState::compute(&job, &payments))
}
