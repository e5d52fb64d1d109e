use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// SQLSTATE raised by the job-completion guard.
pub const RESOLUTION_REQUIRED_SQLSTATE: &str = "RR001";

/// Prefix of the guard's error message, followed by the job id.
pub const RESOLUTION_REQUIRED: &str = "RESOLUTION_REQUIRED";

/// SQLSTATE raised when a resolution or booking event is updated or deleted.
pub const APPEND_ONLY_SQLSTATE: &str = "RR002";

/// Error type for writes to the job table.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The write would mark a job completed without a resolution on record.
    #[error("RESOLUTION_REQUIRED: job {job_id} has no resolution")]
    ResolutionRequired {
        /// The job that was being completed.
        job_id: Uuid,
    },

    /// A waiver was submitted without saying why.
    #[error("waived resolution for job {job_id} requires a reason")]
    MissingWaiverReason {
        /// The job the waiver was for.
        job_id: Uuid,
    },

    /// No job with this id exists.
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    /// Any other database failure.
    #[error(transparent)]
    DatabaseError(sqlx::Error),
}

impl GuardError {
    /// Message suitable for showing to the person who attempted the write.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ResolutionRequired { .. } => {
                "Complete this job by recording payment or a waiver first."
            }
            Self::MissingWaiverReason { .. } => "A waiver needs a reason.",
            Self::JobNotFound(_) => "This job no longer exists.",
            Self::DatabaseError(_) => "Something went wrong while saving this job.",
        }
    }
}

impl From<sqlx::Error> for GuardError {
    fn from(error: sqlx::Error) -> Self {
        match resolution_required_job(&error) {
            Some(job_id) => Self::ResolutionRequired { job_id },
            None => Self::DatabaseError(error),
        }
    }
}

/// Extracts the job id from a rejection raised by the storage guard.
///
/// Returns `None` for every other kind of error.
pub fn resolution_required_job(error: &sqlx::Error) -> Option<Uuid> {
    let db_error = error.as_database_error()?;
    let is_guard = db_error.code().as_deref() == Some(RESOLUTION_REQUIRED_SQLSTATE)
        || db_error.message().starts_with(RESOLUTION_REQUIRED);
    if !is_guard {
        return None;
    }

    db_error
        .message()
        .split_whitespace()
        .find_map(|word| Uuid::parse_str(word.trim_matches(|c: char| !c.is_ascii_hexdigit())).ok())
}

/// Error type for process startup. Every variant is fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Schema migrations could not be applied.
    #[error("failed to run migrations: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    /// Backfilling resolutions for legacy completed jobs failed.
    #[error("failed to repair completed jobs without a resolution: {0}")]
    RepairError(#[source] sqlx::Error),

    /// The job-completion guard could not be installed.
    #[error("failed to install job completion guards: {0}")]
    GuardInstallError(#[source] sqlx::Error),
}

/// Error type for a single deposit release attempt.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// Reading or writing booking state failed.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),

    /// The payment processor rejected or failed the transfer.
    #[error("transfer failed: {0:#}")]
    TransferError(anyhow::Error),

    /// The payment processor did not answer in time.
    #[error("transfer timed out after {0:?}")]
    TransferTimeout(Duration),
}

/// Error type for deposit configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    /// Deposit amounts are never negative.
    #[error("deposit amount must not be negative, got {0}")]
    NegativeAmount(i64),
}
