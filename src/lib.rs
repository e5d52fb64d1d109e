#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Refund or retention of deposits on cancellation.
pub mod cancellation;
/// Deposit amounts and derived escrow state.
pub mod deposit;
mod enforcer;
mod errors;
/// Job, resolution and payment writes.
pub mod jobs;
/// Deposit metadata embedded in notes.
pub mod metadata;
mod processor;
mod scheduler;
/// Database schema definitions.
pub mod schema;
mod setup;
/// Booking, event and provider storage.
pub mod storage;
mod util;

/// Storage-level job completion guards.
pub use self::enforcer::{
    REPAIR_WAIVER_REASON, guards_installed, install_guards, repair_completed_jobs,
    unresolved_completed_jobs,
};
/// Error types.
pub use self::errors::{
    APPEND_ONLY_SQLSTATE, GuardError, MetadataError, RESOLUTION_REQUIRED, RESOLUTION_REQUIRED_SQLSTATE, ReleaseError,
    StartupError, resolution_required_job,
};
/// Payment processor capability.
pub use self::processor::{DEFAULT_CURRENCY, HttpPaymentProcessor, PaymentProcessor, TransferRequest};
/// The deposit auto-release scheduler.
pub use self::scheduler::{CycleReport, ReleaseOutcome, ReleaseScheduler, RunHandle, transfer_group_key};
/// Migrations, repair and guard installation in startup order.
pub use self::setup::setup_database;
