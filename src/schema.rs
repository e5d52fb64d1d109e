//! Database schema definitions for SQLx.
//!
//! Row types for the tables created by `migrations/`, and the Postgres enum
//! types that back their status columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of a unit of scheduled work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet started.
    Scheduled,
    /// Work has begun.
    InProgress,
    /// Closed out. Requires a [`JobResolution`].
    Completed,
    /// Called off.
    Cancelled,
}

/// How a job's financial outcome was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "resolution_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    /// An invoice was issued and paid.
    Invoice,
    /// A direct payment was recorded.
    Payment,
    /// No payment is expected. Carries a waiver reason.
    Waived,
}

/// Settlement state of a [`JobPayment`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Paid,
    Confirmed,
    Failed,
}

impl PaymentStatus {
    /// Whether money has actually settled for this payment.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Paid | Self::Confirmed)
    }
}

/// What a [`JobPayment`] represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    /// An ordinary payment against the job or its invoice.
    #[default]
    Standard,
    /// A deposit collected ahead of the work.
    Deposit,
    /// A deposit handed back to the customer.
    DepositRefund,
}

/// Escrow axis of a [`BookingRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "deposit_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// No deposit has been collected.
    None,
    /// An authorization exists but funds have not settled.
    Held,
    /// Funds settled with the processor and are held in escrow.
    Captured,
    /// Funds were transferred to the provider. Terminal.
    Released,
    /// Funds were returned to the customer. Terminal.
    Refunded,
}

/// Engagement axis of a [`BookingRequest`], independent of [`DepositStatus`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "completion_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Pending,
    Scheduled,
    Completed,
    Cancelled,
}

/// Who caused a [`BookingEvent`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "actor_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Customer,
    Provider,
    /// Background processes such as the release scheduler.
    System,
}

/// Kind of entry in the booking audit log.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "booking_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BookingEventType {
    DepositCaptured,
    /// Written by the release scheduler after a successful close-out.
    DepositAutoReleased,
    DepositRefunded,
    DepositRetained,
    BookingCancelled,
}

/// A service provider, owner of jobs and bookings.
#[derive(Debug, Clone, FromRow)]
pub struct Provider {
    /// Unique identifier for the provider
    pub id: Uuid,
    /// Name shown to customers
    pub display_name: String,
    /// Processor account that receives released deposits, if configured
    pub payout_account: Option<String>,
    /// Timestamp when the provider was created
    pub created_at: DateTime<Utc>,
}

/// Represents a job record in the database
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job
    pub id: Uuid,
    /// Provider who owns the job
    pub owner_id: Uuid,
    /// Current lifecycle status
    pub status: JobStatus,
    /// Total price in minor currency units
    pub price_cents: i64,
    /// Free-text annotation, may embed deposit metadata
    pub notes: Option<String>,
    /// Invoice raised for this job, if any
    pub invoice_id: Option<Uuid>,
    /// When the work is due to start
    pub scheduled_start: Option<DateTime<Utc>>,
    /// When the job was marked completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last write
    pub updated_at: DateTime<Utc>,
}

/// Proof of a job's financial closure. One per job, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct JobResolution {
    /// Row identifier
    pub id: i64,
    /// The job this resolution closes out
    pub job_id: Uuid,
    /// How the job was settled
    pub resolution_type: ResolutionType,
    /// Why no payment is expected, required for waivers
    pub waiver_reason: Option<String>,
    /// When the resolution was recorded
    pub resolved_at: DateTime<Utc>,
    /// Who recorded it
    pub resolved_by: Uuid,
}

/// Represents a payment linked to a job or its invoice
#[derive(Debug, Clone, FromRow)]
pub struct JobPayment {
    /// Unique identifier for the payment
    pub id: Uuid,
    /// Job the payment was taken for
    pub job_id: Option<Uuid>,
    /// Invoice the payment was taken against
    pub invoice_id: Option<Uuid>,
    /// Amount in minor currency units
    pub amount_cents: i64,
    /// Payment method, e.g. `card` or `cash`
    pub method: String,
    /// Settlement state
    pub status: PaymentStatus,
    /// Structured kind; `None` on rows written before the column existed
    pub kind: Option<PaymentKind>,
    /// Free-text annotation, carries the legacy kind tag
    pub notes: Option<String>,
    /// Timestamp when the payment was recorded
    pub created_at: DateTime<Utc>,
}

/// A prospective engagement that may carry a deposit
#[derive(Debug, Clone, FromRow)]
pub struct BookingRequest {
    /// Unique identifier for the booking
    pub id: Uuid,
    /// Provider the booking was made with
    pub provider_id: Uuid,
    /// Customer contact name
    pub customer_name: String,
    /// Customer contact email
    pub customer_email: Option<String>,
    /// Customer contact phone
    pub customer_phone: Option<String>,
    /// Requested service, as submitted
    pub service_details: Value,
    /// Deposit in minor currency units
    pub deposit_cents: i64,
    /// Escrow state
    pub deposit_status: DepositStatus,
    /// Engagement state
    pub completion_status: CompletionStatus,
    /// Processor charge holding the deposit
    pub charge_id: Option<String>,
    /// Processor transfer that released the deposit
    pub transfer_id: Option<String>,
    /// Portion of the deposit carried forward, overrides `deposit_cents` on release
    pub rolled_amount_cents: Option<i64>,
    /// When the work is due to start
    pub scheduled_start: Option<DateTime<Utc>>,
    /// When the booked work was finished
    pub job_completed_at: Option<DateTime<Utc>>,
    /// Manual marker making the booking eligible for release immediately
    pub release_requested: bool,
    /// Last release attempt that was skipped or failed
    pub last_release_attempt_at: Option<DateTime<Utc>>,
    /// Timestamp when the booking was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last write
    pub updated_at: DateTime<Utc>,
}

/// Represents an entry in the append-only booking audit log
#[derive(Debug, Clone, FromRow)]
pub struct BookingEvent {
    /// Row identifier
    pub id: i64,
    /// Booking the event belongs to
    pub booking_id: Uuid,
    /// What happened
    pub event_type: BookingEventType,
    /// Who made it happen
    pub actor_type: ActorType,
    /// Free-form details such as amounts and trigger reasons
    pub metadata: Value,
    /// Timestamp when the event was recorded
    pub created_at: DateTime<Utc>,
}
