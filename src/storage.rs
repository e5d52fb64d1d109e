use crate::schema::{
    ActorType, BookingEvent, BookingEventType, BookingRequest, CompletionStatus, DepositStatus,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

const BOOKING_COLUMNS: &str = r"
    id, provider_id, customer_name, customer_email, customer_phone, service_details,
    deposit_cents, deposit_status, completion_status, charge_id, transfer_id,
    rolled_amount_cents, scheduled_start, job_completed_at, release_requested,
    last_release_attempt_at, created_at, updated_at
";

/// A booking to insert.
#[derive(Debug, Clone)]
pub struct NewBooking {
    /// Provider the booking is with.
    pub provider_id: Uuid,
    /// Customer contact name.
    pub customer_name: String,
    /// Customer contact email.
    pub customer_email: Option<String>,
    /// Customer contact phone.
    pub customer_phone: Option<String>,
    /// Requested service, as submitted.
    pub service_details: Value,
    /// Deposit in minor currency units.
    pub deposit_cents: i64,
    /// When the work is due to start.
    pub scheduled_start: Option<DateTime<Utc>>,
}

/// Insert a provider and return its id.
pub async fn create_provider(
    pool: &PgPool,
    display_name: &str,
    payout_account: Option<&str>,
) -> Result<Uuid, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        "INSERT INTO providers (id, display_name, payout_account) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(display_name)
    .bind(payout_account)
    .fetch_one(pool)
    .await
}

/// Insert a booking with no deposit collected yet.
pub async fn create_booking(pool: &PgPool, booking: &NewBooking) -> Result<BookingRequest, sqlx::Error> {
    sqlx::query_as::<_, BookingRequest>(&format!(
        r"
        INSERT INTO booking_requests
            (id, provider_id, customer_name, customer_email, customer_phone,
             service_details, deposit_cents, scheduled_start)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {BOOKING_COLUMNS}
        "
    ))
    .bind(Uuid::new_v4())
    .bind(booking.provider_id)
    .bind(&booking.customer_name)
    .bind(&booking.customer_email)
    .bind(&booking.customer_phone)
    .bind(&booking.service_details)
    .bind(booking.deposit_cents)
    .bind(booking.scheduled_start)
    .fetch_one(pool)
    .await
}

/// Fetch a booking by id.
pub async fn find_booking(pool: &PgPool, booking_id: Uuid) -> Result<Option<BookingRequest>, sqlx::Error> {
    sqlx::query_as::<_, BookingRequest>(&format!(
        "SELECT {BOOKING_COLUMNS} FROM booking_requests WHERE id = $1"
    ))
    .bind(booking_id)
    .fetch_optional(pool)
    .await
}

/// Record that the processor settled the deposit on `charge_id`.
///
/// Returns `false` if the deposit was already captured or closed out.
pub async fn mark_deposit_captured(
    pool: &PgPool,
    booking_id: Uuid,
    charge_id: &str,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r"
        UPDATE booking_requests
        SET deposit_status = 'captured', charge_id = $2, updated_at = NOW()
        WHERE id = $1 AND deposit_status IN ('none', 'held')
        ",
    )
    .bind(booking_id)
    .bind(charge_id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    append_event(
        &mut tx,
        booking_id,
        BookingEventType::DepositCaptured,
        ActorType::Customer,
        serde_json::json!({ "charge_id": charge_id }),
    )
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Record that the booked work finished at `completed_at`, which starts the release clock.
pub async fn mark_job_completed(
    pool: &PgPool,
    booking_id: Uuid,
    completed_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE booking_requests
        SET job_completed_at = $2, updated_at = NOW()
        WHERE id = $1
        ",
    )
    .bind(booking_id)
    .bind(completed_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Make a captured booking eligible for release on the next cycle.
pub async fn request_release(pool: &PgPool, booking_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE booking_requests SET release_requested = TRUE, updated_at = NOW() WHERE id = $1")
        .bind(booking_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Bookings whose captured deposit is due for release.
///
/// Eligible means: deposit captured, a charge on record, either a manual
/// release request or a job completion older than `release_delay`, and
/// somewhere to pay it (a payout account, or nothing left to transfer).
/// Bookings never attempted come first, then the ones whose last failed
/// attempt is oldest, so failures rotate to the back.
pub(crate) async fn find_bookings_awaiting_release(
    pool: &PgPool,
    release_delay: Duration,
    limit: i64,
) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r"
        SELECT b.id FROM booking_requests b
        JOIN providers p ON p.id = b.provider_id
        WHERE b.deposit_status = 'captured'
          AND b.charge_id IS NOT NULL
          AND (
            b.release_requested
            OR b.job_completed_at <= NOW() - make_interval(secs => $1)
          )
          AND (
            COALESCE(b.rolled_amount_cents, b.deposit_cents) <= 0
            OR btrim(COALESCE(p.payout_account, '')) <> ''
          )
        ORDER BY b.last_release_attempt_at ASC NULLS FIRST,
                 b.job_completed_at ASC NULLS FIRST,
                 b.id ASC
        LIMIT $2
        ",
    )
    .bind(release_delay.as_secs_f64())
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Stamp a booking whose release was skipped or failed, moving it behind
/// the rest of the queue.
pub(crate) async fn record_release_attempt(pool: &PgPool, booking_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE booking_requests
        SET last_release_attempt_at = NOW()
        WHERE id = $1 AND deposit_status = 'captured'
        ",
    )
    .bind(booking_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Lock a booking for the rest of the transaction.
///
/// Returns `None` if the booking is gone or another transaction holds it.
pub(crate) async fn lock_booking_tx(
    tx: &mut Transaction<'_, Postgres>,
    booking_id: Uuid,
) -> Result<Option<BookingRequest>, sqlx::Error> {
    sqlx::query_as::<_, BookingRequest>(&format!(
        r"
        SELECT {BOOKING_COLUMNS} FROM booking_requests
        WHERE id = $1
        FOR UPDATE SKIP LOCKED
        "
    ))
    .bind(booking_id)
    .fetch_optional(&mut **tx)
    .await
}

/// The processor account a provider is paid out to, if one is configured.
pub(crate) async fn payout_account_tx(
    tx: &mut Transaction<'_, Postgres>,
    provider_id: Uuid,
) -> Result<Option<String>, sqlx::Error> {
    let account = sqlx::query_scalar::<_, Option<String>>(
        "SELECT payout_account FROM providers WHERE id = $1",
    )
    .bind(provider_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(account.flatten().filter(|account| !account.trim().is_empty()))
}

/// Close out a booking whose deposit was paid to the provider.
///
/// Only moves `captured` bookings forward; returns whether a row changed.
pub(crate) async fn mark_released_tx(
    tx: &mut Transaction<'_, Postgres>,
    booking_id: Uuid,
    transfer_id: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE booking_requests
        SET deposit_status = $2,
            completion_status = $3,
            transfer_id = COALESCE($4, transfer_id),
            updated_at = NOW()
        WHERE id = $1 AND deposit_status = 'captured'
        ",
    )
    .bind(booking_id)
    .bind(DepositStatus::Released)
    .bind(CompletionStatus::Completed)
    .bind(transfer_id)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Append an entry to a booking's audit log.
pub async fn append_event(
    tx: &mut Transaction<'_, Postgres>,
    booking_id: Uuid,
    event_type: BookingEventType,
    actor_type: ActorType,
    metadata: Value,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO booking_events (booking_id, event_type, actor_type, metadata)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        ",
    )
    .bind(booking_id)
    .bind(event_type)
    .bind(actor_type)
    .bind(metadata)
    .fetch_one(&mut **tx)
    .await
}

/// A booking's audit log, oldest first.
pub async fn events_for_booking(pool: &PgPool, booking_id: Uuid) -> Result<Vec<BookingEvent>, sqlx::Error> {
    sqlx::query_as::<_, BookingEvent>(
        r"
        SELECT id, booking_id, event_type, actor_type, metadata, created_at
        FROM booking_events
        WHERE booking_id = $1
        ORDER BY created_at ASC, id ASC
        ",
    )
    .bind(booking_id)
    .fetch_all(pool)
    .await
}
