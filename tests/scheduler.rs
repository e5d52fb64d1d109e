#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::Utc;
use claims::{assert_matches, assert_none, assert_ok, assert_some, assert_some_eq};
use escrow::schema::{BookingEventType, CompletionStatus, DepositStatus};
use escrow::storage::{
    NewBooking, create_booking, create_provider, events_for_booking, find_booking,
    mark_deposit_captured, mark_job_completed, request_release,
};
use escrow::{
    CycleReport, PaymentProcessor, ReleaseError, ReleaseOutcome, ReleaseScheduler,
    TransferRequest, setup_database, transfer_group_key,
};
use insta::assert_compact_json_snapshot;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let container = Postgres::default().start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((pool, container))
    }

    /// Create a scheduler that runs a single cycle
    pub(super) fn create_test_scheduler(
        pool: PgPool,
        processor: RecordingProcessor,
    ) -> ReleaseScheduler<RecordingProcessor> {
        ReleaseScheduler::new(pool, processor)
            .jitter(Duration::ZERO)
            .transfer_timeout(Duration::from_secs(5))
            .shutdown_after_first_cycle()
    }
}

/// Processor double that records every transfer it is asked for.
#[derive(Clone, Default)]
struct RecordingProcessor {
    transfers: Arc<Mutex<Vec<TransferRequest>>>,
    failing: Arc<AtomicBool>,
    rejected_destination: Option<String>,
    delay: Duration,
}

impl RecordingProcessor {
    fn failing() -> Self {
        let processor = Self::default();
        processor.failing.store(true, Ordering::SeqCst);
        processor
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn rejecting(destination: &str) -> Self {
        Self {
            rejected_destination: Some(destination.to_string()),
            ..Self::default()
        }
    }

    fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    fn transfers(&self) -> Vec<TransferRequest> {
        self.transfers.lock().unwrap().clone()
    }
}

impl PaymentProcessor for RecordingProcessor {
    async fn create_transfer(&self, request: &TransferRequest) -> anyhow::Result<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("processor unavailable");
        }
        if self.rejected_destination.as_ref() == Some(&request.destination) {
            anyhow::bail!("destination {} rejected", request.destination);
        }

        let mut transfers = self.transfers.lock().unwrap();
        transfers.push(request.clone());
        Ok(format!("tr_{}", transfers.len()))
    }
}

/// A booking whose 7500 deposit is captured and due for release.
async fn eligible_booking(pool: &PgPool, payout_account: Option<&str>) -> anyhow::Result<Uuid> {
    let provider_id = create_provider(pool, "Crew of Two", payout_account).await?;
    let booking = create_booking(
        pool,
        &NewBooking {
            provider_id,
            customer_name: "Dana".into(),
            customer_email: Some("dana@example.com".into()),
            customer_phone: None,
            service_details: serde_json::json!({ "service": "roof inspection" }),
            deposit_cents: 7_500,
            scheduled_start: Some(Utc::now()),
        },
    )
    .await?;

    assert!(mark_deposit_captured(pool, booking.id, "ch_123").await?);
    request_release(pool, booking.id).await?;
    Ok(booking.id)
}

async fn event_types(pool: &PgPool, booking_id: Uuid) -> anyhow::Result<Vec<BookingEventType>> {
    Ok(events_for_booking(pool, booking_id)
        .await?
        .into_iter()
        .map(|event| event.event_type)
        .collect())
}

#[tokio::test]
async fn captured_deposit_is_released() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let booking_id = eligible_booking(&pool, Some("acct_crew")).await?;

    let processor = RecordingProcessor::default();
    let scheduler = test_utils::create_test_scheduler(pool.clone(), processor.clone());

    let report = scheduler.run_cycle().await?;
    assert_eq!(
        report,
        CycleReport {
            eligible: 1,
            released: 1,
            ..CycleReport::default()
        }
    );

    let booking = find_booking(&pool, booking_id).await?.unwrap();
    assert_eq!(booking.deposit_status, DepositStatus::Released);
    assert_eq!(booking.completion_status, CompletionStatus::Completed);
    assert_some_eq!(booking.transfer_id, "tr_1".to_string());

    let transfers = processor.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].amount, 7_500);
    assert_eq!(transfers[0].currency, "usd");
    assert_eq!(transfers[0].destination, "acct_crew");
    assert_eq!(transfers[0].group_key, transfer_group_key(booking_id));

    let events = events_for_booking(&pool, booking_id).await?;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, BookingEventType::DepositCaptured);
    assert_eq!(events[1].event_type, BookingEventType::DepositAutoReleased);
    assert_compact_json_snapshot!(events[1].metadata, @r#"{"amount": 7500, "charge_id": "ch_123", "transfer_id": "tr_1", "trigger": "release_requested"}"#);

    // Released bookings drop out of the eligible set
    let report = scheduler.run_cycle().await?;
    assert_eq!(report, CycleReport::default());
    assert_eq!(processor.transfers().len(), 1);

    Ok(())
}

#[tokio::test]
async fn failed_transfer_leaves_booking_captured_for_retry() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let booking_id = eligible_booking(&pool, Some("acct_crew")).await?;

    let processor = RecordingProcessor::failing();
    let scheduler = test_utils::create_test_scheduler(pool.clone(), processor.clone());

    let report = scheduler.run_cycle().await?;
    assert_eq!(report.eligible, 1);
    assert_eq!(report.failed, 1);

    let booking = find_booking(&pool, booking_id).await?.unwrap();
    assert_eq!(booking.deposit_status, DepositStatus::Captured);
    assert_eq!(booking.completion_status, CompletionStatus::Pending);
    assert_none!(booking.transfer_id);
    assert_eq!(event_types(&pool, booking_id).await?, [BookingEventType::DepositCaptured]);

    assert_matches!(
        scheduler.release_booking(booking_id).await,
        Err(ReleaseError::TransferError(_))
    );

    // Next cycle sees it again and succeeds once the processor recovers
    processor.recover();
    let report = scheduler.run_cycle().await?;
    assert_eq!(report.eligible, 1);
    assert_eq!(report.released, 1);

    let booking = find_booking(&pool, booking_id).await?.unwrap();
    assert_eq!(booking.deposit_status, DepositStatus::Released);

    Ok(())
}

#[tokio::test]
async fn transfer_timeout_is_a_failure() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let booking_id = eligible_booking(&pool, Some("acct_crew")).await?;

    let processor = RecordingProcessor::slow(Duration::from_millis(500));
    let scheduler = test_utils::create_test_scheduler(pool.clone(), processor.clone())
        .transfer_timeout(Duration::from_millis(50));

    assert_matches!(
        scheduler.release_booking(booking_id).await,
        Err(ReleaseError::TransferTimeout(_))
    );

    let booking = find_booking(&pool, booking_id).await?.unwrap();
    assert_eq!(booking.deposit_status, DepositStatus::Captured);
    assert!(processor.transfers().is_empty());

    Ok(())
}

#[tokio::test]
async fn unpayable_booking_does_not_block_the_queue() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let unpayable = eligible_booking(&pool, None).await?;
    let payable = eligible_booking(&pool, Some("acct_crew")).await?;
    mark_job_completed(&pool, unpayable, Utc::now() - chrono::Duration::days(10)).await?;
    mark_job_completed(&pool, payable, Utc::now() - chrono::Duration::days(5)).await?;

    let processor = RecordingProcessor::default();
    let scheduler =
        test_utils::create_test_scheduler(pool.clone(), processor.clone()).batch_size(1);

    let report = scheduler.run_cycle().await?;
    assert_eq!(
        report,
        CycleReport {
            eligible: 1,
            released: 1,
            ..CycleReport::default()
        }
    );

    let booking = find_booking(&pool, payable).await?.unwrap();
    assert_eq!(booking.deposit_status, DepositStatus::Released);
    let booking = find_booking(&pool, unpayable).await?.unwrap();
    assert_eq!(booking.deposit_status, DepositStatus::Captured);

    // Stays out of the queue until the provider can be paid
    assert_eq!(scheduler.run_cycle().await?, CycleReport::default());
    assert_eq!(
        scheduler.release_booking(unpayable).await?,
        ReleaseOutcome::NoPayoutAccount
    );

    Ok(())
}

#[tokio::test]
async fn failing_booking_moves_to_the_back_of_the_queue() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let rejected = eligible_booking(&pool, Some("acct_frozen")).await?;
    let payable = eligible_booking(&pool, Some("acct_crew")).await?;
    mark_job_completed(&pool, rejected, Utc::now() - chrono::Duration::days(10)).await?;
    mark_job_completed(&pool, payable, Utc::now() - chrono::Duration::days(5)).await?;

    let processor = RecordingProcessor::rejecting("acct_frozen");
    let scheduler =
        test_utils::create_test_scheduler(pool.clone(), processor.clone()).batch_size(1);

    let report = scheduler.run_cycle().await?;
    assert_eq!(report.eligible, 1);
    assert_eq!(report.failed, 1);
    let booking = find_booking(&pool, rejected).await?.unwrap();
    assert_eq!(booking.deposit_status, DepositStatus::Captured);
    assert_some!(booking.last_release_attempt_at);

    let report = scheduler.run_cycle().await?;
    assert_eq!(report.eligible, 1);
    assert_eq!(report.released, 1);
    let booking = find_booking(&pool, payable).await?.unwrap();
    assert_eq!(booking.deposit_status, DepositStatus::Released);
    assert_none!(booking.last_release_attempt_at);

    // Only the failing booking is left, and it keeps being retried
    let report = scheduler.run_cycle().await?;
    assert_eq!(report.eligible, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(processor.transfers().len(), 1);

    Ok(())
}

#[tokio::test]
async fn rolled_amount_takes_precedence() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let booking_id = eligible_booking(&pool, Some("acct_crew")).await?;
    sqlx::query("UPDATE booking_requests SET rolled_amount_cents = 5000 WHERE id = $1")
        .bind(booking_id)
        .execute(&pool)
        .await?;

    let processor = RecordingProcessor::default();
    let scheduler = test_utils::create_test_scheduler(pool.clone(), processor.clone());

    assert_eq!(
        scheduler.release_booking(booking_id).await?,
        ReleaseOutcome::Released {
            amount: 5_000,
            transfer_id: "tr_1".into(),
        }
    );
    assert_eq!(processor.transfers()[0].amount, 5_000);

    Ok(())
}

#[tokio::test]
async fn nothing_to_transfer_still_closes_out() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let booking_id = eligible_booking(&pool, None).await?;
    sqlx::query("UPDATE booking_requests SET rolled_amount_cents = 0 WHERE id = $1")
        .bind(booking_id)
        .execute(&pool)
        .await?;

    let processor = RecordingProcessor::default();
    let scheduler = test_utils::create_test_scheduler(pool.clone(), processor.clone());

    let report = scheduler.run_cycle().await?;
    assert_eq!(report.closed_without_transfer, 1);
    assert!(processor.transfers().is_empty());

    let booking = find_booking(&pool, booking_id).await?.unwrap();
    assert_eq!(booking.deposit_status, DepositStatus::Released);
    assert_eq!(booking.completion_status, CompletionStatus::Completed);
    assert_none!(booking.transfer_id);

    let events = events_for_booking(&pool, booking_id).await?;
    assert_eq!(events.last().unwrap().event_type, BookingEventType::DepositAutoReleased);
    assert_eq!(events.last().unwrap().metadata["amount"], 0);

    Ok(())
}

#[tokio::test]
async fn eligibility_follows_release_delay() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let provider_id = create_provider(&pool, "Solo", Some("acct_solo")).await?;
    let new_booking = |deposit_cents| NewBooking {
        provider_id,
        customer_name: "Lee".into(),
        customer_email: None,
        customer_phone: Some("555-0100".into()),
        service_details: serde_json::json!({}),
        deposit_cents,
        scheduled_start: None,
    };

    let recent = create_booking(&pool, &new_booking(1_000)).await?.id;
    let overdue = create_booking(&pool, &new_booking(2_000)).await?.id;
    let unfinished = create_booking(&pool, &new_booking(3_000)).await?.id;
    let uncaptured = create_booking(&pool, &new_booking(4_000)).await?.id;

    for id in [recent, overdue, unfinished] {
        mark_deposit_captured(&pool, id, "ch_delay").await?;
    }
    mark_job_completed(&pool, recent, Utc::now() - chrono::Duration::hours(2)).await?;
    mark_job_completed(&pool, overdue, Utc::now() - chrono::Duration::hours(30)).await?;
    mark_job_completed(&pool, uncaptured, Utc::now() - chrono::Duration::hours(30)).await?;

    let processor = RecordingProcessor::default();
    let scheduler = test_utils::create_test_scheduler(pool.clone(), processor.clone())
        .release_delay(Duration::from_secs(24 * 60 * 60));

    let report = scheduler.run_cycle().await?;
    assert_eq!(report.eligible, 1);
    assert_eq!(report.released, 1);

    let transfers = processor.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].group_key, transfer_group_key(overdue));
    assert_eq!(transfers[0].metadata["trigger"], "release_delay_elapsed");

    for id in [recent, unfinished] {
        let booking = find_booking(&pool, id).await?.unwrap();
        assert_eq!(booking.deposit_status, DepositStatus::Captured);
    }
    let booking = find_booking(&pool, uncaptured).await?.unwrap();
    assert_eq!(booking.deposit_status, DepositStatus::None);

    Ok(())
}

#[tokio::test]
async fn bookings_without_capture_are_left_alone() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let booking_id = eligible_booking(&pool, Some("acct_crew")).await?;
    sqlx::query("UPDATE booking_requests SET deposit_status = 'refunded' WHERE id = $1")
        .bind(booking_id)
        .execute(&pool)
        .await?;

    let processor = RecordingProcessor::default();
    let scheduler = test_utils::create_test_scheduler(pool.clone(), processor.clone());

    assert_eq!(scheduler.run_cycle().await?.eligible, 0);
    assert_eq!(
        scheduler.release_booking(booking_id).await?,
        ReleaseOutcome::AlreadyHandled
    );
    assert!(processor.transfers().is_empty());

    Ok(())
}

#[tokio::test]
async fn concurrent_schedulers_release_once() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let booking_id = eligible_booking(&pool, Some("acct_crew")).await?;

    let processor = RecordingProcessor::slow(Duration::from_millis(300));
    let first = test_utils::create_test_scheduler(pool.clone(), processor.clone());
    let second = test_utils::create_test_scheduler(pool.clone(), processor.clone());

    let (a, b) = tokio::join!(first.run_cycle(), second.run_cycle());
    let (a, b) = (a?, b?);

    assert_eq!(a.released + b.released, 1);
    assert_eq!(a.failed + b.failed, 0);
    assert_eq!(processor.transfers().len(), 1);

    let released_events = events_for_booking(&pool, booking_id)
        .await?
        .into_iter()
        .filter(|event| event.event_type == BookingEventType::DepositAutoReleased)
        .count();
    assert_eq!(released_events, 1);

    Ok(())
}

#[tokio::test]
async fn overlapping_cycles_on_one_scheduler_are_skipped() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    eligible_booking(&pool, Some("acct_crew")).await?;

    let processor = RecordingProcessor::slow(Duration::from_millis(300));
    let scheduler = test_utils::create_test_scheduler(pool.clone(), processor.clone());

    let (a, b) = tokio::join!(scheduler.run_cycle(), scheduler.run_cycle());
    let mut reports = [a?, b?];
    reports.sort_by_key(|report| report.eligible);

    assert_eq!(reports[0], CycleReport::default());
    assert_eq!(reports[1].released, 1);
    assert_eq!(processor.transfers().len(), 1);

    Ok(())
}

#[tokio::test]
async fn started_scheduler_runs_a_cycle_and_stops() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let booking_id = eligible_booking(&pool, Some("acct_crew")).await?;

    let processor = RecordingProcessor::default();
    let handle = test_utils::create_test_scheduler(pool.clone(), processor.clone()).start();
    handle.wait_for_shutdown().await;

    let booking = find_booking(&pool, booking_id).await?.unwrap();
    assert_eq!(booking.deposit_status, DepositStatus::Released);

    Ok(())
}

#[tokio::test]
async fn running_scheduler_stops_on_request() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let handle = ReleaseScheduler::new(pool, RecordingProcessor::default())
        .poll_interval(Duration::from_secs(3600))
        .start();
    handle.shutdown();

    let stopped = tokio::time::timeout(Duration::from_secs(10), handle.wait_for_shutdown()).await;
    assert_ok!(stopped);

    Ok(())
}
