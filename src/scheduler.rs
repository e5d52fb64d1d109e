//! Recurring release of captured deposits to providers.
//!
//! Each cycle asks storage for bookings whose deposit is captured and due for
//! release, then handles them one at a time. A booking is released inside a
//! transaction holding its row lock (`FOR UPDATE SKIP LOCKED`) for the whole
//! attempt, including the processor call, so two schedulers never release the
//! same booking at once. A failed attempt rolls back and leaves the booking
//! `captured`, stamped with the attempt time so it queues behind bookings
//! that have not failed yet.

use crate::errors::ReleaseError;
use crate::processor::{DEFAULT_CURRENCY, PaymentProcessor, TransferRequest};
use crate::schema::{ActorType, BookingEventType, DepositStatus};
use crate::storage;
use crate::util::{with_jitter, with_sentry_transaction};
use futures_util::FutureExt;
use sqlx::PgPool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use uuid::Uuid;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_JITTER: Duration = Duration::from_secs(10);
const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RELEASE_DELAY: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_BATCH_SIZE: i64 = 100;

/// What happened to a single booking during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Funds were transferred and the booking closed out.
    Released {
        /// Amount transferred, in minor units.
        amount: i64,
        /// Processor identifier of the transfer.
        transfer_id: String,
    },
    /// Nothing to transfer; the booking was closed out anyway.
    ClosedWithoutTransfer,
    /// The booking was no longer captured or never had a charge.
    AlreadyHandled,
    /// The provider has nowhere to be paid; the booking stays captured.
    NoPayoutAccount,
    /// Another transaction holds the booking.
    Locked,
}

/// Tally of one scheduler cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Bookings returned by the eligibility query.
    pub eligible: usize,
    /// Bookings paid out.
    pub released: usize,
    /// Bookings closed without a transfer.
    pub closed_without_transfer: usize,
    /// Bookings left alone this cycle.
    pub skipped: usize,
    /// Bookings whose attempt failed and will be retried.
    pub failed: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &ReleaseOutcome) {
        match outcome {
            ReleaseOutcome::Released { .. } => self.released += 1,
            ReleaseOutcome::ClosedWithoutTransfer => self.closed_without_transfer += 1,
            ReleaseOutcome::AlreadyHandled
            | ReleaseOutcome::NoPayoutAccount
            | ReleaseOutcome::Locked => self.skipped += 1,
        }
    }
}

/// Clears the in-progress flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The deposit auto-release scheduler.
pub struct ReleaseScheduler<P: PaymentProcessor> {
    connection_pool: PgPool,
    processor: Arc<P>,
    poll_interval: Duration,
    jitter: Duration,
    transfer_timeout: Duration,
    release_delay: Duration,
    batch_size: i64,
    currency: String,
    shutdown_after_first_cycle: bool,
    cycle_in_progress: AtomicBool,
}

impl<P: PaymentProcessor> std::fmt::Debug for ReleaseScheduler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseScheduler")
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .field("transfer_timeout", &self.transfer_timeout)
            .field("release_delay", &self.release_delay)
            .field("batch_size", &self.batch_size)
            .field("currency", &self.currency)
            .field("shutdown_after_first_cycle", &self.shutdown_after_first_cycle)
            .finish()
    }
}

impl<P: PaymentProcessor> ReleaseScheduler<P> {
    /// Create a scheduler with the default intervals.
    pub fn new(connection_pool: PgPool, processor: P) -> Self {
        Self {
            connection_pool,
            processor: Arc::new(processor),
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            release_delay: DEFAULT_RELEASE_DELAY,
            batch_size: DEFAULT_BATCH_SIZE,
            currency: DEFAULT_CURRENCY.to_string(),
            shutdown_after_first_cycle: false,
            cycle_in_progress: AtomicBool::new(false),
        }
    }

    /// Set how long to wait between cycles.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random delay added to each wait between cycles.
    ///
    /// Spreads out replicas that were started at the same time.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set how long a transfer may take before the attempt counts as failed.
    pub fn transfer_timeout(mut self, transfer_timeout: Duration) -> Self {
        self.transfer_timeout = transfer_timeout;
        self
    }

    /// Set how long after job completion a deposit becomes eligible for release.
    pub fn release_delay(mut self, release_delay: Duration) -> Self {
        self.release_delay = release_delay;
        self
    }

    /// Set the maximum number of bookings handled per cycle.
    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the currency transfers are made in.
    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    /// Stop after a single cycle instead of looping forever.
    pub fn shutdown_after_first_cycle(mut self) -> Self {
        self.shutdown_after_first_cycle = true;
        self
    }

    /// Start the scheduler loop on the current runtime.
    pub fn start(self) -> RunHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(?self, "Starting deposit release scheduler…");
        let span = info_span!("release_scheduler");
        let handle = tokio::spawn(async move { self.run(shutdown_rx).instrument(span).await });

        RunHandle {
            handle,
            shutdown: shutdown_tx,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.run_cycle().await {
                Ok(report) if report.eligible == 0 => trace!("No deposits awaiting release"),
                Ok(report) => info!(?report, "Deposit release cycle finished"),
                Err(error) => error!("Failed to query deposits awaiting release: {error}"),
            }

            if self.shutdown_after_first_cycle || *shutdown.borrow() {
                debug!("Shutting down the deposit release scheduler…");
                break;
            }

            let sleep_duration = with_jitter(self.poll_interval, self.jitter);
            trace!("Next deposit release cycle in {sleep_duration:?}…");
            tokio::select! {
                () = sleep(sleep_duration) => {}
                _ = shutdown.changed() => {
                    debug!("Shutting down the deposit release scheduler…");
                    break;
                }
            }
        }
    }

    /// Run one cycle: find eligible bookings and attempt each in turn.
    ///
    /// A failure on one booking is logged and counted; it never stops the
    /// rest of the batch. Only a failure of the eligibility query itself is
    /// returned as an error. If a cycle is already running on this scheduler
    /// the call returns an empty report.
    pub async fn run_cycle(&self) -> Result<CycleReport, sqlx::Error> {
        if self.cycle_in_progress.swap(true, Ordering::AcqRel) {
            debug!("Deposit release cycle already running");
            return Ok(CycleReport::default());
        }
        let _guard = CycleGuard(&self.cycle_in_progress);

        let booking_ids = storage::find_bookings_awaiting_release(
            &self.connection_pool,
            self.release_delay,
            self.batch_size,
        )
        .await?;

        let mut report = CycleReport {
            eligible: booking_ids.len(),
            ..CycleReport::default()
        };

        for booking_id in booking_ids {
            let span = info_span!("release", booking.id = %booking_id);

            let attempt = AssertUnwindSafe(self.release_booking(booking_id))
                .catch_unwind()
                .instrument(span.clone())
                .await;

            let deferred = {
                let _enter = span.enter();
                match attempt {
                    Ok(Ok(outcome)) => {
                        debug!(?outcome, "Release attempt finished");
                        report.record(&outcome);
                        outcome == ReleaseOutcome::NoPayoutAccount
                    }
                    Ok(Err(error)) => {
                        warn!("Failed to release deposit, will retry next cycle: {error}");
                        report.failed += 1;
                        true
                    }
                    Err(_) => {
                        error!("Release attempt panicked, will retry next cycle");
                        report.failed += 1;
                        true
                    }
                }
            };

            if deferred {
                let stamped = storage::record_release_attempt(&self.connection_pool, booking_id)
                    .instrument(span)
                    .await;
                if let Err(error) = stamped {
                    warn!(booking.id = %booking_id, "Failed to record release attempt: {error}");
                }
            }
        }

        Ok(report)
    }

    /// Attempt to release the deposit held for one booking.
    ///
    /// On error nothing has been written and the booking is still `captured`.
    pub async fn release_booking(&self, booking_id: Uuid) -> Result<ReleaseOutcome, ReleaseError> {
        with_sentry_transaction("deposit_release", || self.try_release(booking_id)).await
    }

    async fn try_release(&self, booking_id: Uuid) -> Result<ReleaseOutcome, ReleaseError> {
        let mut tx = self.connection_pool.begin().await?;

        let Some(booking) = storage::lock_booking_tx(&mut tx, booking_id).await? else {
            debug!("Booking is locked by another attempt, skipping");
            tx.rollback().await?;
            return Ok(ReleaseOutcome::Locked);
        };

        let charge_id = match (&booking.deposit_status, &booking.charge_id) {
            (DepositStatus::Captured, Some(charge_id)) => charge_id.clone(),
            _ => {
                debug!(deposit.status = ?booking.deposit_status, "Deposit not captured, skipping");
                tx.rollback().await?;
                return Ok(ReleaseOutcome::AlreadyHandled);
            }
        };

        let amount = booking.rolled_amount_cents.unwrap_or(booking.deposit_cents);
        let trigger = if booking.release_requested {
            "release_requested"
        } else {
            "release_delay_elapsed"
        };

        if amount <= 0 {
            info!(amount, "Nothing to transfer, closing out booking");
            storage::mark_released_tx(&mut tx, booking_id, None).await?;
            storage::append_event(
                &mut tx,
                booking_id,
                BookingEventType::DepositAutoReleased,
                ActorType::System,
                serde_json::json!({
                    "amount": 0,
                    "charge_id": charge_id,
                    "trigger": trigger,
                    "transfer_id": null,
                }),
            )
            .await?;
            tx.commit().await?;
            return Ok(ReleaseOutcome::ClosedWithoutTransfer);
        }

        let Some(destination) = storage::payout_account_tx(&mut tx, booking.provider_id).await?
        else {
            warn!(provider.id = %booking.provider_id, "Provider has no payout account, skipping");
            tx.rollback().await?;
            return Ok(ReleaseOutcome::NoPayoutAccount);
        };

        let request = TransferRequest {
            amount,
            currency: self.currency.clone(),
            destination,
            group_key: transfer_group_key(booking_id),
            metadata: serde_json::json!({
                "booking_id": booking_id,
                "charge_id": charge_id,
                "trigger": trigger,
            }),
        };

        debug!(amount, "Creating transfer…");
        let transfer = timeout(self.transfer_timeout, self.processor.create_transfer(&request));
        let transfer_id = match transfer.await {
            Ok(Ok(transfer_id)) => transfer_id,
            Ok(Err(error)) => return Err(ReleaseError::TransferError(error)),
            Err(_) => return Err(ReleaseError::TransferTimeout(self.transfer_timeout)),
        };

        let closed = async {
            storage::mark_released_tx(&mut tx, booking_id, Some(&transfer_id)).await?;
            storage::append_event(
                &mut tx,
                booking_id,
                BookingEventType::DepositAutoReleased,
                ActorType::System,
                serde_json::json!({
                    "amount": amount,
                    "charge_id": charge_id,
                    "trigger": trigger,
                    "transfer_id": transfer_id,
                }),
            )
            .await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(())
        }
        .await;

        if let Err(error) = closed {
            // The money moved but the booking is still `captured`. The retry
            // reuses the same group key.
            error!(
                transfer.id = %transfer_id,
                amount,
                "Transfer succeeded but the booking could not be closed out: {error}"
            );
            return Err(error.into());
        }

        info!(transfer.id = %transfer_id, amount, "Deposit released");
        Ok(ReleaseOutcome::Released {
            amount,
            transfer_id,
        })
    }
}

/// Stable key grouping every transfer made for a booking.
pub fn transfer_group_key(booking_id: Uuid) -> String {
    format!("booking_{booking_id}")
}

/// Handle to a running release scheduler
///
/// Dropping the handle also stops the scheduler once its current cycle ends.
#[derive(Debug)]
pub struct RunHandle {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl RunHandle {
    /// Ask the scheduler to stop once the current cycle finishes.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the scheduler to stop.
    pub async fn wait_for_shutdown(self) {
        if let Err(error) = self.handle.await {
            warn!(%error, "Deposit release scheduler task panicked");
        }
    }
}
