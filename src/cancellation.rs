//! Refund or retention of a paid deposit when a booking is cancelled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Customers cancelling with at least this much notice get their deposit back.
pub const FREE_CANCELLATION_HOURS: f64 = 24.0;

/// Side that called off the booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelledBy {
    /// The person who booked the work.
    Customer,
    /// The service provider.
    Provider,
}

/// Why the deposit was split the way it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// Nothing was paid, so there is nothing to split.
    NoDepositPaid,
    /// The provider cancelled; the customer is made whole.
    ProviderCancelled,
    /// The customer cancelled inside the free cancellation window.
    CustomerWithNotice,
    /// The customer cancelled too close to the start.
    CustomerLateCancellation,
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::NoDepositPaid => "no deposit was paid",
            Self::ProviderCancelled => "cancelled by provider, full refund",
            Self::CustomerWithNotice => "cancelled with at least 24 hours notice, full refund",
            Self::CustomerLateCancellation => "cancelled with less than 24 hours notice, deposit retained",
        };
        f.write_str(reason)
    }
}

/// How a paid deposit is split on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationOutcome {
    /// Returned to the customer.
    pub refund_amount: i64,
    /// Kept by the provider.
    pub retained_amount: i64,
    /// Which policy branch applied.
    pub reason: CancellationReason,
}

impl CancellationOutcome {
    /// Apply the cancellation policy.
    ///
    /// Issuing the refund or transfer is up to the caller.
    pub fn resolve(cancelled_by: CancelledBy, hours_until_job: f64, deposit_paid_cents: i64) -> Self {
        if deposit_paid_cents <= 0 {
            return Self {
                refund_amount: 0,
                retained_amount: 0,
                reason: CancellationReason::NoDepositPaid,
            };
        }

        let refund = |reason| Self {
            refund_amount: deposit_paid_cents,
            retained_amount: 0,
            reason,
        };

        match cancelled_by {
            CancelledBy::Provider => refund(CancellationReason::ProviderCancelled),
            CancelledBy::Customer if hours_until_job >= FREE_CANCELLATION_HOURS => {
                refund(CancellationReason::CustomerWithNotice)
            }
            CancelledBy::Customer => Self {
                refund_amount: 0,
                retained_amount: deposit_paid_cents,
                reason: CancellationReason::CustomerLateCancellation,
            },
        }
    }
}

/// Hours from `now` until `job_start`, negative once the start has passed.
pub fn hours_until(job_start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let seconds = (job_start - now).num_seconds() as f64;
    seconds / 3600.0
}
