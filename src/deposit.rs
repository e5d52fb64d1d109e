//! Deposit amounts and the escrow state of a job.
//!
//! Both are pure projections over stored rows and are recomputed on every read.

use crate::metadata::{DepositMetadata, DepositType, payment_kind_from_notes};
use crate::schema::{Job, JobPayment, PaymentKind};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Upper bound applied to percentage deposits when requesting money.
pub const MAX_DEPOSIT_PERCENT: i64 = 30;

/// How much deposit to request for a job worth `total_cents`.
///
/// Flat deposits never exceed the total. Percentage deposits are capped at
/// [`MAX_DEPOSIT_PERCENT`] before being applied. Negative inputs count as zero.
pub fn calculate_deposit_amount(total_cents: i64, deposit_type: DepositType, value: i64) -> i64 {
    let total_cents = total_cents.max(0);
    let value = value.max(0);
    match deposit_type {
        DepositType::Flat => value.min(total_cents),
        DepositType::Percent => percent_of(total_cents, value.min(MAX_DEPOSIT_PERCENT)),
    }
}

/// `round(total * percent / 100)`, rounding halves up.
fn percent_of(total_cents: i64, percent: i64) -> i64 {
    let scaled = i128::from(total_cents) * i128::from(percent);
    let rounded = (scaled + 50).div_euclid(100);
    i64::try_from(rounded).unwrap_or(i64::MAX)
}

/// Escrow position of a job, derived from its notes and payments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositState {
    /// Whether the job has a deposit policy configured.
    pub has_deposit: bool,
    /// Deposit the policy asks for.
    pub deposit_requested_cents: i64,
    /// Settled deposit payments.
    pub deposit_paid_cents: i64,
    /// What is still owed, never negative.
    pub deposit_balance_cents: i64,
    /// Set once any deposit has been paid; the deposit can no longer be edited or cancelled.
    pub is_locked: bool,
    /// When the deposit was handed back, if it was.
    pub refunded_at: Option<DateTime<Utc>>,
}

impl DepositState {
    /// Derive the escrow state of `job` from all payments recorded against it
    /// or its invoice. Payments for other jobs are ignored.
    pub fn compute(job: &Job, payments: &[JobPayment]) -> Self {
        let metadata = DepositMetadata::decode(job.notes.as_deref());

        let deposit_requested_cents = match metadata {
            None => 0,
            Some(DepositMetadata {
                deposit_type: DepositType::Flat,
                deposit_amount,
            }) => deposit_amount,
            Some(DepositMetadata {
                deposit_type: DepositType::Percent,
                deposit_amount,
            }) => percent_of(job.price_cents, deposit_amount),
        };

        let belongs_to_job = |payment: &&JobPayment| {
            payment.job_id == Some(job.id)
                || (job.invoice_id.is_some() && payment.invoice_id == job.invoice_id)
        };

        let deposit_paid_cents = payments
            .iter()
            .filter(belongs_to_job)
            .filter(|p| p.status.is_settled() && effective_kind(p) == PaymentKind::Deposit)
            .fold(0_i64, |total, p| total.saturating_add(p.amount_cents));

        let refunded_at = payments
            .iter()
            .filter(belongs_to_job)
            .filter(|p| effective_kind(p) == PaymentKind::DepositRefund)
            .map(|p| p.created_at)
            .min();

        Self {
            has_deposit: metadata.is_some(),
            deposit_requested_cents,
            deposit_paid_cents,
            deposit_balance_cents: deposit_requested_cents
                .saturating_sub(deposit_paid_cents)
                .max(0),
            is_locked: deposit_paid_cents > 0,
            refunded_at,
        }
    }
}

/// The structured kind when present, the legacy notes tag otherwise.
pub fn effective_kind(payment: &JobPayment) -> PaymentKind {
    payment
        .kind
        .unwrap_or_else(|| payment_kind_from_notes(payment.notes.as_deref()))
}
