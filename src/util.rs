use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, SentryFutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Run `callback` inside its own Sentry transaction, marking it failed on `Err`.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let hub = Arc::new(Hub::new_from_top(Hub::current()));

    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "escrow.release");
    let tx = hub.start_transaction(tx_ctx);
    hub.configure_scope(|scope| scope.set_span(Some(tx.clone().into())));

    let result = callback().bind_hub(hub).await;

    tx.set_status(if result.is_ok() {
        SpanStatus::Ok
    } else {
        SpanStatus::UnknownError
    });
    tx.finish();

    result
}

/// `base` plus a random amount up to `jitter`.
pub(crate) fn with_jitter(base: Duration, jitter: Duration) -> Duration {
    use rand::Rng;

    if jitter.is_zero() {
        return base;
    }

    let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
    base + Duration::from_millis(random_jitter)
}
