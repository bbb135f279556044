//! Cancellable retry-with-backoff for history source calls.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::FetchError;
use crate::types::config::RetryPolicy;

/// Outcome of a retried source call.
#[derive(Debug)]
pub enum Retried<T> {
    Ok(T),
    /// The token fired before the call succeeded.
    Cancelled,
    /// A non-retryable error, or the last retryable one.
    Failed { attempts: u32, error: FetchError },
}

/// Run `op` until it succeeds, fails permanently, exhausts the policy, or
/// the token is cancelled.
///
/// The wait between attempts is the larger of the policy backoff and the
/// server's `retry_after` hint.
pub async fn retry_fetch<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Retried::Cancelled,
            result = op() => result,
        };

        let error = match result {
            Ok(value) => return Retried::Ok(value),
            Err(error) => error,
        };

        if !error.is_retryable() || !policy.allows_retry(attempt) {
            return Retried::Failed { attempts: attempt, error };
        }

        let delay = error
            .retry_after()
            .map_or(policy.backoff(attempt), |hint| hint.max(policy.backoff(attempt)));
        warn!(
            what = %what,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "source call failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Retried::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
