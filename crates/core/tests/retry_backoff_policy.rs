//! Exercises `transfer::retry_with_backoff`'s policy directly: rate-limit
//! errors never count against the attempt budget, other retriable errors
//! eventually succeed once the transient condition clears, and a
//! non-retriable error propagates on the very first attempt.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tdrive_core::transfer::retry_with_backoff;
use tdrive_core::Error;

#[tokio::test]
async fn rate_limited_attempts_are_not_counted_against_the_retry_budget() {
    let calls = AtomicU32::new(0);
    // More than RETRY_MAX_ATTEMPTS (5) rate-limit responses in a row would
    // exhaust a counted budget; since they're exempt, this still succeeds.
    let result = retry_with_backoff(|| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n <= 8 {
                Err(Error::RateLimited(Duration::from_millis(5)))
            } else {
                Ok::<_, Error>(n)
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 9);
    assert_eq!(calls.load(Ordering::SeqCst), 9);
}

#[tokio::test]
async fn a_transient_error_is_retried_and_can_still_succeed() {
    let calls = AtomicU32::new(0);
    let result = retry_with_backoff(|| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n == 1 {
                Err(Error::Transient { message: "connection reset".to_string() })
            } else {
                Ok::<_, Error>("recovered")
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_non_retriable_error_propagates_on_the_first_attempt() {
    let calls = AtomicU32::new(0);
    let result: Result<(), Error> = retry_with_backoff(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            Err(Error::InvalidOperation {
                message: "caller error, retrying would not help".to_string(),
            })
        }
    })
    .await;

    assert!(matches!(result, Err(Error::InvalidOperation { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
