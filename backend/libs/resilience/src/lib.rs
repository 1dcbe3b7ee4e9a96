/// Bounded waits and retries for calls that leave the process.
///
/// Every suspension point on an external collaborator (message store,
/// conferencing provider) goes through [`with_timeout_result`], so a slow
/// dependency surfaces to the caller as an error instead of blocking it.
/// Best-effort cleanup calls that must eventually land use [`with_retry`].
///
/// # Example
///
/// ```rust,no_run
/// use resilience::{with_timeout_result, TimeoutError};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let result = with_timeout_result("store.persist", Duration::from_secs(2), async {
///         Ok::<_, String>(42)
///     })
///     .await;
///     assert!(!matches!(result, Err(TimeoutError::Elapsed { .. })));
/// }
/// ```

pub mod retry;
pub mod timeout;

pub use retry::{with_retry, RetryConfig, RetryError};
pub use timeout::{with_timeout_result, TimeoutError};
