//! Bounded connect retry.
//!
//! Connecting to the broker is retried a fixed number of times with a fixed
//! pause between attempts. Once the budget is spent the last error is
//! returned as [`RpcError::ConnectionFailed`](crate::RpcError::ConnectionFailed)
//! and the owner treats it as fatal; nothing here retries again.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::{log_debug, log_warn, RpcError};

/// Attempt budget for establishing a broker session.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of connect attempts (values below 1 are treated as 1).
    pub max_attempts: u32,

    /// Pause after each failed attempt.
    pub delay: Duration,
}

impl Default for RetryConfig {
    /// - `max_attempts`: 10
    /// - `delay`: 2s
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(2),
        }
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent.
///
/// Every failure is retried regardless of its kind: any step of the connect
/// sequence may fail transiently while a broker restarts. The delay is also
/// observed after the final failure, matching a caller that sleeps between
/// attempts unconditionally.
///
/// # Errors
///
/// Returns [`RpcError::ConnectionFailed`] carrying the last error message.
pub(crate) async fn retry_fixed<F, Fut, T>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for left in (1..=attempts).rev() {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                log_warn!("{what}: connect failed ({err}), attempts left: {left}");
                last_error = Some(err);
                sleep(config.delay).await;
            }
        }
    }

    let details = last_error.map(|e| e.to_string()).unwrap_or_default();
    log_debug!("{what}: retry exhausted after {attempts} attempts");

    Err(RpcError::ConnectionFailed(details))
}
