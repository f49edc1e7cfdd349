//! Exponential-backoff connection retries for ComfyUI WebSocket
//! connections.
//!
//! [`connect_with_retry`] keeps retrying with increasing delays until the
//! connection is established, the attempt budget is spent, or the
//! [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIClientError, ComfyUIConnection};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Give up after this many attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Short budget used when opening a progress channel for a dispatch.
    pub fn for_dispatch() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_attempts: Some(3),
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Outcome of a failed [`connect_with_retry`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: ComfyUIClientError,
    },
}

/// Connect to a ComfyUI instance with exponential backoff.
pub async fn connect_with_retry(
    client: &ComfyUIClient,
    client_id: &str,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Result<ComfyUIConnection, RetryError> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = client.connect(client_id) => result,
        };

        match result {
            Ok(conn) => {
                if attempt > 1 {
                    tracing::info!(
                        backend_id = %client.backend_id(),
                        attempt,
                        "Reconnected to ComfyUI",
                    );
                }
                return Ok(conn);
            }
            Err(e) => {
                tracing::warn!(
                    backend_id = %client.backend_id(),
                    error = %e,
                    "Connect attempt {attempt} failed",
                );
                if config.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }
            }
        }

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn next_delay_clamps_at_max() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(next_delay(Duration::from_secs(8), &config), Duration::from_secs(10));
    }

    #[test]
    fn full_backoff_sequence() {
        let config = ReconnectConfig::default();
        let mut delay = config.initial_delay;
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];

        for &expected_secs in &expected {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = next_delay(delay, &config);
        }
    }

    #[tokio::test]
    async fn cancellation_token_stops_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = ComfyUIClient::new("gpu-1", "ws://127.0.0.1:9/ws");
        let result =
            connect_with_retry(&client, "c", &ReconnectConfig::default(), &cancel).await;
        assert_matches!(result, Err(RetryError::Cancelled));
    }

    #[tokio::test]
    async fn attempt_budget_is_respected() {
        let cancel = CancellationToken::new();
        let client = ComfyUIClient::new("gpu-1", "ws://127.0.0.1:9/ws");
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(1),
            max_attempts: Some(2),
            ..Default::default()
        };
        let result = connect_with_retry(&client, "c", &config, &cancel).await;
        assert_matches!(result, Err(RetryError::Exhausted { attempts: 2, .. }));
    }
}
