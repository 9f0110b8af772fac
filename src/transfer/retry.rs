use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::TransferError;

/// Politique de nouvelle tentative : backoff exponentiel borné avec gigue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Nombre total de tentatives, la première comprise.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Politique sans attente entre les tentatives.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Délai avant la tentative `attempt + 1` : entre la moitié et la totalité
    /// de `base * 2^(attempt-1)`, plafonné à `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let ceiling = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let half = ceiling / 2;
        let jitter = rand::thread_rng().gen_range(0..=ceiling - half);
        Duration::from_millis(half + jitter)
    }
}

/// Exécute `op` jusqu'au succès, à une erreur non transitoire ou à
/// l'épuisement des tentatives. L'annulation interrompt aussi l'attente.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, TransferError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                log::warn!(
                    "retry: op={}, attempt={}/{}, delay_ms={}, error={}",
                    what,
                    attempt,
                    policy.max_attempts,
                    delay.as_millis(),
                    err
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> TransferError {
        TransferError::Store(StoreError::Transient("503 Slow Down".to_string()))
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        for _ in 0..50 {
            let first = policy.delay_for(1).as_millis();
            assert!((50..=100).contains(&first));
            let third = policy.delay_for(3).as_millis();
            assert!((200..=400).contains(&third));
            assert!(policy.delay_for(30).as_millis() <= 1_000);
        }
        assert_eq!(RetryPolicy::immediate(3).delay_for(4), Duration::ZERO);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(&RetryPolicy::immediate(5), &CancellationToken::new(), "op", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&RetryPolicy::immediate(4), &CancellationToken::new(), "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_and_conflicts_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&RetryPolicy::immediate(4), &CancellationToken::new(), "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransferError::Store(StoreError::PreconditionFailed)) }
        })
        .await;
        assert!(matches!(
            result,
            Err(TransferError::Store(StoreError::PreconditionFailed))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
        };
        let trigger = cancel.clone();
        let result: Result<(), _> = retry(&policy, &cancel, "op", |_| {
            trigger.cancel();
            async { Err(transient()) }
        })
        .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }
}
