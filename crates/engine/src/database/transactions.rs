//! Optimistic transactions
//!
//! Contains RetryConfig for transaction retry behavior and the `transact`
//! read-modify-write loop.

use std::time::Duration;

use arbor_core::{ArborResult, NodeInfo, NodePath, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Database;
use crate::writer::{WriteMode, WriteOptions};

// ============================================================================
// Retry Configuration
// ============================================================================

/// Configuration for transaction retry behavior
///
/// A transaction whose node changed between its read and its write is
/// retried from the read step, with exponential backoff between attempts.
///
/// # Example
/// ```
/// use arbor_engine::RetryConfig;
///
/// let config = RetryConfig::new()
///     .with_max_retries(5)
///     .with_base_delay_ms(10)
///     .with_max_delay_ms(200);
/// assert_eq!(config.max_retries, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: usize,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay_ms: 1,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Create a new RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryConfig with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Calculate delay for a given attempt (exponential backoff)
    pub(crate) fn calculate_delay(&self, attempt: usize) -> Duration {
        // Cap the shift to prevent overflow (1 << 63 is the max for u64)
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Outcome of [`Database::transact`]
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionResult {
    /// The new value was written
    Committed(NodeInfo),
    /// The callback returned `None`; nothing was written
    Cancelled,
}

impl TransactionResult {
    /// Check if the transaction wrote its value
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionResult::Committed(_))
    }
}

impl Database {
    /// Read-modify-write the node at `path`
    ///
    /// `f` receives the current value (`None` if the node does not exist)
    /// and returns the value to store: `None` cancels, `Some(Value::Null)`
    /// removes the node. If the node changes between the read and the
    /// write, `f` runs again on the fresh value, up to
    /// `transaction_retries.max_retries` more times.
    ///
    /// # Errors
    ///
    /// Returns `RevisionConflict` when retries are disabled or exhausted,
    /// and any error of the underlying read or write.
    pub async fn transact<F>(&self, path: &str, mut f: F) -> ArborResult<TransactionResult>
    where
        F: FnMut(Option<Value>) -> Option<Value>,
    {
        let path = NodePath::concrete(path)?;
        let retries = self.inner.config.transaction_retries.clone();
        let mut attempt = 0;

        loop {
            let checkpoint = self.checkpoint_at(&path).await?;
            let Some(value) = f(checkpoint.value().cloned()) else {
                debug!(target: "arbor::txn", path = %path, attempt, "Transaction cancelled");
                return Ok(TransactionResult::Cancelled);
            };

            let options = WriteOptions::new().with_assert(checkpoint);
            match self
                .write(path.clone(), value, WriteMode::Overwrite, options)
                .await
            {
                Ok(info) => {
                    debug!(target: "arbor::txn", path = %path, attempt, "Transaction committed");
                    return Ok(TransactionResult::Committed(info));
                }
                Err(e) if e.is_conflict() && attempt < retries.max_retries => {
                    let delay = retries.calculate_delay(attempt);
                    debug!(
                        target: "arbor::txn",
                        path = %path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Revision conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_conflict() {
                        warn!(target: "arbor::txn", path = %path, attempts = attempt + 1, "Transaction retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.base_delay_ms, 1);
        assert_eq!(config.max_delay_ms, 100);
        assert_eq!(RetryConfig::no_retry().max_retries, 0);
    }

    #[test]
    fn test_calculate_delay_backoff() {
        let config = RetryConfig::new().with_base_delay_ms(10).with_max_delay_ms(100);
        assert_eq!(config.calculate_delay(0), Duration::from_millis(10));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(20));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(80));
        assert_eq!(config.calculate_delay(4), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(500), Duration::from_millis(100));
    }

    #[test]
    fn test_transaction_result() {
        assert!(!TransactionResult::Cancelled.is_committed());
    }
}
