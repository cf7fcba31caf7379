//! Error types for the PostgresUpgrade controller.
//!
//! Only transient I/O failures are returned from reconciliation; everything a
//! user can act on is absorbed into status conditions instead. The variants
//! here therefore classify into:
//! - **Transient**: Kubernetes API failures, retried with backoff
//! - **Permanent**: conflicts and malformed objects that need intervention

use std::time::Duration;
use thiserror::Error;

/// Error variants for PostgresUpgrade reconciliation.
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Object could not be serialized for a patch
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A generated object is already controlled by someone else
    #[error("{child} is already controlled by {owner}")]
    OwnershipConflict { child: String, owner: String },

    /// Upgrade object has not been persisted yet
    #[error("PostgresUpgrade {0} has no UID; cannot own generated jobs")]
    MissingUid(String),

    /// Instance pod template is missing the database container
    #[error("StatefulSet {statefulset} has no {container} container")]
    MissingDatabaseContainer {
        statefulset: String,
        container: String,
    },
}

impl Error {
    /// Returns true if this error should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_) | Error::SerializationError(_)
        )
    }

    /// Returns true if this error requires user intervention.
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}

/// Result type for upgrade operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Backoff configuration for transient reconcile failures.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        // Apply jitter
        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        // Cap at max delay
        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kube_errors_are_retryable() {
        let err = Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcd leader changed".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        }));
        assert!(err.is_retryable());
        assert!(!err.is_permanent());
    }

    #[test]
    fn ownership_conflicts_are_permanent() {
        let err = Error::OwnershipConflict {
            child: "hippo-pgdata".to_string(),
            owner: "someone-else".to_string(),
        };
        assert!(err.is_permanent());
    }

    #[test]
    fn backoff_delays_grow_and_cap() {
        let config = BackoffConfig {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(300));
    }
}
