//! Capability probe: may the store be used from concurrent workers?
//!
//! Drivers self-report a thread-safety ordinal:
//!
//! | level | meaning                                        |
//! |-------|------------------------------------------------|
//! | 0     | not thread-safe                                |
//! | 1     | threads may share the module, not connections  |
//! | 2     | threads may share connections                  |
//! | 3     | fully serialized, safe everywhere              |
//!
//! Dispatch runs in parallel only at level 2 or above. Anything that cannot
//! be determined counts as 0.

use anyhow::Result;
use async_trait::async_trait;

use crate::error::IndexerError;

/// Something that can report its thread-safety ordinal.
#[async_trait]
pub trait ThreadSafetySource: Send + Sync {
    async fn thread_safety(&self) -> Result<u8>;
}

/// Highest defined level.
pub const MAX_THREAD_SAFETY: u8 = 3;

/// Lowest level at which workers may run concurrently.
pub const PARALLEL_THREAD_SAFETY: u8 = 2;

/// Returns `true` iff the reported level is at least 2.
///
/// Probe errors and out-of-range values are logged and treated as level 0.
pub async fn supports_parallel_connections(source: &dyn ThreadSafetySource) -> bool {
    let level = match source.thread_safety().await {
        Ok(level) if level <= MAX_THREAD_SAFETY => level,
        Ok(level) => {
            let err = IndexerError::CapabilityProbe(format!(
                "thread-safety level {} is out of range",
                level
            ));
            tracing::warn!(error = %err, "assuming level 0");
            0
        }
        Err(e) => {
            let err = IndexerError::CapabilityProbe(format!("{:#}", e));
            tracing::warn!(error = %err, "assuming level 0");
            0
        }
    };
    tracing::debug!(level, "store thread-safety");
    level >= PARALLEL_THREAD_SAFETY
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<u8, &'static str>);

    #[async_trait]
    impl ThreadSafetySource for Fixed {
        async fn thread_safety(&self) -> Result<u8> {
            self.0.map_err(|e| anyhow::anyhow!(e))
        }
    }

    #[tokio::test]
    async fn level_one_is_serial() {
        assert!(!supports_parallel_connections(&Fixed(Ok(1))).await);
        assert!(!supports_parallel_connections(&Fixed(Ok(0))).await);
    }

    #[tokio::test]
    async fn level_two_and_three_are_parallel() {
        assert!(supports_parallel_connections(&Fixed(Ok(2))).await);
        assert!(supports_parallel_connections(&Fixed(Ok(3))).await);
    }

    #[tokio::test]
    async fn probe_errors_fail_closed() {
        assert!(!supports_parallel_connections(&Fixed(Err("driver exploded"))).await);
        assert!(!supports_parallel_connections(&Fixed(Ok(9))).await);
    }
}
