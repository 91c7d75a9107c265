//! Retry policy for replicant read-only transactions that observed a
//! replication session change.

use std::time::Duration;

use crate::types::Shard;

/// Called before each retry. The returned delay is slept before the next
/// attempt; the retry loop itself never gives up.
pub trait RetryHook: Send + Sync {
    fn before_retry(&self, shard: &Shard, attempt: u32) -> Duration;
}

/// Retry immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackoff;

impl RetryHook for NoBackoff {
    fn before_retry(&self, shard: &Shard, attempt: u32) -> Duration {
        tracing::debug!("Session of shard {} changed, retry #{}", shard, attempt);
        Duration::ZERO
    }
}
