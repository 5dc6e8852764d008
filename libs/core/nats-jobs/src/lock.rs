//! Lock and sorted-set store used by the scheduler.

use crate::error::JobsError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// TTL of scheduling locks.
pub const LOCK_TTL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Set `key` to `value` with a TTL unless it already exists.
    ///
    /// Returns true if this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, JobsError>;

    /// Add `member` with `score`. Returns the number of newly added members.
    async fn sorted_set_add(&self, key: &str, score: i64, member: &[u8])
        -> Result<u64, JobsError>;

    /// Members with a score in `(-inf, upper]`, lowest score first.
    async fn sorted_set_range_by_score(&self, key: &str, upper: i64)
        -> Result<Vec<Bytes>, JobsError>;

    /// Remove members with a score in `(-inf, upper]`. Returns the count removed.
    async fn sorted_set_remove_range_by_score(&self, key: &str, upper: i64)
        -> Result<u64, JobsError>;
}
