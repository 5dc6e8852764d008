//! Shared test infrastructure for the job engine crates
//!
//! - `TestNats`: NATS container with JetStream enabled (feature: "nats")
//! - `TestRedis`: Redis container (feature: "redis")
//! - `TestDataBuilder`: deterministic stream, subject and id generation
//!
//! Container-backed tests need a running Docker daemon and are marked
//! `#[ignore = "requires docker"]` by convention; run them with
//! `cargo test -- --ignored`.
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["nats", "redis"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestNats};
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn my_stream_test() {
//!     let nats = TestNats::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_stream_test");
//!     let stream = builder.stream_name("email");
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "nats")]
pub use nats::TestNats;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic randomization
///
/// Streams and consumers are shared server-side state, so tests that share a
/// container should take their names from a builder seeded by the test name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_processes_message");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic id for payloads and message ids
    pub fn id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// A JetStream-safe stream name.
    ///
    /// Stream names may not contain `.`, `*`, `>` or whitespace, so the
    /// result only uses ASCII alphanumerics and `_`.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let name = TestDataBuilder::new(7).stream_name("email");
    /// assert_eq!(name, "test_email_7");
    /// ```
    pub fn stream_name(&self, prefix: &str) -> String {
        let prefix: String = prefix
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("test_{}_{}", prefix, self.seed)
    }

    /// Generate a unique name for testing, e.g. "test-project-12345-main"
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.id(), builder2.id());
        assert_eq!(builder1.stream_name("jobs"), builder2.stream_name("jobs"));
        assert_eq!(builder1.name("lock", "a"), builder2.name("lock", "a"));
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.id(), builder2.id());
        assert_ne!(builder1.stream_name("jobs"), builder2.stream_name("jobs"));
    }

    #[test]
    fn test_stream_name_is_sanitized() {
        let name = TestDataBuilder::new(1).stream_name("orders.created >*");
        assert_eq!(name, "test_orders_created____1");
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
