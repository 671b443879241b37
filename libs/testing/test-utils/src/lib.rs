//! Shared test utilities for messaging tests
//!
//! This crate provides reusable test infrastructure:
//! - `TestRabbitMq`: RabbitMQ container with automatic cleanup (feature: "rabbitmq")
//! - `TestDataBuilder`: Deterministic test data generation (always available)
//! - `assertions`: Polling assertion for eventually-consistent broker state (always available)
//!
//! # Features
//!
//! - `rabbitmq`: Enables RabbitMQ test infrastructure
//! - `all`: Enables all broker test infrastructure
//!
//! # Usage
//!
//! Add `features = ["rabbitmq"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["rabbitmq"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRabbitMq};
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn my_broker_test() {
//!     let rabbit = TestRabbitMq::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_broker_test");
//!
//!     let broker = pubsub::AmqpBroker::connect(rabbit.url()).await.unwrap();
//!     let queue = builder.name("queue", "main");
//! }
//! ```

#[cfg(feature = "rabbitmq")]
mod rabbitmq;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;

/// Builder for test data with deterministic randomization
///
/// This ensures tests are reproducible by using seeded random data.
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
    /// This is the recommended way to create a builder for consistent test data.
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_pause_broadcast");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Generate a unique name for testing
    ///
    /// # Arguments
    ///
    /// * `prefix` - The kind of resource (e.g., "queue", "exchange")
    /// * `suffix` - A unique identifier within the test (e.g., "main", "dlq")
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("my_test");
    /// let name = builder.name("queue", "main");
    /// // Returns: "test-queue-12345-main"
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }

    /// Generate a username that is unique to this test
    ///
    /// Broker resources derived from it (e.g. `pause.<username>`) do not
    /// collide between tests sharing one broker.
    pub fn username(&self, label: &str) -> String {
        format!("{}-{:x}", label, self.seed & 0xffff_ffff)
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::time::Duration;

    /// Poll `check` every 5ms until it holds, panicking after `timeout`
    ///
    /// Subscriptions settle deliveries on a background task, so broker state
    /// is only eventually consistent with what a handler has seen.
    pub async fn assert_eventually(mut check: impl FnMut() -> bool, timeout: Duration, context: &str) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !check() {
            if tokio::time::Instant::now() >= deadline {
                panic!("{}: condition not reached within {:?}", context, timeout);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
