//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that creates a NATS container with JetStream for testing.

use async_nats::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
/// JetStream is always enabled, since job streams need it.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
///
/// // Plain client for core publishes
/// let client = nats.client();
///
/// // JetStream context for creating job streams and consumers
/// let jetstream = nats.jetstream();
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    pub connection_string: String,
}

impl TestNats {
    /// Start a NATS server with JetStream (`-js`) and connect to it.
    pub async fn new() -> Self {
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]);

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let connection_string = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// Get a cloned client (useful for passing to a job processor)
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Get a JetStream context for stream and consumer operations
    pub fn jetstream(&self) -> async_nats::jetstream::Context {
        async_nats::jetstream::new(self.client.clone())
    }

    /// Get the connection string for manual client creation
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_nats::jetstream::{consumer, stream};
    use futures::StreamExt;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_work_queue_stream_removes_acked_messages() {
        let nats = TestNats::new().await;
        let jetstream = nats.jetstream();

        let stream = jetstream
            .create_stream(stream::Config {
                name: "WORK".to_string(),
                subjects: vec!["work".to_string()],
                retention: stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .expect("Failed to create stream");

        for i in 0..3 {
            jetstream
                .publish("work", format!("job-{}", i).into())
                .await
                .unwrap()
                .await
                .unwrap();
        }

        let consumer = stream
            .create_consumer(consumer::pull::Config {
                durable_name: Some("WORKConsumer".to_string()),
                ack_policy: consumer::AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .expect("Failed to create consumer");

        let mut messages = consumer.fetch().max_messages(10).messages().await.unwrap();
        let mut count = 0;
        while let Some(Ok(msg)) = messages.next().await {
            msg.double_ack().await.expect("Failed to ack");
            count += 1;
        }
        assert_eq!(count, 3);

        let mut stream = jetstream.get_stream("WORK").await.unwrap();
        let info = stream.info().await.unwrap();
        assert_eq!(info.state.messages, 0);
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_duplicate_msg_id_is_dropped() {
        let nats = TestNats::new().await;
        let jetstream = nats.jetstream();

        jetstream
            .create_stream(stream::Config {
                name: "DEDUPE".to_string(),
                subjects: vec!["dedupe".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        for _ in 0..2 {
            let mut headers = async_nats::HeaderMap::new();
            headers.insert(async_nats::header::NATS_MESSAGE_ID, "same-id");
            jetstream
                .publish_with_headers("dedupe", headers, "payload".into())
                .await
                .unwrap()
                .await
                .unwrap();
        }

        let mut stream = jetstream.get_stream("DEDUPE").await.unwrap();
        let info = stream.info().await.unwrap();
        assert_eq!(info.state.messages, 1);
    }
}
