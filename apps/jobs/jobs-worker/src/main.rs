//! Jobs Worker Service - Entry Point
//!
//! Pulls jobs from NATS JetStream and publishes scheduled messages.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    jobs_worker::run().await
}
