//! NATS JetStream adapter.

use crate::config::{
    ConsumerSettings, DeliverPolicy, Discard, ReplayPolicy, Retention, Storage, StreamSettings,
};
use crate::error::JobsError;
use crate::queue::{
    AckOutcome, ConsumerSummary, JobMessage, JobQueue, MessageAcker, MessageInfo, PullConsumer,
    Publisher,
};
use async_nats::jetstream::consumer::{self, pull, AckPolicy};
use async_nats::jetstream::{self, stream, AckKind, Context};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use core_config::nats::NatsConfig;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Work queue backed by a NATS connection.
#[derive(Clone)]
pub struct NatsQueue {
    client: Client,
    jetstream: Context,
}

impl NatsQueue {
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    pub async fn connect(config: &NatsConfig) -> Result<Self, JobsError> {
        let mut options = async_nats::ConnectOptions::new();
        if let Some(name) = &config.client_name {
            options = options.name(name);
        }
        let client = options.connect(config.url.as_str()).await?;
        info!(url = %config.url, "Connected to NATS");
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn jetstream(&self) -> &Context {
        &self.jetstream
    }
}

fn stream_config(settings: &StreamSettings) -> stream::Config {
    let mut config = stream::Config {
        name: settings.name.clone(),
        subjects: settings.subjects.clone(),
        retention: match settings.retention {
            Retention::Limits => stream::RetentionPolicy::Limits,
            Retention::Interest => stream::RetentionPolicy::Interest,
            Retention::WorkQueue => stream::RetentionPolicy::WorkQueue,
        },
        storage: match settings.storage {
            Storage::File => stream::StorageType::File,
            Storage::Memory => stream::StorageType::Memory,
        },
        max_age: settings.max_age,
        num_replicas: settings.replicas,
        discard: match settings.discard {
            Discard::Old => stream::DiscardPolicy::Old,
            Discard::New => stream::DiscardPolicy::New,
        },
        deny_delete: settings.deny_delete,
        deny_purge: settings.deny_purge,
        ..Default::default()
    };
    if let Some(window) = settings.duplicate_window {
        config.duplicate_window = window;
    }
    config
}

fn consumer_config(settings: &ConsumerSettings) -> pull::Config {
    pull::Config {
        durable_name: Some(settings.durable_name.clone()),
        ack_policy: AckPolicy::Explicit,
        ack_wait: settings.ack_wait,
        max_deliver: settings.max_deliver.unwrap_or(-1),
        deliver_policy: match settings.deliver_policy {
            DeliverPolicy::All => consumer::DeliverPolicy::All,
            DeliverPolicy::Last => consumer::DeliverPolicy::Last,
            DeliverPolicy::New => consumer::DeliverPolicy::New,
        },
        replay_policy: match settings.replay_policy {
            ReplayPolicy::Instant => consumer::ReplayPolicy::Instant,
            ReplayPolicy::Original => consumer::ReplayPolicy::Original,
        },
        filter_subject: settings.filter_subject.clone().unwrap_or_default(),
        ..Default::default()
    }
}

#[async_trait]
impl Publisher for NatsQueue {
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        msg_id: Option<String>,
    ) -> Result<u64, JobsError> {
        let pending = match msg_id {
            Some(id) => {
                let mut headers = HeaderMap::new();
                headers.insert(async_nats::header::NATS_MESSAGE_ID, id.as_str());
                self.jetstream
                    .publish_with_headers(subject.to_string(), headers, payload)
                    .await
            }
            None => self.jetstream.publish(subject.to_string(), payload).await,
        }
        .map_err(|e| JobsError::publish_error(e.to_string()))?;

        let ack = pending
            .await
            .map_err(|e| JobsError::publish_error(e.to_string()))?;

        debug!(
            subject = %subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Published message"
        );
        Ok(ack.sequence)
    }
}

#[async_trait]
impl JobQueue for NatsQueue {
    async fn ensure_stream(&self, settings: &StreamSettings) -> Result<(), JobsError> {
        let mut stream = self
            .jetstream
            .get_or_create_stream(stream_config(settings))
            .await
            .map_err(|e| JobsError::from_jetstream_error(e))?;
        let info = stream.info().await.map_err(|e| JobsError::from_jetstream_error(e))?;
        debug!(
            stream = %settings.name,
            messages = info.state.messages,
            "Stream ready"
        );
        Ok(())
    }

    async fn ensure_consumer(
        &self,
        stream: &str,
        settings: &ConsumerSettings,
    ) -> Result<Box<dyn PullConsumer>, JobsError> {
        let stream_handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| JobsError::consumer_error(e.to_string()))?;

        let consumer = stream_handle
            .get_or_create_consumer(&settings.durable_name, consumer_config(settings))
            .await
            .map_err(|e| JobsError::consumer_error(e.to_string()))?;

        let config = &consumer.cached_info().config;
        let summary = ConsumerSummary {
            stream: stream.to_string(),
            durable_name: config
                .durable_name
                .clone()
                .unwrap_or_else(|| settings.durable_name.clone()),
            ack_wait: config.ack_wait,
            max_deliver: config.max_deliver,
        };
        info!(
            stream = %stream,
            consumer = %summary.durable_name,
            max_deliver = summary.max_deliver,
            "Consumer ready"
        );

        Ok(Box::new(NatsPullConsumer { consumer, summary }))
    }

    async fn close(&self) -> Result<(), JobsError> {
        self.client
            .drain()
            .await
            .map_err(|e| JobsError::from_jetstream_error(e))?;
        info!("NATS connection drained");
        Ok(())
    }
}

struct NatsPullConsumer {
    consumer: consumer::Consumer<pull::Config>,
    summary: ConsumerSummary,
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    fn info(&self) -> &ConsumerSummary {
        &self.summary
    }

    async fn pull(&self, batch: usize, expires: Duration) -> Result<Vec<JobMessage>, JobsError> {
        let mut messages = self
            .consumer
            .batch()
            .max_messages(batch)
            .expires(expires)
            .messages()
            .await
            .map_err(|e| JobsError::consumer_error(e.to_string()))?;

        let mut result = Vec::new();
        while let Some(msg) = messages.next().await {
            match msg {
                Ok(message) => result.push(to_job_message(message, &self.summary)),
                Err(e) => warn!(stream = %self.summary.stream, error = %e, "Error receiving message"),
            }
        }
        Ok(result)
    }
}

fn to_job_message(message: jetstream::Message, summary: &ConsumerSummary) -> JobMessage {
    let subject = message.subject.to_string();
    let info = match message.info() {
        Ok(info) => MessageInfo {
            stream: info.stream.to_string(),
            consumer: info.consumer.to_string(),
            subject: subject.clone(),
            stream_sequence: info.stream_sequence,
            consumer_sequence: info.consumer_sequence,
            redelivery_count: u64::try_from(info.delivered).unwrap_or(1),
            pending: info.pending,
        },
        Err(e) => {
            warn!(error = %e, "Failed to get message info, using defaults");
            MessageInfo {
                stream: summary.stream.clone(),
                consumer: summary.durable_name.clone(),
                subject: subject.clone(),
                redelivery_count: 1,
                ..Default::default()
            }
        }
    };

    let headers = message
        .headers
        .as_ref()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(name, values)| {
                    values
                        .first()
                        .map(|value| (name.to_string(), value.as_str().to_string()))
                })
                .collect()
        })
        .unwrap_or_else(HashMap::new);

    let payload = message.payload.clone();
    JobMessage::new(
        subject,
        payload,
        headers,
        info,
        Arc::new(NatsAcker { message }),
    )
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl MessageAcker for NatsAcker {
    async fn ack_ack(&self) -> Result<AckOutcome, JobsError> {
        Ok(match self.message.double_ack().await {
            Ok(()) => AckOutcome::Confirmed,
            Err(e) => AckOutcome::Unconfirmed(e.to_string()),
        })
    }

    async fn nak(&self, delay: Duration) -> Result<(), JobsError> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| JobsError::consumer_error(e.to_string()))
    }

    async fn working(&self) -> Result<(), JobsError> {
        self.message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| JobsError::consumer_error(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_mapping() {
        let settings = StreamSettings::new("email").with_duplicate_window(Duration::from_secs(30));
        let config = stream_config(&settings);
        assert_eq!(config.name, "email");
        assert_eq!(config.subjects, vec!["email".to_string()]);
        assert_eq!(config.retention, stream::RetentionPolicy::WorkQueue);
        assert_eq!(config.storage, stream::StorageType::File);
        assert_eq!(config.discard, stream::DiscardPolicy::Old);
        assert_eq!(config.num_replicas, 1);
        assert_eq!(config.duplicate_window, Duration::from_secs(30));
    }

    #[test]
    fn test_consumer_config_mapping() {
        let settings = ConsumerSettings::new("email")
            .with_max_deliver(3)
            .with_filter_subject("email.eu");
        let config = consumer_config(&settings);
        assert_eq!(config.durable_name.as_deref(), Some("emailConsumer"));
        assert_eq!(config.ack_policy, AckPolicy::Explicit);
        assert_eq!(config.ack_wait, Duration::from_secs(10));
        assert_eq!(config.max_deliver, 3);
        assert_eq!(config.filter_subject, "email.eu");
    }
}
