use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::config::KafkaConfig;
use crate::enricher::chunked;
use crate::error::OutboundError;
use crate::metrics_consts::{DOCUMENTS_PUBLISHED, DOCUMENTS_PUBLISH_FAILED, PUBLISH_BATCH_SIZE};
use crate::outcome::Outcome;
use crate::publisher::Publisher;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("failed to produce to kafka: {0}")]
    Produce(String),
    #[error("failed to produce to kafka (delivery canceled)")]
    Canceled,
    #[error("failed to produce to kafka: no acknowledgment after {0}ms")]
    Timeout(u128),
    #[error("failed to produce to kafka: broker returned no acknowledgment for this message")]
    MissingAck,
}

/// One record to produce: an optional partitioning key and a serialized payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub key: Option<String>,
    pub payload: String,
}

/// Produces a list of messages to a topic in a single call.
///
/// On `Ok`, the returned acknowledgments line up with `messages` by position.
/// `Err` means the call as a whole failed and no message can be assumed delivered.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn send_batch(
        &self,
        topic: &str,
        messages: Vec<BrokerMessage>,
    ) -> Result<Vec<Result<(), BrokerError>>, BrokerError>;
}

/// Turns a document into the key and payload of its broker message.
pub trait MessageFormatter<I>: Send + Sync {
    fn format(&self, document: &I) -> Result<BrokerMessage, OutboundError>;
}

/// Serializes documents as JSON, keyed by the given extractor.
pub struct JsonFormatter<F> {
    key_extractor: F,
}

impl<F> JsonFormatter<F> {
    pub fn new(key_extractor: F) -> Self {
        Self { key_extractor }
    }
}

impl<I, F> MessageFormatter<I> for JsonFormatter<F>
where
    I: Serialize,
    F: Fn(&I) -> Option<String> + Send + Sync,
{
    fn format(&self, document: &I) -> Result<BrokerMessage, OutboundError> {
        let payload =
            serde_json::to_string(document).map_err(|e| OutboundError::Format(e.to_string()))?;

        Ok(BrokerMessage {
            key: (self.key_extractor)(document),
            payload,
        })
    }
}

pub struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("outbound_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("outbound_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("outbound_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("outbound_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("outbound_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (topic, stats) in stats.topics {
            gauge!(
                "outbound_kafka_produce_avg_batch_size_bytes",
                "topic" => topic.clone()
            )
            .set(stats.batchsize.avg as f64);
            gauge!(
                "outbound_kafka_produce_avg_batch_size_events",
                "topic" => topic
            )
            .set(stats.batchcnt.avg as f64);
        }

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!(
                "outbound_kafka_broker_requests_pending",
                "broker" => id_string.clone()
            )
            .set(stats.outbuf_cnt as f64);
            counter!(
                "outbound_kafka_broker_tx_errors_total",
                "broker" => id_string
            )
            .absolute(stats.txerrs);
        }
    }
}

pub fn create_kafka_producer(
    config: &KafkaConfig,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> = client_config.create_with_context(KafkaContext)?;

    // "Ping" the Kafka brokers by requesting metadata
    match producer
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "connected to Kafka brokers, found {} topics",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(producer)
}

/// `BrokerClient` over an rdkafka producer.
///
/// Every message is enqueued first, then all delivery reports are awaited
/// concurrently. If the reports do not all arrive within `batch_timeout`, the
/// call fails as a whole.
pub struct KafkaBrokerClient {
    producer: FutureProducer<KafkaContext>,
    batch_timeout: Duration,
}

impl KafkaBrokerClient {
    pub fn new(producer: FutureProducer<KafkaContext>, batch_timeout: Duration) -> Self {
        Self {
            producer,
            batch_timeout,
        }
    }

    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::new(30, 0))
    }
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    async fn send_batch(
        &self,
        topic: &str,
        messages: Vec<BrokerMessage>,
    ) -> Result<Vec<Result<(), BrokerError>>, BrokerError> {
        // Enqueue sequentially so the producer keeps the input order within a partition
        let pending: Vec<_> = messages
            .iter()
            .map(|message| {
                self.producer
                    .send_result(FutureRecord {
                        topic,
                        payload: Some(message.payload.as_str()),
                        partition: None,
                        key: message.key.as_deref(),
                        timestamp: None,
                        headers: None,
                    })
                    .map_err(|(e, _)| BrokerError::Produce(e.to_string()))
            })
            .collect();

        let acks = join_all(pending.into_iter().map(|enqueued| async move {
            match enqueued?.await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err((e, _))) => Err(BrokerError::Produce(e.to_string())),
                Err(_) => Err(BrokerError::Canceled),
            }
        }));

        timeout(self.batch_timeout, acks)
            .await
            .map_err(|_| BrokerError::Timeout(self.batch_timeout.as_millis()))
    }
}

/// Splits every call into sub-calls of at most `max_batch_size` messages, sent one
/// after the other.
///
/// A failed sub-call only fails the acknowledgments of its own messages, so one
/// rejected request never takes the rest of the batch down with it.
pub struct ChunkedBrokerClient {
    inner: Arc<dyn BrokerClient>,
    max_batch_size: usize,
}

impl ChunkedBrokerClient {
    pub fn new(inner: Arc<dyn BrokerClient>, max_batch_size: usize) -> Self {
        Self {
            inner,
            max_batch_size: max_batch_size.max(1),
        }
    }
}

#[async_trait]
impl BrokerClient for ChunkedBrokerClient {
    async fn send_batch(
        &self,
        topic: &str,
        messages: Vec<BrokerMessage>,
    ) -> Result<Vec<Result<(), BrokerError>>, BrokerError> {
        let mut acks = Vec::with_capacity(messages.len());

        for (index, chunk) in chunked(messages, self.max_batch_size)
            .into_iter()
            .enumerate()
        {
            let size = chunk.len();
            match self.inner.send_batch(topic, chunk).await {
                Ok(mut chunk_acks) => {
                    chunk_acks.resize(size, Err(BrokerError::MissingAck));
                    acks.extend(chunk_acks);
                }
                Err(error) => {
                    warn!(chunk = index, size, "broker call failed: {}", error);
                    acks.extend(std::iter::repeat(Err(error)).take(size));
                }
            }
        }

        Ok(acks)
    }
}

/// Publishes a whole batch to one topic in a single broker call.
pub struct BrokerPublisher<I> {
    client: Arc<dyn BrokerClient>,
    topic: String,
    formatter: Arc<dyn MessageFormatter<I>>,
}

impl<I> BrokerPublisher<I> {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        topic: String,
        formatter: Arc<dyn MessageFormatter<I>>,
    ) -> Self {
        Self {
            client,
            topic,
            formatter,
        }
    }
}

#[async_trait]
impl<I> Publisher<I> for BrokerPublisher<I>
where
    I: Send + 'static,
{
    async fn publish(&self, document: I) -> Result<I, OutboundError> {
        match self.publish_many(vec![document]).await.pop() {
            Some(Outcome::Success { document }) => Ok(document),
            Some(Outcome::Failure { error, .. }) => Err(error),
            None => Err(BrokerError::MissingAck.into()),
        }
    }

    #[instrument(skip_all, fields(topic = %self.topic, documents = documents.len()))]
    async fn publish_many(&self, documents: Vec<I>) -> Vec<Outcome<I>> {
        let mut errors: Vec<Option<OutboundError>> = vec![None; documents.len()];
        let mut messages = Vec::with_capacity(documents.len());
        // Position in `documents` of every message handed to the broker
        let mut sent = Vec::with_capacity(documents.len());

        for (index, document) in documents.iter().enumerate() {
            match self.formatter.format(document) {
                Ok(message) => {
                    messages.push(message);
                    sent.push(index);
                }
                Err(error) => errors[index] = Some(error),
            }
        }

        if !messages.is_empty() {
            histogram!(PUBLISH_BATCH_SIZE, "publisher" => "broker").record(messages.len() as f64);

            match self.client.send_batch(&self.topic, messages).await {
                Ok(acks) => {
                    for (position, index) in sent.into_iter().enumerate() {
                        match acks.get(position) {
                            Some(Ok(())) => {}
                            Some(Err(error)) => errors[index] = Some(error.clone().into()),
                            None => errors[index] = Some(BrokerError::MissingAck.into()),
                        }
                    }
                }
                Err(error) => {
                    error!("broker call failed for {} documents: {}", sent.len(), error);
                    for index in sent {
                        errors[index] = Some(error.clone().into());
                    }
                }
            }
        }

        let outcomes: Vec<_> = documents
            .into_iter()
            .zip(errors)
            .map(|(document, error)| match error {
                None => Outcome::success(document),
                Some(error) => Outcome::failure(document, error),
            })
            .collect();

        let failed = outcomes.iter().filter(|o| o.is_failure()).count();
        counter!(DOCUMENTS_PUBLISHED, "publisher" => "broker")
            .increment((outcomes.len() - failed) as u64);
        counter!(DOCUMENTS_PUBLISH_FAILED, "publisher" => "broker").increment(failed as u64);

        outcomes
    }
}
