//! Stream mode: consume the change stream in batches and hand them to the
//! streaming pipeline, storing offsets only once a batch is settled.
use std::collections::HashMap;
use std::time::Duration;

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use outbound_common::config::{ConsumerConfig, KafkaConfig};
use outbound_common::processor::StreamingProcessor;

use crate::context::{AppContext, Liveness};
use crate::document::ChangeDocument;
use crate::error::WorkerError;
use crate::retry::RetryPolicy;

/// A batch of raw documents, with the highest offset read per partition.
#[derive(Debug, Default)]
pub struct Batch {
    pub documents: Vec<Value>,
    offsets: HashMap<i32, i64>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn push(&mut self, partition: i32, offset: i64, document: Value) {
        self.documents.push(document);
        let highest = self.offsets.entry(partition).or_insert(offset);
        *highest = (*highest).max(offset);
    }
}

/// Payloads are handed to the decoder as-is: a payload that is not JSON becomes a
/// JSON string, so that it is rejected and tracked like any other invalid document.
pub fn parse_payload(payload: Option<&[u8]>) -> Value {
    match payload {
        None => Value::Null,
        Some(bytes) => serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
    }
}

pub struct BatchConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl BatchConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            // Offsets are stored by hand once a batch is settled, then auto-committed
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            );

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;
        info!(
            "subscribed to {} as {}",
            consumer_config.kafka_consumer_topic, consumer_config.kafka_consumer_group
        );

        Ok(Self {
            consumer,
            topic: consumer_config.kafka_consumer_topic.clone(),
        })
    }

    /// Reads up to `max` messages, or whatever arrived within `linger`.
    pub async fn recv_batch(&self, max: usize, linger: Duration) -> Result<Batch, KafkaError> {
        let mut batch = Batch::default();
        let mut failure = None;

        tokio::select! {
            _ = tokio::time::sleep(linger) => {},
            _ = async {
                while batch.documents.len() < max {
                    match self.consumer.recv().await {
                        Ok(message) => batch.push(
                            message.partition(),
                            message.offset(),
                            parse_payload(message.payload()),
                        ),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            } => {}
        }

        match failure {
            Some(e) if batch.is_empty() => Err(e),
            Some(e) => {
                warn!("stopped filling batch early: {}", e);
                Ok(batch)
            }
            None => Ok(batch),
        }
    }

    /// Marks every message of the batch as consumed.
    pub fn store_offsets(&self, batch: &Batch) -> Result<(), KafkaError> {
        let mut offsets = TopicPartitionList::new();
        for (partition, offset) in &batch.offsets {
            offsets.add_partition_offset(&self.topic, *partition, Offset::Offset(offset + 1))?;
        }
        self.consumer.store_offsets(&offsets)
    }
}

/// Runs the pipeline on a batch until it is settled, backing off between attempts.
///
/// A rejected batch is retried as a whole: documents already published are
/// published again, which downstream consumers tolerate.
pub async fn process_with_retry(
    processor: &StreamingProcessor<ChangeDocument>,
    documents: &[Value],
    retry_policy: &RetryPolicy,
    liveness: &Liveness,
) -> Result<(), WorkerError> {
    let mut attempt = 0;

    loop {
        liveness.report_healthy();

        let error = match processor.process(documents).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        if !retry_policy.should_retry(attempt) {
            error!(attempt, "giving up on batch: {}", error);
            return Err(WorkerError::RetriesExhausted(error));
        }

        let wait = retry_policy.time_until_next_retry(attempt);
        warn!(attempt, "batch rejected, retrying in {:?}: {}", wait, error);
        tokio::time::sleep(wait).await;
        attempt += 1;
    }
}

pub async fn run_stream(context: &AppContext) -> Result<(), WorkerError> {
    let config = &context.config;
    let consumer = BatchConsumer::new(&config.kafka, &config.consumer)?;
    let retry_policy = RetryPolicy::from(&config.retry_policy);

    loop {
        context.liveness.report_healthy();

        let batch = match consumer
            .recv_batch(config.batch_size, config.batch_linger.0)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                error!("failed to receive from kafka: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        if batch.is_empty() {
            continue;
        }

        debug!("processing batch of {} documents", batch.documents.len());
        process_with_retry(
            &context.streaming,
            &batch.documents,
            &retry_policy,
            &context.liveness,
        )
        .await?;

        consumer.store_offsets(&batch)?;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn batch_keeps_highest_offset_per_partition() {
        let mut batch = Batch::default();
        batch.push(0, 10, json!(1));
        batch.push(1, 3, json!(2));
        batch.push(0, 12, json!(3));
        batch.push(0, 11, json!(4));

        assert_eq!(batch.documents.len(), 4);
        assert_eq!(batch.offsets, HashMap::from([(0, 12), (1, 3)]));
    }

    #[test]
    fn payloads_always_reach_the_decoder() {
        assert_eq!(parse_payload(Some(br#"{"id":"1"}"#)), json!({"id": "1"}));
        assert_eq!(parse_payload(Some(b"not json")), json!("not json"));
        assert_eq!(parse_payload(None), Value::Null);
    }
}
