use outbound_common::error::BatchError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Enumeration of errors that stop the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a kafka error occurred while consuming: {0}")]
    Kafka(#[from] KafkaError),
    #[error("batch rejected after exhausting retries: {0}")]
    RetriesExhausted(BatchError),
    #[error("a batch could not be accounted for: {0}")]
    Batch(#[from] BatchError),
    #[error("failed to read the export file: {0}")]
    Io(#[from] std::io::Error),
}
