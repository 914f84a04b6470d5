use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPool;
use thiserror::Error;
use tracing::{error, instrument};

use crate::error::OutboundError;
use crate::metrics_consts::{DOCUMENTS_PUBLISHED, DOCUMENTS_PUBLISH_FAILED};
use crate::outcome::Outcome;
use crate::publisher::Publisher;

/// Enumeration of errors for sending to the fallback queue.
/// sqlx errors are not `Clone`, so only their message is kept.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("queue connection failed with: {0}")]
    Connection(String),
    #[error("INSERT query failed with: {0}")]
    Send(String),
    #[error("failed to serialize queue message: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Configuration(_)
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => QueueError::Connection(error.to_string()),
            _ => QueueError::Send(error.to_string()),
        }
    }
}

/// Sends single messages to a queue.
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn send(&self, message: Value) -> Result<(), QueueError>;
}

/// A queue backed by a Postgres table, one row per message.
pub struct PgQueueClient {
    pool: PgPool,
    table: String,
    queue: String,
}

impl PgQueueClient {
    pub fn from_pool(pool: PgPool, table: &str, queue: &str) -> Self {
        Self {
            pool,
            table: table.to_owned(),
            queue: queue.to_owned(),
        }
    }
}

#[async_trait]
impl QueueClient for PgQueueClient {
    async fn send(&self, message: Value) -> Result<(), QueueError> {
        // sqlx does not bind identifiers, the table name comes from configuration
        let base_query = format!(
            r#"
INSERT INTO {}
    (queue, created_at, payload)
VALUES
    ($1, NOW(), $2)
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(&self.queue)
            .bind(sqlx::types::Json(&message))
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

type QueueMapper<I> = Box<dyn Fn(&I) -> Result<Value, serde_json::Error> + Send + Sync>;

/// Sends every document to a queue as its own message, optionally reshaped by a
/// mapping function first.
pub struct QueuePublisher<I> {
    client: Arc<dyn QueueClient>,
    mapper: QueueMapper<I>,
}

impl<I: Serialize + 'static> QueuePublisher<I> {
    pub fn new(client: Arc<dyn QueueClient>) -> Self {
        Self {
            client,
            mapper: Box::new(|document: &I| serde_json::to_value(document)),
        }
    }
}

impl<I> QueuePublisher<I> {
    pub fn with_mapper<F>(client: Arc<dyn QueueClient>, mapper: F) -> Self
    where
        F: Fn(&I) -> Result<Value, serde_json::Error> + Send + Sync + 'static,
    {
        Self {
            client,
            mapper: Box::new(mapper),
        }
    }

    async fn send(&self, document: &I) -> Result<(), QueueError> {
        let message =
            (self.mapper)(document).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.client.send(message).await
    }
}

#[async_trait]
impl<I> Publisher<I> for QueuePublisher<I>
where
    I: Send + Sync + 'static,
{
    async fn publish(&self, document: I) -> Result<I, OutboundError> {
        self.send(&document).await?;
        Ok(document)
    }

    #[instrument(skip_all, fields(documents = documents.len()))]
    async fn publish_many(&self, documents: Vec<I>) -> Vec<Outcome<I>> {
        let results = join_all(documents.iter().map(|document| self.send(document))).await;

        documents
            .into_iter()
            .zip(results)
            .map(|(document, result)| match result {
                Ok(()) => {
                    counter!(DOCUMENTS_PUBLISHED, "publisher" => "queue").increment(1);
                    Outcome::success(document)
                }
                Err(e) => {
                    error!("failed to send document to queue: {}", e);
                    counter!(DOCUMENTS_PUBLISH_FAILED, "publisher" => "queue").increment(1);
                    Outcome::failure(document, e)
                }
            })
            .collect()
    }
}
