use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use sqlx::postgres::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::decoder::DecodeError;
use crate::error::OutboundError;
use crate::metrics_consts::{DOCUMENTS_PUBLISHED, DOCUMENTS_PUBLISH_FAILED};
use crate::outcome::Outcome;
use crate::publisher::Publisher;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuditError {
    /// The store cannot be reached at all; no further write can succeed.
    #[error("audit store connection failed with: {0}")]
    Connection(String),
    #[error("audit row write failed with: {0}")]
    Write(String),
}

impl AuditError {
    pub fn is_connection(&self) -> bool {
        matches!(self, AuditError::Connection(_))
    }
}

impl From<sqlx::Error> for AuditError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Configuration(_)
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => AuditError::Connection(error.to_string()),
            _ => AuditError::Write(error.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    DecodeError,
    PublishError,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::DecodeError => "decode_error",
            AuditKind::PublishError => "publish_error",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record of one document that could not be processed.
///
/// Rows are partitioned by month, and keyed by a time-ordered UUID so that rows
/// of the same partition sort by creation time.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuditRow {
    pub partition_key: String,
    pub row_key: Uuid,
    pub kind: AuditKind,
    pub error: String,
    /// The offending input or document, as JSON.
    pub document: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditRow {
    pub fn new(
        kind: AuditKind,
        error: String,
        document: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            partition_key: now.format("%Y%m").to_string(),
            row_key: Uuid::now_v7(),
            kind,
            error,
            document,
            created_at: now,
        }
    }

    pub fn decode_failure(error: &DecodeError, now: DateTime<Utc>) -> Self {
        Self::new(
            AuditKind::DecodeError,
            error.to_string(),
            Some(error.raw.clone()),
            now,
        )
    }

    pub fn publish_failure<I: Serialize>(
        document: &I,
        error: &OutboundError,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            AuditKind::PublishError,
            error.to_string(),
            serde_json::to_string(document).ok(),
            now,
        )
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert(&self, row: AuditRow) -> Result<(), AuditError>;
}

/// Audit rows in a Postgres table.
pub struct PgAuditStore {
    pool: PgPool,
    table: String,
}

impl PgAuditStore {
    pub fn from_pool(pool: PgPool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_owned(),
        }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn insert(&self, row: AuditRow) -> Result<(), AuditError> {
        let base_query = format!(
            r#"
INSERT INTO {}
    (partition_key, row_key, kind, error, document, created_at)
VALUES
    ($1, $2, $3, $4, $5, $6)
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(&row.partition_key)
            .bind(row.row_key)
            .bind(row.kind.as_str())
            .bind(&row.error)
            .bind(&row.document)
            .bind(row.created_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

type RowMapper<I> = Box<dyn Fn(&I) -> AuditRow + Send + Sync>;

/// Writes every document to the audit store as its own row.
pub struct TablePublisher<I> {
    store: Arc<dyn AuditStore>,
    mapper: RowMapper<I>,
}

impl<I> TablePublisher<I> {
    pub fn new<F>(store: Arc<dyn AuditStore>, mapper: F) -> Self
    where
        F: Fn(&I) -> AuditRow + Send + Sync + 'static,
    {
        Self {
            store,
            mapper: Box::new(mapper),
        }
    }
}

#[async_trait]
impl<I> Publisher<I> for TablePublisher<I>
where
    I: Send + Sync + 'static,
{
    async fn publish(&self, document: I) -> Result<I, OutboundError> {
        self.store.insert((self.mapper)(&document)).await?;
        Ok(document)
    }

    async fn publish_many(&self, documents: Vec<I>) -> Vec<Outcome<I>> {
        let results = join_all(
            documents
                .iter()
                .map(|document| self.store.insert((self.mapper)(document))),
        )
        .await;

        documents
            .into_iter()
            .zip(results)
            .map(|(document, result)| match result {
                Ok(()) => {
                    counter!(DOCUMENTS_PUBLISHED, "publisher" => "table").increment(1);
                    Outcome::success(document)
                }
                Err(e) => {
                    counter!(DOCUMENTS_PUBLISH_FAILED, "publisher" => "table").increment(1);
                    Outcome::failure(document, e)
                }
            })
            .collect()
    }
}
