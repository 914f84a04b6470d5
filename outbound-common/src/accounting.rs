use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use tracing::{error, warn};

use crate::decoder::DecodeError;
use crate::metrics_consts::{AUDIT_ROWS_FAILED, AUDIT_ROWS_WRITTEN};
use crate::outcome::Failed;
use crate::publisher::audit::{AuditError, AuditRow, AuditStore};

const CHECK_STORAGE: &str = "Check storage table errors for details.";

/// Summary of a bulk batch, as reported to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    #[serde(rename = "isSuccess")]
    pub is_success: bool,
    pub result: String,
}

impl BatchOutcome {
    /// Builds the outcome of a batch from its counts.
    ///
    /// | decode errors | publish failures | is_success |
    /// |---------------|------------------|------------|
    /// | 0             | 0                | true       |
    /// | > 0           | 0                | false      |
    /// | 0             | > 0              | false      |
    /// | > 0           | > 0              | false      |
    pub fn from_counts(sent: usize, decode_errors: usize, publish_failures: usize) -> Self {
        let decoding = if decode_errors == 0 {
            "No decoding errors.".to_string()
        } else {
            "Error decoding some documents.".to_string()
        };

        let result = match (decode_errors, publish_failures) {
            (0, 0) => format!("Documents sent ({sent}). {decoding}"),
            (_, 0) => format!("Documents sent ({sent}). {decoding} {CHECK_STORAGE}"),
            _ => format!("Error publishing some documents. {CHECK_STORAGE} {decoding}"),
        };

        Self {
            is_success: decode_errors == 0 && publish_failures == 0,
            result,
        }
    }

    /// Marks the batch as failed without changing its message.
    pub fn degrade(mut self) -> Self {
        self.is_success = false;
        self
    }
}

/// How many audit rows a batch produced, and how many of them could not be stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuditSummary {
    pub written: usize,
    pub failed: usize,
}

/// Persists the failures of a bulk batch as audit rows.
pub struct BatchAccountant {
    store: Arc<dyn AuditStore>,
}

impl BatchAccountant {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Writes one row per decode error, then one row per publish failure.
    ///
    /// A row that cannot be written is counted and the remaining rows are still
    /// attempted. Only a connection failure of the store aborts, since no later
    /// write could succeed either.
    pub async fn record<I: Serialize>(
        &self,
        decode_errors: &[DecodeError],
        publish_failures: &[Failed<I>],
    ) -> Result<AuditSummary, AuditError> {
        let now = Utc::now();
        let rows: Vec<_> = decode_errors
            .iter()
            .map(|error| AuditRow::decode_failure(error, now))
            .chain(publish_failures.iter().map(|failed| {
                AuditRow::publish_failure(&failed.document, &failed.error, now)
            }))
            .collect();

        let mut summary = AuditSummary::default();
        for row in rows {
            match self.store.insert(row).await {
                Ok(()) => {
                    counter!(AUDIT_ROWS_WRITTEN).increment(1);
                    summary.written += 1;
                }
                Err(e) if e.is_connection() => {
                    error!("audit store is unreachable: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("failed to write audit row: {}", e);
                    counter!(AUDIT_ROWS_FAILED).increment(1);
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}
