//! Bulk mode: push an export file through the bulk pipeline, one batch at a time.
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use outbound_common::accounting::BatchOutcome;
use outbound_common::processor::BulkProcessor;

use crate::context::Liveness;
use crate::document::ChangeDocument;
use crate::error::WorkerError;

/// A line that is not JSON is kept as a string, so that it is audited as a decode failure.
pub fn parse_line(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}

/// Reads newline-delimited documents from `reader` and processes them in batches
/// of `batch_size`, returning the outcome of every batch in order.
pub async fn run_bulk<R>(
    processor: &BulkProcessor<ChangeDocument>,
    reader: R,
    batch_size: usize,
    liveness: &Liveness,
) -> Result<Vec<BatchOutcome>, WorkerError>
where
    R: AsyncBufRead + Unpin,
{
    let batch_size = batch_size.max(1);
    let mut lines = reader.lines();
    let mut outcomes = Vec::new();
    let mut batch = Vec::with_capacity(batch_size);

    loop {
        let line = lines.next_line().await?;
        let exhausted = line.is_none();

        if let Some(line) = line {
            if !line.trim().is_empty() {
                batch.push(parse_line(&line));
            }
        }

        if batch.len() >= batch_size || (exhausted && !batch.is_empty()) {
            liveness.report_healthy();
            let outcome = processor.process(&batch).await?;
            if outcome.is_success {
                info!(batch = outcomes.len(), "{}", outcome.result);
            } else {
                warn!(batch = outcomes.len(), "{}", outcome.result);
            }
            outcomes.push(outcome);
            batch.clear();
        }

        if exhausted {
            return Ok(outcomes);
        }
    }
}
