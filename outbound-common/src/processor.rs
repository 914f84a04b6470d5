use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::accounting::{BatchAccountant, BatchOutcome};
use crate::decoder::{decode_batch, Decoder};
use crate::enricher::Enricher;
use crate::error::{BatchError, OutboundError};
use crate::filterer::{Filterer, IdentityFilterer};
use crate::metrics_consts::BATCHES_PROCESSED;
use crate::outcome::{partition, Failed};
use crate::publisher::Publisher;
use crate::tracker::{Severity, Tracker};

/// Streaming pipeline: decode, filter, enrich, publish, and fall back.
///
/// Documents that fail enrichment or the main publish are sent to the fallback
/// publisher. If any of them cannot be delivered there either, the whole batch
/// fails so that the trigger retries it.
pub struct StreamingProcessor<I> {
    decoder: Arc<dyn Decoder<I>>,
    filterer: Arc<dyn Filterer<I>>,
    enricher: Arc<dyn Enricher<I>>,
    main: Arc<dyn Publisher<I>>,
    fallback: Arc<dyn Publisher<I>>,
    tracker: Arc<dyn Tracker>,
}

impl<I> StreamingProcessor<I>
where
    I: Send + 'static,
{
    pub fn new(
        decoder: Arc<dyn Decoder<I>>,
        enricher: Arc<dyn Enricher<I>>,
        main: Arc<dyn Publisher<I>>,
        fallback: Arc<dyn Publisher<I>>,
        tracker: Arc<dyn Tracker>,
    ) -> Self {
        Self {
            decoder,
            filterer: Arc::new(IdentityFilterer),
            enricher,
            main,
            fallback,
            tracker,
        }
    }

    pub fn with_filterer(mut self, filterer: Arc<dyn Filterer<I>>) -> Self {
        self.filterer = filterer;
        self
    }

    fn decode_and_filter(&self, raw: &[Value]) -> Vec<I> {
        let decoded = decode_batch(self.decoder.as_ref(), raw);
        for error in decoded.errors {
            self.tracker
                .track_error(&OutboundError::Decode(error), Severity::Error);
        }

        self.filterer.filter(decoded.documents)
    }

    /// Enriches then publishes `documents`, returning every document that needs the fallback.
    async fn enrich_and_publish(&self, documents: Vec<I>) -> Vec<Failed<I>> {
        let (enriched, mut needs_fallback) = partition(self.enricher.enrich_many(documents).await);
        let (_, publish_failures) = partition(self.main.publish_many(enriched).await);

        needs_fallback.extend(publish_failures);
        needs_fallback
    }

    #[instrument(skip_all, fields(raw = raw.len()))]
    pub async fn process(&self, raw: &[Value]) -> Result<(), BatchError> {
        let documents = self.decode_and_filter(raw);
        debug!("{} documents to publish", documents.len());

        let needs_fallback = self.enrich_and_publish(documents).await;
        self.settle(needs_fallback).await
    }

    async fn settle(&self, failed: Vec<Failed<I>>) -> Result<(), BatchError> {
        if failed.is_empty() {
            counter!(BATCHES_PROCESSED, "mode" => "stream", "result" => "published").increment(1);
            return Ok(());
        }

        let (documents, errors): (Vec<I>, Vec<OutboundError>) = failed
            .into_iter()
            .map(|failed| (failed.document, failed.error))
            .unzip();
        info!("sending {} documents to the fallback publisher", documents.len());

        let outcomes = self.fallback.publish_many(documents).await;

        let mut fallback_errors = Vec::new();
        let mut original_errors = Vec::new();
        for (outcome, original) in outcomes.iter().zip(errors) {
            if let Some(error) = outcome.error() {
                fallback_errors.push(error.to_string());
                original_errors.push(original.to_string());
            }
        }

        if fallback_errors.is_empty() {
            counter!(BATCHES_PROCESSED, "mode" => "stream", "result" => "fallback").increment(1);
            return Ok(());
        }

        let failures = fallback_errors.len();
        let message = fallback_errors
            .into_iter()
            .chain(original_errors)
            .collect::<Vec<_>>()
            .join("|");

        error!(failures, "fallback publisher failed, rejecting batch");
        counter!(BATCHES_PROCESSED, "mode" => "stream", "result" => "rejected").increment(1);
        Err(BatchError::FallbackFailed { message, failures })
    }
}

/// Bulk pipeline: decode, publish, and account for every failure in the audit store.
///
/// Data-level faults never fail the call; they are reflected in the returned
/// `BatchOutcome`.
pub struct BulkProcessor<I> {
    decoder: Arc<dyn Decoder<I>>,
    main: Arc<dyn Publisher<I>>,
    accountant: BatchAccountant,
}

impl<I> BulkProcessor<I>
where
    I: Serialize + Send + Sync + 'static,
{
    pub fn new(
        decoder: Arc<dyn Decoder<I>>,
        main: Arc<dyn Publisher<I>>,
        accountant: BatchAccountant,
    ) -> Self {
        Self {
            decoder,
            main,
            accountant,
        }
    }

    #[instrument(skip_all, fields(raw = raw.len()))]
    pub async fn process(&self, raw: &[Value]) -> Result<BatchOutcome, BatchError> {
        let decoded = decode_batch(self.decoder.as_ref(), raw);

        let (sent, failures) = partition(self.main.publish_many(decoded.documents).await);
        let outcome = BatchOutcome::from_counts(sent.len(), decoded.errors.len(), failures.len());

        let summary = self
            .accountant
            .record(&decoded.errors, &failures)
            .await
            .map_err(BatchError::AuditStoreUnavailable)?;

        let outcome = if summary.failed > 0 {
            warn!("{} audit rows could not be written", summary.failed);
            outcome.degrade()
        } else {
            outcome
        };

        let result = if outcome.is_success { "success" } else { "failure" };
        counter!(BATCHES_PROCESSED, "mode" => "bulk", "result" => result).increment(1);

        Ok(outcome)
    }
}
