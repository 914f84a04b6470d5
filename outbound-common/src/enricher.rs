use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, instrument};

use crate::cache::{Cache, CacheError};
use crate::error::OutboundError;
use crate::metrics_consts::{CACHE_FAULTS, CACHE_HITS, CACHE_MISSES, ENRICHMENT_FAILURES};
use crate::outcome::Outcome;
use crate::tokenizer::Tokenizer;
use crate::tracker::{Severity, Tracker};

const CACHE_KEY_PREFIX: &str = "pdv:token:";

/// A document that can be pseudonymized: it exposes the personal data to exchange
/// for a token, and accepts the token as its derived field.
pub trait Pseudonymizable: Send + Sync + 'static {
    /// The personal data to tokenize. Doubles as the correlation key for the cache.
    fn pii(&self) -> &str;

    fn with_token(self, token: String) -> Self;
}

#[async_trait]
pub trait Enricher<I: Send + 'static>: Send + Sync {
    async fn enrich_one(&self, document: I) -> Outcome<I>;

    async fn enrich_many(&self, documents: Vec<I>) -> Vec<Outcome<I>>;
}

/// Splits `items` into consecutive chunks of at most `size` items, keeping order.
pub fn chunked<I>(items: Vec<I>, size: usize) -> Vec<Vec<I>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);

    for item in items {
        current.push(item);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Enriches documents with a token from the PDV tokenizer, with a cache in front of it.
///
/// Batches are processed in chunks of `max_parallel_throttling` documents: chunks run
/// one after the other, documents within a chunk run concurrently. This caps the
/// number of in-flight tokenizer and cache calls whatever the batch size.
pub struct PdvEnricher {
    /// `None` when no cache client could be obtained at startup.
    cache: Option<Arc<dyn Cache>>,
    tokenizer: Arc<dyn Tokenizer>,
    tracker: Arc<dyn Tracker>,
    cache_ttl: Duration,
    max_parallel_throttling: usize,
}

impl PdvEnricher {
    pub fn new(
        cache: Option<Arc<dyn Cache>>,
        tokenizer: Arc<dyn Tokenizer>,
        tracker: Arc<dyn Tracker>,
        cache_ttl: Duration,
        max_parallel_throttling: usize,
    ) -> Self {
        Self {
            cache,
            tokenizer,
            tracker,
            cache_ttl,
            max_parallel_throttling: max_parallel_throttling.max(1),
        }
    }

    fn track_cache_fault(&self, error: CacheError) {
        metrics::counter!(CACHE_FAULTS).increment(1);
        self.tracker
            .track_error(&OutboundError::Cache(error), Severity::Warning);
    }

    /// Looks the key up in the cache. Returns the cached token, if any, and whether
    /// the cache is reachable enough to be worth writing back to.
    async fn read_cache(&self, key: &str) -> (Option<String>, bool) {
        let Some(cache) = &self.cache else {
            self.track_cache_fault(CacheError::Unavailable(
                "no cache client available".to_string(),
            ));
            return (None, false);
        };

        match cache.get(key).await {
            Ok(Some(token)) if !token.is_empty() => {
                metrics::counter!(CACHE_HITS).increment(1);
                (Some(token), true)
            }
            Ok(_) => {
                metrics::counter!(CACHE_MISSES).increment(1);
                (None, true)
            }
            Err(error) => {
                let reachable = !error.is_unavailable();
                self.track_cache_fault(error);
                (None, reachable)
            }
        }
    }

    async fn write_cache(&self, key: &str, token: &str) {
        if let Some(cache) = &self.cache {
            if let Err(error) = cache.set(key, self.cache_ttl, token).await {
                self.track_cache_fault(error);
            }
        }
    }
}

#[async_trait]
impl<I> Enricher<I> for PdvEnricher
where
    I: Pseudonymizable,
{
    async fn enrich_one(&self, document: I) -> Outcome<I> {
        let key = format!("{}{}", CACHE_KEY_PREFIX, document.pii());

        let (cached, write_back) = self.read_cache(&key).await;
        if let Some(token) = cached {
            return Outcome::success(document.with_token(token));
        }

        match self.tokenizer.tokenize(document.pii()).await {
            Ok(token) => {
                if write_back {
                    self.write_cache(&key, &token).await;
                }
                Outcome::success(document.with_token(token))
            }
            Err(error) => {
                debug!("failed to enrich document: {}", error);
                metrics::counter!(ENRICHMENT_FAILURES).increment(1);
                Outcome::failure(document, error)
            }
        }
    }

    #[instrument(skip_all, fields(documents = documents.len()))]
    async fn enrich_many(&self, documents: Vec<I>) -> Vec<Outcome<I>> {
        let mut outcomes = Vec::with_capacity(documents.len());

        for chunk in chunked(documents, self.max_parallel_throttling) {
            let enriched = join_all(
                chunk
                    .into_iter()
                    .map(|document| <Self as Enricher<I>>::enrich_one(self, document)),
            );
            outcomes.extend(enriched.await);
        }

        outcomes
    }
}

/// Forwards every document unchanged, for document kinds that carry no personal data.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThroughEnricher;

#[async_trait]
impl<I> Enricher<I> for PassThroughEnricher
where
    I: Send + 'static,
{
    async fn enrich_one(&self, document: I) -> Outcome<I> {
        Outcome::success(document)
    }

    async fn enrich_many(&self, documents: Vec<I>) -> Vec<Outcome<I>> {
        documents.into_iter().map(Outcome::success).collect()
    }
}
