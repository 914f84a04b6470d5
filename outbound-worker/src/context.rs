use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Error;
use axum::http::StatusCode;
use tracing::{info, warn};

use outbound_common::accounting::BatchAccountant;
use outbound_common::cache::{Cache, RedisCache};
use outbound_common::decoder::Decoder;
use outbound_common::enricher::PdvEnricher;
use outbound_common::filterer::PredicateFilterer;
use outbound_common::processor::{BulkProcessor, StreamingProcessor};
use outbound_common::publisher::audit::PgAuditStore;
use outbound_common::publisher::kafka::{
    create_kafka_producer, BrokerPublisher, ChunkedBrokerClient, KafkaBrokerClient,
};
use outbound_common::publisher::queue::{PgQueueClient, QueuePublisher};
use outbound_common::publisher::Publisher;
use outbound_common::storage;
use outbound_common::tokenizer::PdvTokenizerClient;
use outbound_common::tracker::LogTracker;

use crate::config::Config;
use crate::document::{self, ChangeDocument, OutboundFormatter};

/// Reports unhealthy when the processing loop has not checked in for `deadline`.
pub struct Liveness {
    started: Instant,
    last_report_ms: AtomicU64,
    deadline: Duration,
}

impl Liveness {
    pub fn new(deadline: Duration) -> Self {
        Self {
            started: Instant::now(),
            last_report_ms: AtomicU64::new(0),
            deadline,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn report_healthy(&self) {
        self.last_report_ms
            .store(self.elapsed_ms(), Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        let since_last = self
            .elapsed_ms()
            .saturating_sub(self.last_report_ms.load(Ordering::Relaxed));
        u128::from(since_last) <= self.deadline.as_millis()
    }

    pub fn status(&self) -> (StatusCode, &'static str) {
        if self.is_healthy() {
            (StatusCode::OK, "ok")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "processing loop is stalled")
        }
    }
}

pub struct AppContext {
    pub config: Config,
    pub broker: Arc<KafkaBrokerClient>,
    pub streaming: StreamingProcessor<ChangeDocument>,
    pub bulk: BulkProcessor<ChangeDocument>,
    pub liveness: Arc<Liveness>,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, Error> {
        let producer = create_kafka_producer(&config.kafka)?;
        let broker = Arc::new(KafkaBrokerClient::new(
            producer,
            config.broker_batch_timeout.0,
        ));

        // The pipeline runs without a cache rather than not at all
        let cache: Option<Arc<dyn Cache>> = match RedisCache::new(
            config.cache.redis_url.clone(),
            config.cache.cache_response_timeout.0,
        ) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!("running without a token cache: {}", e);
                None
            }
        };

        let tokenizer = Arc::new(PdvTokenizerClient::new(
            &config.tokenizer.tokenizer_base_url,
            config.tokenizer.tokenizer_api_key.clone(),
            config.tokenizer.tokenizer_request_timeout.0,
        )?);
        let tracker = Arc::new(LogTracker);
        let enricher = Arc::new(PdvEnricher::new(
            cache,
            tokenizer,
            tracker.clone(),
            config.cache.ttl(),
            config.enrichment.max_parallel_throttling,
        ));

        let db = storage::connect_lazy(
            &config.storage.database_url,
            config.storage.max_pg_connections,
        )?;
        storage::run_migrations(&db).await?;
        info!("storage migrations applied");

        let decoder: Arc<dyn Decoder<ChangeDocument>> = Arc::new(document::decoder());
        let main: Arc<dyn Publisher<ChangeDocument>> = Arc::new(BrokerPublisher::new(
            Arc::new(ChunkedBrokerClient::new(
                broker.clone(),
                config.broker_max_batch_size,
            )),
            config.kafka_target_topic.clone(),
            Arc::new(OutboundFormatter),
        ));
        let queue = Arc::new(PgQueueClient::from_pool(
            db.clone(),
            &config.storage.fallback_queue_table,
            &config.storage.fallback_queue_name,
        ));
        let fallback = Arc::new(QueuePublisher::with_mapper(
            queue,
            document::fallback_message,
        ));

        let mut streaming =
            StreamingProcessor::new(decoder.clone(), enricher, main.clone(), fallback, tracker);
        if config.filter_test_accounts {
            streaming = streaming.with_filterer(Arc::new(PredicateFilterer::new(
                document::is_real_account,
            )));
        }

        let audit = Arc::new(PgAuditStore::from_pool(db, &config.storage.audit_table));
        let bulk = BulkProcessor::new(decoder, main, BatchAccountant::new(audit));

        Ok(Self {
            config: config.clone(),
            broker,
            streaming,
            bulk,
            liveness: Arc::new(Liveness::new(config.liveness_deadline.0)),
        })
    }
}
