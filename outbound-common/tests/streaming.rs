use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use outbound_common::decoder::JsonDecoder;
use outbound_common::enricher::PdvEnricher;
use outbound_common::error::BatchError;
use outbound_common::filterer::PredicateFilterer;
use outbound_common::processor::StreamingProcessor;
use outbound_common::publisher::empty::{EmptyPublisher, NO_FALLBACK_SINK};
use outbound_common::publisher::kafka::{
    BrokerError, BrokerPublisher, ChunkedBrokerClient, JsonFormatter,
};
use outbound_common::publisher::queue::{QueueError, QueuePublisher};
use outbound_common::publisher::Publisher;
use outbound_common::test_utils::{
    raw_document, MockBrokerClient, MockCache, MockQueueClient, MockTokenizer, RecordingTracker,
    TestDocument,
};
use outbound_common::tokenizer::TokenizerError;
use outbound_common::tracker::Severity;

struct Pipeline {
    broker: Arc<MockBrokerClient>,
    tokenizer: Arc<MockTokenizer>,
    tracker: Arc<RecordingTracker>,
    processor: StreamingProcessor<TestDocument>,
}

fn pipeline(
    broker: MockBrokerClient,
    tokenizer: MockTokenizer,
    fallback: Arc<dyn Publisher<TestDocument>>,
    throttling: usize,
) -> Pipeline {
    let broker = Arc::new(broker);
    let tokenizer = Arc::new(tokenizer);
    let tracker = Arc::new(RecordingTracker::default());

    let enricher = PdvEnricher::new(
        Some(Arc::new(MockCache::new())),
        tokenizer.clone(),
        tracker.clone(),
        Duration::from_secs(60),
        throttling,
    );
    let main = BrokerPublisher::new(
        broker.clone(),
        "outbound-changes".to_string(),
        Arc::new(JsonFormatter::new(|d: &TestDocument| Some(d.id.clone()))),
    );

    let processor = StreamingProcessor::new(
        Arc::new(JsonDecoder::<TestDocument>::new()),
        Arc::new(enricher),
        Arc::new(main),
        fallback,
        tracker.clone(),
    );

    Pipeline {
        broker,
        tokenizer,
        tracker,
        processor,
    }
}

fn raw_documents(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| raw_document(&i.to_string(), &format!("FISCAL-{i}")))
        .collect()
}

#[tokio::test]
async fn publishes_enriched_documents() {
    let p = pipeline(
        MockBrokerClient::new(),
        MockTokenizer::new(),
        Arc::new(EmptyPublisher),
        10,
    );

    p.processor
        .process(&raw_documents(3))
        .await
        .expect("batch should succeed");

    let calls = p.broker.calls();
    assert_eq!(calls.len(), 1);
    let published: Vec<TestDocument> = calls[0]
        .1
        .iter()
        .map(|m| serde_json::from_str(&m.payload).unwrap())
        .collect();
    assert_eq!(
        published
            .iter()
            .map(|d| d.user_token.clone())
            .collect::<Vec<_>>(),
        vec![
            Some("token-FISCAL-0".to_string()),
            Some("token-FISCAL-1".to_string()),
            Some("token-FISCAL-2".to_string()),
        ]
    );
    assert!(p.tracker.events().is_empty());
}

#[tokio::test]
async fn decode_errors_never_block_valid_documents() {
    let p = pipeline(
        MockBrokerClient::new(),
        MockTokenizer::new(),
        Arc::new(EmptyPublisher),
        10,
    );
    let raw = vec![
        json!({"id": "broken"}),
        raw_document("1", "FISCAL-1"),
        json!("not a document"),
        raw_document("2", "FISCAL-2"),
    ];

    p.processor
        .process(&raw)
        .await
        .expect("decode errors are not fatal");

    assert_eq!(p.broker.calls()[0].1.len(), 2);
    let events = p.tracker.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|(_, severity)| *severity == Severity::Error));
}

#[tokio::test]
async fn filtered_documents_are_neither_enriched_nor_published() {
    let p = pipeline(
        MockBrokerClient::new(),
        MockTokenizer::new(),
        Arc::new(EmptyPublisher),
        10,
    );
    let processor = p.processor.with_filterer(Arc::new(PredicateFilterer::new(
        |d: &TestDocument| !d.test_account,
    )));
    let raw = vec![
        raw_document("1", "FISCAL-1"),
        json!({"id": "2", "fiscal_code": "FISCAL-2", "test_account": true}),
    ];

    processor.process(&raw).await.expect("batch should succeed");

    assert_eq!(p.tokenizer.calls(), vec!["FISCAL-1".to_string()]);
    assert_eq!(p.broker.calls()[0].1.len(), 1);
}

#[tokio::test]
async fn fallback_success_suppresses_escalation() {
    let queue = Arc::new(MockQueueClient::new());
    let p = pipeline(
        MockBrokerClient::failing(BrokerError::Produce("all brokers down".to_string())),
        MockTokenizer::new(),
        Arc::new(QueuePublisher::<TestDocument>::new(queue.clone())),
        10,
    );

    p.processor
        .process(&raw_documents(3))
        .await
        .expect("fallback absorbed every failure");

    assert_eq!(queue.messages().len(), 3);
}

#[tokio::test]
async fn enrichment_failures_reach_the_fallback_unmodified() {
    let queue = Arc::new(MockQueueClient::new());
    let p = pipeline(
        MockBrokerClient::new(),
        MockTokenizer::new().with_error(
            "FISCAL-1",
            TokenizerError::Status {
                status: 429,
                title: "Too Many Requests".to_string(),
            },
        ),
        Arc::new(QueuePublisher::<TestDocument>::new(queue.clone())),
        10,
    );

    p.processor
        .process(&raw_documents(3))
        .await
        .expect("fallback absorbed the failure");

    assert_eq!(p.broker.calls()[0].1.len(), 2);
    assert_eq!(
        queue.messages(),
        vec![json!({"id": "1", "fiscal_code": "FISCAL-1", "test_account": false})]
    );
}

#[tokio::test]
async fn fallback_failure_escalates_with_joined_messages() {
    let p = pipeline(
        MockBrokerClient::failing(BrokerError::Produce("all brokers down".to_string())),
        MockTokenizer::new(),
        Arc::new(EmptyPublisher),
        10,
    );

    let result = p.processor.process(&raw_documents(2)).await;

    match result {
        Err(BatchError::FallbackFailed { message, failures }) => {
            assert_eq!(failures, 2);
            let broker_error = "failed to produce to kafka: all brokers down";
            assert_eq!(
                message,
                [NO_FALLBACK_SINK, NO_FALLBACK_SINK, broker_error, broker_error].join("|")
            );
        }
        other => panic!("expected the batch to be rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn escalation_lists_fallback_errors_then_their_original_errors() {
    // "0" and "2" fail enrichment, "1" is rejected by the broker; the fallback
    // then rejects "0" and "1" but accepts "2"
    let queue = Arc::new(MockQueueClient::failing_ids(
        &["0", "1"],
        QueueError::Send("duplicate key value".to_string()),
    ));
    let p = pipeline(
        MockBrokerClient::scripted(|_, messages| {
            Ok(messages
                .iter()
                .enumerate()
                .map(|(position, _)| match position {
                    0 => Err(BrokerError::Produce("Message size too large".to_string())),
                    _ => Ok(()),
                })
                .collect())
        }),
        MockTokenizer::new()
            .with_error(
                "FISCAL-0",
                TokenizerError::Status {
                    status: 429,
                    title: "Too Many Requests".to_string(),
                },
            )
            .with_error(
                "FISCAL-2",
                TokenizerError::Status {
                    status: 503,
                    title: "Service Unavailable".to_string(),
                },
            ),
        Arc::new(QueuePublisher::<TestDocument>::new(queue.clone())),
        10,
    );

    let result = p.processor.process(&raw_documents(4)).await;

    match result {
        Err(BatchError::FallbackFailed { message, failures }) => {
            assert_eq!(failures, 2);
            assert_eq!(
                message,
                [
                    "INSERT query failed with: duplicate key value",
                    "INSERT query failed with: duplicate key value",
                    "Pdv tokenizer returned 429 with error: Too Many Requests",
                    "failed to produce to kafka: Message size too large",
                ]
                .join("|")
            );
        }
        other => panic!("expected the batch to be rejected, got {other:?}"),
    }
    let queued = queue.messages();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0]["id"], "2");
    assert_eq!(p.broker.calls()[0].1.len(), 2);
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let p = pipeline(
        MockBrokerClient::new(),
        MockTokenizer::new(),
        Arc::new(EmptyPublisher),
        10,
    );

    p.processor.process(&[]).await.expect("nothing to do");

    assert!(p.broker.calls().is_empty());
    assert!(p.tokenizer.calls().is_empty());
}

#[tokio::test]
async fn failing_broker_chunk_only_sends_its_documents_to_the_fallback() {
    let max_batch_size = 100;
    let broker = Arc::new(MockBrokerClient::scripted(|call, messages| match call {
        0 => Err(BrokerError::Produce("request timed out".to_string())),
        _ => Ok(messages.iter().map(|_| Ok(())).collect()),
    }));
    let tokenizer = Arc::new(MockTokenizer::new());
    let queue = Arc::new(MockQueueClient::new());
    let enricher = PdvEnricher::new(
        None,
        tokenizer.clone(),
        Arc::new(RecordingTracker::default()),
        Duration::from_secs(60),
        max_batch_size,
    );
    let main = BrokerPublisher::new(
        Arc::new(ChunkedBrokerClient::new(broker.clone(), max_batch_size)),
        "outbound-changes".to_string(),
        Arc::new(JsonFormatter::new(|d: &TestDocument| Some(d.id.clone()))),
    );
    let processor = StreamingProcessor::new(
        Arc::new(JsonDecoder::<TestDocument>::new()),
        Arc::new(enricher),
        Arc::new(main),
        Arc::new(QueuePublisher::<TestDocument>::new(queue.clone())),
        Arc::new(RecordingTracker::default()),
    );

    processor
        .process(&raw_documents(1000))
        .await
        .expect("fallback absorbed the failing chunk");

    let calls = broker.calls();
    assert_eq!(calls.len(), 10);
    assert!(calls
        .iter()
        .all(|(_, messages)| messages.len() == max_batch_size));
    let queued = queue.messages();
    assert_eq!(queued.len(), max_batch_size);
    assert_eq!(queued[0]["id"], "0");
    assert_eq!(queued[max_batch_size - 1]["id"], "99");
    assert!(tokenizer.max_in_flight() <= max_batch_size);
}
