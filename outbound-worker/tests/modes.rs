use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use outbound_common::accounting::BatchAccountant;
use outbound_common::enricher::PdvEnricher;
use outbound_common::processor::{BulkProcessor, StreamingProcessor};
use outbound_common::publisher::kafka::{BrokerError, BrokerPublisher};
use outbound_common::publisher::queue::{QueueError, QueuePublisher};
use outbound_common::test_utils::{
    MockAuditStore, MockBrokerClient, MockQueueClient, MockTokenizer, RecordingTracker,
};
use outbound_worker::bulk::run_bulk;
use outbound_worker::consumer::process_with_retry;
use outbound_worker::context::Liveness;
use outbound_worker::document::{self, ChangeDocument, OutboundFormatter};
use outbound_worker::error::WorkerError;
use outbound_worker::retry::RetryPolicy;

fn change(id: &str) -> Value {
    json!({"id": id, "fiscal_code": format!("FISCAL-{id}"), "status": "ACTIVE"})
}

/// An export record, already carrying its token.
fn exported(id: &str) -> Value {
    let mut record = change(id);
    record["user_token"] = json!(format!("token-FISCAL-{id}"));
    record
}

fn immediate_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(1, Duration::ZERO, Duration::ZERO, Some(max_attempts))
}

fn main_publisher(broker: Arc<MockBrokerClient>) -> BrokerPublisher<ChangeDocument> {
    BrokerPublisher::new(
        broker,
        "cdc_changes_outbound".to_string(),
        Arc::new(OutboundFormatter),
    )
}

fn streaming(
    broker: Arc<MockBrokerClient>,
    queue: Arc<MockQueueClient>,
) -> StreamingProcessor<ChangeDocument> {
    let enricher = PdvEnricher::new(
        None,
        Arc::new(MockTokenizer::new()),
        Arc::new(RecordingTracker::default()),
        Duration::from_secs(60),
        10,
    );

    StreamingProcessor::new(
        Arc::new(document::decoder()),
        Arc::new(enricher),
        Arc::new(main_publisher(broker)),
        Arc::new(QueuePublisher::with_mapper(queue, document::fallback_message)),
        Arc::new(RecordingTracker::default()),
    )
}

#[tokio::test]
async fn stream_batch_is_retried_until_settled() {
    let broker = Arc::new(MockBrokerClient::scripted(|call, messages| {
        if call < 2 {
            Err(BrokerError::Produce("leader not available".to_string()))
        } else {
            Ok(messages.iter().map(|_| Ok(())).collect())
        }
    }));
    let queue = Arc::new(MockQueueClient::failing(QueueError::Connection(
        "queue is down".to_string(),
    )));
    let processor = streaming(broker.clone(), queue);

    process_with_retry(
        &processor,
        &[change("1"), change("2")],
        &immediate_retries(5),
        &Liveness::new(Duration::from_secs(60)),
    )
    .await
    .expect("third attempt goes through");

    let calls = broker.calls();
    assert_eq!(calls.len(), 3);
    let message = &calls[2].1[0];
    assert_eq!(message.key.as_deref(), Some("token-FISCAL-1"));
    let published: Value = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(published["user_token"], "token-FISCAL-1");
    assert_eq!(published.get("fiscal_code"), None);
}

#[tokio::test]
async fn stream_batch_gives_up_after_max_attempts() {
    let broker = Arc::new(MockBrokerClient::failing(BrokerError::Timeout(100)));
    let queue = Arc::new(MockQueueClient::failing(QueueError::Connection(
        "queue is down".to_string(),
    )));
    let processor = streaming(broker.clone(), queue);

    let error = process_with_retry(
        &processor,
        &[change("1")],
        &immediate_retries(1),
        &Liveness::new(Duration::from_secs(60)),
    )
    .await
    .unwrap_err();

    assert!(matches!(error, WorkerError::RetriesExhausted(_)));
    assert_eq!(broker.calls().len(), 2);
}

#[tokio::test]
async fn failed_stream_documents_land_in_the_queue_without_token() {
    let broker = Arc::new(MockBrokerClient::failing(BrokerError::Timeout(100)));
    let queue = Arc::new(MockQueueClient::new());
    let processor = streaming(broker, queue.clone());

    process_with_retry(
        &processor,
        &[change("1")],
        &immediate_retries(0),
        &Liveness::new(Duration::from_secs(60)),
    )
    .await
    .expect("fallback accepted the document");

    let messages = queue.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["id"], "1");
    assert_eq!(messages[0].get("user_token"), None);
}

#[tokio::test]
async fn bulk_file_is_processed_in_batches() {
    let broker = Arc::new(MockBrokerClient::new());
    let store = Arc::new(MockAuditStore::new());
    let processor = BulkProcessor::new(
        Arc::new(document::decoder()),
        Arc::new(main_publisher(broker.clone())),
        BatchAccountant::new(store.clone()),
    );
    let input = [
        exported("1").to_string(),
        exported("2").to_string(),
        String::new(),
        exported("3").to_string(),
        "{not json".to_string(),
    ]
    .join("\n");

    let outcomes = run_bulk(
        &processor,
        input.as_bytes(),
        2,
        &Liveness::new(Duration::from_secs(60)),
    )
    .await
    .expect("store is reachable");

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].is_success);
    assert_eq!(outcomes[0].result, "Documents sent (2). No decoding errors.");
    assert!(!outcomes[1].is_success);
    let calls = broker.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls
        .iter()
        .flat_map(|(_, messages)| messages)
        .all(|message| !message.payload.contains("fiscal_code")));
    assert_eq!(store.rows().len(), 1);
}

#[tokio::test]
async fn bulk_records_without_token_are_audited_not_published() {
    let broker = Arc::new(MockBrokerClient::new());
    let store = Arc::new(MockAuditStore::new());
    let processor = BulkProcessor::new(
        Arc::new(document::decoder()),
        Arc::new(main_publisher(broker.clone())),
        BatchAccountant::new(store.clone()),
    );
    let input = format!("{}\n{}\n", exported("1"), change("2"));

    let outcomes = run_bulk(
        &processor,
        input.as_bytes(),
        10,
        &Liveness::new(Duration::from_secs(60)),
    )
    .await
    .unwrap();

    assert!(!outcomes[0].is_success);
    assert_eq!(broker.calls()[0].1.len(), 1);
    let rows = store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].error, "failed to format document: user_token is missing");
}

#[tokio::test]
async fn empty_bulk_file_has_no_batches() {
    let broker = Arc::new(MockBrokerClient::new());
    let processor = BulkProcessor::new(
        Arc::new(document::decoder()),
        Arc::new(main_publisher(broker.clone())),
        BatchAccountant::new(Arc::new(MockAuditStore::new())),
    );

    let outcomes = run_bulk(
        &processor,
        &b"\n\n"[..],
        10,
        &Liveness::new(Duration::from_secs(60)),
    )
    .await
    .unwrap();

    assert!(outcomes.is_empty());
    assert!(broker.calls().is_empty());
}
