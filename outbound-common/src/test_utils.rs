//! In-memory doubles for the external capabilities of the pipeline, used by unit
//! and integration tests. They record every call so tests can assert on them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{Cache, CacheError};
use crate::enricher::Pseudonymizable;
use crate::error::OutboundError;
use crate::publisher::audit::{AuditError, AuditRow, AuditStore};
use crate::publisher::kafka::{BrokerClient, BrokerError, BrokerMessage};
use crate::publisher::queue::{QueueClient, QueueError};
use crate::tokenizer::{Tokenizer, TokenizerError};
use crate::tracker::{Severity, Tracker};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A change-stream document as used throughout the tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDocument {
    pub id: String,
    pub fiscal_code: String,
    #[serde(default)]
    pub test_account: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_token: Option<String>,
}

impl Pseudonymizable for TestDocument {
    fn pii(&self) -> &str {
        &self.fiscal_code
    }

    fn with_token(mut self, token: String) -> Self {
        self.user_token = Some(token);
        self
    }
}

pub fn test_document(id: &str, fiscal_code: &str) -> TestDocument {
    TestDocument {
        id: id.to_string(),
        fiscal_code: fiscal_code.to_string(),
        test_account: false,
        user_token: None,
    }
}

/// The raw JSON form of `test_document`.
pub fn raw_document(id: &str, fiscal_code: &str) -> Value {
    serde_json::json!({ "id": id, "fiscal_code": fiscal_code })
}

#[derive(Default)]
pub struct RecordingTracker {
    events: Mutex<Vec<(OutboundError, Severity)>>,
}

impl RecordingTracker {
    pub fn events(&self) -> Vec<(OutboundError, Severity)> {
        lock(&self.events).clone()
    }
}

impl Tracker for RecordingTracker {
    fn track_error(&self, error: &OutboundError, severity: Severity) {
        lock(&self.events).push((error.clone(), severity));
    }
}

#[derive(Default)]
pub struct MockCache {
    entries: Mutex<HashMap<String, String>>,
    get_error: Option<CacheError>,
    set_error: Option<CacheError>,
    set_ttls: Mutex<Vec<Duration>>,
}

impl MockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(self, key: &str, value: &str) -> Self {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_get_error(mut self, error: CacheError) -> Self {
        self.get_error = Some(error);
        self
    }

    pub fn with_set_error(mut self, error: CacheError) -> Self {
        self.set_error = Some(error);
        self
    }

    pub fn entry(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    /// TTLs of the successful `set` calls, in call order.
    pub fn set_ttls(&self) -> Vec<Duration> {
        lock(&self.set_ttls).clone()
    }
}

#[async_trait]
impl Cache for MockCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if let Some(error) = &self.get_error {
            return Err(error.clone());
        }
        Ok(self.entry(key))
    }

    async fn set(&self, key: &str, ttl: Duration, value: &str) -> Result<(), CacheError> {
        if let Some(error) = &self.set_error {
            return Err(error.clone());
        }
        lock(&self.entries).insert(key.to_string(), value.to_string());
        lock(&self.set_ttls).push(ttl);
        Ok(())
    }
}

/// Returns `token-{pii}` unless an error was registered for that pii.
#[derive(Default)]
pub struct MockTokenizer {
    errors: HashMap<String, TokenizerError>,
    delay: Option<Duration>,
    reverse_delays: bool,
    calls: Mutex<Vec<String>>,
    started: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(mut self, pii: &str, error: TokenizerError) -> Self {
        self.errors.insert(pii.to_string(), error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Earlier calls sleep longer than later ones, so they complete out of order.
    pub fn with_reverse_delays(mut self) -> Self {
        self.reverse_delays = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tokenizer for MockTokenizer {
    async fn tokenize(&self, pii: &str) -> Result<String, TokenizerError> {
        lock(&self.calls).push(pii.to_string());
        let started = self.started.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.reverse_delays {
            let steps = 64usize.saturating_sub(started % 64);
            tokio::time::sleep(Duration::from_micros(100) * u32::try_from(steps).unwrap_or(0))
                .await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match self.errors.get(pii) {
            Some(error) => Err(error.clone()),
            None => Ok(format!("token-{pii}")),
        }
    }
}

type BrokerScript = Box<
    dyn Fn(usize, &[BrokerMessage]) -> Result<Vec<Result<(), BrokerError>>, BrokerError>
        + Send
        + Sync,
>;

/// Records every call; by default acknowledges every message.
pub struct MockBrokerClient {
    script: BrokerScript,
    calls: Mutex<Vec<(String, Vec<BrokerMessage>)>>,
}

impl Default for MockBrokerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrokerClient {
    pub fn new() -> Self {
        Self::scripted(|_, messages| Ok(messages.iter().map(|_| Ok(())).collect()))
    }

    /// The script receives the call index and the messages of the call.
    pub fn scripted<F>(script: F) -> Self
    where
        F: Fn(usize, &[BrokerMessage]) -> Result<Vec<Result<(), BrokerError>>, BrokerError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fails every call as a whole.
    pub fn failing(error: BrokerError) -> Self {
        Self::scripted(move |_, _| Err(error.clone()))
    }

    pub fn calls(&self) -> Vec<(String, Vec<BrokerMessage>)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    async fn send_batch(
        &self,
        topic: &str,
        messages: Vec<BrokerMessage>,
    ) -> Result<Vec<Result<(), BrokerError>>, BrokerError> {
        let index = {
            let mut calls = lock(&self.calls);
            calls.push((topic.to_string(), messages.clone()));
            calls.len() - 1
        };
        (self.script)(index, &messages)
    }
}

/// Keeps messages in memory. Sends can be made to fail for messages whose
/// `id` is in a given list, or for every message.
#[derive(Default)]
pub struct MockQueueClient {
    fail_ids: Option<Vec<String>>,
    error: Option<QueueError>,
    messages: Mutex<Vec<Value>>,
}

impl MockQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: QueueError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn failing_ids(ids: &[&str], error: QueueError) -> Self {
        Self {
            fail_ids: Some(ids.iter().map(|id| id.to_string()).collect()),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<Value> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl QueueClient for MockQueueClient {
    async fn send(&self, message: Value) -> Result<(), QueueError> {
        if let Some(error) = &self.error {
            let matches = match &self.fail_ids {
                Some(ids) => message["id"]
                    .as_str()
                    .is_some_and(|id| ids.iter().any(|fail| fail == id)),
                None => true,
            };
            if matches {
                return Err(error.clone());
            }
        }
        lock(&self.messages).push(message);
        Ok(())
    }
}

/// Keeps rows in memory. Writes can be made to fail for rows whose error
/// message contains a given marker, or for every row.
#[derive(Default)]
pub struct MockAuditStore {
    fail_when_error_contains: Option<String>,
    error: Option<AuditError>,
    rows: Mutex<Vec<AuditRow>>,
}

impl MockAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: AuditError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn failing_rows_containing(marker: &str, error: AuditError) -> Self {
        Self {
            fail_when_error_contains: Some(marker.to_string()),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn rows(&self) -> Vec<AuditRow> {
        lock(&self.rows).clone()
    }
}

#[async_trait]
impl AuditStore for MockAuditStore {
    async fn insert(&self, row: AuditRow) -> Result<(), AuditError> {
        if let Some(error) = &self.error {
            let matches = match &self.fail_when_error_contains {
                Some(marker) => row.error.contains(marker.as_str()),
                None => true,
            };
            if matches {
                return Err(error.clone());
            }
        }
        lock(&self.rows).push(row);
        Ok(())
    }
}
