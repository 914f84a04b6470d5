use thiserror::Error;

use crate::cache::CacheError;
use crate::decoder::DecodeError;
use crate::publisher::audit::AuditError;
use crate::publisher::kafka::BrokerError;
use crate::publisher::queue::QueueError;
use crate::tokenizer::TokenizerError;

/// Enumeration of per-document errors carried by an `Outcome::Failure`.
///
/// Every variant displays exactly the message of the underlying error: these
/// messages end up pipe-joined in batch errors and in audit rows, where triage
/// tooling matches on them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OutboundError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("failed to format document: {0}")]
    Format(String),
    #[error("{0}")]
    Publish(String),
}

/// Enumeration of errors that fail a whole batch invocation.
#[derive(Error, Debug)]
pub enum BatchError {
    /// Some documents could not be delivered to the main nor to the fallback sink.
    /// The trigger is expected to retry the whole batch.
    #[error("{message}")]
    FallbackFailed { message: String, failures: usize },
    #[error("audit store is unavailable: {0}")]
    AuditStoreUnavailable(AuditError),
}
