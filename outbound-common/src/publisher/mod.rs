use async_trait::async_trait;

use crate::error::OutboundError;
use crate::outcome::Outcome;

pub mod audit;
pub mod empty;
pub mod kafka;
pub mod queue;

/// A sink for documents.
///
/// `publish_many` never fails as a whole: every input document comes back exactly
/// once, in input order, either as a `Success` or as a `Failure` carrying the
/// document as it was handed in.
#[async_trait]
pub trait Publisher<I: Send + 'static>: Send + Sync {
    async fn publish(&self, document: I) -> Result<I, OutboundError>;

    async fn publish_many(&self, documents: Vec<I>) -> Vec<Outcome<I>>;
}
