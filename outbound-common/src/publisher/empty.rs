use async_trait::async_trait;

use crate::error::OutboundError;
use crate::outcome::Outcome;
use crate::publisher::Publisher;

pub const NO_FALLBACK_SINK: &str = "No fallback publisher is configured for this document type";

/// Stands in for a sink that does not exist, typically the fallback of a document
/// kind with no retry queue. Every document fails, so that the caller escalates.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyPublisher;

#[async_trait]
impl<I> Publisher<I> for EmptyPublisher
where
    I: Send + 'static,
{
    async fn publish(&self, _document: I) -> Result<I, OutboundError> {
        Err(OutboundError::Publish(NO_FALLBACK_SINK.to_string()))
    }

    async fn publish_many(&self, documents: Vec<I>) -> Vec<Outcome<I>> {
        documents
            .into_iter()
            .map(|document| {
                Outcome::failure(document, OutboundError::Publish(NO_FALLBACK_SINK.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fails_every_document_with_the_same_error() {
        let outcomes = EmptyPublisher.publish_many(vec!["a", "b"]).await;

        assert_eq!(outcomes.len(), 2);
        for (outcome, expected) in outcomes.iter().zip(["a", "b"]) {
            assert_eq!(outcome.document(), &expected);
            assert_eq!(
                outcome.error().map(|e| e.to_string()),
                Some(NO_FALLBACK_SINK.to_string())
            );
        }

        assert!(EmptyPublisher.publish(1).await.is_err());
    }
}
