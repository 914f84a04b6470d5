use crate::error::OutboundError;

/// The result of attempting one operation (enrichment, publish) on a single document.
///
/// `document` is always the document that was handed to the operation: a failed
/// attempt never carries a partially modified copy, so it can be retried verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<I> {
    Success { document: I },
    Failure { document: I, error: OutboundError },
}

impl<I> Outcome<I> {
    pub fn success(document: I) -> Self {
        Outcome::Success { document }
    }

    pub fn failure(document: I, error: impl Into<OutboundError>) -> Self {
        Outcome::Failure {
            document,
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    pub fn document(&self) -> &I {
        match self {
            Outcome::Success { document } | Outcome::Failure { document, .. } => document,
        }
    }

    pub fn error(&self) -> Option<&OutboundError> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { error, .. } => Some(error),
        }
    }
}

/// A failed attempt, split out of an `Outcome` list.
#[derive(Debug, Clone, PartialEq)]
pub struct Failed<I> {
    pub document: I,
    pub error: OutboundError,
}

/// Splits outcomes into successful documents and failures, keeping the relative order of each.
pub fn partition<I>(outcomes: Vec<Outcome<I>>) -> (Vec<I>, Vec<Failed<I>>) {
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();

    for outcome in outcomes {
        match outcome {
            Outcome::Success { document } => succeeded.push(document),
            Outcome::Failure { document, error } => failed.push(Failed { document, error }),
        }
    }

    (succeeded, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::empty::NO_FALLBACK_SINK;

    #[test]
    fn partition_keeps_order_within_each_side() {
        let outcomes = vec![
            Outcome::success(1),
            Outcome::failure(2, OutboundError::Publish(NO_FALLBACK_SINK.into())),
            Outcome::success(3),
            Outcome::failure(4, OutboundError::Publish(NO_FALLBACK_SINK.into())),
        ];

        let (succeeded, failed) = partition(outcomes);

        assert_eq!(succeeded, vec![1, 3]);
        assert_eq!(
            failed.iter().map(|f| f.document).collect::<Vec<_>>(),
            vec![2, 4]
        );
    }

    #[test]
    fn failure_exposes_error_and_original_document() {
        let outcome = Outcome::failure("doc", OutboundError::Publish("boom".to_string()));

        assert!(outcome.is_failure());
        assert_eq!(outcome.document(), &"doc");
        assert_eq!(outcome.error().map(|e| e.to_string()), Some("boom".into()));
    }
}
