/// Selects which decoded documents of a batch go on to be published.
///
/// The filter sees the whole batch at once, so a composite condition is written
/// as a single predicate rather than a chain of per-item callbacks.
pub trait Filterer<I>: Send + Sync {
    fn filter(&self, documents: Vec<I>) -> Vec<I>;
}

/// Retains every document.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityFilterer;

impl<I> Filterer<I> for IdentityFilterer {
    fn filter(&self, documents: Vec<I>) -> Vec<I> {
        documents
    }
}

/// Retains the documents matching a predicate.
pub struct PredicateFilterer<F> {
    predicate: F,
}

impl<F> PredicateFilterer<F> {
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<I, F> Filterer<I> for PredicateFilterer<F>
where
    F: Fn(&I) -> bool + Send + Sync,
{
    fn filter(&self, documents: Vec<I>) -> Vec<I> {
        documents
            .into_iter()
            .filter(|document| (self.predicate)(document))
            .collect()
    }
}
