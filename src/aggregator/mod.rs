//! Shared global state and the policies that fold local updates into it.
//!
//! Every aggregator owns its state behind a single lock, held only for the read-modify-write of
//! one submission and never across network I/O. The snapshot returned by
//! [`Aggregator::combine()`] is taken under the same lock, so a client never observes a
//! half-updated aggregate.
//!
//! Two combination laws are available and selected per deployment:
//!
//! - **federated averaging** ([`Averager`]): dense updates of identical shape are summed and the
//!   published global model is `total / count`;
//! - **append-and-vote** ([`Forests`], [`Boosting`]): every accepted submission is kept distinct
//!   and predictions are computed at query time from all stored models.

pub mod average;
pub mod boosting;
pub mod forest;

pub use self::{
    average::{Averager, DenseUpdate, GlobalModel, Shape},
    boosting::{Boosting, Stump},
    forest::{Forest, Forests, Node, NodeId, Tree},
};

use thiserror::Error;

/// Errors which can occur while combining an update or querying the aggregate.
#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    /// The update disagrees with the shape established by the first accepted update.
    #[error("dimension mismatch: global model has shape {expected}, update has shape {actual}")]
    DimensionMismatch { expected: Shape, actual: Shape },
    /// The number of values does not fit the declared shape.
    #[error("{len} values do not fill a model of shape {shape}")]
    LengthMismatch { shape: Shape, len: usize },
    #[error("empty update")]
    EmptyUpdate,
    /// A model refers to a feature the sample does not have.
    #[error("feature index {index} is out of range for a sample of {len} features")]
    FeatureOutOfRange { index: usize, len: usize },
}

#[async_trait]
/// The interface of a concurrently shared aggregate.
pub trait Aggregator
where
    Self: Send + Sync + 'static,
{
    /// A local update submitted by one client.
    type Update: Send + 'static;
    /// A consistent view of the aggregate.
    type Snapshot: Send + 'static;

    /// Folds `update` into the aggregate and returns the resulting snapshot.
    ///
    /// # Errors
    /// A rejected update leaves the aggregate unchanged.
    async fn combine(&self, update: Self::Update) -> Result<Self::Snapshot, AggregationError>;

    /// Returns the current aggregate, or `None` if nothing has been accepted yet.
    async fn snapshot(&self) -> Option<Self::Snapshot>;
}

/// The size of an append-and-vote ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsembleSummary {
    /// The number of accepted submissions.
    pub submissions: usize,
    /// The number of stored members (trees or stumps) over all submissions.
    pub members: usize,
}

/// Picks the most frequent label. Ties go to the numerically lowest label.
pub(crate) fn majority_vote<I>(predictions: I) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let mut votes: Vec<(f64, usize)> = Vec::new();
    for prediction in predictions {
        match votes
            .iter_mut()
            .find(|(label, _)| label.total_cmp(&prediction).is_eq())
        {
            Some((_, count)) => *count += 1,
            None => votes.push((prediction, 1)),
        }
    }
    votes
        .into_iter()
        .max_by(|(label_a, count_a), (label_b, count_b)| {
            count_a
                .cmp(count_b)
                .then_with(|| label_b.total_cmp(label_a))
        })
        .map(|(label, _)| label)
}
