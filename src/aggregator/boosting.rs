//! Boosted decision stumps combined by weighted vote.

use tokio::sync::Mutex;

use super::{AggregationError, Aggregator, EnsembleSummary};
use crate::codec::FrameError;

/// A weak learner: a decision stump weighted by `alpha`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stump {
    pub feature: usize,
    pub threshold: f64,
    pub alpha: f64,
}

impl Stump {
    /// The number of doubles encoding one stump: feature index, threshold and weight.
    pub const FIELDS: usize = 3;

    /// Decodes a stump from a `(feature, threshold, alpha)` triple.
    ///
    /// # Errors
    /// Fails if the feature index is not a non-negative integer.
    pub fn from_fields(fields: [f64; Self::FIELDS]) -> Result<Self, FrameError> {
        let [feature, threshold, alpha] = fields;
        if !(feature.is_finite() && feature >= 0. && feature.fract() == 0.) {
            return Err(FrameError::Malformed(format!(
                "invalid feature index {}",
                feature
            )));
        }
        Ok(Self {
            feature: feature as usize,
            threshold,
            alpha,
        })
    }

    pub fn to_fields(&self) -> [f64; Self::FIELDS] {
        [self.feature as f64, self.threshold, self.alpha]
    }

    /// Votes `+1` if `sample[feature] <= threshold`, else `-1`.
    pub fn vote(&self, sample: &[f64]) -> Result<f64, AggregationError> {
        let value = sample
            .get(self.feature)
            .ok_or(AggregationError::FeatureOutOfRange {
                index: self.feature,
                len: sample.len(),
            })?;
        Ok(if *value <= self.threshold { 1. } else { -1. })
    }
}

#[derive(Debug, Default)]
struct BoostingState {
    learners: Vec<Stump>,
    submissions: usize,
}

impl BoostingState {
    fn summary(&self) -> EnsembleSummary {
        EnsembleSummary {
            submissions: self.submissions,
            members: self.learners.len(),
        }
    }
}

/// The append-and-vote aggregator for boosted stumps.
///
/// The stumps of every submission are appended to one ensemble. The ensemble predicts the sign of
/// the `alpha` weighted sum of all votes, a zero sum counting as `+1`.
#[derive(Debug, Default)]
pub struct Boosting {
    state: Mutex<BoostingState>,
}

impl Boosting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Predicts the label of `sample`, or returns `None` if no stump has been accepted yet.
    pub async fn predict(&self, sample: &[f64]) -> Result<Option<f64>, AggregationError> {
        let state = self.state.lock().await;
        if state.learners.is_empty() {
            return Ok(None);
        }
        let mut score = 0.;
        for stump in state.learners.iter() {
            score += stump.alpha * stump.vote(sample)?;
        }
        Ok(Some(if score >= 0. { 1. } else { -1. }))
    }
}

#[async_trait]
impl Aggregator for Boosting {
    type Update = Vec<Stump>;
    type Snapshot = EnsembleSummary;

    async fn combine(&self, learners: Vec<Stump>) -> Result<EnsembleSummary, AggregationError> {
        if learners.is_empty() {
            return Err(AggregationError::EmptyUpdate);
        }
        let mut state = self.state.lock().await;
        state.learners.extend(learners);
        state.submissions += 1;
        Ok(state.summary())
    }

    async fn snapshot(&self) -> Option<EnsembleSummary> {
        let state = self.state.lock().await;
        if state.submissions == 0 {
            None
        } else {
            Some(state.summary())
        }
    }
}
