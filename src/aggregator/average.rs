//! Federated averaging of dense updates.

use derive_more::Display;
use tokio::sync::Mutex;

use super::{AggregationError, Aggregator};

/// The shape of a dense model.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    #[display(fmt = "[{}]", _0)]
    Vector(usize),
    #[display(fmt = "[{}x{}]", rows, cols)]
    Matrix { rows: usize, cols: usize },
}

impl Shape {
    /// The number of values of a model of this shape.
    pub fn len(&self) -> usize {
        match *self {
            Shape::Vector(len) => len,
            Shape::Matrix { rows, cols } => rows * cols,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dense local update: a vector or a matrix of doubles.
///
/// Matrices are stored as a flat list of values in the order they were received.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseUpdate {
    shape: Shape,
    values: Vec<f64>,
}

impl DenseUpdate {
    /// Creates an update.
    ///
    /// # Errors
    /// Fails if the shape is empty or the values do not fill it exactly.
    pub fn new(shape: Shape, values: Vec<f64>) -> Result<Self, AggregationError> {
        if shape.is_empty() {
            return Err(AggregationError::EmptyUpdate);
        }
        if shape.len() != values.len() {
            return Err(AggregationError::LengthMismatch {
                shape,
                len: values.len(),
            });
        }
        Ok(Self { shape, values })
    }

    pub fn vector(values: Vec<f64>) -> Result<Self, AggregationError> {
        Self::new(Shape::Vector(values.len()), values)
    }

    pub fn matrix(rows: usize, cols: usize, values: Vec<f64>) -> Result<Self, AggregationError> {
        Self::new(Shape::Matrix { rows, cols }, values)
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// A snapshot of the averaged global model.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalModel {
    pub shape: Shape,
    /// The mean of all accepted updates.
    pub values: Vec<f64>,
    /// The number of accepted updates.
    pub count: u64,
}

/// The dimensionality of the aggregate is unknown until the first update arrives.
#[derive(Debug)]
enum AverageState {
    Uninitialized,
    Initialized {
        shape: Shape,
        total: Vec<f64>,
        global: Vec<f64>,
        count: u64,
    },
}

impl AverageState {
    fn fold(&mut self, update: DenseUpdate) -> Result<(), AggregationError> {
        match self {
            AverageState::Uninitialized => {
                *self = AverageState::Initialized {
                    shape: update.shape,
                    total: update.values.clone(),
                    global: update.values,
                    count: 1,
                };
            }
            AverageState::Initialized {
                shape,
                total,
                global,
                count,
            } => {
                if *shape != update.shape {
                    return Err(AggregationError::DimensionMismatch {
                        expected: *shape,
                        actual: update.shape,
                    });
                }
                total
                    .iter_mut()
                    .zip(update.values)
                    .for_each(|(sum, value)| *sum += value);
                *count += 1;
                let n = *count as f64;
                *global = total.iter().map(|sum| sum / n).collect();
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Option<GlobalModel> {
        match self {
            AverageState::Uninitialized => None,
            AverageState::Initialized {
                shape,
                global,
                count,
                ..
            } => Some(GlobalModel {
                shape: *shape,
                values: global.clone(),
                count: *count,
            }),
        }
    }
}

/// The federated averaging aggregator.
///
/// Maintains `total += update` and `count += 1` and publishes `global = total / count`. The shape
/// is fixed by the first accepted update; later updates of another shape are rejected and leave
/// the aggregate unchanged.
#[derive(Debug)]
pub struct Averager {
    state: Mutex<AverageState>,
}

impl Default for Averager {
    fn default() -> Self {
        Self::new()
    }
}

impl Averager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AverageState::Uninitialized),
        }
    }
}

#[async_trait]
impl Aggregator for Averager {
    type Update = DenseUpdate;
    type Snapshot = GlobalModel;

    async fn combine(&self, update: DenseUpdate) -> Result<GlobalModel, AggregationError> {
        let mut state = self.state.lock().await;
        state.fold(update)?;
        // the state was initialized by the fold above
        state.snapshot().ok_or(AggregationError::EmptyUpdate)
    }

    async fn snapshot(&self) -> Option<GlobalModel> {
        self.state.lock().await.snapshot()
    }
}
