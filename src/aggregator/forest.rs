//! Decision tree ensembles combined by majority vote.
//!
//! # Wire format
//!
//! A tree is a pre-order traversal of its nodes, each introduced by a tag byte:
//!
//! ```text
//! leaf:  0x00 | prediction: f64
//! split: 0x01 | feature: u32 | threshold: f64 | <left subtree> | <right subtree>
//! ```
//!
//! Numbers use the native byte order of the numeric protocol.

use tokio::sync::Mutex;

use super::{majority_vote, AggregationError, Aggregator, EnsembleSummary};
use crate::codec::{FrameError, FromBytes, ToBytes, F64_FIELD, LENGTH_FIELD};

const LEAF_TAG: u8 = 0;
const SPLIT_TAG: u8 = 1;
const LEAF_LENGTH: usize = 1 + F64_FIELD;
const SPLIT_LENGTH: usize = 1 + LENGTH_FIELD + F64_FIELD;

/// The index of a node in the arena of its tree.
pub type NodeId = usize;

/// A node of a decision tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Node {
    Leaf {
        prediction: f64,
    },
    /// Samples with `sample[feature] <= threshold` descend to `left`, the others to `right`.
    Split {
        feature: usize,
        threshold: f64,
        left: NodeId,
        right: NodeId,
    },
}

impl Node {
    fn encoded_length(&self) -> usize {
        match self {
            Node::Leaf { .. } => LEAF_LENGTH,
            Node::Split { .. } => SPLIT_LENGTH,
        }
    }

    fn shifted(self, offset: usize) -> Self {
        match self {
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => Node::Split {
                feature,
                threshold,
                left: left + offset,
                right: right + offset,
            },
            leaf => leaf,
        }
    }
}

/// A decision tree whose nodes live in an arena, the root at index `0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn leaf(prediction: f64) -> Self {
        Self {
            nodes: vec![Node::Leaf { prediction }],
        }
    }

    pub fn split(feature: usize, threshold: f64, left: Tree, right: Tree) -> Self {
        let left_root = 1;
        let right_root = left_root + left.nodes.len();
        let mut nodes = Vec::with_capacity(1 + left.nodes.len() + right.nodes.len());
        nodes.push(Node::Split {
            feature,
            threshold,
            left: left_root,
            right: right_root,
        });
        nodes.extend(left.nodes.into_iter().map(|node| node.shifted(left_root)));
        nodes.extend(right.nodes.into_iter().map(|node| node.shifted(right_root)));
        Self { nodes }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Descends from the root to a leaf and returns its prediction.
    pub fn predict(&self, sample: &[f64]) -> Result<f64, AggregationError> {
        let mut current = 0;
        loop {
            match self.nodes[current] {
                Node::Leaf { prediction } => return Ok(prediction),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let value = sample.get(feature).ok_or(AggregationError::FeatureOutOfRange {
                        index: feature,
                        len: sample.len(),
                    })?;
                    current = if *value <= threshold { left } else { right };
                }
            }
        }
    }
}

impl ToBytes for Tree {
    fn buffer_length(&self) -> usize {
        self.nodes.iter().map(Node::encoded_length).sum()
    }

    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T) {
        let buffer = buffer.as_mut();
        let mut offset = 0;
        let mut stack = vec![0];
        while let Some(id) = stack.pop() {
            match self.nodes[id] {
                Node::Leaf { prediction } => {
                    buffer[offset] = LEAF_TAG;
                    buffer[offset + 1..offset + LEAF_LENGTH]
                        .copy_from_slice(&prediction.to_ne_bytes());
                    offset += LEAF_LENGTH;
                }
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let feature_end = offset + 1 + LENGTH_FIELD;
                    buffer[offset] = SPLIT_TAG;
                    buffer[offset + 1..feature_end].copy_from_slice(&(feature as u32).to_ne_bytes());
                    buffer[feature_end..offset + SPLIT_LENGTH]
                        .copy_from_slice(&threshold.to_ne_bytes());
                    offset += SPLIT_LENGTH;
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
    }
}

/// A node as read from the wire, before its children are resolved.
enum RawNode {
    Leaf(f64),
    Split(usize, f64),
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N], FrameError> {
    let slice = bytes
        .get(offset..offset + N)
        .ok_or_else(|| FrameError::Malformed("truncated tree node".into()))?;
    let mut array = [0_u8; N];
    array.copy_from_slice(slice);
    Ok(array)
}

impl FromBytes for Tree {
    fn from_bytes<T: AsRef<[u8]> + ?Sized>(buffer: &T) -> Result<Self, FrameError> {
        let bytes = buffer.as_ref();

        // Read the nodes in order, counting the subtrees that still have to be read.
        let mut raw = Vec::new();
        let mut pending: usize = 1;
        let mut offset = 0;
        while offset < bytes.len() {
            if pending == 0 {
                return Err(FrameError::Malformed(format!(
                    "{} trailing bytes after tree",
                    bytes.len() - offset
                )));
            }
            pending -= 1;
            match bytes[offset] {
                LEAF_TAG => {
                    let prediction = f64::from_ne_bytes(read_array(bytes, offset + 1)?);
                    raw.push(RawNode::Leaf(prediction));
                    offset += LEAF_LENGTH;
                }
                SPLIT_TAG => {
                    let feature = u32::from_ne_bytes(read_array(bytes, offset + 1)?) as usize;
                    let threshold =
                        f64::from_ne_bytes(read_array(bytes, offset + 1 + LENGTH_FIELD)?);
                    raw.push(RawNode::Split(feature, threshold));
                    offset += SPLIT_LENGTH;
                    pending += 2;
                }
                tag => {
                    return Err(FrameError::Malformed(format!(
                        "invalid node tag {:#04x}",
                        tag
                    )))
                }
            }
        }
        if pending != 0 {
            return Err(FrameError::Malformed("truncated tree".into()));
        }

        // Subtree sizes, computed from the back: the left subtree of a split at `i` starts at
        // `i + 1` and is the most recently completed one.
        let mut sizes = vec![0; raw.len()];
        let mut completed: Vec<usize> = Vec::new();
        for (i, node) in raw.iter().enumerate().rev() {
            sizes[i] = match node {
                RawNode::Leaf(_) => 1,
                RawNode::Split(..) => {
                    let left = completed.pop().unwrap_or_default();
                    let right = completed.pop().unwrap_or_default();
                    1 + left + right
                }
            };
            completed.push(sizes[i]);
        }

        let nodes = raw
            .into_iter()
            .enumerate()
            .map(|(i, node)| match node {
                RawNode::Leaf(prediction) => Node::Leaf { prediction },
                RawNode::Split(feature, threshold) => Node::Split {
                    feature,
                    threshold,
                    left: i + 1,
                    right: i + 1 + sizes[i + 1],
                },
            })
            .collect();
        Ok(Self { nodes })
    }
}

/// The trees submitted by one client.
pub type Forest = Vec<Tree>;

/// The append-and-vote aggregator for random forests.
///
/// Every accepted forest is stored as is. The ensemble prediction is the majority vote over every
/// tree of every stored forest.
#[derive(Debug, Default)]
pub struct Forests {
    forests: Mutex<Vec<Forest>>,
}

impl Forests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Predicts the label of `sample`, or returns `None` if no forest has been accepted yet.
    pub async fn predict(&self, sample: &[f64]) -> Result<Option<f64>, AggregationError> {
        let forests = self.forests.lock().await;
        let predictions = forests
            .iter()
            .flatten()
            .map(|tree| tree.predict(sample))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(majority_vote(predictions))
    }
}

fn summary(forests: &[Forest]) -> EnsembleSummary {
    EnsembleSummary {
        submissions: forests.len(),
        members: forests.iter().map(Vec::len).sum(),
    }
}

#[async_trait]
impl Aggregator for Forests {
    type Update = Forest;
    type Snapshot = EnsembleSummary;

    async fn combine(&self, forest: Forest) -> Result<EnsembleSummary, AggregationError> {
        if forest.is_empty() {
            return Err(AggregationError::EmptyUpdate);
        }
        let mut forests = self.forests.lock().await;
        forests.push(forest);
        Ok(summary(&forests))
    }

    async fn snapshot(&self) -> Option<EnsembleSummary> {
        let forests = self.forests.lock().await;
        if forests.is_empty() {
            None
        } else {
            Some(summary(&forests))
        }
    }
}
