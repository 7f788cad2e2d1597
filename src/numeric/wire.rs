//! Request and reply layouts of the numeric protocol.
//!
//! ```text
//! vector:   n: i32 | n * f64
//! matrix:   rows: i32 | cols: i32 | rows * cols * f64
//! forest:   trees: i32 | trees * (len: i32 | len tree bytes)
//! boosting: learners: i32 | learners * (feature: f64 | threshold: f64 | alpha: f64)
//! ```
//!
//! Averaging replies with the global model as raw doubles, the ensembles reply with an `i32`
//! count. Every field uses the native byte order.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::NumericError;
use crate::{
    aggregator::{DenseUpdate, Forest, Shape, Stump, Tree},
    codec::{
        encode_doubles, encode_length, read_doubles, read_length, read_payload, write_length,
        ByteOrder, FrameError, FromBytes, ToBytes,
    },
    settings::DenseLayout,
};

const ORDER: ByteOrder = ByteOrder::Native;

/// Reads a dense update laid out as `layout`. Every count, and the number of values of a matrix,
/// must lie in `1..=max`.
pub async fn read_dense<R>(
    reader: &mut R,
    layout: DenseLayout,
    max: u32,
) -> Result<DenseUpdate, NumericError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let shape = match layout {
        DenseLayout::Vector => Shape::Vector(read_length(reader, ORDER, max, true).await?),
        DenseLayout::Matrix => {
            let rows = read_length(reader, ORDER, max, true).await?;
            let cols = read_length(reader, ORDER, max, false).await?;
            Shape::Matrix { rows, cols }
        }
    };
    if shape.len() > max as usize {
        return Err(FrameError::SizeOutOfRange {
            length: shape.len() as i64,
            max,
        }
        .into());
    }
    let values = read_doubles(reader, shape.len()).await?;
    Ok(DenseUpdate::new(shape, values)?)
}

/// Reads a forest of length-prefixed trees.
pub async fn read_forest<R>(reader: &mut R, max: u32) -> Result<Forest, NumericError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let trees = read_length(reader, ORDER, max, true).await?;
    let mut forest = Forest::new();
    for _ in 0..trees {
        let length = read_length(reader, ORDER, max, false).await?;
        let bytes = read_payload(reader, length).await?;
        forest.push(Tree::from_bytes(&bytes)?);
    }
    Ok(forest)
}

/// Reads a list of weighted decision stumps.
pub async fn read_learners<R>(reader: &mut R, max: u32) -> Result<Vec<Stump>, NumericError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let count = read_length(reader, ORDER, max, true).await?;
    let fields = read_doubles(reader, count * Stump::FIELDS).await?;
    let learners = fields
        .chunks_exact(Stump::FIELDS)
        .map(|chunk| Stump::from_fields([chunk[0], chunk[1], chunk[2]]))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(learners)
}

/// Writes an ensemble acknowledgement and flushes.
pub async fn write_count<W>(writer: &mut W, count: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_length(writer, ORDER, count).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads an ensemble acknowledgement.
pub async fn read_count<R>(reader: &mut R) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_length(reader, ORDER, i32::MAX as u32, true).await
}

pub fn encode_dense(update: &DenseUpdate) -> Result<Vec<u8>, FrameError> {
    let mut bytes = Vec::new();
    match update.shape() {
        Shape::Vector(len) => bytes.extend_from_slice(&encode_length(ORDER, len)?),
        Shape::Matrix { rows, cols } => {
            bytes.extend_from_slice(&encode_length(ORDER, rows)?);
            bytes.extend_from_slice(&encode_length(ORDER, cols)?);
        }
    }
    bytes.extend_from_slice(&encode_doubles(update.values()));
    Ok(bytes)
}

pub fn encode_forest(forest: &[Tree]) -> Result<Vec<u8>, FrameError> {
    let mut bytes = encode_length(ORDER, forest.len())?.to_vec();
    for tree in forest {
        let tree = tree.to_vec();
        bytes.extend_from_slice(&encode_length(ORDER, tree.len())?);
        bytes.extend_from_slice(&tree);
    }
    Ok(bytes)
}

pub fn encode_learners(learners: &[Stump]) -> Result<Vec<u8>, FrameError> {
    let mut bytes = encode_length(ORDER, learners.len())?.to_vec();
    for learner in learners {
        bytes.extend_from_slice(&encode_doubles(&learner.to_fields()));
    }
    Ok(bytes)
}
