//! Clients of both protocols.
//!
//! [`NumericClient`] submits local updates to a numeric aggregation server and returns the
//! combined state. [`SessionClient`] fetches models and exchanges parameters with a session
//! server.

pub mod numeric;
pub mod session;

pub use self::{
    numeric::{NumericClient, PersistentVectorClient},
    session::SessionClient,
};

use std::io;

use thiserror::Error;

use crate::{aggregator::AggregationError, codec::FrameError};

/// Errors which can occur while talking to a server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("transfer failed: {0}")]
    Frame(FrameError),
    #[error("invalid update: {0}")]
    InvalidUpdate(#[from] AggregationError),
    /// The numeric protocol has no error replies: a rejected update is answered by closing the
    /// connection.
    #[error("the server closed the connection without a reply")]
    Rejected,
    /// An `ERROR <message>` reply of the session protocol.
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(String),
    /// The session was closed with `CLOSE all`.
    #[error("no identifier, the session is closed")]
    NoIdentifier,
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Disconnected | FrameError::ShortRead { actual: 0, .. } => {
                ClientError::Rejected
            }
            err => ClientError::Frame(err),
        }
    }
}
