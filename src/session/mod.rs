//! The session protocol.
//!
//! Clients talk to the server through newline-terminated command lines:
//!
//! ```text
//! GET_IDENTIFIER                    -> <id>
//! <id> GET_MODEL <model>            -> SUCCESS + model bytes until close
//! <id> SUBMIT_PARAMS <model>        -> (params frame) RECEIVED (buffers frame) SUCCESS
//! <id> GET_PARAMS <model>           -> SUCCESS + parameter bytes until close
//! <id> CLOSE <model|all>            -> SUCCESS
//! ```
//!
//! Every request but `GET_IDENTIFIER` is authorized against the [`Registry`] of issued
//! identifiers and their model grants. Failures are answered with an `ERROR <reason>` line.

pub mod connection;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod request;
pub mod store;

pub use self::{
    connection::SessionHandler,
    handlers::{Dispatcher, Reply, RequestHandler, SessionState, SessionStream},
    models::{ModelHandle, ModelStore},
    registry::Registry,
    request::{Request, RequestError, Verb},
    store::{FlatFileStore, NoopStore, RecordStore, StorageResult},
};

use std::str::FromStr;

use derive_more::{Display, From};
use uuid::Uuid;

#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display, From)]
/// A unique random client identifier.
pub struct ClientId(Uuid);

impl ClientId {
    /// Return a new random client identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_text_form() {
        let id = ClientId::new();
        assert_eq!(id.to_string().parse::<ClientId>().unwrap(), id);
        assert_ne!(ClientId::new(), id);
        assert!("42".parse::<ClientId>().is_err());
    }
}
