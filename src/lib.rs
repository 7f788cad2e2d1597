//! # fedhub: a rendezvous server for federated learning
//!
//! Many independent clients compute a local model update on their private data and submit it to
//! this server, which combines the updates into a shared global model and hands it back.
//!
//! The crate is organised around the coordination substrate rather than around any learning
//! algorithm:
//!
//! - [`codec`]: the two wire framings used by the server. Numeric updates travel as native byte
//!   order counts followed by raw IEEE-754 doubles; session payloads travel as network byte order
//!   length-prefixed blobs.
//! - [`aggregator`]: the shared global state and its combination policies, federated averaging
//!   for dense updates and append-and-vote for tree and stump ensembles.
//! - [`server`]: the accept loop, spawning one task per connection.
//! - [`numeric`]: the connection handler of the numeric aggregation protocol.
//! - [`session`]: the line-oriented session protocol with client identifiers, per-model grants,
//!   a flat-file record table and a lazily loaded model cache.
//! - [`client`]: clients for both protocols.
//! - [`settings`]: loading and validation of the configuration.
//!
//! The two protocols are independent and not wire compatible with each other; a deployment may
//! run either or both.

#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate tracing;

pub mod aggregator;
pub mod client;
pub mod codec;
pub mod numeric;
pub mod server;
pub mod session;
pub mod settings;
