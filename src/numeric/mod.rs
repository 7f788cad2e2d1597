//! The numeric aggregation protocol.
//!
//! A client connects, writes one local update and reads back the combined state. In persistent
//! mode the same connection carries further rounds until the client disconnects.
//!
//! The protocol has no error channel: a rejected request is logged and the connection is closed,
//! so the client observes the end of the stream instead of waiting for a reply.

pub mod wire;

use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use self::wire::{read_dense, read_forest, read_learners, write_count};
use crate::{
    aggregator::{AggregationError, Aggregator, Averager, Boosting, Forests},
    codec::{write_doubles, FrameError},
    server::ConnectionHandler,
    settings::{AggregationPolicy, AggregationSettings, CodecSettings, DenseLayout},
};

/// Errors which abort a numeric exchange.
#[derive(Debug, Error)]
pub enum NumericError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("update rejected: {0}")]
    Aggregation(#[from] AggregationError),
}

/// The aggregate served by a numeric listener.
#[derive(Debug, Clone)]
pub enum Policy {
    Average {
        layout: DenseLayout,
        averager: Arc<Averager>,
    },
    Forest(Arc<Forests>),
    Boosting(Arc<Boosting>),
}

impl Policy {
    /// Creates an empty aggregate for the configured policy.
    pub fn new(settings: &AggregationSettings) -> Self {
        match settings.policy {
            AggregationPolicy::Average => Policy::Average {
                layout: settings.layout,
                averager: Arc::new(Averager::new()),
            },
            AggregationPolicy::Forest => Policy::Forest(Arc::new(Forests::new())),
            AggregationPolicy::Boosting => Policy::Boosting(Arc::new(Boosting::new())),
        }
    }

    async fn predict(&self, sample: &[f64]) -> Result<Option<f64>, AggregationError> {
        match self {
            Policy::Average { .. } => Ok(None),
            Policy::Forest(forests) => forests.predict(sample).await,
            Policy::Boosting(boosting) => boosting.predict(sample).await,
        }
    }
}

/// Serves numeric protocol connections against one shared aggregate.
#[derive(Debug)]
pub struct NumericHandler {
    policy: Policy,
    max_elements: u32,
    persistent: bool,
    report_threshold: usize,
    probes: Vec<Vec<f64>>,
}

impl NumericHandler {
    pub fn new(settings: &AggregationSettings, codec: &CodecSettings) -> Self {
        Self {
            policy: Policy::new(settings),
            max_elements: codec.max_elements,
            persistent: settings.persistent,
            report_threshold: settings.report_threshold,
            probes: settings.probes.clone(),
        }
    }

    /// The shared aggregate.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Runs one exchange, or rounds of exchanges in persistent mode, on `stream`.
    ///
    /// A peer that disconnects before a request ends the connection without error.
    pub async fn serve_connection<S>(&self, stream: &mut S) -> Result<(), NumericError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut rounds = 0_usize;
        loop {
            match self.exchange(stream).await {
                Ok(()) => rounds += 1,
                Err(NumericError::Frame(FrameError::Disconnected)) => {
                    debug!("peer disconnected after {} rounds", rounds);
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
            if !self.persistent {
                return Ok(());
            }
        }
    }

    async fn exchange<S>(&self, stream: &mut S) -> Result<(), NumericError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match &self.policy {
            Policy::Average { layout, averager } => {
                let update = read_dense(stream, *layout, self.max_elements).await?;
                let global = averager.combine(update).await?;
                info!("global model updated, {} clients aggregated", global.count);
                write_doubles(stream, &global.values).await?;
            }
            Policy::Forest(forests) => {
                let forest = read_forest(stream, self.max_elements).await?;
                let summary = forests.combine(forest).await?;
                info!(
                    "forest stored, {} forests with {} trees",
                    summary.submissions, summary.members
                );
                write_count(stream, summary.submissions).await?;
                self.report(summary.submissions).await;
            }
            Policy::Boosting(boosting) => {
                let learners = read_learners(stream, self.max_elements).await?;
                let summary = boosting.combine(learners).await?;
                info!(
                    "learners stored, {} stumps from {} clients",
                    summary.members, summary.submissions
                );
                write_count(stream, summary.members).await?;
                self.report(summary.submissions).await;
            }
        }
        Ok(())
    }

    /// Logs the ensemble prediction of every probe once enough submissions are stored.
    async fn report(&self, submissions: usize) {
        if submissions < self.report_threshold {
            return;
        }
        for (probe, sample) in self.probes.iter().enumerate() {
            match self.policy.predict(sample).await {
                Ok(Some(label)) => info!(probe, label, "ensemble prediction"),
                Ok(None) => {}
                Err(err) => warn!(probe, "cannot evaluate probe: {}", err),
            }
        }
    }
}

#[async_trait]
impl ConnectionHandler for NumericHandler {
    async fn handle(&self, mut stream: TcpStream, _peer: SocketAddr) -> anyhow::Result<()> {
        self.serve_connection(&mut stream).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{
        aggregator::{DenseUpdate, Stump, Tree},
        codec::{decode_doubles, DEFAULT_MAX_LEN},
    };

    fn handler(policy: AggregationPolicy, persistent: bool) -> NumericHandler {
        let settings = AggregationSettings {
            policy,
            persistent,
            probes: vec![vec![0., 0.]],
            ..AggregationSettings::default()
        };
        NumericHandler::new(&settings, &CodecSettings::default())
    }

    async fn submit_vector(handler: &NumericHandler, values: &[f64]) -> Vec<f64> {
        let (mut client, mut server) = duplex(1024);
        let request = wire::encode_dense(&DenseUpdate::vector(values.to_vec()).unwrap()).unwrap();
        client.write_all(&request).await.unwrap();
        handler.serve_connection(&mut server).await.unwrap();
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        decode_doubles(&reply)
    }

    #[tokio::test]
    async fn test_average_replies_with_mean() {
        let handler = handler(AggregationPolicy::Average, false);
        assert_eq!(submit_vector(&handler, &[1., 0.]).await, vec![1., 0.]);
        assert_eq!(submit_vector(&handler, &[0., 1.]).await, vec![0.5, 0.5]);
        assert_eq!(submit_vector(&handler, &[2., 2.]).await, vec![1., 1.]);
    }

    #[tokio::test]
    async fn test_mismatch_closes_without_reply() {
        let handler = handler(AggregationPolicy::Average, false);
        submit_vector(&handler, &[1., 1.]).await;

        let (mut client, mut server) = duplex(1024);
        let request = wire::encode_dense(&DenseUpdate::vector(vec![1., 2., 3.]).unwrap()).unwrap();
        client.write_all(&request).await.unwrap();
        let err = handler.serve_connection(&mut server).await.unwrap_err();
        assert!(matches!(
            err,
            NumericError::Aggregation(AggregationError::DimensionMismatch { .. })
        ));
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());

        match handler.policy() {
            Policy::Average { averager, .. } => {
                let global = averager.snapshot().await.unwrap();
                assert_eq!(global.values, vec![1., 1.]);
                assert_eq!(global.count, 1);
            }
            other => panic!("unexpected policy: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_persistent_rounds() {
        let handler = handler(AggregationPolicy::Average, true);
        let (mut client, mut server) = duplex(1024);

        let client = tokio::spawn(async move {
            let mut means = Vec::new();
            for values in &[[2., 4.], [4., 8.]] {
                let request = wire::encode_dense(&DenseUpdate::vector(values.to_vec()).unwrap())
                    .unwrap();
                client.write_all(&request).await.unwrap();
                let mut reply = [0_u8; 16];
                client.read_exact(&mut reply).await.unwrap();
                means.push(decode_doubles(&reply));
            }
            means
        });

        // returns once the client half is dropped at a frame boundary
        handler.serve_connection(&mut server).await.unwrap();
        let means = client.await.unwrap();
        assert_eq!(means, vec![vec![2., 4.], vec![3., 6.]]);
    }

    #[tokio::test]
    async fn test_forest_acknowledges_forest_count() {
        let handler = handler(AggregationPolicy::Forest, false);
        for expected in 1..=2 {
            let (mut client, mut server) = duplex(1024);
            let request =
                wire::encode_forest(&[Tree::leaf(1.), Tree::leaf(0.), Tree::leaf(1.)]).unwrap();
            client.write_all(&request).await.unwrap();
            handler.serve_connection(&mut server).await.unwrap();
            assert_eq!(wire::read_count(&mut client).await.unwrap(), expected);
        }
        assert_eq!(handler.policy().predict(&[0., 0.]).await, Ok(Some(1.)));
    }

    #[tokio::test]
    async fn test_boosting_acknowledges_stump_count() {
        let handler = handler(AggregationPolicy::Boosting, false);
        let (mut client, mut server) = duplex(1024);
        let learners = [
            Stump {
                feature: 0,
                threshold: 1.,
                alpha: 0.5,
            },
            Stump {
                feature: 1,
                threshold: -1.,
                alpha: 0.2,
            },
        ];
        client
            .write_all(&wire::encode_learners(&learners).unwrap())
            .await
            .unwrap();
        handler.serve_connection(&mut server).await.unwrap();
        assert_eq!(wire::read_count(&mut client).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let settings = AggregationSettings::default();
        let codec = CodecSettings {
            max_elements: 2,
            max_frame_len: DEFAULT_MAX_LEN,
        };
        let handler = NumericHandler::new(&settings, &codec);
        let (mut client, mut server) = duplex(1024);
        client.write_all(&3_i32.to_ne_bytes()).await.unwrap();
        let err = handler.serve_connection(&mut server).await.unwrap_err();
        assert!(matches!(
            err,
            NumericError::Frame(FrameError::SizeOutOfRange { length: 3, max: 2 })
        ));
    }
}
