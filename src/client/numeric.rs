//! The client of the numeric aggregation protocol.

use std::net::SocketAddr;

use tokio::{io::AsyncWriteExt, net::TcpStream};

use super::ClientError;
use crate::{
    aggregator::{DenseUpdate, Stump, Tree},
    codec::read_doubles,
    numeric::wire::{encode_dense, encode_forest, encode_learners, read_count},
};

/// Submits local updates, one connection per exchange.
#[derive(Debug, Clone, Copy)]
pub struct NumericClient {
    addr: SocketAddr,
}

impl NumericClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    async fn send(&self, request: &[u8]) -> Result<TcpStream, ClientError> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.write_all(request).await?;
        stream.flush().await?;
        Ok(stream)
    }

    async fn submit_dense(&self, update: DenseUpdate) -> Result<Vec<f64>, ClientError> {
        let mut stream = self.send(&encode_dense(&update)?).await?;
        Ok(read_doubles(&mut stream, update.shape().len()).await?)
    }

    /// Submits a vector and returns the global mean.
    pub async fn submit_vector(&self, values: Vec<f64>) -> Result<Vec<f64>, ClientError> {
        self.submit_dense(DenseUpdate::vector(values)?).await
    }

    /// Submits a `rows x cols` matrix and returns the global mean in the same layout.
    pub async fn submit_matrix(
        &self,
        rows: usize,
        cols: usize,
        values: Vec<f64>,
    ) -> Result<Vec<f64>, ClientError> {
        self.submit_dense(DenseUpdate::matrix(rows, cols, values)?)
            .await
    }

    /// Submits a forest and returns the number of forests stored by the server.
    pub async fn submit_forest(&self, forest: &[Tree]) -> Result<usize, ClientError> {
        let mut stream = self.send(&encode_forest(forest)?).await?;
        Ok(read_count(&mut stream).await?)
    }

    /// Submits weighted stumps and returns the number of stumps stored by the server.
    pub async fn submit_learners(&self, learners: &[Stump]) -> Result<usize, ClientError> {
        let mut stream = self.send(&encode_learners(learners)?).await?;
        Ok(read_count(&mut stream).await?)
    }
}

/// Submits vectors in rounds over one connection, for servers in persistent mode.
#[derive(Debug)]
pub struct PersistentVectorClient {
    stream: TcpStream,
}

impl PersistentVectorClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
        })
    }

    /// Runs one round and returns the global mean.
    pub async fn round(&mut self, values: Vec<f64>) -> Result<Vec<f64>, ClientError> {
        let update = DenseUpdate::vector(values)?;
        self.stream.write_all(&encode_dense(&update)?).await?;
        self.stream.flush().await?;
        Ok(read_doubles(&mut self.stream, update.shape().len()).await?)
    }
}
