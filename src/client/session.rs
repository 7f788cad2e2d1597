//! The client of the session protocol.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use super::ClientError;
use crate::{
    codec::{send_frame, ByteOrder},
    session::{ClientId, Verb},
};

/// A client session identified by the server. Every request uses a fresh connection.
#[derive(Debug, Clone)]
pub struct SessionClient {
    addr: SocketAddr,
    id: Option<ClientId>,
}

impl SessionClient {
    /// Connects to the server and requests an identifier.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let mut stream = open(addr, &Verb::GetIdentifier.to_string()).await?;
        let line = read_reply(&mut stream).await?;
        let id = line
            .parse::<ClientId>()
            .map_err(|_| ClientError::UnexpectedReply(line))?;
        debug!("received identifier {}", id);
        Ok(Self::with_identifier(addr, id))
    }

    /// Resumes a session with an identifier issued earlier.
    pub fn with_identifier(addr: SocketAddr, id: ClientId) -> Self {
        Self { addr, id: Some(id) }
    }

    /// The identifier, until the session is closed.
    pub fn id(&self) -> Option<ClientId> {
        self.id
    }

    async fn request(
        &self,
        verb: Verb,
        argument: &str,
    ) -> Result<BufReader<TcpStream>, ClientError> {
        let id = self.id.ok_or(ClientError::NoIdentifier)?;
        open(self.addr, &format!("{} {} {}", id, verb, argument)).await
    }

    /// Fetches a model artifact. This grants the model to the client.
    pub async fn get_model(&self, name: &str) -> Result<Bytes, ClientError> {
        let mut stream = self.request(Verb::GetModel, name).await?;
        read_blob(&mut stream).await
    }

    /// Replaces the parameters and buffers of a granted model.
    pub async fn submit_params(
        &self,
        name: &str,
        params: &[u8],
        buffers: &[u8],
    ) -> Result<(), ClientError> {
        let mut stream = self.request(Verb::SubmitParams, name).await?;
        send_frame(&mut stream, ByteOrder::Network, params).await?;
        expect(&mut stream, "RECEIVED").await?;
        send_frame(&mut stream, ByteOrder::Network, buffers).await?;
        expect(&mut stream, "SUCCESS").await
    }

    /// Fetches the current parameters of a granted model.
    pub async fn get_params(&self, name: &str) -> Result<Bytes, ClientError> {
        let mut stream = self.request(Verb::GetParams, name).await?;
        read_blob(&mut stream).await
    }

    /// Revokes the grant of a model, or closes the session with `all`.
    pub async fn close(&mut self, name: &str) -> Result<(), ClientError> {
        let mut stream = self.request(Verb::Close, name).await?;
        expect(&mut stream, "SUCCESS").await?;
        if name == "all" {
            self.id = None;
        }
        Ok(())
    }
}

async fn open(addr: SocketAddr, line: &str) -> Result<BufReader<TcpStream>, ClientError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(format!("{}\n", line).as_bytes()).await?;
    stream.flush().await?;
    Ok(BufReader::new(stream))
}

/// Reads a reply line, turning an `ERROR` line into [`ClientError::Server`].
async fn read_reply(stream: &mut BufReader<TcpStream>) -> Result<String, ClientError> {
    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Err(ClientError::Rejected);
    }
    let line = line.trim_end();
    match line.strip_prefix("ERROR") {
        Some(message) => Err(ClientError::Server(message.trim_start().to_string())),
        None => Ok(line.to_string()),
    }
}

async fn expect(stream: &mut BufReader<TcpStream>, expected: &str) -> Result<(), ClientError> {
    let line = read_reply(stream).await?;
    if line == expected {
        Ok(())
    } else {
        Err(ClientError::UnexpectedReply(line))
    }
}

/// Reads `SUCCESS` followed by a blob which lasts until the server closes the connection.
async fn read_blob(stream: &mut BufReader<TcpStream>) -> Result<Bytes, ClientError> {
    expect(stream, "SUCCESS").await?;
    let mut blob = Vec::new();
    stream.read_to_end(&mut blob).await?;
    Ok(Bytes::from(blob))
}
