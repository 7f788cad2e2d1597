//! The line-oriented connection loop of the session protocol.

use std::net::SocketAddr;

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use super::{
    handlers::{Dispatcher, Reply, SessionState, SessionStream},
    models::ModelStore,
    registry::Registry,
    request::RequestError,
    store::{FlatFileStore, StorageResult},
};
use crate::{
    codec::FrameError,
    server::ConnectionHandler,
    settings::{CodecSettings, SessionSettings},
};

/// The longest accepted command line, newline included.
pub const MAX_LINE_LEN: u64 = 4096;

/// Serves session protocol connections.
pub struct SessionHandler {
    dispatcher: Dispatcher,
}

impl SessionHandler {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Creates a handler backed by the configured record table and models directory.
    ///
    /// # Errors
    /// Fails if the record table exists but cannot be read.
    pub async fn from_settings(
        session: &SessionSettings,
        codec: &CodecSettings,
    ) -> StorageResult<Self> {
        let registry = Registry::new(FlatFileStore::new(&session.records_path)).await?;
        if !session.models_dir.is_dir() {
            warn!(
                "models directory {} does not exist",
                session.models_dir.display()
            );
        }
        Ok(Self::new(Dispatcher::new(SessionState {
            registry,
            models: ModelStore::new(&session.models_dir),
            max_frame_len: codec.max_frame_len,
        })))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Serves command lines on `stream` until the client disconnects, a blob has been sent, or
    /// the transfer failed.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), RequestError>
    where
        S: SessionStream,
    {
        let mut stream = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            let read = (&mut stream)
                .take(MAX_LINE_LEN)
                .read_until(b'\n', &mut raw)
                .await
                .map_err(FrameError::from)?;
            if read == 0 {
                debug!("client disconnected");
                return Ok(());
            }
            if !raw.ends_with(b"\n") && read as u64 == MAX_LINE_LEN {
                let err = RequestError::Malformed("request line too long");
                send_error(&mut stream, &err).await?;
                return Err(err);
            }
            let line = match std::str::from_utf8(&raw) {
                Ok(line) => line,
                Err(_) => {
                    let err = RequestError::Malformed("invalid UTF-8");
                    debug!("request rejected: {}", err);
                    send_error(&mut stream, &err).await?;
                    continue;
                }
            };

            match self.dispatcher.dispatch(line.trim_end(), &mut stream).await {
                Ok(Reply::Identifier(id)) => send_line(&mut stream, &id.to_string()).await?,
                Ok(Reply::Success) => send_line(&mut stream, "SUCCESS").await?,
                Ok(Reply::Blob(blob)) => {
                    let mut message = b"SUCCESS\n".to_vec();
                    message.extend_from_slice(&blob);
                    stream.write_all(&message).await.map_err(FrameError::from)?;
                    stream.shutdown().await.map_err(FrameError::from)?;
                    return Ok(());
                }
                Err(err) if err.is_fatal() => {
                    if let RequestError::Transfer(ref frame) = err {
                        if !frame.is_disconnect() {
                            // best effort, the connection is dropped anyway
                            let _ = send_error(&mut stream, &err).await;
                        }
                    }
                    return Err(err);
                }
                Err(err) => {
                    debug!("request rejected: {}", err);
                    send_error(&mut stream, &err).await?;
                }
            }
        }
    }
}

async fn send_line<S: SessionStream>(stream: &mut S, line: &str) -> Result<(), RequestError> {
    stream
        .write_all(format!("{}\n", line).as_bytes())
        .await
        .map_err(FrameError::from)?;
    stream.flush().await.map_err(FrameError::from)?;
    Ok(())
}

async fn send_error<S: SessionStream>(stream: &mut S, err: &RequestError) -> Result<(), RequestError> {
    send_line(stream, &format!("ERROR {}", err)).await
}

#[async_trait]
impl ConnectionHandler for SessionHandler {
    async fn handle(&self, stream: TcpStream, _peer: SocketAddr) -> anyhow::Result<()> {
        self.serve_connection(stream).await?;
        Ok(())
    }
}
