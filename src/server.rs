//! The TCP listener shared by both protocols.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing_futures::Instrument;

#[async_trait]
/// A unit of work run once per accepted connection.
pub trait ConnectionHandler
where
    Self: Send + Sync + 'static,
{
    /// Serves one connection until it is done or the peer goes away.
    ///
    /// # Errors
    /// Errors are local to the connection: they are logged by [`serve()`] and the socket is
    /// dropped.
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()>;
}

/// Binds a listener to `addr`.
///
/// # Errors
/// Fails if the address cannot be bound. This is the only fatal error of a server.
pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accepts connections forever, spawning one task per connection.
///
/// The loop never waits for a handler. Accept failures are logged and the loop continues; handler
/// failures are logged at the task boundary and affect no other connection.
pub async fn serve<H: ConnectionHandler>(listener: TcpListener, handler: Arc<H>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("accepted connection from {}", peer);
                let handler = handler.clone();
                tokio::spawn(
                    async move {
                        match handler.handle(stream, peer).await {
                            Ok(()) => debug!("connection closed"),
                            Err(err) => warn!("connection aborted: {:#}", err),
                        }
                    }
                    .instrument(info_span!("connection", peer = %peer)),
                );
            }
            Err(err) => error!("failed to accept connection: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    /// Echoes one byte, failing on every other connection.
    #[derive(Default)]
    struct Flaky {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionHandler for Flaky {
        async fn handle(&self, mut stream: TcpStream, _peer: SocketAddr) -> anyhow::Result<()> {
            if self.seen.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                anyhow::bail!("flaky handler");
            }
            let byte = stream.read_u8().await?;
            stream.write_u8(byte).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_listener() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(Flaky::default())));

        for round in 0..4_u8 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut reply = Vec::new();
            if round % 2 == 0 {
                stream.write_u8(round).await.unwrap();
                stream.read_to_end(&mut reply).await.unwrap();
                assert_eq!(reply, vec![round]);
            } else {
                stream.read_to_end(&mut reply).await.unwrap();
                assert!(reply.is_empty());
            }
        }
    }
}
