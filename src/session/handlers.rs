//! Routing of authenticated requests to their handlers.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::{
    models::ModelStore,
    registry::Registry,
    request::{CommandLine, Request, RequestError, Verb},
    ClientId,
};
use crate::codec::{recv_frame, ByteOrder, FrameError};

/// The byte stream of a session connection.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// The successful outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A freshly issued identifier, sent as `<id>`.
    Identifier(ClientId),
    /// Sent as `SUCCESS`.
    Success,
    /// Sent as `SUCCESS` followed by the blob. The connection is closed after the transfer.
    Blob(Bytes),
}

/// The state shared by all request handlers.
pub struct SessionState {
    pub registry: Registry,
    pub models: ModelStore,
    /// The upper bound of a submitted blob.
    pub max_frame_len: u32,
}

async fn write_line(stream: &mut dyn SessionStream, line: &str) -> Result<(), FrameError> {
    stream.write_all(format!("{}\n", line).as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[async_trait]
/// A handler for one request type.
pub trait RequestHandler
where
    Self: Send + Sync + 'static,
{
    /// Handles an authenticated request.
    ///
    /// Handlers which exchange further data with the client use `stream` directly.
    async fn handle(
        &self,
        state: &SessionState,
        request: Request,
        stream: &mut dyn SessionStream,
    ) -> Result<Reply, RequestError>;
}

struct GetIdentifierHandler;

#[async_trait]
impl RequestHandler for GetIdentifierHandler {
    async fn handle(
        &self,
        state: &SessionState,
        _request: Request,
        _stream: &mut dyn SessionStream,
    ) -> Result<Reply, RequestError> {
        let id = state.registry.issue_identifier().await;
        info!("issued identifier {}", id);
        Ok(Reply::Identifier(id))
    }
}

/// Sends a model artifact and grants the model to the client.
struct GetModelHandler;

#[async_trait]
impl RequestHandler for GetModelHandler {
    async fn handle(
        &self,
        state: &SessionState,
        request: Request,
        _stream: &mut dyn SessionStream,
    ) -> Result<Reply, RequestError> {
        let client = request.client()?;
        let name = request.model()?;
        let model = state
            .models
            .load(name)
            .await?
            .ok_or_else(|| RequestError::ModelNotFound(name.to_string()))?;
        state.registry.register_model_to_client(name, &client).await;
        debug!("sending model {} to {}", name, client);
        Ok(Reply::Blob(model.artifact()))
    }
}

/// Receives a parameter blob and a buffer blob and replaces those of the shared model.
struct SubmitParamsHandler;

#[async_trait]
impl RequestHandler for SubmitParamsHandler {
    async fn handle(
        &self,
        state: &SessionState,
        request: Request,
        stream: &mut dyn SessionStream,
    ) -> Result<Reply, RequestError> {
        let client = request.client()?;
        let name = request.model()?;
        if !state.registry.is_model_registered(name, &client).await {
            return Err(RequestError::NotGranted(name.to_string()));
        }

        let params = recv_frame(&mut *stream, ByteOrder::Network, state.max_frame_len).await?;
        write_line(&mut *stream, "RECEIVED").await?;
        let buffers = recv_frame(&mut *stream, ByteOrder::Network, state.max_frame_len).await?;

        let model = state
            .models
            .load(name)
            .await?
            .ok_or_else(|| RequestError::ModelNotFound(name.to_string()))?;
        info!(
            "{} submitted parameters for {} ({} bytes, {} bytes of buffers)",
            client,
            name,
            params.len(),
            buffers.len()
        );
        model.replace(params, buffers).await;
        Ok(Reply::Success)
    }
}

/// Sends the current parameter blob of a granted model.
struct GetParamsHandler;

#[async_trait]
impl RequestHandler for GetParamsHandler {
    async fn handle(
        &self,
        state: &SessionState,
        request: Request,
        _stream: &mut dyn SessionStream,
    ) -> Result<Reply, RequestError> {
        let client = request.client()?;
        let name = request.model()?;
        if !state.registry.is_model_registered(name, &client).await {
            return Err(RequestError::NotGranted(name.to_string()));
        }
        let model = state
            .models
            .load(name)
            .await?
            .ok_or_else(|| RequestError::ModelNotFound(name.to_string()))?;
        Ok(Reply::Blob(model.params().await))
    }
}

/// Revokes one grant, or forgets the client altogether with `all`.
struct CloseHandler;

/// The argument of `CLOSE` which removes the whole client.
const CLOSE_ALL: &str = "all";

#[async_trait]
impl RequestHandler for CloseHandler {
    async fn handle(
        &self,
        state: &SessionState,
        request: Request,
        _stream: &mut dyn SessionStream,
    ) -> Result<Reply, RequestError> {
        let client = request.client()?;
        let name = request
            .argument
            .as_deref()
            .ok_or(RequestError::Malformed("missing model name"))?;

        if state.registry.remove_model_for_client(name, &client).await {
            debug!("{} closed model {}", client, name);
            Ok(Reply::Success)
        } else if name == CLOSE_ALL {
            state.registry.remove_client(&client).await;
            info!("{} closed its session", client);
            Ok(Reply::Success)
        } else {
            Err(RequestError::NotGranted(name.to_string()))
        }
    }
}

/// Authenticates command lines and routes them to the handler of their verb.
pub struct Dispatcher {
    state: SessionState,
    handlers: HashMap<Verb, Box<dyn RequestHandler>>,
}

impl Dispatcher {
    pub fn new(state: SessionState) -> Self {
        let mut handlers: HashMap<Verb, Box<dyn RequestHandler>> = HashMap::new();
        handlers.insert(Verb::GetIdentifier, Box::new(GetIdentifierHandler));
        handlers.insert(Verb::GetModel, Box::new(GetModelHandler));
        handlers.insert(Verb::SubmitParams, Box::new(SubmitParamsHandler));
        handlers.insert(Verb::GetParams, Box::new(GetParamsHandler));
        handlers.insert(Verb::Close, Box::new(CloseHandler));
        Self { state, handlers }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Resolves a command line into a request.
    ///
    /// The identifier is checked before the verb, so an unregistered client learns nothing about
    /// the request types.
    async fn authenticate(&self, line: &str) -> Result<Request, RequestError> {
        match CommandLine::parse(line)? {
            CommandLine::Identify => Ok(Request {
                verb: Verb::GetIdentifier,
                client: None,
                argument: None,
            }),
            CommandLine::Client {
                token,
                verb,
                argument,
            } => {
                let client = match token.parse::<ClientId>() {
                    Ok(client) => client,
                    Err(_) => return Err(RequestError::InvalidIdentifier(token.to_string())),
                };
                if !self.state.registry.is_client_registered(&client).await {
                    return Err(RequestError::InvalidIdentifier(token.to_string()));
                }
                let verb = verb
                    .ok_or(RequestError::Malformed("missing request type"))?
                    .parse()?;
                Ok(Request {
                    verb,
                    client: Some(client),
                    argument: argument.map(str::to_string),
                })
            }
        }
    }

    /// Handles one command line.
    pub async fn dispatch(
        &self,
        line: &str,
        stream: &mut dyn SessionStream,
    ) -> Result<Reply, RequestError> {
        let request = self.authenticate(line).await?;
        let verb = request.verb;
        let handler = self
            .handlers
            .get(&verb)
            .ok_or_else(|| RequestError::UnknownVerb(verb.to_string()))?;
        debug!("handling {} request", verb);
        handler.handle(&self.state, request, stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        models::tests::{models_dir, ModelsDir},
        store::NoopStore,
    };

    async fn dispatcher() -> (Dispatcher, ModelsDir) {
        let dir = models_dir().await;
        let dispatcher = Dispatcher::new(SessionState {
            registry: Registry::new(NoopStore).await.unwrap(),
            models: ModelStore::new(dir.path()),
            max_frame_len: 64,
        });
        (dispatcher, dir)
    }

    async fn identify(dispatcher: &Dispatcher) -> ClientId {
        let mut stream = tokio_test::io::Builder::new().build();
        match dispatcher.dispatch("GET_IDENTIFIER", &mut stream).await {
            Ok(Reply::Identifier(id)) => id,
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    async fn dispatch(dispatcher: &Dispatcher, line: &str) -> Result<Reply, RequestError> {
        let mut stream = tokio_test::io::Builder::new().build();
        dispatcher.dispatch(line, &mut stream).await
    }

    #[tokio::test]
    async fn test_identifier_is_checked_first() {
        let (dispatcher, _models) = dispatcher().await;
        let err = dispatch(&dispatcher, "bogus PUSH x").await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid identifier: bogus");

        let stranger = ClientId::new();
        let err = dispatch(&dispatcher, &format!("{} GET_MODEL mnist", stranger))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidIdentifier(_)));

        let id = identify(&dispatcher).await;
        let err = dispatch(&dispatcher, &format!("{} PUSH x", id))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown request type: PUSH");
    }

    #[tokio::test]
    async fn test_get_model_grants() {
        let (dispatcher, _models) = dispatcher().await;
        let id = identify(&dispatcher).await;

        let err = dispatch(&dispatcher, &format!("{} GET_PARAMS mnist", id))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::NotGranted(_)));

        let reply = dispatch(&dispatcher, &format!("{} GET_MODEL mnist", id))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Blob(Bytes::from_static(b"mnist artifact")));
        assert!(
            dispatcher
                .state()
                .registry
                .is_model_registered("mnist", &id)
                .await
        );

        let reply = dispatch(&dispatcher, &format!("{} GET_PARAMS mnist", id))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Blob(Bytes::from_static(b"initial params")));
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let (dispatcher, _models) = dispatcher().await;
        let id = identify(&dispatcher).await;
        let err = dispatch(&dispatcher, &format!("{} GET_MODEL resnet", id))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Model not found: resnet");

        let err = dispatch(&dispatcher, &format!("{} GET_MODEL .secret", id))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidModelName(_)));
    }

    #[tokio::test]
    async fn test_submit_params() {
        let (dispatcher, _models) = dispatcher().await;
        let id = identify(&dispatcher).await;
        dispatch(&dispatcher, &format!("{} GET_MODEL mnist", id))
            .await
            .unwrap();

        let mut stream = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 3])
            .read(b"new")
            .write(b"RECEIVED\n")
            .read(&[0, 0, 0, 2])
            .read(b"bf")
            .build();
        let reply = dispatcher
            .dispatch(&format!("{} SUBMIT_PARAMS mnist", id), &mut stream)
            .await
            .unwrap();
        assert_eq!(reply, Reply::Success);

        let model = dispatcher.state().models.loaded("mnist").await.unwrap();
        assert_eq!(model.params().await.as_ref(), b"new");
        assert_eq!(model.buffers().await.as_ref(), b"bf");
    }

    #[tokio::test]
    async fn test_submit_params_rejects_oversized_blob() {
        let (dispatcher, _models) = dispatcher().await;
        let id = identify(&dispatcher).await;
        dispatch(&dispatcher, &format!("{} GET_MODEL mnist", id))
            .await
            .unwrap();

        let mut stream = tokio_test::io::Builder::new()
            .read(&65_u32.to_be_bytes())
            .build();
        let err = dispatcher
            .dispatch(&format!("{} SUBMIT_PARAMS mnist", id), &mut stream)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RequestError::Transfer(FrameError::SizeOutOfRange { length: 65, max: 64 })
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_close() {
        let (dispatcher, _models) = dispatcher().await;
        let id = identify(&dispatcher).await;
        dispatch(&dispatcher, &format!("{} GET_MODEL mnist", id))
            .await
            .unwrap();

        let reply = dispatch(&dispatcher, &format!("{} CLOSE mnist", id))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Success);
        let err = dispatch(&dispatcher, &format!("{} GET_PARAMS mnist", id))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::NotGranted(_)));
        let err = dispatch(&dispatcher, &format!("{} CLOSE mnist", id))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::NotGranted(_)));

        let reply = dispatch(&dispatcher, &format!("{} CLOSE all", id))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Success);
        let err = dispatch(&dispatcher, &format!("{} GET_MODEL mnist", id))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidIdentifier(_)));
    }
}
