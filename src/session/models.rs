//! Lazily loaded models shared by all clients.

use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};

const MODEL_EXTENSION: &str = "model";
const PARAMS_EXTENSION: &str = "params";

/// Whether `name` can be used as a model name: non-empty, made of ASCII letters, digits, `_`, `-`
/// and `.`, and not starting with `.`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[derive(Debug, Clone, Default)]
struct Parameters {
    params: Bytes,
    buffers: Bytes,
}

/// A named model loaded once and shared by every client granted it.
#[derive(Debug)]
pub struct ModelHandle {
    artifact: Bytes,
    parameters: RwLock<Parameters>,
}

impl ModelHandle {
    pub fn new(artifact: Bytes, params: Bytes) -> Self {
        Self {
            artifact,
            parameters: RwLock::new(Parameters {
                params,
                buffers: Bytes::new(),
            }),
        }
    }

    /// The model artifact as sent by `GET_MODEL`.
    pub fn artifact(&self) -> Bytes {
        self.artifact.clone()
    }

    /// The current parameter blob.
    pub async fn params(&self) -> Bytes {
        self.parameters.read().await.params.clone()
    }

    /// The current buffer blob.
    pub async fn buffers(&self) -> Bytes {
        self.parameters.read().await.buffers.clone()
    }

    /// Replaces the parameters and buffers of the shared instance.
    pub async fn replace(&self, params: Bytes, buffers: Bytes) {
        let mut parameters = self.parameters.write().await;
        parameters.params = params;
        parameters.buffers = buffers;
    }
}

/// The cache of loaded models, backed by a directory of `<name>.model` artifacts.
///
/// An optional `<name>.params` file seeds the parameter blob of a model.
#[derive(Debug)]
pub struct ModelStore {
    dir: PathBuf,
    handles: Mutex<HashMap<String, Arc<ModelHandle>>>,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, name: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, extension))
    }

    /// Returns the handle of `name`, loading it on first use. A model is loaded at most once.
    ///
    /// Returns `None` if the model does not exist.
    ///
    /// # Errors
    /// Fails if the artifact exists but cannot be read.
    pub async fn load(&self, name: &str) -> io::Result<Option<Arc<ModelHandle>>> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(name) {
            return Ok(Some(handle.clone()));
        }

        let artifact = match read_optional(&self.path(name, MODEL_EXTENSION)).await? {
            Some(artifact) => artifact,
            None => return Ok(None),
        };
        let params = read_optional(&self.path(name, PARAMS_EXTENSION))
            .await?
            .unwrap_or_default();
        info!(
            "loaded model {} ({} bytes, {} bytes of parameters)",
            name,
            artifact.len(),
            params.len()
        );

        let handle = Arc::new(ModelHandle::new(artifact, params));
        handles.insert(name.to_string(), handle.clone());
        Ok(Some(handle))
    }

    /// Returns the handle of `name` if it is loaded.
    pub async fn loaded(&self, name: &str) -> Option<Arc<ModelHandle>> {
        self.handles.lock().await.get(name).cloned()
    }
}

async fn read_optional(path: &Path) -> io::Result<Option<Bytes>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(Bytes::from(bytes))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
