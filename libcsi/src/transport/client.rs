//! Orchestrator-side client for the plugin socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, instrument};

use super::MAX_MESSAGE_BYTES;
use crate::error::CsiError;
use crate::message::{CsiMessage, CsiRequest};

/// Extra time the client waits beyond the request deadline so the server's
/// own `DeadlineExceeded` reply arrives before the client gives up.
const DEADLINE_GRACE: Duration = Duration::from_secs(1);

/// Sends [`CsiMessage`] requests to a plugin, one connection per call.
#[derive(Debug, Clone)]
pub struct CsiClient {
    path: PathBuf,
}

impl CsiClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send a request without a deadline and return the raw response,
    /// which may be [`CsiMessage::Error`].
    pub async fn request(&self, msg: CsiMessage) -> Result<CsiMessage, CsiError> {
        self.send(CsiRequest::new(msg)).await
    }

    /// Send a request the server must answer within `timeout`.
    pub async fn request_with_timeout(
        &self,
        msg: CsiMessage,
        timeout: Duration,
    ) -> Result<CsiMessage, CsiError> {
        let request = CsiRequest::with_timeout(msg, timeout);
        tokio::time::timeout(timeout + DEADLINE_GRACE, self.send(request))
            .await
            .map_err(|_| {
                CsiError::DeadlineExceeded(format!("no response within {timeout:?}"))
            })?
    }

    /// Like [`Self::request`], with [`CsiMessage::Error`] turned into `Err`.
    pub async fn call(&self, msg: CsiMessage) -> Result<CsiMessage, CsiError> {
        into_result(self.request(msg).await?)
    }

    /// Like [`Self::request_with_timeout`], with [`CsiMessage::Error`]
    /// turned into `Err`.
    pub async fn call_with_timeout(
        &self,
        msg: CsiMessage,
        timeout: Duration,
    ) -> Result<CsiMessage, CsiError> {
        into_result(self.request_with_timeout(msg, timeout).await?)
    }

    #[instrument(skip(self, request), fields(msg = %request.message))]
    async fn send(&self, request: CsiRequest) -> Result<CsiMessage, CsiError> {
        let mut stream = UnixStream::connect(&self.path)
            .await
            .map_err(CsiError::transport)?;

        let payload = serde_json::to_vec(&request).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        stream.shutdown().await.map_err(CsiError::transport)?;

        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_BYTES + 1)
            .read_to_end(&mut buf)
            .await
            .map_err(CsiError::transport)?;
        if buf.len() as u64 > MAX_MESSAGE_BYTES {
            return Err(CsiError::transport("response exceeds the message size limit"));
        }

        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }
}

fn into_result(response: CsiMessage) -> Result<CsiMessage, CsiError> {
    match response {
        CsiMessage::Error(e) => Err(e),
        other => Ok(other),
    }
}
