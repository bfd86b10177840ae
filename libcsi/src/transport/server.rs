//! Plugin-side server: accepts connections on the CSI socket and dispatches
//! requests to the driver.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use super::MAX_MESSAGE_BYTES;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::{CsiMessage, CsiRequest};
use crate::node::CsiNode;

/// Log a request task that panicked or was aborted.  Returns whether the
/// task ran to completion.
fn reap(joined: Result<(), JoinError>) -> bool {
    match joined {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, panicked = e.is_panic(), "CSI request task failed");
            false
        }
    }
}

/// A CSI server that dispatches [`CsiMessage`] requests to a
/// [`CsiIdentity`] + [`CsiController`] + [`CsiNode`] implementation.
pub struct CsiServer<T> {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<T>,
    request_timeout: Duration,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Bind the socket at `path`, replacing a stale socket file left behind
    /// by a previous run.  No request runs longer than `request_timeout`.
    pub async fn bind(
        path: impl AsRef<Path>,
        handler: Arc<T>,
        request_timeout: Duration,
    ) -> Result<Self, CsiError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(CsiError::transport)?;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CsiError::transport(e)),
        }
        let listener = UnixListener::bind(&path).map_err(CsiError::transport)?;
        info!(path = %path.display(), "CSI server listening");
        Ok(Self {
            listener,
            path,
            handler,
            request_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve until the process exits.
    pub async fn serve(self) -> Result<(), CsiError> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `shutdown` completes, then let in-flight requests finish
    /// and remove the socket.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), CsiError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    reap(joined);
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = Arc::clone(&self.handler);
                        let limit = self.request_timeout;
                        in_flight.spawn(async move {
                            if let Err(e) = Self::handle_stream(stream, &handler, limit).await {
                                error!(error = %e, "CSI stream handler error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "CSI accept failed"),
                },
            }
        }

        info!(in_flight = in_flight.len(), "CSI server shutting down");
        while let Some(joined) = in_flight.join_next().await {
            reap(joined);
        }
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!(path = %self.path.display(), error = %e, "failed to remove socket");
        }
        Ok(())
    }

    /// Read one request, dispatch it under its deadline, write one response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut stream: UnixStream,
        handler: &T,
        limit: Duration,
    ) -> Result<(), CsiError> {
        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_BYTES + 1)
            .read_to_end(&mut buf)
            .await
            .map_err(CsiError::transport)?;

        let response = if buf.len() as u64 > MAX_MESSAGE_BYTES {
            CsiMessage::Error(CsiError::invalid("request exceeds the message size limit"))
        } else {
            match serde_json::from_slice::<CsiRequest>(&buf) {
                Ok(request) => Self::run(handler, request, limit).await,
                Err(e) => {
                    warn!(error = %e, "malformed CSI request");
                    CsiMessage::Error(CsiError::invalid(format!("malformed request: {e}")))
                }
            }
        };

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        stream.shutdown().await.map_err(CsiError::transport)?;
        Ok(())
    }

    /// Dispatch under `min(caller deadline, limit)`.  On expiry the handler
    /// future is dropped, which releases its locks and stops its polling.
    async fn run(handler: &T, request: CsiRequest, limit: Duration) -> CsiMessage {
        let timeout = request.timeout().map_or(limit, |t| t.min(limit));
        let name = request.message.to_string();
        debug!(request = %name, ?timeout, "CSI request received");

        match tokio::time::timeout(timeout, Self::dispatch(handler, request.message)).await {
            Ok(response) => {
                debug!(request = %name, %response, "CSI request finished");
                response
            }
            Err(_) => {
                warn!(request = %name, ?timeout, "CSI request deadline exceeded");
                CsiMessage::Error(CsiError::DeadlineExceeded(format!(
                    "{name} did not finish within {timeout:?}"
                )))
            }
        }
    }

    /// Map a request [`CsiMessage`] to the trait method call and wrap the
    /// result in a response [`CsiMessage`].
    async fn dispatch(handler: &T, request: CsiMessage) -> CsiMessage {
        let result = match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => handler.probe().await.map(CsiMessage::ProbeResult),
            CsiMessage::GetPluginInfo => handler
                .get_plugin_info()
                .await
                .map(CsiMessage::PluginInfoResponse),
            CsiMessage::GetPluginCapabilities => handler
                .get_plugin_capabilities()
                .await
                .map(CsiMessage::PluginCapabilitiesResponse),

            // --- Controller -------------------------------------------------
            CsiMessage::CreateVolume(req) => handler
                .create_volume(req)
                .await
                .map(CsiMessage::VolumeCreated),
            CsiMessage::DeleteVolume(id) => {
                handler.delete_volume(&id).await.map(|()| CsiMessage::Ok)
            }
            CsiMessage::ControllerPublishVolume(req) => handler
                .controller_publish_volume(req)
                .await
                .map(CsiMessage::VolumePublished),
            CsiMessage::ControllerUnpublishVolume(req) => handler
                .controller_unpublish_volume(req)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::ListVolumes(req) => handler
                .list_volumes(req)
                .await
                .map(CsiMessage::VolumeList),
            CsiMessage::GetCapacity => handler.get_capacity().await.map(CsiMessage::Capacity),
            CsiMessage::ValidateVolumeCapabilities {
                volume_id,
                capabilities,
            } => handler
                .validate_volume_capabilities(&volume_id, &capabilities)
                .await
                .map(CsiMessage::CapabilitiesValid),
            CsiMessage::ControllerGetCapabilities => CsiController::get_capabilities(handler)
                .await
                .map(CsiMessage::ControllerCapabilitiesResponse),

            // --- Node -------------------------------------------------------
            CsiMessage::StageVolume(req) => {
                handler.stage_volume(req).await.map(|()| CsiMessage::Ok)
            }
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => handler
                .unstage_volume(&volume_id, &staging_target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::PublishVolume(req) => {
                handler.publish_volume(req).await.map(|()| CsiMessage::Ok)
            }
            CsiMessage::UnpublishVolume {
                volume_id,
                target_path,
            } => handler
                .unpublish_volume(&volume_id, &target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::GetNodeInfo => handler.get_info().await.map(CsiMessage::NodeInfoResponse),
            CsiMessage::NodeGetCapabilities => CsiNode::get_capabilities(handler)
                .await
                .map(CsiMessage::NodeCapabilitiesResponse),

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                Err(CsiError::invalid(format!("unexpected message: {other}")))
            }
        };
        result.unwrap_or_else(CsiMessage::Error)
    }
}
