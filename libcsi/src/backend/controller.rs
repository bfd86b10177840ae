//! Controller service backed by the cloud volume API.
//!
//! The service keeps no volume state of its own.  Every RPC starts by asking
//! the cloud what the volume currently looks like and derives the transition
//! from that:
//!
//! ```text
//! Absent -> Creating -> Created -> Attaching -> Attached
//!                          ^                        |
//!                          +------ Detaching <------+
//! Created -> Deleting -> Absent
//! ```
//!
//! Mutations of one volume are serialized through a per-id lock, creations
//! through a per-name lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cloud::{CloudError, CloudVolume, CloudVolumes, CreateVolumeOpts};
use crate::config::DriverConfig;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::lock::LockRegistry;
use crate::retry::retry_transient;
use crate::types::*;
use crate::waiter::ActionWaiter;

/// Smallest volume the cloud provisions, also the default size.
pub const MIN_VOLUME_BYTES: u64 = 10 * GIB;
/// Largest volume the cloud provisions.
pub const MAX_VOLUME_BYTES: u64 = 10 * 1024 * GIB;

/// Resolve a capacity range into the size to provision.
pub fn volume_size(range: &CapacityRange) -> Result<u64, CsiError> {
    let required = range.required_bytes.div_ceil(GIB) * GIB;
    let size = required.max(MIN_VOLUME_BYTES);
    if size > MAX_VOLUME_BYTES {
        return Err(CsiError::OutOfRange(format!(
            "requested {} bytes, at most {MAX_VOLUME_BYTES} bytes are supported",
            range.required_bytes
        )));
    }
    if range.limit_bytes != 0 && range.limit_bytes < size {
        return Err(CsiError::OutOfRange(format!(
            "limit of {} bytes is below the provisionable size of {size} bytes",
            range.limit_bytes
        )));
    }
    Ok(size)
}

/// Only single-node writers are supported by cloud block volumes.
fn is_supported(capability: &VolumeCapability) -> bool {
    capability.access_mode == AccessMode::ReadWriteOnce
}

fn to_volume(volume: &CloudVolume) -> Volume {
    Volume {
        volume_id: volume.id.clone(),
        capacity_bytes: volume.size_bytes,
        volume_context: HashMap::new(),
        accessible_topology: vec![Topology::location(&volume.location)],
    }
}

fn publish_context(volume: &CloudVolume) -> HashMap<String, String> {
    volume
        .linux_device
        .iter()
        .map(|dev| (PUBLISH_CONTEXT_DEVICE_PATH.to_owned(), dev.clone()))
        .collect()
}

pub struct ControllerService {
    cloud: Arc<dyn CloudVolumes>,
    waiter: ActionWaiter,
    config: DriverConfig,
    /// Serializes creations of the same volume name.
    names: LockRegistry<String>,
    /// Serializes mutations of the same volume.
    volumes: LockRegistry<VolumeId>,
}

impl ControllerService {
    pub fn new(cloud: Arc<dyn CloudVolumes>, config: DriverConfig) -> Self {
        let waiter = ActionWaiter::new(
            Arc::clone(&cloud),
            config.wait.clone(),
            config.retry.clone(),
        );
        Self {
            cloud,
            waiter,
            config,
            names: LockRegistry::new(),
            volumes: LockRegistry::new(),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.operation_timeout
    }

    async fn call<T, F, Fut>(&self, what: &str, deadline: Instant, op: F) -> Result<T, CloudError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        retry_transient(&self.config.retry, deadline, what, op).await
    }

    async fn find_by_name(
        &self,
        name: &str,
        deadline: Instant,
    ) -> Result<Option<CloudVolume>, CsiError> {
        let volumes = self
            .call("list_volumes", deadline, || self.cloud.list_volumes(Some(name)))
            .await?;
        Ok(volumes.into_iter().find(|v| v.name == name))
    }

    fn reuse_existing(&self, existing: CloudVolume, size: u64) -> Result<Volume, CsiError> {
        if existing.size_bytes != size {
            warn!(
                volume_id = %existing.id,
                existing_bytes = existing.size_bytes,
                requested_bytes = size,
                "volume name already used with a different size"
            );
            return Err(CsiError::AlreadyExists(format!(
                "volume {} already exists with {} bytes, requested {size}",
                existing.name, existing.size_bytes
            )));
        }
        debug!(volume_id = %existing.id, "returning existing volume for idempotent create");
        Ok(to_volume(&existing))
    }

    /// The node a volume is attached to right now.
    async fn attached_to(
        &self,
        volume_id: &VolumeId,
        deadline: Instant,
    ) -> Result<Option<NodeId>, CloudError> {
        let volume = self
            .call("get_volume", deadline, || self.cloud.get_volume(volume_id))
            .await?;
        Ok(volume.server)
    }
}

#[async_trait]
impl CsiController for ControllerService {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::invalid("volume name is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::invalid("volume capabilities are required"));
        }
        if let Some(cap) = req.volume_capabilities.iter().find(|c| !is_supported(c)) {
            return Err(CsiError::invalid(format!(
                "unsupported access mode {:?}",
                cap.access_mode
            )));
        }
        let size = volume_size(&req.capacity_range)?;
        let location = req
            .parameters
            .get(PARAM_LOCATION)
            .filter(|l| !l.is_empty())
            .cloned()
            .unwrap_or_else(|| self.config.location.clone());

        let deadline = self.deadline();
        let _guard = self.names.acquire(&req.name).await;

        if let Some(existing) = self.find_by_name(&req.name, deadline).await? {
            return self.reuse_existing(existing, size);
        }

        let opts = CreateVolumeOpts {
            name: req.name.clone(),
            size_bytes: size,
            location: location.clone(),
        };
        let created = match self
            .call("create_volume", deadline, || {
                self.cloud.create_volume(opts.clone())
            })
            .await
        {
            Ok(created) => created,
            // An earlier attempt of this request got through after all.
            Err(CloudError::AlreadyExists(_)) => {
                return match self.find_by_name(&req.name, deadline).await? {
                    Some(existing) => self.reuse_existing(existing, size),
                    None => Err(CsiError::Aborted(format!(
                        "volume {} is being created concurrently",
                        req.name
                    ))),
                };
            }
            Err(e) => {
                warn!(error = %e, "create failed");
                return Err(e.into());
            }
        };

        if let Some(action) = &created.action {
            self.waiter.wait_for(action, deadline).await?;
        }
        info!(volume_id = %created.volume.id, size_bytes = size, %location, "volume created");
        Ok(to_volume(&created.volume))
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::invalid("volume id is required"));
        }
        let deadline = self.deadline();
        let _guard = self.volumes.acquire(volume_id).await;

        let volume = match self
            .call("get_volume", deadline, || self.cloud.get_volume(volume_id))
            .await
        {
            Ok(volume) => volume,
            Err(CloudError::NotFound(_)) => {
                debug!("volume already deleted");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "lookup before delete failed");
                return Err(e.into());
            }
        };
        if let Some(server) = &volume.server {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {volume_id} is still attached to node {server}"
            )));
        }

        match self
            .call("delete_volume", deadline, || {
                self.cloud.delete_volume(volume_id)
            })
            .await
        {
            Ok(Some(action)) => self.waiter.wait_for(&action, deadline).await?,
            Ok(None) => {}
            Err(CloudError::NotFound(_)) => debug!("volume vanished during delete"),
            Err(e) => {
                warn!(error = %e, "delete failed");
                return Err(e.into());
            }
        }
        info!("volume deleted");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::invalid("volume id is required"));
        }
        if req.node_id.0.is_empty() {
            return Err(CsiError::invalid("node id is required"));
        }
        if !is_supported(&req.volume_capability) {
            return Err(CsiError::invalid(format!(
                "unsupported access mode {:?}",
                req.volume_capability.access_mode
            )));
        }
        let deadline = self.deadline();
        let _guard = self.volumes.acquire(&req.volume_id).await;

        let volume = self
            .call("get_volume", deadline, || self.cloud.get_volume(&req.volume_id))
            .await?;
        match &volume.server {
            Some(server) if *server == req.node_id => {
                debug!("volume already attached to this node");
                return Ok(publish_context(&volume));
            }
            Some(server) => {
                return Err(CsiError::FailedPrecondition(format!(
                    "volume {} is attached to node {server}",
                    req.volume_id
                )));
            }
            None => {}
        }

        self.call("get_server", deadline, || self.cloud.get_server(&req.node_id))
            .await
            .map_err(|e| match e {
                CloudError::NotFound(_) => CsiError::NotFound(format!("node {}", req.node_id)),
                other => other.into(),
            })?;

        match self
            .call("attach_volume", deadline, || {
                self.cloud.attach_volume(&req.volume_id, &req.node_id)
            })
            .await
        {
            Ok(action) => self.waiter.wait_for(&action, deadline).await?,
            Err(e) => {
                // A lost response to an earlier attach looks like a conflict.
                if self.attached_to(&req.volume_id, deadline).await? == Some(req.node_id.clone()) {
                    debug!(error = %e, "attach already in effect");
                } else {
                    warn!(error = %e, "attach failed");
                    return Err(e.into());
                }
            }
        }
        info!("volume attached");
        Ok(publish_context(&volume))
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::invalid("volume id is required"));
        }
        let deadline = self.deadline();
        let _guard = self.volumes.acquire(&req.volume_id).await;

        let attached = match self.attached_to(&req.volume_id, deadline).await {
            Ok(attached) => attached,
            Err(CloudError::NotFound(_)) => {
                debug!("volume is gone, nothing to detach");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        match attached {
            None => {
                debug!("volume is not attached");
                return Ok(());
            }
            Some(server) if server != req.node_id => {
                debug!(attached_to = %server, "volume is attached to another node, leaving it");
                return Ok(());
            }
            Some(_) => {}
        }

        match self
            .call("detach_volume", deadline, || {
                self.cloud.detach_volume(&req.volume_id)
            })
            .await
        {
            Ok(action) => self.waiter.wait_for(&action, deadline).await?,
            Err(CloudError::NotFound(_)) => debug!("volume vanished during detach"),
            Err(e) => {
                if self.attached_to(&req.volume_id, deadline).await? != Some(req.node_id.clone()) {
                    debug!(error = %e, "detach already in effect");
                } else {
                    warn!(error = %e, "detach failed");
                    return Err(e.into());
                }
            }
        }
        info!("volume detached");
        Ok(())
    }

    #[instrument(skip(self, capabilities))]
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::invalid("volume id is required"));
        }
        if capabilities.is_empty() {
            return Err(CsiError::invalid("volume capabilities are required"));
        }
        self.call("get_volume", self.deadline(), || {
            self.cloud.get_volume(volume_id)
        })
        .await?;
        Ok(capabilities.iter().all(is_supported))
    }

    #[instrument(skip(self))]
    async fn list_volumes(
        &self,
        req: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, CsiError> {
        let start = match req.starting_token.as_deref() {
            None | Some("") => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| CsiError::Aborted(format!("invalid starting token {token:?}")))?,
        };
        let volumes = self
            .call("list_volumes", self.deadline(), || {
                self.cloud.list_volumes(None)
            })
            .await?;
        if start > volumes.len() {
            return Err(CsiError::Aborted(format!(
                "starting token {start} is past the end of the volume list"
            )));
        }
        let end = match req.max_entries {
            0 => volumes.len(),
            max => (start + max as usize).min(volumes.len()),
        };
        Ok(ListVolumesResponse {
            entries: volumes[start..end].iter().map(to_volume).collect(),
            next_token: (end < volumes.len()).then(|| end.to_string()),
        })
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        Err(CsiError::Unimplemented(
            "the cloud does not report available capacity".into(),
        ))
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::PublishUnpublishVolume,
            ControllerCapability::ListVolumes,
        ])
    }
}
