//! CSI Controller service trait.
//!
//! The Controller service manages the cluster-wide volume lifecycle:
//! creation, deletion, attaching a volume to a node and detaching it again.
//! It never touches node-local state; the only thing it shares with the Node
//! service is the volume id and the publish context it returns.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest,
    CreateVolumeRequest, ListVolumesRequest, ListVolumesResponse, Volume, VolumeCapability,
    VolumeId,
};

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, or return the existing one with the same name.
    ///
    /// The returned [`Volume`] contains the assigned `volume_id` and
    /// `volume_context` that must be forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.  Deleting an unknown volume
    /// succeeds.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Attach a volume to a node and return the publish context the node
    /// uses to find the block device.
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError>;

    /// Detach a volume from a node.  A no-op when the volume is not attached
    /// to that node.
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// List volumes known to the cloud, one page at a time.
    async fn list_volumes(&self, req: ListVolumesRequest)
    -> Result<ListVolumesResponse, CsiError>;

    /// Return the total available capacity in bytes.
    async fn get_capacity(&self) -> Result<u64, CsiError>;

    /// Advertise the controller RPCs this plugin implements.
    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}
