//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local operations
//! required to make an attached block volume available to Pod containers:
//!
//! 1. **Stage**: format the block device if needed and mount it at a
//!    node-global staging path.
//! 2. **Publish**: bind-mount the staging path into the Pod's container.
//! 3. **Unpublish**: remove the bind-mount.
//! 4. **Unstage**: unmount the staging path.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at the global staging path.
    ///
    /// This is idempotent; calling it again for an already-staged volume
    /// succeeds without remounting.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume.  Fails with `FailedPrecondition` while any publish
    /// target still references the staging path.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount the staged global path into the container.
    ///
    /// Fails with `FailedPrecondition` when the staging path is not staged.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind-mount from the container path.
    ///
    /// This is idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    /// Advertise the optional node RPCs this plugin implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;
}
