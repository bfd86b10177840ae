//! Node service: makes attached volumes usable by workloads on this node.
//!
//! Per volume the node moves through `Unstaged -> Staged -> Published`
//! and back.  Staging formats the device if needed and mounts it at the
//! staging path; publishing bind-mounts the staging path into the target.
//! Raw block volumes skip staging and bind-mount the device node itself.
//! All state is read back from the mount table on every call.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::lock::LockRegistry;
use crate::mount::{DeviceLocator, MountError, Mounter, is_read_only};
use crate::node::CsiNode;
use crate::types::*;

fn local(err: MountError) -> CsiError {
    warn!(error = %err, "node-local operation failed");
    err.into()
}

fn require(value: &str, what: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::invalid(format!("{what} is required")));
    }
    Ok(())
}

pub struct NodeService {
    mounter: Arc<dyn Mounter>,
    locator: DeviceLocator,
    node_id: NodeId,
    location: String,
    max_volumes: u64,
    default_fs_type: String,
    locks: LockRegistry<VolumeId>,
}

impl NodeService {
    pub fn new(mounter: Arc<dyn Mounter>, config: &DriverConfig) -> Self {
        Self {
            mounter,
            locator: DeviceLocator::new(config.device.clone()),
            node_id: config.node_id.clone(),
            location: config.location.clone(),
            max_volumes: config.max_volumes_per_node,
            default_fs_type: config.device.default_fs_type.clone(),
            locks: LockRegistry::new(),
        }
    }
}

#[async_trait]
impl CsiNode for NodeService {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, staging = %req.staging_target_path))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require(&req.volume_id.0, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        let _guard = self.locks.acquire(&req.volume_id).await;

        let (fs_type, mount_flags) = match &req.volume_capability.access_type {
            AccessType::Block => {
                debug!("raw block volume, nothing to stage");
                return Ok(());
            }
            AccessType::Mount {
                fs_type,
                mount_flags,
            } => (fs_type, mount_flags),
        };
        let fs_type = if fs_type.is_empty() {
            self.default_fs_type.as_str()
        } else {
            fs_type.as_str()
        };

        let staging = Path::new(&req.staging_target_path);
        let device = self
            .locator
            .locate(self.mounter.as_ref(), &req.volume_id, &req.publish_context)
            .await?;
        if self
            .mounter
            .already_mounted(&device, staging, is_read_only(mount_flags))
            .await
            .map_err(local)?
        {
            debug!(device = %device.display(), "volume already staged");
            return Ok(());
        }

        self.mounter
            .format(&device, fs_type, false)
            .await
            .map_err(local)?;
        self.mounter
            .mount(&device, staging, Some(fs_type), mount_flags)
            .await
            .map_err(local)?;
        info!(device = %device.display(), fs_type, "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        require(&volume_id.0, "volume id")?;
        require(staging_target_path, "staging target path")?;
        let _guard = self.locks.acquire(volume_id).await;

        let staging = Path::new(staging_target_path);
        let refs = self.mounter.mount_refs(staging).await.map_err(local)?;
        if let Some(target) = refs.first() {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {volume_id} is still published at {}",
                target.display()
            )));
        }
        self.mounter.unmount(staging).await.map_err(local)?;
        info!("volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require(&req.volume_id.0, "volume id")?;
        require(&req.target_path, "target path")?;
        let _guard = self.locks.acquire(&req.volume_id).await;

        let target = Path::new(&req.target_path);
        let mut options = vec!["bind".to_owned()];
        if req.read_only {
            options.push("ro".to_owned());
        }

        match &req.volume_capability.access_type {
            AccessType::Block => {
                let device = self
                    .locator
                    .locate(self.mounter.as_ref(), &req.volume_id, &req.publish_context)
                    .await?;
                self.mounter
                    .mount(&device, target, None, &options)
                    .await
                    .map_err(local)?;
                info!(device = %device.display(), read_only = req.read_only, "block volume published");
            }
            AccessType::Mount { mount_flags, .. } => {
                require(&req.staging_target_path, "staging target path")?;
                let staging = Path::new(&req.staging_target_path);
                if !self.mounter.is_mounted(staging).await.map_err(local)? {
                    return Err(CsiError::FailedPrecondition(format!(
                        "volume {} is not staged at {}",
                        req.volume_id, req.staging_target_path
                    )));
                }
                options.extend(mount_flags.iter().cloned());
                self.mounter
                    .mount(staging, target, None, &options)
                    .await
                    .map_err(local)?;
                info!(read_only = req.read_only, "volume published");
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        require(&volume_id.0, "volume id")?;
        require(target_path, "target path")?;
        let _guard = self.locks.acquire(volume_id).await;

        self.mounter
            .unmount(Path::new(target_path))
            .await
            .map_err(local)?;
        info!("volume unpublished");
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: self.max_volumes,
            accessible_topology: Some(Topology::location(&self.location)),
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::path::PathBuf;

    use crate::error::Code;
    use crate::mount::fake::FakeMounter;

    const DEVICE: &str = "/dev/sdb";
    const STAGING: &str = "/var/lib/rkl/csi/stage/1";
    const TARGET: &str = "/var/lib/rkl/pods/p1/volumes/data";

    fn setup() -> (Arc<FakeMounter>, NodeService) {
        let mounter = Arc::new(FakeMounter::default());
        mounter.add_device(DEVICE);
        let svc = NodeService::new(
            Arc::clone(&mounter) as Arc<dyn Mounter>,
            &DriverConfig::fast("1"),
        );
        (mounter, svc)
    }

    fn context() -> HashMap<String, String> {
        HashMap::from([(PUBLISH_CONTEXT_DEVICE_PATH.to_owned(), DEVICE.to_owned())])
    }

    fn stage_req(capability: VolumeCapability) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: "1".into(),
            publish_context: context(),
            staging_target_path: STAGING.into(),
            volume_capability: capability,
            volume_context: HashMap::new(),
        }
    }

    fn publish_req(capability: VolumeCapability, read_only: bool) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "1".into(),
            publish_context: context(),
            staging_target_path: STAGING.into(),
            target_path: TARGET.into(),
            volume_capability: capability,
            read_only,
        }
    }

    #[tokio::test]
    async fn publish_before_stage_fails() {
        let (_, svc) = setup();
        let err = svc
            .publish_volume(publish_req(VolumeCapability::default(), false))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn full_cycle_is_idempotent() {
        let (mounter, svc) = setup();
        let id = VolumeId::from("1");

        for _ in 0..2 {
            svc.stage_volume(stage_req(VolumeCapability::mount("ext4")))
                .await
                .unwrap();
        }
        assert_eq!(mounter.mkfs_calls(), 1);
        let staged = mounter.mount_at(STAGING).unwrap();
        assert_eq!(staged.source, PathBuf::from(DEVICE));
        assert_eq!(staged.fs_type.as_deref(), Some("ext4"));

        for _ in 0..2 {
            svc.publish_volume(publish_req(VolumeCapability::default(), false))
                .await
                .unwrap();
        }
        let published = mounter.mount_at(TARGET).unwrap();
        assert!(published.is_bind());
        assert_eq!(published.source, PathBuf::from(STAGING));

        for _ in 0..2 {
            svc.unpublish_volume(&id, TARGET).await.unwrap();
        }
        for _ in 0..2 {
            svc.unstage_volume(&id, STAGING).await.unwrap();
        }
        assert!(mounter.mounts().is_empty());
        assert_eq!(mounter.mount_calls(), 2);
    }

    #[tokio::test]
    async fn unstage_while_published_fails() {
        let (mounter, svc) = setup();
        svc.stage_volume(stage_req(VolumeCapability::default()))
            .await
            .unwrap();
        svc.publish_volume(publish_req(VolumeCapability::default(), false))
            .await
            .unwrap();
        let err = svc
            .unstage_volume(&"1".into(), STAGING)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert!(mounter.mount_at(STAGING).is_some());
    }

    #[tokio::test]
    async fn read_only_publish() {
        let (mounter, svc) = setup();
        svc.stage_volume(stage_req(VolumeCapability::default()))
            .await
            .unwrap();
        svc.publish_volume(publish_req(VolumeCapability::default(), true))
            .await
            .unwrap();
        assert!(mounter.mount_at(TARGET).unwrap().is_read_only());
    }

    #[tokio::test]
    async fn staging_path_of_another_volume_is_refused() {
        let (mounter, svc) = setup();
        mounter.add_device("/dev/sdc");
        svc.stage_volume(stage_req(VolumeCapability::default()))
            .await
            .unwrap();

        let mut other = stage_req(VolumeCapability::default());
        other.volume_id = "2".into();
        other.publish_context =
            HashMap::from([(PUBLISH_CONTEXT_DEVICE_PATH.to_owned(), "/dev/sdc".to_owned())]);
        let err = svc.stage_volume(other).await.unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
        assert_eq!(mounter.mount_at(STAGING).unwrap().source, PathBuf::from(DEVICE));
        assert_eq!(mounter.mkfs_calls(), 1);
    }

    #[tokio::test]
    async fn publish_with_other_access_is_refused() {
        let (mounter, svc) = setup();
        svc.stage_volume(stage_req(VolumeCapability::default()))
            .await
            .unwrap();
        svc.publish_volume(publish_req(VolumeCapability::default(), false))
            .await
            .unwrap();

        let err = svc
            .publish_volume(publish_req(VolumeCapability::default(), true))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
        assert!(!mounter.mount_at(TARGET).unwrap().is_read_only());
    }

    #[tokio::test]
    async fn existing_filesystem_is_kept() {
        let (mounter, svc) = setup();
        mounter.set_filesystem(DEVICE, "ext4");
        svc.stage_volume(stage_req(VolumeCapability::mount("")))
            .await
            .unwrap();
        assert_eq!(mounter.mkfs_calls(), 0);
    }

    #[tokio::test]
    async fn conflicting_filesystem_is_refused() {
        let (mounter, svc) = setup();
        mounter.set_filesystem(DEVICE, "xfs");
        let err = svc
            .stage_volume(stage_req(VolumeCapability::mount("ext4")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert!(mounter.mount_at(STAGING).is_none());
    }

    #[tokio::test]
    async fn missing_device_is_unavailable() {
        let (_, svc) = setup();
        let mut req = stage_req(VolumeCapability::default());
        req.publish_context.clear();
        let err = svc.stage_volume(req).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn block_volume_binds_device() {
        let (mounter, svc) = setup();
        svc.stage_volume(stage_req(VolumeCapability::block()))
            .await
            .unwrap();
        assert_eq!(mounter.mount_calls(), 0);

        svc.publish_volume(publish_req(VolumeCapability::block(), false))
            .await
            .unwrap();
        let published = mounter.mount_at(TARGET).unwrap();
        assert_eq!(published.source, PathBuf::from(DEVICE));
        assert!(published.is_bind());

        svc.unpublish_volume(&"1".into(), TARGET).await.unwrap();
        svc.unstage_volume(&"1".into(), STAGING).await.unwrap();
        assert!(mounter.mounts().is_empty());
    }

    #[tokio::test]
    async fn missing_fields_are_invalid() {
        let (_, svc) = setup();
        let mut req = stage_req(VolumeCapability::default());
        req.staging_target_path.clear();
        assert_eq!(
            svc.stage_volume(req).await.unwrap_err().code(),
            Code::InvalidArgument
        );
        assert_eq!(
            svc.unpublish_volume(&"".into(), TARGET)
                .await
                .unwrap_err()
                .code(),
            Code::InvalidArgument
        );
    }

    #[tokio::test]
    async fn reports_node_info() {
        let (_, svc) = setup();
        let info = svc.get_info().await.unwrap();
        assert_eq!(info.node_id, NodeId::from("1"));
        assert_eq!(info.max_volumes, 16);
        assert_eq!(info.accessible_topology, Some(Topology::location("fsn1")));
        assert_eq!(
            svc.get_capabilities().await.unwrap(),
            vec![NodeCapability::StageUnstageVolume]
        );
    }
}
