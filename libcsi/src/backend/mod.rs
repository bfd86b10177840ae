//! The hcloud volume driver.
//!
//! [`Driver`] serves the Identity service itself and forwards Controller
//! and Node RPCs to whichever of [`ControllerService`] and [`NodeService`]
//! this process runs.  A controller deployment and a node deployment are
//! the same binary with a different set of services enabled.

pub mod controller;
pub mod node;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::node::CsiNode;
use crate::types::*;

pub use controller::ControllerService;
pub use node::NodeService;

/// Name the plugin registers under.
pub const PLUGIN_NAME: &str = "rk8s.hcloud.csi";

#[derive(Default)]
pub struct Driver {
    controller: Option<ControllerService>,
    node: Option<NodeService>,
}

impl Driver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_controller(mut self, controller: ControllerService) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_node(mut self, node: NodeService) -> Self {
        self.node = Some(node);
        self
    }

    fn controller(&self) -> Result<&ControllerService, CsiError> {
        self.controller
            .as_ref()
            .ok_or_else(|| CsiError::Unimplemented("controller service is not enabled".into()))
    }

    fn node(&self) -> Result<&NodeService, CsiError> {
        self.node
            .as_ref()
            .ok_or_else(|| CsiError::Unimplemented("node service is not enabled".into()))
    }
}

#[async_trait]
impl CsiIdentity for Driver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(self.controller.is_some() || self.node.is_some())
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        let mut caps = Vec::new();
        if self.controller.is_some() {
            caps.push(PluginCapability::ControllerService);
        }
        caps.push(PluginCapability::VolumeAccessibilityConstraints);
        Ok(caps)
    }
}

#[async_trait]
impl CsiController for Driver {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        self.controller()?.create_volume(req).await
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.controller()?.delete_volume(volume_id).await
    }

    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError> {
        self.controller()?.controller_publish_volume(req).await
    }

    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        self.controller()?.controller_unpublish_volume(req).await
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        self.controller()?
            .validate_volume_capabilities(volume_id, capabilities)
            .await
    }

    async fn list_volumes(
        &self,
        req: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, CsiError> {
        self.controller()?.list_volumes(req).await
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        self.controller()?.get_capacity().await
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        CsiController::get_capabilities(self.controller()?).await
    }
}

#[async_trait]
impl CsiNode for Driver {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.node()?.stage_volume(req).await
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        self.node()?
            .unstage_volume(volume_id, staging_target_path)
            .await
    }

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.node()?.publish_volume(req).await
    }

    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        self.node()?.unpublish_volume(volume_id, target_path).await
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        self.node()?.get_info().await
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        CsiNode::get_capabilities(self.node()?).await
    }
}
