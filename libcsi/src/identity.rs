//! Identity service: who the plugin is and whether it is ready.
//!
//! Controller and node deployments both answer these calls, so the
//! orchestrator can register either one under the same plugin name.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Registered plugin name and the driver version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// `false` while the plugin cannot serve any volume RPC yet.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Which optional services and constraints this deployment offers.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}
