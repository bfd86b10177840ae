//! Driver tunables.
//!
//! The binary fills a [`DriverConfig`] from flags and environment variables;
//! the library only ever reads it.  Defaults are conservative values for a
//! cloud whose actions usually finish within seconds.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::NodeId;

/// Default cloud location new volumes are created in.
pub const DEFAULT_LOCATION: &str = "fsn1";

/// Polling behaviour of the action waiter.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Delay between two action status polls.
    pub poll_interval: Duration,
    /// Upper bound for a single action wait.
    pub max_wait: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(120),
        }
    }
}

/// Bounded exponential backoff for transient cloud errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

/// Where and how long the node looks for an attached block device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Directory holding stable device links.
    pub by_id_dir: PathBuf,
    /// Link name prefix; the volume id is appended.
    pub link_prefix: String,
    pub discovery_attempts: u32,
    pub discovery_interval: Duration,
    /// Filesystem used when the capability leaves it empty.
    pub default_fs_type: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            by_id_dir: PathBuf::from("/dev/disk/by-id"),
            link_prefix: "scsi-0HC_Volume_".to_owned(),
            discovery_attempts: 10,
            discovery_interval: Duration::from_secs(1),
            default_fs_type: "ext4".to_owned(),
        }
    }
}

/// Full driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Id of the server this process runs on.
    pub node_id: NodeId,
    /// Location of this node, also the default for new volumes.
    pub location: String,
    /// Upper bound for a single RPC, enforced by the transport server.
    pub request_timeout: Duration,
    /// Budget for a whole controller operation (retries and action waits).
    pub operation_timeout: Duration,
    pub max_volumes_per_node: u64,
    pub wait: WaitConfig,
    pub retry: RetryConfig,
    pub device: DeviceConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(String::new()),
            location: DEFAULT_LOCATION.to_owned(),
            request_timeout: Duration::from_secs(300),
            operation_timeout: Duration::from_secs(240),
            max_volumes_per_node: 16,
            wait: WaitConfig::default(),
            retry: RetryConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Configuration with tiny intervals, for tests.
    pub fn fast(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            request_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            wait: WaitConfig {
                poll_interval: Duration::from_millis(5),
                max_wait: Duration::from_secs(2),
            },
            retry: RetryConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(10),
                max_attempts: 4,
            },
            device: DeviceConfig {
                discovery_attempts: 3,
                discovery_interval: Duration::from_millis(5),
                ..DeviceConfig::default()
            },
            ..Self::default()
        }
    }
}
