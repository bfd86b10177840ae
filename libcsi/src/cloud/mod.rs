//! Cloud Volume Client contract.
//!
//! [`CloudVolumes`] is the narrow surface the Controller service needs from
//! the cloud: volumes, their attachment to servers, and the asynchronous
//! actions that mutate them.  [`hcloud::HcloudClient`] talks to the real REST
//! API; [`fake::FakeCloud`] keeps the same state in memory for tests.
//!
//! Implementations hold no cache: every call reads the system of record.

pub mod fake;
pub mod hcloud;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CsiError;
use crate::types::{NodeId, VolumeId};

/// A block volume as reported by the cloud.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloudVolume {
    pub id: VolumeId,
    pub name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub location: String,
    /// Server the volume is attached to, if any.
    pub server: Option<NodeId>,
    /// Device path the volume appears under once attached.
    pub linux_device: Option<String>,
}

/// A compute server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub id: NodeId,
    pub name: String,
    pub location: String,
}

/// Lifecycle of an asynchronous cloud action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// Resource an action operates on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionResource {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// An in-flight (or finished) cloud mutation.  Observed, never owned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Action {
    pub id: u64,
    pub command: String,
    pub status: ActionStatus,
    #[serde(default)]
    pub resources: Vec<ActionResource>,
    /// Error code reported for a failed action.
    #[serde(default)]
    pub error: Option<String>,
}

/// Parameters for volume creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVolumeOpts {
    pub name: String,
    pub size_bytes: u64,
    pub location: String,
}

/// Result of a create call: the volume plus the action provisioning it.
#[derive(Debug, Clone)]
pub struct CreatedVolume {
    pub volume: CloudVolume,
    pub action: Option<Action>,
}

/// Typed failures of the cloud API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The resource is busy with another action.
    #[error("locked: {0}")]
    Locked(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Network failure, timeout or 5xx from the API.
    #[error("transient: {0}")]
    Transient(String),

    #[error("cloud error {code}: {message}")]
    Unknown { code: String, message: String },
}

impl CloudError {
    /// Whether re-issuing the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }
}

impl From<CloudError> for CsiError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::NotFound(what) => CsiError::NotFound(what),
            CloudError::AlreadyExists(what) => CsiError::AlreadyExists(what),
            CloudError::Locked(what) => {
                CsiError::Aborted(format!("{what} is busy with another operation"))
            }
            CloudError::RateLimited(_) => CsiError::Unavailable("cloud API rate limit".into()),
            CloudError::Transient(_) => CsiError::Unavailable("cloud API unreachable".into()),
            CloudError::Unauthenticated(_) => {
                CsiError::Internal("cloud API rejected the configured credentials".into())
            }
            CloudError::Unknown { code, .. } => {
                CsiError::Internal(format!("cloud API error: {code}"))
            }
        }
    }
}

/// Operations the driver performs against the cloud.
#[async_trait]
pub trait CloudVolumes: Send + Sync {
    async fn create_volume(&self, opts: CreateVolumeOpts) -> Result<CreatedVolume, CloudError>;

    async fn get_volume(&self, id: &VolumeId) -> Result<CloudVolume, CloudError>;

    /// List volumes, optionally only those with exactly this name.
    async fn list_volumes(&self, name: Option<&str>) -> Result<Vec<CloudVolume>, CloudError>;

    /// Delete a volume.  Returns the action when the cloud performs the
    /// deletion asynchronously.
    async fn delete_volume(&self, id: &VolumeId) -> Result<Option<Action>, CloudError>;

    async fn attach_volume(&self, id: &VolumeId, server: &NodeId) -> Result<Action, CloudError>;

    async fn detach_volume(&self, id: &VolumeId) -> Result<Action, CloudError>;

    async fn get_action(&self, id: u64) -> Result<Action, CloudError>;

    async fn get_server(&self, id: &NodeId) -> Result<Server, CloudError>;
}
