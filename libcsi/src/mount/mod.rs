//! Device Locator & Mounter.
//!
//! [`Mounter`] is the node-local capability surface the Node service depends
//! on: device presence, filesystem detection and creation, mounting and
//! unmounting.  [`linux::LinuxMounter`] drives the kernel; [`fake::FakeMounter`]
//! keeps an in-memory mount table for tests.  Every operation tolerates
//! being called twice in a row with the same arguments.
//!
//! [`DeviceLocator`] maps a volume to its block device path and waits for
//! the device node to appear after an attach.

pub mod fake;
pub mod linux;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DeviceConfig;
use crate::error::CsiError;
use crate::types::{PUBLISH_CONTEXT_DEVICE_PATH, VolumeId};

/// Node-local failures.
#[derive(Debug, Error)]
pub enum MountError {
    /// The device carries a different filesystem than requested.
    #[error("{device} is formatted as {existing}, requested {requested}")]
    FormatConflict {
        device: PathBuf,
        existing: String,
        requested: String,
    },

    #[error("unsupported filesystem type {0:?}")]
    UnsupportedFilesystem(String),

    /// An external tool (mkfs, blkid) failed.
    #[error("{command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("mount failed at {path}: {reason}")]
    Mount { path: PathBuf, reason: String },

    #[error("unmount failed at {path}: {reason}")]
    Unmount { path: PathBuf, reason: String },

    /// Something other than the requested mount already occupies the target.
    #[error("{path} is already mounted: {reason}")]
    Conflict { path: PathBuf, reason: String },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MountError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<MountError> for CsiError {
    fn from(err: MountError) -> Self {
        match err {
            MountError::FormatConflict {
                existing,
                requested,
                ..
            } => CsiError::FailedPrecondition(format!(
                "device is already formatted as {existing}, requested {requested}"
            )),
            MountError::UnsupportedFilesystem(fs) => {
                CsiError::InvalidArgument(format!("unsupported filesystem type {fs:?}"))
            }
            MountError::Command { command, .. } => {
                CsiError::Internal(format!("{command} failed on this node"))
            }
            MountError::Mount { path, .. } => {
                CsiError::Internal(format!("mount failed at {}", path.display()))
            }
            MountError::Unmount { path, .. } => {
                CsiError::Internal(format!("unmount failed at {}", path.display()))
            }
            MountError::Conflict { path, reason } => {
                CsiError::AlreadyExists(format!("{} is already mounted: {reason}", path.display()))
            }
            MountError::Io { path, .. } => {
                CsiError::Internal(format!("filesystem error at {}", path.display()))
            }
        }
    }
}

/// What currently occupies a mount point, relative to a requested source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistingMount {
    /// The mount exposes the requested source (device or bind origin).
    pub same_source: bool,
    pub read_only: bool,
}

/// Whether a mount option list asks for read-only access.
pub fn is_read_only(options: &[String]) -> bool {
    options.iter().any(|o| o == "ro")
}

/// Node-local block device and mount operations.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Whether the device node exists on this node.
    async fn device_exists(&self, device: &Path) -> Result<bool, MountError>;

    /// Filesystem type found on the device, `None` when unformatted.
    async fn filesystem(&self, device: &Path) -> Result<Option<String>, MountError>;

    /// Create a filesystem unconditionally.
    async fn mkfs(&self, device: &Path, fs_type: &str) -> Result<(), MountError>;

    /// Mount `source` at `target`, creating `target` if absent.  Succeeds
    /// without remounting when `target` already has exactly this mount and
    /// fails with [`MountError::Conflict`] when it has a different one.  A
    /// `"bind"` option requests a bind mount, `"ro"` a read-only one.
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), MountError>;

    /// Unmount `target`; succeeds when nothing is mounted there.
    async fn unmount(&self, target: &Path) -> Result<(), MountError>;

    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError>;

    /// The mount at `target` compared against `source`, `None` when
    /// nothing is mounted there.
    async fn existing_mount(
        &self,
        source: &Path,
        target: &Path,
    ) -> Result<Option<ExistingMount>, MountError>;

    /// Other mount points exposing the same filesystem subtree as `target`
    /// (bind mounts made from it).
    async fn mount_refs(&self, target: &Path) -> Result<Vec<PathBuf>, MountError>;

    /// `true` when `target` already carries `source` with the requested
    /// access, `false` when it is free.
    async fn already_mounted(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<bool, MountError> {
        let Some(existing) = self.existing_mount(source, target).await? else {
            return Ok(false);
        };
        if !existing.same_source {
            return Err(MountError::Conflict {
                path: target.to_path_buf(),
                reason: format!("not mounted from {}", source.display()),
            });
        }
        if existing.read_only != read_only {
            return Err(MountError::Conflict {
                path: target.to_path_buf(),
                reason: format!(
                    "mounted {}, requested {}",
                    if existing.read_only { "read-only" } else { "read-write" },
                    if read_only { "read-only" } else { "read-write" },
                ),
            });
        }
        Ok(true)
    }

    async fn is_formatted(&self, device: &Path) -> Result<bool, MountError> {
        Ok(self.filesystem(device).await?.is_some())
    }

    /// Format unless the device already carries `fs_type`.  A different
    /// existing filesystem is only overwritten when `force` is set.
    async fn format(&self, device: &Path, fs_type: &str, force: bool) -> Result<(), MountError> {
        match self.filesystem(device).await? {
            Some(existing) if existing == fs_type => {
                debug!(device = %device.display(), fs_type, "already formatted");
                Ok(())
            }
            Some(existing) if !force => Err(MountError::FormatConflict {
                device: device.to_path_buf(),
                existing,
                requested: fs_type.to_owned(),
            }),
            _ => self.mkfs(device, fs_type).await,
        }
    }
}

/// Finds the block device of an attached volume.
#[derive(Debug, Clone)]
pub struct DeviceLocator {
    config: DeviceConfig,
}

impl DeviceLocator {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }

    /// Stable by-id path for a volume.
    pub fn by_id_path(&self, volume_id: &VolumeId) -> PathBuf {
        self.config
            .by_id_dir
            .join(format!("{}{}", self.config.link_prefix, volume_id))
    }

    /// Resolve the device path, preferring the one the controller reported
    /// at attach time.  Device nodes show up with a delay after an attach,
    /// so absence is retried before it becomes `Unavailable`.
    pub async fn locate(
        &self,
        mounter: &dyn Mounter,
        volume_id: &VolumeId,
        publish_context: &HashMap<String, String>,
    ) -> Result<PathBuf, CsiError> {
        let reported = publish_context
            .get(PUBLISH_CONTEXT_DEVICE_PATH)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let attached = reported.is_some();
        let device = reported.unwrap_or_else(|| self.by_id_path(volume_id));

        let attempts = self.config.discovery_attempts.max(1);
        for attempt in 1..=attempts {
            if mounter.device_exists(&device).await? {
                debug!(%volume_id, device = %device.display(), attempt, "device found");
                return Ok(device);
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.discovery_interval).await;
            }
        }

        warn!(%volume_id, device = %device.display(), attempts, "device not found");
        Err(if attached {
            CsiError::Unavailable(format!(
                "device {} of volume {volume_id} is not yet visible on this node",
                device.display()
            ))
        } else {
            CsiError::Unavailable(format!(
                "no device for volume {volume_id} at {}; it was never attached to this node",
                device.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::error::Code;
    use fake::FakeMounter;

    fn locator() -> DeviceLocator {
        DeviceLocator::new(DeviceConfig {
            discovery_attempts: 3,
            discovery_interval: Duration::from_millis(1),
            ..DeviceConfig::default()
        })
    }

    #[test]
    fn by_id_path_uses_prefix() {
        assert_eq!(
            locator().by_id_path(&"4711".into()),
            PathBuf::from("/dev/disk/by-id/scsi-0HC_Volume_4711")
        );
    }

    #[tokio::test]
    async fn prefers_reported_device_path() {
        let mounter = FakeMounter::default();
        mounter.add_device("/dev/sdb");
        let ctx = HashMap::from([(PUBLISH_CONTEXT_DEVICE_PATH.to_owned(), "/dev/sdb".to_owned())]);
        let dev = locator().locate(&mounter, &"1".into(), &ctx).await.unwrap();
        assert_eq!(dev, PathBuf::from("/dev/sdb"));
    }

    #[tokio::test]
    async fn retries_until_device_appears() {
        let mounter = FakeMounter::default();
        let path = locator().by_id_path(&"9".into());
        mounter.add_device_after(&path, 2);
        let dev = locator()
            .locate(&mounter, &"9".into(), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(dev, path);
    }

    #[tokio::test]
    async fn missing_device_distinguishes_never_attached() {
        let mounter = FakeMounter::default();
        let err = locator()
            .locate(&mounter, &"9".into(), &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert!(err.to_string().contains("never attached"));

        let ctx = HashMap::from([(PUBLISH_CONTEXT_DEVICE_PATH.to_owned(), "/dev/sdz".to_owned())]);
        let err = locator().locate(&mounter, &"9".into(), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("not yet visible"));
    }

    #[tokio::test]
    async fn format_is_idempotent_and_detects_conflicts() {
        let mounter = FakeMounter::default();
        let dev = Path::new("/dev/sdb");
        mounter.add_device(dev);

        assert!(!mounter.is_formatted(dev).await.unwrap());
        mounter.format(dev, "ext4", false).await.unwrap();
        mounter.format(dev, "ext4", false).await.unwrap();
        assert_eq!(mounter.mkfs_calls(), 1);

        let err = mounter.format(dev, "xfs", false).await.unwrap_err();
        assert!(matches!(err, MountError::FormatConflict { .. }));
        assert_eq!(CsiError::from(err).code(), Code::FailedPrecondition);

        mounter.format(dev, "xfs", true).await.unwrap();
        assert_eq!(mounter.filesystem(dev).await.unwrap().as_deref(), Some("xfs"));
    }
}
