//! In-memory [`Mounter`] for tests.
//!
//! Devices, filesystems and the mount table live in a mutex-guarded map.
//! Nothing touches the host.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ExistingMount, MountError, Mounter, is_read_only};

/// One entry in the fake mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeMount {
    pub source: PathBuf,
    pub fs_type: Option<String>,
    pub options: Vec<String>,
}

impl FakeMount {
    pub fn is_read_only(&self) -> bool {
        is_read_only(&self.options)
    }

    pub fn is_bind(&self) -> bool {
        self.options.iter().any(|o| o == "bind")
    }
}

#[derive(Debug, Default)]
struct State {
    devices: HashSet<PathBuf>,
    /// Devices that appear after being probed this many more times.
    pending: HashMap<PathBuf, u32>,
    filesystems: HashMap<PathBuf, String>,
    mounts: BTreeMap<PathBuf, FakeMount>,
    mkfs_calls: usize,
    mount_calls: usize,
}

#[derive(Debug, Default)]
pub struct FakeMounter {
    state: Mutex<State>,
}

impl FakeMounter {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_device(&self, path: impl AsRef<Path>) {
        self.lock().devices.insert(path.as_ref().to_path_buf());
    }

    /// The device becomes visible after `polls` failed existence checks.
    pub fn add_device_after(&self, path: impl AsRef<Path>, polls: u32) {
        self.lock()
            .pending
            .insert(path.as_ref().to_path_buf(), polls);
    }

    pub fn set_filesystem(&self, device: impl AsRef<Path>, fs_type: &str) {
        self.lock()
            .filesystems
            .insert(device.as_ref().to_path_buf(), fs_type.to_owned());
    }

    /// The mount at `target`, if any.
    pub fn mount_at(&self, target: impl AsRef<Path>) -> Option<FakeMount> {
        self.lock().mounts.get(target.as_ref()).cloned()
    }

    pub fn mounts(&self) -> BTreeMap<PathBuf, FakeMount> {
        self.lock().mounts.clone()
    }

    pub fn mkfs_calls(&self) -> usize {
        self.lock().mkfs_calls
    }

    /// Mounts actually performed, excluding idempotent no-ops.
    pub fn mount_calls(&self) -> usize {
        self.lock().mount_calls
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn device_exists(&self, device: &Path) -> Result<bool, MountError> {
        let mut state = self.lock();
        if state.devices.contains(device) {
            return Ok(true);
        }
        match state.pending.get_mut(device) {
            Some(0) => {
                state.pending.remove(device);
                state.devices.insert(device.to_path_buf());
                Ok(true)
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn filesystem(&self, device: &Path) -> Result<Option<String>, MountError> {
        Ok(self.lock().filesystems.get(device).cloned())
    }

    async fn mkfs(&self, device: &Path, fs_type: &str) -> Result<(), MountError> {
        let mut state = self.lock();
        if !state.devices.contains(device) {
            return Err(MountError::Command {
                command: format!("mkfs.{fs_type}"),
                reason: format!("{} does not exist", device.display()),
            });
        }
        state.mkfs_calls += 1;
        state
            .filesystems
            .insert(device.to_path_buf(), fs_type.to_owned());
        Ok(())
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), MountError> {
        if self
            .already_mounted(source, target, is_read_only(options))
            .await?
        {
            return Ok(());
        }
        let mut state = self.lock();
        let bind = options.iter().any(|o| o == "bind");
        let source_known = state.devices.contains(source) || state.mounts.contains_key(source);
        if !source_known && !bind {
            return Err(MountError::Mount {
                path: target.to_path_buf(),
                reason: format!("{} does not exist", source.display()),
            });
        }
        state.mount_calls += 1;
        state.mounts.insert(
            target.to_path_buf(),
            FakeMount {
                source: source.to_path_buf(),
                fs_type: fs_type.map(str::to_owned),
                options: options.to_vec(),
            },
        );
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        self.lock().mounts.remove(target);
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        Ok(self.lock().mounts.contains_key(target))
    }

    async fn existing_mount(
        &self,
        source: &Path,
        target: &Path,
    ) -> Result<Option<ExistingMount>, MountError> {
        Ok(self.lock().mounts.get(target).map(|m| ExistingMount {
            same_source: m.source == source,
            read_only: m.is_read_only(),
        }))
    }

    async fn mount_refs(&self, target: &Path) -> Result<Vec<PathBuf>, MountError> {
        Ok(self
            .lock()
            .mounts
            .iter()
            .filter(|(_, m)| m.source == target)
            .map(|(path, _)| path.clone())
            .collect())
    }
}
