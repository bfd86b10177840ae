//! [`Mounter`] backed by the Linux kernel and the usual userspace tools.
//!
//! - `blkid` detects filesystems, `mkfs.<fs>` creates them.
//! - `mount(2)`/`umount(2)` via `nix`.
//! - `/proc/self/mountinfo` answers "is this mounted" and "who binds this".

use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::mount::MsFlags;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::{ExistingMount, MountError, Mounter, is_read_only};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// `major:minor` of the backing device.
    pub dev: String,
    /// Root of the mount within its filesystem.
    pub root: PathBuf,
    pub mount_point: PathBuf,
    /// Per-mount options such as `ro,nosuid`.
    pub options: String,
    pub fs_type: String,
    pub source: String,
}

/// Undo the octal escaping the kernel applies to whitespace and backslashes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && let Some(digits) = bytes.get(i + 1..i + 4)
            && digits.iter().all(|d| (b'0'..=b'7').contains(d))
        {
            let value = digits
                .iter()
                .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse the contents of a mountinfo file, skipping malformed lines.
pub fn parse_mountinfo(contents: &str) -> Vec<MountInfo> {
    contents
        .lines()
        .filter_map(|line| {
            // <id> <parent> <dev> <root> <mount point> <opts> [optional...] - <fs> <source> <super opts>
            let (pre, post) = line.split_once(" - ")?;
            let pre: Vec<&str> = pre.split_whitespace().collect();
            let mut post = post.split_whitespace();
            if pre.len() < 5 {
                return None;
            }
            Some(MountInfo {
                dev: pre[2].to_owned(),
                root: PathBuf::from(unescape(pre[3])),
                mount_point: PathBuf::from(unescape(pre[4])),
                options: pre.get(5).copied().unwrap_or_default().to_owned(),
                fs_type: post.next()?.to_owned(),
                source: unescape(post.next().unwrap_or("none")),
            })
        })
        .collect()
}

impl MountInfo {
    pub fn is_read_only(&self) -> bool {
        self.options.split(',').any(|o| o == "ro")
    }
}

async fn read_mountinfo() -> Result<Vec<MountInfo>, MountError> {
    let contents = tokio::fs::read_to_string(MOUNTINFO)
        .await
        .map_err(|e| MountError::io(Path::new(MOUNTINFO), e))?;
    Ok(parse_mountinfo(&contents))
}

/// Mount points in mountinfo are canonical; callers may pass symlinks.
async fn canonical(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Split mount options into kernel flags and the filesystem data string.
fn split_options(options: &[String]) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for opt in options {
        match opt.as_str() {
            "bind" => flags |= MsFlags::MS_BIND,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" | "defaults" | "" => {}
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            other => data.push(other),
        }
    }
    let data = (!data.is_empty()).then(|| data.join(","));
    (flags, data)
}

fn mkfs_force_flag(fs_type: &str) -> Option<&'static str> {
    match fs_type {
        "ext2" | "ext3" | "ext4" => Some("-F"),
        "xfs" | "btrfs" => Some("-f"),
        _ => None,
    }
}

/// The production mounter.  Requires root.
#[derive(Debug, Default, Clone)]
pub struct LinuxMounter;

impl LinuxMounter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Mounter for LinuxMounter {
    async fn device_exists(&self, device: &Path) -> Result<bool, MountError> {
        match tokio::fs::metadata(device).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MountError::io(device, e)),
        }
    }

    async fn filesystem(&self, device: &Path) -> Result<Option<String>, MountError> {
        let output = Command::new("blkid")
            .args(["-p", "-s", "TYPE", "-o", "value"])
            .arg(device)
            .output()
            .await
            .map_err(|e| MountError::Command {
                command: "blkid".into(),
                reason: e.to_string(),
            })?;

        // blkid exits with 2 when no recognizable signature was found.
        match output.status.code() {
            Some(0) => {
                let fs = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                Ok((!fs.is_empty()).then_some(fs))
            }
            Some(2) => Ok(None),
            code => Err(MountError::Command {
                command: "blkid".into(),
                reason: format!(
                    "exit {code:?}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }

    #[instrument(skip(self), fields(device = %device.display()))]
    async fn mkfs(&self, device: &Path, fs_type: &str) -> Result<(), MountError> {
        let force = mkfs_force_flag(fs_type)
            .ok_or_else(|| MountError::UnsupportedFilesystem(fs_type.to_owned()))?;
        let command = format!("mkfs.{fs_type}");
        let output = Command::new(&command)
            .arg(force)
            .arg(device)
            .output()
            .await
            .map_err(|e| MountError::Command {
                command: command.clone(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(MountError::Command {
                command,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        info!(fs_type, "device formatted");
        Ok(())
    }

    #[instrument(skip(self), fields(source = %source.display(), target = %target.display()))]
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
            debug!("target already mounted");
            return Ok(());
        }

        // Block devices are bind-mounted onto a regular file.
        let source_is_dir = tokio::fs::metadata(source)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(true);
        let (flags, data) = split_options(options);
        if flags.contains(MsFlags::MS_BIND) && !source_is_dir {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| MountError::io(parent, e))?;
            }
            tokio::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(target)
                .await
                .map_err(|e| MountError::io(target, e))?;
        } else {
            tokio::fs::create_dir_all(target)
                .await
                .map_err(|e| MountError::io(target, e))?;
        }

        nix::mount::mount(Some(source), target, fs_type, flags, data.as_deref()).map_err(|e| {
            MountError::Mount {
                path: target.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        // Some kernels ignore MS_RDONLY on the initial bind-mount call; a
        // separate remount is required to actually enforce read-only access.
        if flags.contains(MsFlags::MS_BIND | MsFlags::MS_RDONLY) {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| MountError::Mount {
                path: target.to_path_buf(),
                reason: format!("remount read-only: {e}"),
            })?;
        }

        info!(?fs_type, "mounted");
        Ok(())
    }

    #[instrument(skip(self), fields(target = %target.display()))]
    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        if !self.is_mounted(target).await? {
            debug!("target not mounted, nothing to unmount");
            return Ok(());
        }
        nix::mount::umount(target).map_err(|e| MountError::Unmount {
            path: target.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!("unmounted");
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        let target = canonical(target).await;
        Ok(read_mountinfo()
            .await?
            .iter()
            .any(|m| m.mount_point == target))
    }

    /// A block device source matches when the target's filesystem lives on
    /// it, or when the target is a bind of the device node itself.  A
    /// directory source matches when both paths expose the same filesystem
    /// subtree.
    async fn existing_mount(
        &self,
        source: &Path,
        target: &Path,
    ) -> Result<Option<ExistingMount>, MountError> {
        let target = canonical(target).await;
        let source = canonical(source).await;
        let mounts = read_mountinfo().await?;
        let Some(own) = mounts.iter().rev().find(|m| m.mount_point == target) else {
            return Ok(None);
        };

        let target_meta = tokio::fs::metadata(&target)
            .await
            .map_err(|e| MountError::io(&target, e))?;
        let source_meta = tokio::fs::metadata(&source)
            .await
            .map_err(|e| MountError::io(&source, e))?;

        let same_source = if source_meta.file_type().is_block_device() {
            if target_meta.file_type().is_block_device() {
                target_meta.rdev() == source_meta.rdev()
            } else {
                target_meta.dev() == source_meta.rdev()
            }
        } else {
            let source_root = mounts
                .iter()
                .rev()
                .find(|m| m.mount_point == source)
                .map(|m| &m.root);
            target_meta.dev() == source_meta.dev() && source_root.is_none_or(|r| *r == own.root)
        };

        Ok(Some(ExistingMount {
            same_source,
            read_only: own.is_read_only(),
        }))
    }

    async fn mount_refs(&self, target: &Path) -> Result<Vec<PathBuf>, MountError> {
        let target = canonical(target).await;
        let mounts = read_mountinfo().await?;
        let Some(own) = mounts.iter().rev().find(|m| m.mount_point == target) else {
            return Ok(Vec::new());
        };
        Ok(mounts
            .iter()
            .filter(|m| m.mount_point != target && m.dev == own.dev && m.root == own.root)
            .map(|m| m.mount_point.clone())
            .collect())
    }
}
